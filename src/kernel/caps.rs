/// Capability manipulation for the container init
///
/// Uses the raw capget/capset syscalls; after `drop_to(keep)` the process
/// holds the intersection of its prior effective set with `keep` in all of
/// effective, permitted and inheritable. The bounding set is cleared as well
/// and ambient capabilities are flushed.
use crate::config::types::Capability;
use crate::types::{Result, RuntimeError};
use std::fs;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

// prctl option numbers not exposed by libc on every target
const PR_CAPBSET_DROP: libc::c_int = 24;
const PR_CAP_AMBIENT: libc::c_int = 47;
const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;

const CAP_LAST_CAP: u32 = 40;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// Read the current effective capability mask from /proc/self/status
pub fn current_effective() -> Result<u64> {
    let status = fs::read_to_string("/proc/self/status")
        .map_err(|e| RuntimeError::Caps(format!("failed to read /proc/self/status: {}", e)))?;
    parse_cap_eff(&status)
}

fn parse_cap_eff(status: &str) -> Result<u64> {
    for line in status.lines() {
        if let Some(hex) = line.strip_prefix("CapEff:") {
            return u64::from_str_radix(hex.trim(), 16)
                .map_err(|e| RuntimeError::Caps(format!("unparseable CapEff value: {}", e)));
        }
    }

    Err(RuntimeError::Caps(
        "CapEff line missing from /proc/self/status".to_string(),
    ))
}

/// Drop every capability except the listed ones.
///
/// The kept set is intersected with the current effective set, so a keep list
/// can never grant a capability the process does not already hold.
pub fn drop_to(keep: &[Capability]) -> Result<()> {
    let mut keep_mask: u64 = 0;
    for cap in keep {
        keep_mask |= 1u64 << cap.number();
    }
    let retained = current_effective()? & keep_mask;

    clear_ambient();
    drop_bounding_set(retained);
    set_process_capabilities(retained)?;

    log::debug!("capability sets reduced to {:#x}", retained);
    Ok(())
}

/// Clear ambient capabilities; older kernels without ambient support are fine
fn clear_ambient() {
    let rc = unsafe { libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_CLEAR_ALL, 0, 0, 0) };
    if rc != 0 {
        log::warn!("failed to clear ambient capabilities (kernel may predate them)");
    }
}

/// Remove everything outside `retained` from the bounding set
fn drop_bounding_set(retained: u64) {
    for cap in 0..=CAP_LAST_CAP {
        if retained & (1u64 << cap) != 0 {
            continue;
        }
        // Ignore errors: the capability may not exist or is already gone.
        let _ = unsafe { libc::prctl(PR_CAPBSET_DROP, cap, 0, 0, 0) };
    }
}

/// Write effective/permitted/inheritable via capset
fn set_process_capabilities(retained: u64) -> Result<()> {
    let header = CapUserHeader {
        version: LINUX_CAPABILITY_VERSION_3,
        pid: 0,
    };

    let low = (retained & 0xffff_ffff) as u32;
    let high = (retained >> 32) as u32;
    let data = [
        CapUserData {
            effective: low,
            permitted: low,
            inheritable: low,
        },
        CapUserData {
            effective: high,
            permitted: high,
            inheritable: high,
        },
    ];

    let rc = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
    if rc != 0 {
        return Err(RuntimeError::Caps(format!(
            "capset failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_effective_is_readable() {
        // Works for any process; the mask itself is environment-dependent.
        assert!(current_effective().is_ok());
    }

    #[test]
    fn cap_eff_line_parses_as_hex() {
        let status = "Name:\tmun_os\nCapInh:\t0000000000000000\n\
                      CapPrm:\t000001ffffffffff\nCapEff:\t000001ffffffffff\n";
        assert_eq!(parse_cap_eff(status).unwrap(), 0x1ff_ffff_ffff);
    }

    #[test]
    fn unprivileged_cap_eff_parses_to_zero() {
        assert_eq!(parse_cap_eff("CapEff:\t0000000000000000\n").unwrap(), 0);
    }

    #[test]
    fn missing_cap_eff_line_is_an_error() {
        assert!(parse_cap_eff("Name:\tmun_os\n").is_err());
    }
}
