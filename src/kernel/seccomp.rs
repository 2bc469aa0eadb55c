/// Seccomp syscall filtering for the container init
///
/// Two profiles are supported: the kernel's strict mode, and a BPF denylist
/// that returns EPERM for a fixed set of host-management syscalls and allows
/// everything else. The denylist program checks the audit architecture first
/// so a foreign-architecture syscall cannot slip past the number comparison.
use crate::config::types::SeccompProfile;
use crate::types::{Result, RuntimeError};

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;

// BPF instruction classes and fields
const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;

// seccomp_data field offsets
const OFFSET_SYSCALL_NR: u32 = 0;
const OFFSET_ARCH: u32 = 4;

#[cfg(target_arch = "x86_64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_003e; // AUDIT_ARCH_X86_64
#[cfg(target_arch = "aarch64")]
const AUDIT_ARCH_CURRENT: u32 = 0xc000_00b7; // AUDIT_ARCH_AARCH64

/// Syscalls the default profile refuses with EPERM
const DENIED_SYSCALLS: &[libc::c_long] = &[
    libc::SYS_add_key,
    libc::SYS_keyctl,
    libc::SYS_reboot,
    libc::SYS_swapon,
    libc::SYS_swapoff,
    libc::SYS_kexec_load,
    libc::SYS_mount,
    libc::SYS_umount2,
    libc::SYS_delete_module,
];

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
struct SockFprog {
    len: u16,
    filter: *const SockFilter,
}

/// Set PR_SET_NO_NEW_PRIVS so the filter survives execve without
/// CAP_SYS_ADMIN. Must precede any filter installation.
pub fn set_no_new_privs() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if rc != 0 {
        return Err(RuntimeError::Seccomp(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Install the configured seccomp profile. NO_NEW_PRIVS is always set,
/// including for the Off profile.
pub fn install(profile: SeccompProfile) -> Result<()> {
    set_no_new_privs()?;

    match profile {
        SeccompProfile::Off => Ok(()),
        SeccompProfile::Strict => install_strict(),
        SeccompProfile::DefaultDeny => install_denylist(),
    }
}

/// Kernel strict mode: only read, write, exit and sigreturn remain
fn install_strict() -> Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_SECCOMP, libc::SECCOMP_MODE_STRICT, 0, 0, 0) };
    if rc != 0 {
        return Err(RuntimeError::Seccomp(format!(
            "failed to enter strict seccomp mode: {}",
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("strict seccomp mode active");
    Ok(())
}

fn install_denylist() -> Result<()> {
    let filter = build_denylist_filter(DENIED_SYSCALLS);
    let prog = SockFprog {
        len: filter.len() as u16,
        filter: filter.as_ptr(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0 as libc::c_uint,
            &prog as *const SockFprog,
        )
    };
    if rc != 0 {
        return Err(RuntimeError::Seccomp(format!(
            "failed to install seccomp filter: {}",
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("seccomp denylist installed ({} syscalls)", DENIED_SYSCALLS.len());
    Ok(())
}

/// Build the denylist BPF program.
///
/// Layout:
/// ```text
/// [0]     load arch
/// [1]     arch == current ? fall through : deny
/// [2]     RET ERRNO(EPERM)            <- foreign architecture
/// [3]     load syscall nr
/// [4..]   one JEQ per denied syscall, jumping to the final deny
/// [4+n]   RET ALLOW
/// [5+n]   RET ERRNO(EPERM)
/// ```
fn build_denylist_filter(denied: &[libc::c_long]) -> Vec<SockFilter> {
    let n = denied.len();
    debug_assert!(n < u8::MAX as usize);

    let mut filter = Vec::with_capacity(n + 6);

    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));
    filter.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        AUDIT_ARCH_CURRENT,
        1,
        0,
    ));
    filter.push(SockFilter::stmt(
        BPF_RET | BPF_K,
        SECCOMP_RET_ERRNO | libc::EPERM as u32,
    ));

    filter.push(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SYSCALL_NR));

    // Each match jumps over the remaining comparisons and the ALLOW.
    for (i, &nr) in denied.iter().enumerate() {
        let deny_offset = (n - i) as u8;
        filter.push(SockFilter::jump(
            BPF_JMP | BPF_JEQ | BPF_K,
            nr as u32,
            deny_offset,
            0,
        ));
    }

    filter.push(SockFilter::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
    filter.push(SockFilter::stmt(
        BPF_RET | BPF_K,
        SECCOMP_RET_ERRNO | libc::EPERM as u32,
    ));

    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_structure() {
        let filter = build_denylist_filter(DENIED_SYSCALLS);
        // 3 (arch) + 1 (load nr) + n (comparisons) + 1 (allow) + 1 (deny)
        assert_eq!(filter.len(), DENIED_SYSCALLS.len() + 6);
    }

    #[test]
    fn arch_check_comes_first() {
        let filter = build_denylist_filter(DENIED_SYSCALLS);
        assert_eq!(filter[0].code, BPF_LD | BPF_W | BPF_ABS);
        assert_eq!(filter[0].k, OFFSET_ARCH);
        assert_eq!(filter[1].k, AUDIT_ARCH_CURRENT);
        // A foreign architecture lands on the EPERM return
        assert_eq!(filter[2].code, BPF_RET | BPF_K);
        assert_eq!(filter[2].k, SECCOMP_RET_ERRNO | libc::EPERM as u32);
    }

    #[test]
    fn every_denied_syscall_jumps_to_the_deny_return() {
        let filter = build_denylist_filter(DENIED_SYSCALLS);
        let n = DENIED_SYSCALLS.len();
        let deny_index = filter.len() - 1;

        for (i, &nr) in DENIED_SYSCALLS.iter().enumerate() {
            let insn = &filter[4 + i];
            assert_eq!(insn.k, nr as u32);
            // jump target = current + 1 + jt
            assert_eq!(4 + i + 1 + insn.jt as usize, deny_index);
            assert_eq!(insn.jf, 0);
        }

        // Falls through to ALLOW when nothing matched
        assert_eq!(filter[4 + n].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn denylist_covers_the_documented_syscalls() {
        for nr in [
            libc::SYS_reboot,
            libc::SYS_mount,
            libc::SYS_umount2,
            libc::SYS_add_key,
            libc::SYS_keyctl,
            libc::SYS_swapon,
            libc::SYS_swapoff,
            libc::SYS_kexec_load,
            libc::SYS_delete_module,
        ] {
            assert!(DENIED_SYSCALLS.contains(&nr));
        }
        assert!(!DENIED_SYSCALLS.contains(&libc::SYS_write));
        assert!(!DENIED_SYSCALLS.contains(&libc::SYS_execve));
    }

    #[test]
    fn deny_action_is_eperm_not_kill() {
        let filter = build_denylist_filter(DENIED_SYSCALLS);
        let last = filter.last().unwrap();
        assert_eq!(last.k & 0xffff_0000, SECCOMP_RET_ERRNO);
        assert_eq!(last.k & 0xffff, libc::EPERM as u32);
    }
}
