/// Root filesystem isolation and essential mounts
///
/// Runs inside the child's mount namespace. The pivot_root path requires the
/// new root to be a mount point, which the bind-mount-onto-self step
/// guarantees; mount propagation is made recursively private beforehand so
/// nothing leaks back to the host.
use crate::config::types::{BindMount, RootStrategy};
use crate::types::{Result, RuntimeError};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use nix::unistd::{chdir, chroot, pivot_root};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

const PUT_OLD: &str = ".old_root";

/// Standard character devices created under /dev: (name, major, minor)
const DEV_NODES: &[(&str, u64, u64)] = &[
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

fn mount_err(what: &str, e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Mount(format!("{}: {}", what, e))
}

/// Stop mount events from propagating to the host: remount everything
/// under / as recursively private.
pub fn privatize_mount_propagation() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| mount_err("could not make / recursively private", e))
}

/// Transition into the container root using the configured strategy
pub fn enter_root(strategy: RootStrategy, rootfs: &Path) -> Result<()> {
    match strategy {
        RootStrategy::PivotRoot => pivot_into(rootfs),
        RootStrategy::Chroot => chroot_into(rootfs),
    }
}

fn pivot_into(rootfs: &Path) -> Result<()> {
    // pivot_root requires the new root to be a mount point
    mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| mount_err("could not bind-mount rootfs onto itself", e))?;

    chdir(rootfs).map_err(|e| mount_err("could not chdir into rootfs", e))?;

    // The old root lands inside the new root until it is detached
    match fs::create_dir(PUT_OLD) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(mount_err("could not create old-root directory", e)),
    }

    pivot_root(".", PUT_OLD).map_err(|e| mount_err("pivot_root failed", e))?;
    chdir("/").map_err(|e| mount_err("could not chdir to new root", e))?;

    let old_root = format!("/{}", PUT_OLD);
    if let Err(e) = umount2(old_root.as_str(), MntFlags::MNT_DETACH) {
        // The container still works with the old root lingering; leave the
        // directory in place since it is still a mount point.
        log::warn!("could not detach old root: {}", e);
    } else if let Err(e) = fs::remove_dir(&old_root) {
        log::warn!("could not remove old-root directory: {}", e);
    }

    Ok(())
}

fn chroot_into(rootfs: &Path) -> Result<()> {
    chroot(rootfs).map_err(|e| mount_err("chroot failed", e))?;
    chdir("/").map_err(|e| mount_err("could not chdir to new root", e))
}

/// Mount /proc, /sys, /dev (with device nodes), /dev/pts and /dev/shm
pub fn mount_essentials() -> Result<()> {
    mount_proc()?;
    mount_sys()?;
    mount_dev()?;
    mount_devpts()?;
    create_dev_symlinks();
    mount_dev_shm();
    Ok(())
}

fn mount_proc() -> Result<()> {
    ensure_dir("/proc")?;
    // An inherited host /proc would show foreign PIDs; drop it first.
    let _ = umount2("/proc", MntFlags::MNT_DETACH);
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| mount_err("could not mount /proc", e))
}

fn mount_sys() -> Result<()> {
    ensure_dir("/sys")?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .map_err(|e| mount_err("could not mount /sys", e))
}

/// Mount /dev, preferring devtmpfs and falling back to tmpfs plus manual
/// device nodes when devtmpfs is unavailable.
fn mount_dev() -> Result<()> {
    ensure_dir("/dev")?;

    let devtmpfs = mount(
        Some("devtmpfs"),
        "/dev",
        Some("devtmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    );
    if devtmpfs.is_ok() {
        return Ok(());
    }

    mount(
        Some("tmpfs"),
        "/dev",
        Some("tmpfs"),
        MsFlags::MS_NOSUID,
        Some("mode=0755"),
    )
    .map_err(|e| mount_err("could not mount /dev", e))?;

    for (name, major, minor) in DEV_NODES {
        let path = format!("/dev/{}", name);
        mknod(
            path.as_str(),
            SFlag::S_IFCHR,
            Mode::from_bits_truncate(0o666),
            makedev(*major, *minor),
        )
        .map_err(|e| mount_err(&format!("could not create {}", path), e))?;
    }

    Ok(())
}

fn mount_devpts() -> Result<()> {
    ensure_dir("/dev/pts")?;
    mount(
        Some("devpts"),
        "/dev/pts",
        Some("devpts"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666"),
    )
    .map_err(|e| mount_err("could not mount /dev/pts", e))?;

    if !Path::new("/dev/ptmx").exists() {
        let _ = symlink("pts/ptmx", "/dev/ptmx");
    }
    Ok(())
}

fn create_dev_symlinks() {
    let links = [
        ("/proc/self/fd", "/dev/fd"),
        ("/proc/self/fd/0", "/dev/stdin"),
        ("/proc/self/fd/1", "/dev/stdout"),
        ("/proc/self/fd/2", "/dev/stderr"),
    ];
    for (target, link) in links {
        if !Path::new(link).exists() {
            let _ = symlink(target, link);
        }
    }
}

/// /dev/shm is expected by POSIX shared-memory users; failure is non-fatal
fn mount_dev_shm() {
    if ensure_dir("/dev/shm").is_err() {
        return;
    }
    if let Err(e) = mount(
        Some("tmpfs"),
        "/dev/shm",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    ) {
        log::warn!("could not mount /dev/shm: {}", e);
    }
}

/// Apply the configured bind mounts inside the container root.
/// Targets that do not exist yet are created.
pub fn apply_bind_mounts(binds: &[BindMount]) -> Result<()> {
    for bind in binds {
        let target = bind
            .target
            .strip_prefix("/")
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| bind.target.clone());
        let target = Path::new("/").join(target);

        ensure_dir(&target)?;

        mount(
            Some(&bind.source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            mount_err(
                &format!(
                    "could not bind {} to {}",
                    bind.source.display(),
                    target.display()
                ),
                e,
            )
        })?;

        // Read-only binds need a remount; the initial MS_BIND ignores MS_RDONLY.
        if bind.readonly {
            mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| {
                mount_err(
                    &format!("could not remount {} read-only", target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Mount a size-bounded tmpfs at /tmp
pub fn mount_tmpfs(size_bytes: u64) -> Result<()> {
    ensure_dir("/tmp")?;
    let options = format!("mode=1777,size={}", size_bytes);
    mount(
        Some("tmpfs"),
        "/tmp",
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .map_err(|e| mount_err("could not mount /tmp", e))
}

/// Remount the container root read-only, after all writable setup is done
pub fn remount_root_readonly() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_RDONLY | MsFlags::MS_REMOUNT | MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| mount_err("could not remount / read-only", e))
}

fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    fs::create_dir_all(path.as_ref())
        .map_err(|e| mount_err(&format!("could not create {}", path.as_ref().display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_nodes_cover_the_standard_six() {
        let names: Vec<&str> = DEV_NODES.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, ["null", "zero", "full", "random", "urandom", "tty"]);
    }

    #[test]
    fn null_device_numbers_are_correct() {
        let (_, major, minor) = DEV_NODES[0];
        assert_eq!((major, minor), (1, 3));
    }
}
