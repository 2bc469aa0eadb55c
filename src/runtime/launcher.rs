/// Container boot sequencing
///
/// The parent performs the privileged setup a process cannot do for itself
/// from inside new namespaces (id maps, cgroup attachment, veth wiring), then
/// releases the child over the sync channel. The child walks the fixed boot
/// phase sequence and execs the workload. Ordering is load-bearing on both
/// sides: privileges drop after mounts, seccomp installs last, and the maps
/// are written before the child is allowed to proceed.
use crate::config::types::{ContainerConfig, RootStrategy};
use crate::config::validator;
use crate::kernel::{caps, cgroup::CgroupManager, mounts, namespace, seccomp, sync::SyncChannel, userns};
use crate::net::{self, ContainerNetwork};
use crate::types::{Result, RuntimeError};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, Pid};
use std::ffi::CString;

const CHILD_STACK_SIZE: usize = 2 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Parent waits for the container and propagates its exit status
    Foreground,
    /// Parent returns immediately; reaping is deferred to stop/liveness
    Background,
}

/// A successfully launched container and the host artifacts backing it
pub struct LaunchedContainer {
    pub pid: Pid,
    pub network: Option<ContainerNetwork>,
}

/// Boot phases of the container init, executed strictly in sequence order.
///
/// Each phase reads its own slice of the configuration; the driver knows
/// nothing about flag combinations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootPhase {
    SetHostname,
    PrivatizeMounts,
    EnterRoot,
    MountEssentials,
    ApplyMounts,
    DropCapabilities,
    DropUser,
    LockPrivileges,
    RedirectStdio,
    ExecWorkload,
}

impl BootPhase {
    pub const SEQUENCE: [BootPhase; 10] = [
        BootPhase::SetHostname,
        BootPhase::PrivatizeMounts,
        BootPhase::EnterRoot,
        BootPhase::MountEssentials,
        BootPhase::ApplyMounts,
        BootPhase::DropCapabilities,
        BootPhase::DropUser,
        BootPhase::LockPrivileges,
        BootPhase::RedirectStdio,
        BootPhase::ExecWorkload,
    ];
}

/// Launch a container and return its host PID.
///
/// On any setup failure after clone the child is killed, the cgroup torn
/// down and network artifacts removed before the error is returned.
pub fn launch(config: &ContainerConfig, mode: LaunchMode) -> Result<LaunchedContainer> {
    validator::validate(config)?;

    let channel = SyncChannel::new()?;

    let cgroup = match CgroupManager::new(&config.name) {
        Ok(cgroup) => cgroup,
        Err(e) => {
            channel.abandon();
            return Err(e);
        }
    };
    if let Err(e) = cgroup.setup(&config.resources) {
        channel.abandon();
        cgroup.teardown();
        return Err(e);
    }

    let flags = namespace::clone_flags(config.security.user_ns.enabled);
    let mut stack = vec![0u8; CHILD_STACK_SIZE];

    let child_config = config.clone();
    let child_channel = channel;
    let cb: Box<dyn FnMut() -> isize> =
        Box::new(move || child_main(&child_config, &child_channel, mode));

    let child = match unsafe { clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) } {
        Ok(pid) => pid,
        Err(e) => {
            channel.abandon();
            cgroup.teardown();
            return Err(RuntimeError::Process(format!("clone failed: {}", e)));
        }
    };
    log::info!("container '{}' cloned as PID {}", config.name, child);

    channel.close_child_end();

    match parent_setup(config, &cgroup, &channel, child) {
        Ok(network) => Ok(LaunchedContainer { pid: child, network }),
        Err(e) => {
            abort_launch(config, &cgroup, child);
            Err(e)
        }
    }
}

/// Parent-side phases between clone and the release byte
fn parent_setup(
    config: &ContainerConfig,
    cgroup: &CgroupManager,
    channel: &SyncChannel,
    child: Pid,
) -> Result<Option<ContainerNetwork>> {
    if config.security.user_ns.enabled {
        userns::write_id_maps(child, &config.security.user_ns)?;
    }

    cgroup.apply(child.as_raw())?;

    let network = net::setup(child.as_raw(), config)?;

    channel.release()?;
    Ok(network)
}

/// Kill a half-launched child and undo the host-side setup
fn abort_launch(config: &ContainerConfig, cgroup: &CgroupManager, child: Pid) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);
    cgroup.teardown();
    let (veth_host, _) = net::veth_names(child.as_raw());
    net::cleanup(&config.network, None, Some(&veth_host));
}

/// Reap a container and map its wait status to an exit code
pub fn wait(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(RuntimeError::Process(format!(
                    "waitpid({}) failed: {}",
                    pid, e
                )))
            }
        }
    }
}

/// Entry point of the cloned child
fn child_main(config: &ContainerConfig, channel: &SyncChannel, mode: LaunchMode) -> isize {
    match run_boot_sequence(config, channel, mode) {
        // exec replaced the process on success; reaching here is a failure
        Ok(()) => 1,
        Err(e) => {
            eprintln!("mun_os: container '{}' boot failed: {}", config.name, e);
            1
        }
    }
}

fn run_boot_sequence(
    config: &ContainerConfig,
    channel: &SyncChannel,
    mode: LaunchMode,
) -> Result<()> {
    channel.await_release()?;
    for phase in BootPhase::SEQUENCE {
        run_phase(phase, config, mode)?;
    }
    Ok(())
}

fn run_phase(phase: BootPhase, config: &ContainerConfig, mode: LaunchMode) -> Result<()> {
    match phase {
        BootPhase::SetHostname => namespace::set_hostname(&config.hostname),

        BootPhase::PrivatizeMounts => match mounts::privatize_mount_propagation() {
            Ok(()) => Ok(()),
            // Without a pivot the propagation change has limited effect
            // anyway; a chroot boot proceeds without it.
            Err(e) if config.security.isolation == RootStrategy::Chroot => {
                log::warn!("mount propagation not privatized: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        },

        BootPhase::EnterRoot => mounts::enter_root(config.security.isolation, &config.rootfs),

        BootPhase::MountEssentials => mounts::mount_essentials(),

        BootPhase::ApplyMounts => {
            mounts::apply_bind_mounts(&config.security.bind_mounts)?;
            if config.security.tmpfs.enabled {
                mounts::mount_tmpfs(config.security.tmpfs.size_bytes)?;
            }
            if config.security.readonly_root {
                mounts::remount_root_readonly()?;
            }
            Ok(())
        }

        BootPhase::DropCapabilities => match &config.security.caps.drop_all_then_keep {
            Some(keep) => caps::drop_to(keep),
            None => Ok(()),
        },

        BootPhase::DropUser => {
            if config.security.user_ns.enabled {
                userns::drop_to_user(
                    config.security.user_ns.container_uid,
                    config.security.user_ns.container_gid,
                )
            } else {
                Ok(())
            }
        }

        BootPhase::LockPrivileges => seccomp::install(config.security.seccomp),

        BootPhase::RedirectStdio => {
            if mode == LaunchMode::Background {
                redirect_stdio_to_null()
            } else {
                Ok(())
            }
        }

        BootPhase::ExecWorkload => exec_workload(&config.command, &config.args),
    }
}

/// Detach a background container from the supervisor's terminal
fn redirect_stdio_to_null() -> Result<()> {
    let fd = open("/dev/null", OFlag::O_RDWR, Mode::empty())
        .map_err(|e| RuntimeError::Process(format!("could not open /dev/null: {}", e)))?;
    for target in 0..=2 {
        dup2(fd, target)
            .map_err(|e| RuntimeError::Process(format!("dup2({}) failed: {}", target, e)))?;
    }
    if fd > 2 {
        let _ = close(fd);
    }
    Ok(())
}

fn exec_workload(command: &str, args: &[String]) -> Result<()> {
    let program = CString::new(command)
        .map_err(|_| RuntimeError::Config("command contains a NUL byte".to_string()))?;

    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(program.clone());
    for arg in args {
        argv.push(
            CString::new(arg.as_str())
                .map_err(|_| RuntimeError::Config("argument contains a NUL byte".to_string()))?,
        );
    }

    match nix::unistd::execvp(&program, &argv) {
        Ok(_) => unreachable!("execvp returned Ok"),
        Err(e) => Err(RuntimeError::Process(format!(
            "execvp '{}' failed: {}",
            command, e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(phase: BootPhase) -> usize {
        BootPhase::SEQUENCE.iter().position(|p| *p == phase).unwrap()
    }

    #[test]
    fn privilege_drops_happen_in_the_mandated_order() {
        // cap drop precedes setuid, which precedes seccomp, which precedes exec
        assert!(position(BootPhase::DropCapabilities) < position(BootPhase::DropUser));
        assert!(position(BootPhase::DropUser) < position(BootPhase::LockPrivileges));
        assert!(position(BootPhase::LockPrivileges) < position(BootPhase::ExecWorkload));
    }

    #[test]
    fn mounts_complete_before_privileges_drop() {
        assert!(position(BootPhase::PrivatizeMounts) < position(BootPhase::EnterRoot));
        assert!(position(BootPhase::EnterRoot) < position(BootPhase::MountEssentials));
        assert!(position(BootPhase::ApplyMounts) < position(BootPhase::DropCapabilities));
    }

    #[test]
    fn exec_is_the_final_phase() {
        assert_eq!(
            BootPhase::SEQUENCE.last().copied(),
            Some(BootPhase::ExecWorkload)
        );
        assert_eq!(BootPhase::SEQUENCE.len(), 10);
    }
}
