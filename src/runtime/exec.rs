/// Run a command inside an existing container's namespaces
///
/// setns into the target's namespaces, then fork: joining a PID namespace
/// only affects children forked afterwards, so the parent stays outside and
/// the forked child runs the user command inside.
use crate::kernel::namespace::JOINABLE_NAMESPACES;
use crate::types::{Result, RuntimeError};
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, ForkResult};
use std::ffi::CString;
use std::fs;

/// Join the container's namespaces and execute `argv` inside them.
/// Returns the command's exit code.
pub fn exec_in_container(pid: i32, argv: &[String]) -> Result<i32> {
    if argv.is_empty() {
        return Err(RuntimeError::Config("exec requires a command".to_string()));
    }

    join_namespaces(pid)?;

    match unsafe { fork() }
        .map_err(|e| RuntimeError::Process(format!("fork failed: {}", e)))?
    {
        ForkResult::Child => {
            // In the child: exec only returns on failure.
            if let Err(e) = exec_argv(argv) {
                eprintln!("mun_os: exec failed: {}", e);
            }
            std::process::exit(127);
        }
        ForkResult::Parent { child } => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    return Err(RuntimeError::Process(format!("waitpid failed: {}", e)))
                }
            }
        },
    }
}

/// Enter the target's namespaces: user first when it differs from ours
/// (that is where the capabilities over the rest come from), then the rest.
fn join_namespaces(pid: i32) -> Result<()> {
    if namespace_differs(pid, "user") {
        match open_ns(pid, "user") {
            Ok(fd) => {
                if let Err(e) = setns(fd, CloneFlags::CLONE_NEWUSER) {
                    log::warn!("could not join user namespace of PID {}: {}", pid, e);
                }
                let _ = close(fd);
            }
            Err(e) => log::warn!("{}", e),
        }
    }

    for (name, flag) in JOINABLE_NAMESPACES {
        let fd = match open_ns(pid, name) {
            Ok(fd) => fd,
            Err(e) => {
                // A missing ns file means the kernel lacks that namespace
                // type; joining the remaining ones is still useful.
                log::warn!("{}", e);
                continue;
            }
        };
        let joined = setns(fd, *flag);
        let _ = close(fd);
        joined.map_err(|e| {
            RuntimeError::Namespace(format!(
                "setns into {} namespace of PID {} failed: {}",
                name, pid, e
            ))
        })?;
    }

    Ok(())
}

fn open_ns(pid: i32, name: &str) -> Result<i32> {
    let path = format!("/proc/{}/ns/{}", pid, name);
    open(path.as_str(), OFlag::O_RDONLY, Mode::empty()).map_err(|e| {
        RuntimeError::Namespace(format!("could not open {}: {}", path, e))
    })
}

fn namespace_differs(pid: i32, name: &str) -> bool {
    let ours = fs::read_link(format!("/proc/self/ns/{}", name));
    let theirs = fs::read_link(format!("/proc/{}/ns/{}", pid, name));
    match (ours, theirs) {
        (Ok(a), Ok(b)) => a != b,
        _ => false,
    }
}

fn exec_argv(argv: &[String]) -> Result<std::convert::Infallible> {
    let program = CString::new(argv[0].as_str())
        .map_err(|_| RuntimeError::Config("command contains a NUL byte".to_string()))?;
    let args: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| RuntimeError::Config("argument contains a NUL byte".to_string()))?;

    nix::unistd::execvp(&program, &args)
        .map_err(|e| RuntimeError::Process(format!("execvp '{}' failed: {}", argv[0], e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn our_own_namespaces_do_not_differ() {
        let pid = std::process::id() as i32;
        for (name, _) in JOINABLE_NAMESPACES {
            assert!(!namespace_differs(pid, name));
        }
    }

    #[test]
    fn empty_argv_is_rejected() {
        assert!(exec_in_container(std::process::id() as i32, &[]).is_err());
    }
}
