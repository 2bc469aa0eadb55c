/// Top-level container lifecycle commands
///
/// One synchronous command per supervisor invocation; idempotence against
/// concurrent invocations comes from the store's per-name directories and
/// the check-then-create discipline of the network layer.
use crate::config::parser;
use crate::config::types::{ContainerConfig, NetworkConfig};
use crate::kernel::cgroup;
use crate::net;
use crate::runtime::exec;
use crate::runtime::launcher::{self, LaunchMode};
use crate::state::{pid_alive, StateStore};
use crate::types::{ContainerState, ContainerStatus, Result, RuntimeError};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Soft-termination window: ten ticks of 500 ms before SIGKILL
const STOP_TICKS: u32 = 10;
const STOP_TICK: Duration = Duration::from_millis(500);

/// Launch in the foreground, wait, and return the container's exit code
pub fn run(config: &ContainerConfig) -> Result<i32> {
    let launched = launcher::launch(config, LaunchMode::Foreground)?;
    let exit = launcher::wait(launched.pid);

    cgroup::teardown_by_name(&config.name);
    if let Some(network) = &launched.network {
        net::cleanup(&config.network, Some(network.ip), Some(&network.veth_host));
    }

    exit
}

/// Launch in the background and persist a state record
pub fn start(config: &ContainerConfig, config_path: &Path, store: &StateStore) -> Result<i32> {
    if let Some(existing) = store.load(&config.name)? {
        if existing.status == ContainerStatus::Running {
            return Err(RuntimeError::State(format!(
                "container '{}' is already running (PID {})",
                config.name, existing.pid
            )));
        }
    }

    let launched = launcher::launch(config, LaunchMode::Background)?;
    let pid = launched.pid.as_raw();

    let record = ContainerState {
        name: config.name.clone(),
        pid,
        status: ContainerStatus::Running,
        config_path: config_path.display().to_string(),
        ip: launched.network.as_ref().map(|n| n.ip.to_string()),
        bridge: launched.network.as_ref().map(|n| n.bridge.clone()),
        veth_host: launched.network.as_ref().map(|n| n.veth_host.clone()),
    };

    if let Err(e) = store.save(&record) {
        // A container nobody can manage is worse than a failed start.
        log::error!("could not persist state for '{}', killing it: {}", config.name, e);
        terminate(pid);
        cgroup::teardown_by_name(&config.name);
        if let Some(network) = &launched.network {
            net::cleanup(&config.network, Some(network.ip), Some(&network.veth_host));
        }
        return Err(e);
    }

    Ok(pid)
}

/// SIGTERM, poll for up to 5 seconds, then SIGKILL; mark the record stopped
pub fn stop(name: &str, store: &StateStore) -> Result<()> {
    let mut state = store
        .load(name)?
        .ok_or_else(|| RuntimeError::State(format!("container '{}' not found", name)))?;

    if state.status == ContainerStatus::Stopped {
        log::info!("container '{}' is already stopped", name);
        // The record may have been reconciled from an external kill; reclaim
        // whatever host artifacts are left and persist the stopped status.
        teardown_host_artifacts(&state);
        return store.save(&state);
    }

    log::info!("stopping container '{}' (PID {})", name, state.pid);
    terminate(state.pid);

    teardown_host_artifacts(&state);

    state.status = ContainerStatus::Stopped;
    store.save(&state)
}

/// Stop (when running) and relaunch from the saved config path
pub fn restart(name: &str, store: &StateStore) -> Result<i32> {
    let state = store
        .load(name)?
        .ok_or_else(|| RuntimeError::State(format!("container '{}' not found", name)))?;

    if state.status == ContainerStatus::Running {
        stop(name, store)?;
    }

    let config_path = Path::new(&state.config_path).to_path_buf();
    let file = parser::load_file(&config_path)?;
    let overrides = parser::Overrides {
        name: Some(state.name.clone()),
        ..parser::Overrides::default()
    };
    let config = parser::build(Some(file), Some(&config_path), &overrides)?;

    start(&config, &config_path, store)
}

/// Delete a stopped container's record
pub fn remove(name: &str, store: &StateStore) -> Result<()> {
    let state = store
        .load(name)?
        .ok_or_else(|| RuntimeError::State(format!("container '{}' not found", name)))?;

    if state.status == ContainerStatus::Running {
        return Err(RuntimeError::State(format!(
            "container '{}' is still running; stop it before removing",
            name
        )));
    }

    store.remove(name)?;
    cgroup::teardown_by_name(name);
    Ok(())
}

/// All records, reconciled against liveness
pub fn list(store: &StateStore) -> Result<Vec<ContainerState>> {
    store.list()
}

/// Join a running container's namespaces and run a command inside
pub fn exec(name: &str, argv: &[String], store: &StateStore) -> Result<i32> {
    let state = store
        .load(name)?
        .ok_or_else(|| RuntimeError::State(format!("container '{}' not found", name)))?;

    if state.status != ContainerStatus::Running {
        return Err(RuntimeError::State(format!(
            "container '{}' is not running",
            name
        )));
    }

    exec::exec_in_container(state.pid, argv)
}

/// Stop every running container
pub fn kill_all(store: &StateStore) -> Result<usize> {
    let mut stopped = 0;
    for state in store.list()? {
        if state.status == ContainerStatus::Running {
            match stop(&state.name, store) {
                Ok(()) => stopped += 1,
                Err(e) => log::warn!("could not stop '{}': {}", state.name, e),
            }
        }
    }
    Ok(stopped)
}

/// Remove every stopped container's record
pub fn prune(store: &StateStore) -> Result<usize> {
    let mut removed = 0;
    for state in store.list()? {
        if state.status == ContainerStatus::Stopped {
            match remove(&state.name, store) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!("could not remove '{}': {}", state.name, e),
            }
        }
    }
    Ok(removed)
}

/// Stop and remove everything
pub fn cleanup(store: &StateStore) -> Result<usize> {
    let mut cleaned = 0;
    for state in store.list()? {
        if state.status == ContainerStatus::Running {
            if let Err(e) = stop(&state.name, store) {
                log::warn!("could not stop '{}': {}", state.name, e);
                continue;
            }
        }
        match remove(&state.name, store) {
            Ok(()) => cleaned += 1,
            Err(e) => log::warn!("could not remove '{}': {}", state.name, e),
        }
    }
    Ok(cleaned)
}

/// Graceful termination with escalation.
///
/// Reaping and liveness-testing are the same act: each tick tries a
/// non-blocking waitpid, falling back to a zero-signal probe when the target
/// is not our child (the usual case, since `stop` runs in a fresh
/// invocation and the orphaned container init was reparented).
fn terminate(pid: i32) {
    let target = Pid::from_raw(pid);

    match kill(target, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => return,
        Err(e) => {
            log::warn!("SIGTERM to PID {} failed: {}", pid, e);
            return;
        }
    }

    for _ in 0..STOP_TICKS {
        if !still_alive(target) {
            return;
        }
        thread::sleep(STOP_TICK);
    }

    log::warn!("PID {} survived SIGTERM, escalating to SIGKILL", pid);
    let _ = kill(target, Signal::SIGKILL);
    // Reap if it is ours; otherwise the kernel's reparenting handles it.
    match waitpid(target, None) {
        Ok(_) | Err(Errno::ECHILD) => {}
        Err(e) => log::warn!("waitpid({}) after SIGKILL failed: {}", pid, e),
    }
}

fn still_alive(target: Pid) -> bool {
    match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => true,
        // Reaped right here: the zombie is gone and so is the container.
        Ok(_) => false,
        Err(Errno::ECHILD) => pid_alive(target.as_raw()),
        Err(e) => {
            log::warn!("waitpid({}) failed: {}", target, e);
            false
        }
    }
}

/// Remove the cgroup subtree and network artifacts of a stopped container
fn teardown_host_artifacts(state: &ContainerState) {
    cgroup::teardown_by_name(&state.name);

    let network = network_for_cleanup(state);
    let ip = state.ip.as_deref().and_then(|ip| ip.parse().ok());
    net::cleanup(&network, ip, state.veth_host.as_deref());
}

/// Network section from the saved config; DNAT cleanup needs the forward
/// list, and a missing or changed config file degrades to veth-only cleanup.
fn network_for_cleanup(state: &ContainerState) -> NetworkConfig {
    match parser::load_network(Path::new(&state.config_path)) {
        Ok(network) => network,
        Err(e) => {
            log::warn!(
                "could not reload config for '{}' ({}); skipping port-forward cleanup",
                state.name,
                e
            );
            NetworkConfig::default()
        }
    }
}
