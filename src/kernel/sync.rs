/// Parent/child launch synchronization
///
/// A datagram socketpair created before clone. The child blocks on a one-byte
/// read until the parent has finished the setup only it can perform (id maps,
/// cgroup attach, network wiring) and sends the release byte. A single wakeup
/// suffices; the byte's value carries no meaning.
use crate::types::{Result, RuntimeError};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{close, read, write};
use std::os::unix::io::RawFd;

/// Copyable by design: the cloned child gets its own fd table, so the copy
/// captured into the clone callback refers to the child's descriptors.
#[derive(Clone, Copy)]
pub struct SyncChannel {
    parent_fd: RawFd,
    child_fd: RawFd,
}

impl SyncChannel {
    pub fn new() -> Result<Self> {
        let (parent_fd, child_fd) = socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| RuntimeError::Process(format!("socketpair failed: {}", e)))?;
        Ok(Self { parent_fd, child_fd })
    }

    /// Parent side: signal the child to continue booting, then close our end.
    pub fn release(&self) -> Result<()> {
        write(self.parent_fd, &[1u8])
            .map_err(|e| RuntimeError::Process(format!("could not release child: {}", e)))?;
        let _ = close(self.parent_fd);
        Ok(())
    }

    /// Child side: block until the parent releases us, then close our end.
    pub fn await_release(&self) -> Result<()> {
        // The child inherited the parent's fd across clone; drop it so the
        // channel has exactly one owner per end.
        let _ = close(self.parent_fd);

        let mut buf = [0u8; 1];
        let n = read(self.child_fd, &mut buf)
            .map_err(|e| RuntimeError::Process(format!("wait for release failed: {}", e)))?;
        let _ = close(self.child_fd);

        if n == 0 {
            return Err(RuntimeError::Process(
                "parent closed the sync channel before releasing".to_string(),
            ));
        }
        Ok(())
    }

    /// Parent side: drop the child's end after a failed launch so the fd does
    /// not leak into subsequent operations.
    pub fn abandon(&self) {
        let _ = close(self.parent_fd);
        let _ = close(self.child_fd);
    }

    /// Parent side: close the inherited child end after a successful clone.
    pub fn close_child_end(&self) {
        let _ = close(self.child_fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn release_wakes_a_blocked_reader() {
        let channel = SyncChannel::new().unwrap();
        let child_fd = channel.child_fd;

        let reader = thread::spawn(move || {
            let mut buf = [0u8; 1];
            read(child_fd, &mut buf).unwrap()
        });

        thread::sleep(Duration::from_millis(50));
        channel.release().unwrap();
        assert_eq!(reader.join().unwrap(), 1);
    }
}
