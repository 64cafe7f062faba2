//! Bounded waits on a readiness handshake.

use std::io;
use std::os::fd::AsFd;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::Pid;
use warden_core::handshake::{AwaitReady, HandshakeError};

/// Wraps a waiter so it gives up after `timeout`.
///
/// The descriptor is polled until it becomes readable (a token or the
/// peer's hangup), then the inner waiter reads it.
#[derive(Debug)]
pub struct Deadline<R> {
    inner: R,
    timeout: Duration,
}

impl<R> Deadline<R> {
    /// Bounds `inner` by `timeout`.
    pub const fn new(inner: R, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<R: AwaitReady + AsFd> AwaitReady for Deadline<R> {
    fn await_ready(self) -> Result<Pid, HandshakeError> {
        let Some(deadline) = Instant::now().checked_add(self.timeout) else {
            return self.inner.await_ready();
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(timeout = ?self.timeout, "handshake timed out");
                return Err(HandshakeError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no readiness token within {:?}", self.timeout),
                )));
            }

            let slice = u16::try_from(remaining.as_millis().max(1)).unwrap_or(u16::MAX);
            let mut fds = [PollFd::new(self.inner.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(slice)) {
                Ok(0) | Err(Errno::EINTR) => {}
                Ok(_) => break,
                Err(e) => return Err(HandshakeError::Io(io::Error::from(e))),
            }
        }

        self.inner.await_ready()
    }
}
