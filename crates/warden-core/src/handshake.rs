//! One-shot readiness handshake between a launcher and its child.
//!
//! A pipe is created before `fork(2)` and both processes inherit it. The
//! signalling side writes its PID as a decimal token followed by a
//! newline; the waiting side blocks until that token arrives. Each
//! endpoint is consumed by its single operation, so a channel can carry
//! at most one message.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::unistd::{Pid, getpid, pipe2};
use thiserror::Error;
use warden_common::constants::MAX_HANDSHAKE_TOKEN_LEN;

/// Errors raised by either end of the handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The peer closed its end without writing a token.
    #[error("peer closed the handshake channel before signalling readiness")]
    Closed,

    /// The received bytes are not a valid process ID token.
    #[error("malformed handshake token {0:?}")]
    Malformed(String),

    /// The pipe could not be created.
    #[error("cannot create handshake pipe")]
    Channel(#[source] nix::Error),

    /// Reading or writing the descriptor failed.
    #[error("handshake I/O failed")]
    Io(#[from] io::Error),
}

/// Blocking wait for a peer's readiness token.
///
/// Implementations consume themselves: a channel is waited on once.
/// Wrappers that add a deadline implement this trait around a
/// [`ReadyReceiver`].
pub trait AwaitReady {
    /// Blocks until the peer's token arrives and returns the PID it carries.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Closed`] if the peer went away without
    /// signalling and [`HandshakeError::Malformed`] for an unparsable token.
    fn await_ready(self) -> Result<Pid, HandshakeError>;
}

/// Creates a connected sender/receiver pair.
///
/// Both descriptors are close-on-exec: they survive `fork(2)` but never
/// leak into the executed workload.
///
/// # Errors
///
/// Returns [`HandshakeError::Channel`] if `pipe2(2)` fails.
pub fn channel() -> Result<(ReadySender, ReadyReceiver), HandshakeError> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(HandshakeError::Channel)?;
    Ok((ReadySender::from_fd(write_end), ReadyReceiver::from_fd(read_end)))
}

/// Writing end of a handshake channel.
#[derive(Debug)]
pub struct ReadySender {
    fd: OwnedFd,
}

impl ReadySender {
    /// Takes ownership of an inherited descriptor.
    #[must_use]
    pub const fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Announces the calling process as ready.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] if the token cannot be written.
    pub fn signal_ready(self) -> Result<(), HandshakeError> {
        self.send(getpid())
    }

    /// Sends `pid` as the readiness token and closes the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Io`] if the token cannot be written.
    pub fn send(self, pid: Pid) -> Result<(), HandshakeError> {
        let token = format!("{pid}\n");
        let mut pipe = File::from(self.fd);
        pipe.write_all(token.as_bytes())?;
        pipe.flush()?;
        tracing::debug!(pid = pid.as_raw(), "readiness signalled");
        Ok(())
    }
}

impl AsFd for ReadySender {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Reading end of a handshake channel.
#[derive(Debug)]
pub struct ReadyReceiver {
    fd: OwnedFd,
}

impl ReadyReceiver {
    /// Takes ownership of an inherited descriptor.
    #[must_use]
    pub const fn from_fd(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Blocks until the peer's token arrives. See [`AwaitReady::await_ready`].
    ///
    /// # Errors
    ///
    /// See [`AwaitReady::await_ready`].
    pub fn await_ready(self) -> Result<Pid, HandshakeError> {
        let mut pipe = File::from(self.fd);
        let mut token = Vec::with_capacity(MAX_HANDSHAKE_TOKEN_LEN);
        let mut byte = [0_u8; 1];
        loop {
            match pipe.read(&mut byte) {
                Ok(0) => break,
                Ok(_) if byte[0] == b'\n' => return parse_token(&token),
                Ok(_) => {
                    token.push(byte[0]);
                    if token.len() >= MAX_HANDSHAKE_TOKEN_LEN {
                        return Err(HandshakeError::Malformed(lossy(&token)));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        if token.is_empty() {
            Err(HandshakeError::Closed)
        } else {
            Err(HandshakeError::Malformed(lossy(&token)))
        }
    }
}

impl AwaitReady for ReadyReceiver {
    fn await_ready(self) -> Result<Pid, HandshakeError> {
        Self::await_ready(self)
    }
}

impl AsFd for ReadyReceiver {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn lossy(token: &[u8]) -> String {
    String::from_utf8_lossy(token).into_owned()
}

fn parse_token(token: &[u8]) -> Result<Pid, HandshakeError> {
    let pid = std::str::from_utf8(token)
        .ok()
        .and_then(|text| text.parse::<i32>().ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| HandshakeError::Malformed(lossy(token)))?;
    tracing::debug!(pid, "readiness token received");
    Ok(Pid::from_raw(pid))
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn write_raw(sender: ReadySender, bytes: &[u8]) {
        let mut pipe = File::from(sender.fd);
        pipe.write_all(bytes).expect("raw write");
    }

    #[test]
    fn receiver_observes_sent_pid() {
        let (tx, rx) = channel().expect("channel");
        tx.send(Pid::from_raw(4242)).expect("send");
        assert_eq!(rx.await_ready().expect("await"), Pid::from_raw(4242));
    }

    #[test]
    fn signal_ready_sends_own_pid() {
        let (tx, rx) = channel().expect("channel");
        tx.signal_ready().expect("signal");
        assert_eq!(rx.await_ready().expect("await"), getpid());
    }

    #[test]
    fn receiver_blocks_until_delayed_signal() {
        let (tx, rx) = channel().expect("channel");
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            tx.send(Pid::from_raw(31337)).expect("send");
        });
        assert_eq!(rx.await_ready().expect("await"), Pid::from_raw(31337));
        writer.join().expect("writer thread");
    }

    #[test]
    fn receiver_reports_closed_when_peer_drops_sender() {
        let (tx, rx) = channel().expect("channel");
        drop(tx);
        assert!(matches!(rx.await_ready(), Err(HandshakeError::Closed)));
    }

    #[test]
    fn receiver_reports_closed_when_peer_exits_later() {
        let (tx, rx) = channel().expect("channel");
        let closer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(tx);
        });
        assert!(matches!(rx.await_ready(), Err(HandshakeError::Closed)));
        closer.join().expect("closer thread");
    }

    #[test]
    fn receiver_rejects_non_numeric_token() {
        let (tx, rx) = channel().expect("channel");
        write_raw(tx, b"ready\n");
        assert!(matches!(rx.await_ready(), Err(HandshakeError::Malformed(t)) if t == "ready"));
    }

    #[test]
    fn receiver_rejects_token_without_newline() {
        let (tx, rx) = channel().expect("channel");
        write_raw(tx, b"1234");
        assert!(matches!(rx.await_ready(), Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn receiver_rejects_zero_and_negative_pids() {
        for token in [&b"0\n"[..], &b"-5\n"[..]] {
            let (tx, rx) = channel().expect("channel");
            write_raw(tx, token);
            assert!(matches!(rx.await_ready(), Err(HandshakeError::Malformed(_))));
        }
    }

    #[test]
    fn receiver_rejects_oversized_token() {
        let (tx, rx) = channel().expect("channel");
        write_raw(tx, &[b'7'; MAX_HANDSHAKE_TOKEN_LEN + 8]);
        assert!(matches!(rx.await_ready(), Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn receiver_waits_through_generic_seam() {
        fn wait<W: AwaitReady>(waiter: W) -> Result<Pid, HandshakeError> {
            waiter.await_ready()
        }
        let (tx, rx) = channel().expect("channel");
        tx.send(Pid::from_raw(7)).expect("send");
        assert_eq!(wait(rx).expect("await"), Pid::from_raw(7));
    }
}
