//! Byte-stream transport to the presence peer.
//!
//! The peer listens on one of [`IPC_SLOT_COUNT`] numbered local endpoints
//! (`discord-ipc-0` .. `discord-ipc-9`); which one is picked per peer process.
//! [`Connector`] opens a slot, [`Channel`] moves bytes with bounded waits.
//!
//! Every read and write carries an explicit timeout so a wedged peer cannot
//! hang the calling thread. On any failure the channel shuts its socket down
//! before returning, so no half-open handle stays live.

use std::time::Duration;

use crate::error::PresenceError;

pub const IPC_SLOT_COUNT: u8 = 10;
pub const IPC_NAME_PREFIX: &str = "discord-ipc-";

pub trait Channel: Send {
    fn write_timed(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), PresenceError>;

    /// Reads exactly `len` bytes or fails once `timeout` has elapsed in total.
    fn read_timed(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, PresenceError>;

    /// Non-blocking zero-length probe. Fails fast when the peer already
    /// closed its end.
    fn probe(&mut self) -> Result<(), PresenceError>;

    fn close(&mut self);
}

pub trait Connector: Send {
    fn channel_name(&self, slot: u8) -> String;

    fn open(&self, slot: u8) -> Result<Box<dyn Channel>, PresenceError>;
}

pub fn slot_name(slot: u8) -> String {
    format!("{}{}", IPC_NAME_PREFIX, slot)
}

#[cfg(unix)]
pub use unix::{UnixChannel, UnixSocketConnector};

#[cfg(unix)]
mod unix {
    use super::{slot_name, Channel, Connector};
    use crate::error::PresenceError;
    use std::env;
    use std::io::{ErrorKind, Read, Write};
    use std::net::Shutdown;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    const IPC_DIR_ENV: &str = "PRESENCE_IPC_DIR";
    const RUNTIME_DIR_ENVS: [&str; 4] = ["XDG_RUNTIME_DIR", "TMPDIR", "TMP", "TEMP"];
    // Sandboxed peer installs (flatpak, snap) nest the socket one level down.
    const SANDBOX_SUBDIRS: [&str; 2] = ["app/com.discordapp.Discord", "snap.discord"];
    const MIN_TIMEOUT: Duration = Duration::from_millis(1);

    pub struct UnixSocketConnector {
        dirs: Vec<PathBuf>,
    }

    impl UnixSocketConnector {
        /// Resolves the socket directory from `PRESENCE_IPC_DIR`, then the
        /// usual runtime/temp variables, then `/tmp`.
        pub fn from_env() -> Self {
            if let Ok(dir) = env::var(IPC_DIR_ENV) {
                if !dir.trim().is_empty() {
                    return Self::with_dir(dir);
                }
            }

            let base = RUNTIME_DIR_ENVS
                .iter()
                .filter_map(|key| env::var(key).ok())
                .find(|value| !value.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));

            let mut dirs = vec![base.clone()];
            dirs.extend(SANDBOX_SUBDIRS.iter().map(|sub| base.join(sub)));
            Self { dirs }
        }

        pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
            Self {
                dirs: vec![dir.into()],
            }
        }

        fn socket_paths(&self, slot: u8) -> impl Iterator<Item = PathBuf> + '_ {
            let name = slot_name(slot);
            self.dirs.iter().map(move |dir| dir.join(&name))
        }
    }

    impl Connector for UnixSocketConnector {
        fn channel_name(&self, slot: u8) -> String {
            self.dirs
                .first()
                .map(|dir| dir.join(slot_name(slot)).display().to_string())
                .unwrap_or_else(|| slot_name(slot))
        }

        fn open(&self, slot: u8) -> Result<Box<dyn Channel>, PresenceError> {
            let mut last_error = None;
            for path in self.socket_paths(slot) {
                match UnixStream::connect(&path) {
                    Ok(stream) => return Ok(Box::new(UnixChannel::new(stream))),
                    Err(err) => last_error = Some((path, err)),
                }
            }

            let (path, source) = last_error.unwrap_or_else(|| {
                (
                    PathBuf::from(slot_name(slot)),
                    std::io::Error::new(ErrorKind::NotFound, "no socket directory"),
                )
            });
            Err(unavailable(&path, source))
        }
    }

    fn unavailable(path: &Path, source: std::io::Error) -> PresenceError {
        PresenceError::ChannelUnavailable {
            name: path.display().to_string(),
            source,
        }
    }

    pub struct UnixChannel {
        stream: Option<UnixStream>,
    }

    impl UnixChannel {
        pub fn new(stream: UnixStream) -> Self {
            Self {
                stream: Some(stream),
            }
        }

        fn stream(&mut self) -> Result<&mut UnixStream, PresenceError> {
            self.stream.as_mut().ok_or(PresenceError::NotConnected)
        }

        fn fail(&mut self, err: PresenceError) -> PresenceError {
            self.close();
            err
        }

        fn write_inner(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), PresenceError> {
            let deadline = Instant::now() + timeout;
            let stream = self.stream()?;
            let mut written = 0;

            while written < bytes.len() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PresenceError::WriteTimeout);
                }
                stream
                    .set_write_timeout(Some(remaining.max(MIN_TIMEOUT)))
                    .map_err(|source| PresenceError::Io {
                        context: "set write timeout",
                        source,
                    })?;

                match stream.write(&bytes[written..]) {
                    Ok(0) => return Err(PresenceError::PeerClosed),
                    Ok(n) => written += n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                    {
                        return Err(PresenceError::WriteTimeout);
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
                        ) =>
                    {
                        return Err(PresenceError::PeerClosed);
                    }
                    Err(source) => {
                        return Err(PresenceError::Io {
                            context: "write",
                            source,
                        })
                    }
                }
            }

            stream.flush().map_err(|source| PresenceError::Io {
                context: "flush",
                source,
            })
        }

        fn read_inner(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, PresenceError> {
            let deadline = Instant::now() + timeout;
            let stream = self.stream()?;
            let mut buffer = vec![0u8; len];
            let mut filled = 0;

            while filled < len {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PresenceError::ReadTimeout);
                }
                stream
                    .set_read_timeout(Some(remaining.max(MIN_TIMEOUT)))
                    .map_err(|source| PresenceError::Io {
                        context: "set read timeout",
                        source,
                    })?;

                match stream.read(&mut buffer[filled..]) {
                    Ok(0) => return Err(PresenceError::PeerClosed),
                    Ok(n) => filled += n,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err)
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                    {
                        return Err(PresenceError::ReadTimeout);
                    }
                    Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                        return Err(PresenceError::PeerClosed);
                    }
                    Err(source) => {
                        return Err(PresenceError::Io {
                            context: "read",
                            source,
                        })
                    }
                }
            }

            Ok(buffer)
        }

        fn probe_inner(&mut self) -> Result<(), PresenceError> {
            let fd = self.stream()?.as_raw_fd();
            let mut byte = 0u8;
            // SAFETY: `fd` is owned by the live stream borrowed above and the
            // buffer is a valid one-byte local.
            let received = unsafe {
                libc::recv(
                    fd,
                    &mut byte as *mut u8 as *mut libc::c_void,
                    1,
                    libc::MSG_PEEK | libc::MSG_DONTWAIT,
                )
            };

            match received {
                0 => Err(PresenceError::PeerClosed),
                n if n > 0 => Ok(()),
                _ => {
                    let err = std::io::Error::last_os_error();
                    match err.kind() {
                        ErrorKind::WouldBlock | ErrorKind::Interrupted => Ok(()),
                        ErrorKind::ConnectionReset => Err(PresenceError::PeerClosed),
                        _ => Err(PresenceError::Io {
                            context: "probe",
                            source: err,
                        }),
                    }
                }
            }
        }
    }

    impl Channel for UnixChannel {
        fn write_timed(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), PresenceError> {
            self.write_inner(bytes, timeout)
                .map_err(|err| self.fail(err))
        }

        fn read_timed(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, PresenceError> {
            self.read_inner(len, timeout).map_err(|err| self.fail(err))
        }

        fn probe(&mut self) -> Result<(), PresenceError> {
            self.probe_inner().map_err(|err| self.fail(err))
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    impl Drop for UnixChannel {
        fn drop(&mut self) {
            self.close();
        }
    }

}
