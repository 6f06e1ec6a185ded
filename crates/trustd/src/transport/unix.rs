//! Local-socket binding: newline-delimited frames over a Unix domain socket
//!
//! Stale endpoint policy: every listener holds an exclusive `flock` on
//! `<path>.lock` for as long as it lives. Binding fails while another
//! instance holds that lock. Otherwise a socket file at the path was left
//! behind by a crashed instance and is unlinked and rebound. A path that
//! exists but is not a socket is never touched.

use futures::{SinkExt, StreamExt};
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::error::ChannelError;

/// One end of a local-socket channel
#[derive(Debug)]
pub struct UnixChannel {
    framed: Framed<UnixStream, LinesCodec>,
    peer_uid: Option<u32>,
    /// The codec reports end of stream once after a decode error
    resync: bool,
}

impl UnixChannel {
    pub fn new(stream: UnixStream, max_frame_bytes: usize) -> Self {
        let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
        Self {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(max_frame_bytes)),
            peer_uid,
            resync: false,
        }
    }

    /// Connect to a listening endpoint
    pub async fn connect(path: &Path, max_frame_bytes: usize) -> Result<Self, ChannelError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream, max_frame_bytes))
    }

    pub async fn send(&mut self, frame: &str) -> Result<(), ChannelError> {
        self.framed.send(frame).await.map_err(codec_error)
    }

    /// Next frame. Cancel-safe: a partially read line stays buffered.
    ///
    /// An oversized frame is reported as `Malformed` and skipped up to its
    /// newline; the channel stays usable.
    pub async fn receive(&mut self) -> Result<String, ChannelError> {
        loop {
            match self.framed.next().await {
                Some(Ok(line)) => {
                    self.resync = false;
                    return Ok(line);
                }
                Some(Err(e)) => {
                    let err = codec_error(e);
                    self.resync = matches!(err, ChannelError::Malformed(_));
                    return Err(err);
                }
                None if std::mem::take(&mut self.resync) => continue,
                None => return Err(ChannelError::Closed),
            }
        }
    }

    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    pub async fn close(mut self) {
        let _ = self.framed.get_mut().shutdown().await;
    }
}

fn codec_error(err: LinesCodecError) -> ChannelError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            ChannelError::Malformed("frame exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
            ChannelError::Malformed(e.to_string())
        }
        LinesCodecError::Io(e) if is_disconnect(&e) => ChannelError::Closed,
        LinesCodecError::Io(e) => ChannelError::Io(e),
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

/// A bound local-socket endpoint. Unlinks its path when dropped.
#[derive(Debug)]
pub struct UnixEndpoint {
    listener: UnixListener,
    path: PathBuf,
    max_frame_bytes: usize,
    /// Held for the listener's lifetime
    _lock: File,
}

impl UnixEndpoint {
    pub async fn bind(path: &Path, max_frame_bytes: usize, private: bool) -> Result<Self, ChannelError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock = lock_endpoint(path)?;
        clear_stale_endpoint(path)?;

        let listener = UnixListener::bind(path)?;

        if private {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        debug!("Listening on {}", path.display());

        Ok(Self {
            listener,
            path: path.to_path_buf(),
            max_frame_bytes,
            _lock: lock,
        })
    }

    /// Accept the next connection. Cancel-safe.
    pub async fn accept(&self) -> Result<UnixChannel, ChannelError> {
        let stream = self.accept_stream().await?;
        Ok(UnixChannel::new(stream, self.max_frame_bytes))
    }

    /// Accept the next connection without framing it
    pub async fn accept_stream(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for UnixEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

/// Take the endpoint's lock without touching whatever listens on the socket.
/// The lock file is left in place when the listener goes away.
fn lock_endpoint(path: &Path) -> Result<File, ChannelError> {
    let lock_path = lock_path(path);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(&lock_path)?;

    // SAFETY: the descriptor is owned by `file` and outlives the call
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(file);
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is in use by a running instance", path.display()),
        )
        .into());
    }
    Err(err.into())
}

/// Called with the endpoint lock held, so any socket at `path` is stale
fn clear_stale_endpoint(path: &Path) -> Result<(), ChannelError> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )
        .into());
    }

    warn!("Removing stale endpoint {}", path.display());
    std::fs::remove_file(path)?;
    Ok(())
}
