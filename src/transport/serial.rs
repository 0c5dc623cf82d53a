//! Virtio-serial transport: a single, long-lived character device shared
//! across every host-initiated session. `Close` on the *connection* is a
//! no-op; only closing the *listener* actually closes the descriptor.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::task::{Context, Poll};

use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{read, write};
use tokio::io::unix::AsyncFd;

use crate::error::Result;

/// Throttle between repeated `accept()` calls so a detached host end doesn't
/// cause a busy spin.
const ACCEPT_THROTTLE: std::time::Duration = std::time::Duration::from_secs(1);

pub struct SerialListener {
    fd: Arc<AsyncFd<OwnedFd>>,
    device_path: PathBuf,
    accepted_once: bool,
}

impl SerialListener {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = open(path, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty())?;
        let owned: OwnedFd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            fd: Arc::new(AsyncFd::new(owned)?),
            device_path: path.to_path_buf(),
            accepted_once: false,
        })
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Returns a handle to the same underlying device. After the first
    /// accept, every subsequent call throttles for one second before
    /// returning the same persistent connection.
    pub async fn accept(&mut self) -> Result<SerialConn> {
        if self.accepted_once {
            tokio::time::sleep(ACCEPT_THROTTLE).await;
        }
        self.accepted_once = true;
        Ok(SerialConn {
            fd: Arc::clone(&self.fd),
        })
    }
}

#[derive(Clone)]
pub struct SerialConn {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl tokio::io::AsyncRead for SerialConn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.fd.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|fd| {
                read(fd.as_raw_fd(), unfilled).map_err(std::io::Error::from)
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl tokio::io::AsyncWrite for SerialConn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.fd.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|fd| write(fd, buf).map_err(std::io::Error::from)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    /// A no-op: the device outlives any individual session. Only
    /// `SerialListener`'s drop (which closes the owned fd) really closes it.
    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
