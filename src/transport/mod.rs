//! The guest-transport matrix: selects between VM sockets, virtio serial,
//! and IPv6 link-local TCP, and produces a lazy stream of listeners for the
//! RPC server to drive.

pub mod serial;
pub mod tcp;
pub mod vsock;

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A dialable/listenable address for the agent's RPC surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32 },
    Tcp { addr: IpAddr },
    Serial { device_path: PathBuf },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Vsock { cid } => write!(f, "cid:{cid}"),
            Endpoint::Tcp { addr } => write!(f, "tcp:{addr}"),
            Endpoint::Serial { device_path } => write!(f, "{}", device_path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("cid:") {
            let cid: u32 = rest
                .parse()
                .map_err(|_| Error::config(format!("invalid vsock cid: {rest}")))?;
            return Ok(Endpoint::Vsock { cid });
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            let addr: IpAddr = rest
                .parse()
                .map_err(|_| Error::config(format!("invalid tcp address: {rest}")))?;
            return Ok(Endpoint::Tcp { addr });
        }
        if s.contains('/') {
            return Ok(Endpoint::Serial {
                device_path: PathBuf::from(s),
            });
        }
        Err(Error::config(format!("unrecognized endpoint: {s}")))
    }
}

/// One accepted connection, transport-tagged so the RPC server can decide
/// whether to run a TLS handshake (vsock, tcp) or serve it plaintext (serial).
pub enum Conn {
    Vsock(tokio_vsock::VsockStream),
    Serial(serial::SerialConn),
    Tcp(tokio::net::TcpStream),
}

impl Conn {
    pub fn wants_tls(&self) -> bool {
        !matches!(self, Conn::Serial(_))
    }
}

impl tokio::io::AsyncRead for Conn {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Conn::Serial(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Conn::Tcp(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Conn {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Conn::Vsock(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Conn::Serial(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Conn::Tcp(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => std::pin::Pin::new(s).poll_flush(cx),
            Conn::Serial(s) => std::pin::Pin::new(s).poll_flush(cx),
            Conn::Tcp(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Conn::Vsock(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Conn::Serial(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Conn::Tcp(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A listener the RPC server can `accept()` from repeatedly.
pub enum TransportListener {
    Vsock(vsock::VsockListener),
    Serial(serial::SerialListener),
    Tcp { listener: tokio::net::TcpListener, label: String },
}

impl TransportListener {
    pub async fn accept(&mut self) -> Result<Conn> {
        match self {
            TransportListener::Vsock(l) => l.accept().await.map(Conn::Vsock),
            TransportListener::Serial(l) => l.accept().await.map(Conn::Serial),
            TransportListener::Tcp { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Conn::Tcp(stream))
            }
        }
    }

    pub fn label(&self) -> String {
        match self {
            TransportListener::Vsock(_) => "vsock".to_string(),
            TransportListener::Serial(l) => format!("serial:{}", l.device_path().display()),
            TransportListener::Tcp { label, .. } => label.clone(),
        }
    }
}

/// The result of running the transport-selection algorithm: a primary
/// listener (fatal if unobtainable) and a channel of secondary TCP listeners
/// discovered lazily as link-local addresses appear.
pub struct TransportMatrix {
    pub primary: TransportListener,
    pub secondary: tokio::sync::mpsc::Receiver<TransportListener>,
}

/// Picks the primary RPC transport (vsock, falling back to virtio serial),
/// then spawns discovery of secondary link-local TCP listeners.
pub async fn build(
    config: &crate::config::AgentConfig,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<TransportMatrix> {
    let use_vsock = !config.legacy_mode && vsock::is_available();

    let primary = if use_vsock {
        TransportListener::Vsock(vsock::VsockListener::bind(crate::config::RPC_PORT)?)
    } else {
        TransportListener::Serial(serial::SerialListener::open(&config.serial_path)?)
    };

    let (tx, rx) = tokio::sync::mpsc::channel(4);

    let is_serial_primary = matches!(primary, TransportListener::Serial(_));
    if is_serial_primary && !config.without_tcp {
        tokio::spawn(tcp::poll_link_local(tx, cancel));
    } else {
        drop(tx);
    }

    Ok(TransportMatrix {
        primary,
        secondary: rx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vsock_endpoint() {
        assert_eq!(
            "cid:42".parse::<Endpoint>().unwrap(),
            Endpoint::Vsock { cid: 42 }
        );
    }

    #[test]
    fn parses_tcp_endpoint() {
        assert_eq!(
            "tcp:fe80::1".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp {
                addr: "fe80::1".parse().unwrap()
            }
        );
    }

    #[test]
    fn parses_serial_endpoint_as_path() {
        match "/var/run/agent.sock".parse::<Endpoint>().unwrap() {
            Endpoint::Serial { device_path } => {
                assert_eq!(device_path, PathBuf::from("/var/run/agent.sock"))
            }
            other => panic!("unexpected endpoint: {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("garbage".parse::<Endpoint>().is_err());
    }
}
