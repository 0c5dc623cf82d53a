//! Endpoint parsing and channel construction for the three transports the
//! agent listens on: VM sockets, link-local TCP, and a UNIX socket proxying
//! the virtio-serial port.

use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_vsock::{VsockAddr, VsockStream};
use tonic::transport::{Channel, Endpoint as TonicEndpoint, Uri};
use tower::service_fn;

use guest_agent::config::RPC_PORT;
use guest_agent::tls;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Vsock { cid: u32 },
    Tcp { addr: IpAddr },
    Serial { socket_path: PathBuf },
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("cid:") {
            let cid: u32 = rest.parse().with_context(|| format!("invalid vsock cid: {rest}"))?;
            return Ok(Endpoint::Vsock { cid });
        }
        if let Some(rest) = s.strip_prefix("tcp:") {
            let addr: IpAddr = rest.parse().with_context(|| format!("invalid tcp address: {rest}"))?;
            return Ok(Endpoint::Tcp { addr });
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Serial {
                socket_path: PathBuf::from(s),
            });
        }
        bail!("unrecognized endpoint: {s} (expected cid:<u32>, tcp:<ip>, or /path)")
    }
}

impl Endpoint {
    /// Only the `cid:` endpoint can bootstrap into the embedded SSH
    /// endpoint: `secure-shell` dials the same VM socket's SSH port
    /// directly, which only makes sense on the vsock transport.
    pub fn cid(&self) -> Option<u32> {
        match self {
            Endpoint::Vsock { cid } => Some(*cid),
            _ => None,
        }
    }

    /// Dials the endpoint and returns a tonic channel ready for the
    /// generated service clients. `cert_dir` is unused for the serial
    /// path, which is plaintext.
    pub async fn connect(&self, cert_dir: &std::path::Path) -> Result<Channel> {
        match self {
            Endpoint::Vsock { cid } => {
                let cid = *cid;
                let tls_config = tls::client_config(cert_dir, true).context("building vsock tls config")?;
                let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
                let channel = TonicEndpoint::from_static("https://vsock")
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let connector = connector.clone();
                        async move {
                            let stream = VsockStream::connect(VsockAddr::new(cid, RPC_PORT))
                                .await
                                .map_err(std::io::Error::from)?;
                            let server_name = rustls::pki_types::ServerName::try_from("agent")
                                .expect("static dns name is valid");
                            let tls_stream = connector.connect(server_name, stream).await?;
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(tls_stream))
                        }
                    }))
                    .await
                    .context("connecting to vsock endpoint")?;
                Ok(channel)
            }
            Endpoint::Tcp { addr } => {
                let addr = *addr;
                let tls_config = tls::client_config(cert_dir, false).context("building tcp tls config")?;
                let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
                let channel = TonicEndpoint::from_static("https://guest")
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let connector = connector.clone();
                        async move {
                            let stream = tokio::net::TcpStream::connect((addr, RPC_PORT as u16)).await?;
                            let server_name = rustls::pki_types::ServerName::try_from("agent")
                                .expect("static dns name is valid");
                            let tls_stream = connector.connect(server_name, stream).await?;
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(tls_stream))
                        }
                    }))
                    .await
                    .context("connecting to tcp endpoint")?;
                Ok(channel)
            }
            Endpoint::Serial { socket_path } => {
                let socket_path = socket_path.clone();
                let channel = TonicEndpoint::from_static("http://serial")
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let socket_path = socket_path.clone();
                        async move {
                            let stream = tokio::net::UnixStream::connect(&socket_path).await?;
                            Ok::<_, std::io::Error>(hyper_util::rt::TokioIo::new(stream))
                        }
                    }))
                    .await
                    .context("connecting to serial proxy socket")?;
                Ok(channel)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vsock_cid() {
        assert_eq!(Endpoint::from_str("cid:3").unwrap(), Endpoint::Vsock { cid: 3 });
    }

    #[test]
    fn parses_tcp_address() {
        let ep = Endpoint::from_str("tcp:192.168.1.5").unwrap();
        assert_eq!(ep, Endpoint::Tcp { addr: "192.168.1.5".parse().unwrap() });
    }

    #[test]
    fn parses_serial_socket_path() {
        let ep = Endpoint::from_str("/run/guest-agent/agent.sock").unwrap();
        assert_eq!(
            ep,
            Endpoint::Serial { socket_path: PathBuf::from("/run/guest-agent/agent.sock") }
        );
    }

    #[test]
    fn rejects_unrecognized_scheme() {
        assert!(Endpoint::from_str("ftp:example").is_err());
    }

    #[test]
    fn cid_is_only_available_for_vsock_endpoints() {
        assert_eq!(Endpoint::from_str("cid:7").unwrap().cid(), Some(7));
        assert_eq!(Endpoint::from_str("tcp:10.0.0.1").unwrap().cid(), None);
    }
}
