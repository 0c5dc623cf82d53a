//! VM-socket (AF_VSOCK) transport.

use tokio_vsock::{VsockAddr, VsockStream, VMADDR_CID_ANY};

use crate::error::Result;

/// Returns true when the vsock character device is present, i.e. the guest
/// kernel exposes `/dev/vsock`.
pub fn is_available() -> bool {
    std::path::Path::new("/dev/vsock").exists()
}

pub struct VsockListener {
    inner: tokio_vsock::VsockListener,
}

impl VsockListener {
    pub fn bind(port: u32) -> Result<Self> {
        let inner = tokio_vsock::VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, port))?;
        Ok(Self { inner })
    }

    pub async fn accept(&mut self) -> Result<VsockStream> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }
}
