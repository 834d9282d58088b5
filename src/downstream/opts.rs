use std::net::{Ipv4Addr, SocketAddr};

use crate::HEADER_SECTION_MAX_LENGTH;

/// Port the local proxy listens on unless configured otherwise.
pub const DEFAULT_LISTEN_PORT: u16 = 18080;

/// Options for the [`LocalProxyServer`](super::LocalProxyServer).
#[derive(Debug, Clone)]
pub struct ServerOpts {
    /// Address to bind the listener to. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Maximum size of a client request head in bytes.
    pub max_header_len: usize,
}

impl Default for ServerOpts {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_LISTEN_PORT)),
            max_header_len: HEADER_SECTION_MAX_LENGTH,
        }
    }
}

impl ServerOpts {
    /// Sets the listen address.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    /// Listens on an ephemeral loopback port.
    pub fn ephemeral() -> Self {
        Self::default().listen(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }

    /// Sets the maximum request head size.
    pub fn max_header_len(mut self, len: usize) -> Self {
        self.max_header_len = len;
        self
    }
}
