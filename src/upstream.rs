use std::time::Duration;

use dynosaur::dynosaur;
use n0_error::e;
use tokio::net::TcpStream;
use tokio_util::time::FutureExt;
use tracing::{debug, trace};

use crate::{
    config::{UpstreamConfig, UpstreamKind},
    error::UpstreamError,
    parse::Authority,
    util::Prebuffered,
};

mod auth;
mod http;
mod socks5;

pub use self::{auth::Credentials, http::HttpConnectClient, socks5::Socks5Client};

/// Default timeout for opening the TCP connection to the upstream proxy.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// An established tunnel through the upstream proxy.
///
/// Bytes the proxy sent after its handshake reply are kept in the buffer and
/// are yielded first when reading.
pub type TunnelStream = Prebuffered<TcpStream>;

#[dynosaur(pub(crate) DynUpstreamConnector = dyn(box) UpstreamConnector)]
/// Opens tunnels to target hosts through an upstream proxy.
///
/// A connector is shared by all connections of a server and must not hold
/// per-connection state.
pub trait UpstreamConnector: Send + Sync {
    /// Opens a fresh tunnel to `target`.
    ///
    /// On success the returned stream is positioned at the first tunneled byte.
    /// On error nothing is left open.
    fn connect<'a>(
        &'a self,
        target: &'a Authority,
    ) -> impl Future<Output = Result<TunnelStream, UpstreamError>> + Send + 'a;
}

/// Connector for the upstream kind selected in an [`UpstreamConfig`].
#[derive(Debug, Clone)]
pub enum Upstream {
    Http(HttpConnectClient),
    Socks5(Socks5Client),
}

impl Upstream {
    /// Builds the connector described by `config`.
    ///
    /// The config is not validated here; see [`UpstreamConfig::validate`].
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let credentials = Credentials::new(config.username.clone(), config.password.clone());
        match config.kind {
            UpstreamKind::Http => Self::Http(HttpConnectClient::new(config.addr(), credentials)),
            UpstreamKind::Socks5 => Self::Socks5(Socks5Client::new(config.addr(), credentials)),
        }
    }

    pub fn kind(&self) -> UpstreamKind {
        match self {
            Self::Http(_) => UpstreamKind::Http,
            Self::Socks5(_) => UpstreamKind::Socks5,
        }
    }

    pub fn proxy_addr(&self) -> &str {
        match self {
            Self::Http(client) => client.proxy_addr(),
            Self::Socks5(client) => client.proxy_addr(),
        }
    }

    /// Overrides the timeout for dialing the proxy.
    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        match self {
            Self::Http(client) => Self::Http(client.with_connect_timeout(timeout)),
            Self::Socks5(client) => Self::Socks5(client.with_connect_timeout(timeout)),
        }
    }
}

impl UpstreamConnector for Upstream {
    async fn connect<'a>(&'a self, target: &'a Authority) -> Result<TunnelStream, UpstreamError> {
        match self {
            Self::Http(client) => client.connect(target).await,
            Self::Socks5(client) => client.connect(target).await,
        }
    }
}

/// Opens a TCP connection to the upstream proxy.
pub(crate) async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, UpstreamError> {
    trace!(%addr, "dialing upstream");
    let stream = match TcpStream::connect(addr).timeout(timeout).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(e!(UpstreamError::Connect {
                addr: addr.to_string(),
                source
            }));
        }
        Err(_elapsed) => {
            return Err(e!(UpstreamError::ConnectTimeout {
                addr: addr.to_string()
            }));
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%addr, "failed to set TCP_NODELAY: {err:#}");
    }
    Ok(stream)
}

pub(crate) fn check_target(target: &Authority) -> Result<(), UpstreamError> {
    if target.host.is_empty() {
        return Err(e!(UpstreamError::InvalidTarget {
            message: "empty host".to_string()
        }));
    }
    if target.port == 0 {
        return Err(e!(UpstreamError::InvalidTarget {
            message: format!("port 0 for host {}", target.host)
        }));
    }
    Ok(())
}
