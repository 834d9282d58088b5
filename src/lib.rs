//! Local HTTP forward proxy that chains every connection through an upstream
//! HTTP or SOCKS5 proxy.
//!
//! ```ignore
//! let config = UpstreamConfig::new(UpstreamKind::Socks5, "10.0.0.1", 1080)
//!     .with_credentials("user", "secret");
//! config.validate()?;
//! let server = LocalProxyServer::from_config(&config, ServerOpts::default());
//! let addr = server.start().await?;
//! // point clients at `addr` ...
//! server.stop().await;
//! ```

pub mod config;
pub mod downstream;
pub mod error;
mod parse;
pub mod upstream;
mod util;

#[cfg(test)]
mod tests;

pub use self::{
    config::{ProxyConfigFile, UpstreamConfig, UpstreamKind},
    downstream::{LocalProxyServer, ProxyError, ServerOpts},
    error::{ConfigError, ServerError, UpstreamError},
    parse::{Authority, HttpRequest, HttpResponse},
    upstream::{
        Credentials, HttpConnectClient, Socks5Client, TunnelStream, Upstream, UpstreamConnector,
    },
    util::{Prebuffered, RelayStats},
};

/// Maximum size of an HTTP request or response head we buffer before giving up.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;
