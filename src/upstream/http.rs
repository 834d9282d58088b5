use std::time::Duration;

use http::StatusCode;
use n0_error::e;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{
    CONNECT_TIMEOUT, Credentials, TunnelStream, UpstreamConnector, check_target, dial,
};
use crate::{
    HEADER_SECTION_MAX_LENGTH,
    error::UpstreamError,
    parse::{Authority, HttpResponse},
    util::Prebuffered,
};

/// Opens tunnels through an HTTP proxy with `CONNECT`.
#[derive(Debug, Clone)]
pub struct HttpConnectClient {
    proxy_addr: String,
    credentials: Credentials,
    connect_timeout: Duration,
}

impl HttpConnectClient {
    /// Creates a client for the HTTP proxy at `proxy_addr` (`host:port`).
    pub fn new(proxy_addr: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            credentials,
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the timeout for dialing the proxy.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn proxy_addr(&self) -> &str {
        &self.proxy_addr
    }

    /// Formats the CONNECT request head for `target`.
    pub fn connect_request(&self, target: &Authority) -> String {
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = self.credentials.basic_auth_header() {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("Connection: keep-alive\r\n\r\n");
        request
    }
}

impl UpstreamConnector for HttpConnectClient {
    async fn connect<'a>(&'a self, target: &'a Authority) -> Result<TunnelStream, UpstreamError> {
        check_target(target)?;
        let stream = dial(&self.proxy_addr, self.connect_timeout).await?;
        let mut stream = Prebuffered::new(stream, HEADER_SECTION_MAX_LENGTH);
        stream
            .write_all(self.connect_request(target).as_bytes())
            .await
            .map_err(|source| e!(UpstreamError::Io { source }))?;

        let response = HttpResponse::read(&mut stream).await.map_err(|err| {
            e!(UpstreamError::Protocol {
                message: format!("invalid CONNECT response: {err:#}")
            })
        })?;
        debug!(status=%response.status, %target, "CONNECT response from upstream");

        // The stream is dropped, and the socket closed, on every error path below.
        if response.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            return Err(e!(UpstreamError::Auth {
                message: response.status_line().trim_end().to_string()
            }));
        }
        if !response.status.is_success() {
            return Err(e!(UpstreamError::Protocol {
                message: format!(
                    "CONNECT failed: {}",
                    response.status_line().trim_end()
                )
            }));
        }
        Ok(stream)
    }
}
