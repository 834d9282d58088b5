//! SOCKS5 client side per RFC 1928, with RFC 1929 username/password auth.

use std::time::Duration;

use n0_error::e;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::{CONNECT_TIMEOUT, Credentials, TunnelStream, UpstreamConnector, check_target, dial};
use crate::{
    error::UpstreamError,
    parse::Authority,
    upstream::auth::USERPASS_VERSION,
    util::Prebuffered,
};

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const USERPASS_SUCCESS: u8 = 0x00;

/// Opens tunnels through a SOCKS5 proxy.
///
/// Targets are always sent as domain names, so name resolution happens on the
/// proxy side.
#[derive(Debug, Clone)]
pub struct Socks5Client {
    proxy_addr: String,
    credentials: Credentials,
    connect_timeout: Duration,
}

impl Socks5Client {
    /// Creates a client for the SOCKS5 proxy at `proxy_addr` (`host:port`).
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

    /// The single method offered in the greeting.
    fn offered_method(&self) -> u8 {
        if self.credentials.is_empty() {
            METHOD_NO_AUTH
        } else {
            METHOD_USERPASS
        }
    }

    /// Runs method negotiation, optional authentication and CONNECT on `stream`.
    ///
    /// Reads exactly the bytes of each server message and nothing beyond the
    /// CONNECT reply, so `stream` is positioned at the first tunneled byte on
    /// success.
    pub async fn handshake(
        &self,
        stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
        target: &Authority,
    ) -> Result<(), UpstreamError> {
        let connect_request = connect_request(target)?;
        let offered = self.offered_method();

        write_frame(stream, &[SOCKS_VERSION, 1, offered]).await?;
        let mut reply = [0u8; 2];
        read_exact(stream, &mut reply, "method selection").await?;
        if reply[0] != SOCKS_VERSION {
            return Err(protocol(format!(
                "invalid version {:#04x} in method selection",
                reply[0]
            )));
        }
        match reply[1] {
            METHOD_NO_ACCEPTABLE => return Err(protocol("no acceptable authentication method")),
            METHOD_NO_AUTH => debug!("upstream requires no authentication"),
            METHOD_USERPASS if offered == METHOD_USERPASS => {
                write_frame(stream, &self.credentials.userpass_request()?).await?;
                let mut status = [0u8; 2];
                read_exact(stream, &mut status, "authentication reply").await?;
                if status[0] != USERPASS_VERSION || status[1] != USERPASS_SUCCESS {
                    return Err(e!(UpstreamError::Auth {
                        message: format!(
                            "username/password rejected (status {:#04x} {:#04x})",
                            status[0], status[1]
                        )
                    }));
                }
                debug!("authenticated with upstream");
            }
            other => {
                return Err(protocol(format!(
                    "upstream selected method {other:#04x} which was not offered"
                )));
            }
        }

        write_frame(stream, &connect_request).await?;
        let mut header = [0u8; 4];
        read_exact(stream, &mut header, "CONNECT reply").await?;
        if header[0] != SOCKS_VERSION {
            return Err(protocol(format!(
                "invalid version {:#04x} in CONNECT reply",
                header[0]
            )));
        }
        if header[1] != REPLY_SUCCEEDED {
            return Err(protocol(format!(
                "CONNECT to {target} failed: {}",
                reply_message(header[1])
            )));
        }
        let bound_len = match header[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                read_exact(stream, &mut len, "bound address length").await?;
                len[0] as usize + 2
            }
            other => return Err(protocol(format!("unknown bound address type {other:#04x}"))),
        };
        let mut bound = vec![0u8; bound_len];
        read_exact(stream, &mut bound, "bound address").await?;
        Ok(())
    }
}

impl UpstreamConnector for Socks5Client {
    async fn connect<'a>(&'a self, target: &'a Authority) -> Result<TunnelStream, UpstreamError> {
        check_target(target)?;
        // Reject oversized fields before dialing.
        connect_request(target)?;
        if !self.credentials.is_empty() {
            self.credentials.check_userpass_len()?;
        }
        let mut stream = dial(&self.proxy_addr, self.connect_timeout).await?;
        self.handshake(&mut stream, target).await?;
        debug!(%target, "SOCKS5 tunnel established");
        Ok(Prebuffered::new(stream, 0))
    }
}

/// Encodes `VER CMD RSV ATYP=domain LEN HOST PORT`.
fn connect_request(target: &Authority) -> Result<Vec<u8>, UpstreamError> {
    let host = target.host.as_bytes();
    let host_len = u8::try_from(host.len()).map_err(|_| {
        e!(UpstreamError::InvalidTarget {
            message: format!("host is {} bytes, at most 255 allowed", host.len())
        })
    })?;
    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN, host_len]);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}

fn reply_message(code: u8) -> String {
    match code {
        0x01 => "general SOCKS server failure".to_string(),
        0x02 => "connection not allowed by ruleset".to_string(),
        0x03 => "network unreachable".to_string(),
        0x04 => "host unreachable".to_string(),
        0x05 => "connection refused".to_string(),
        0x06 => "TTL expired".to_string(),
        0x07 => "command not supported".to_string(),
        0x08 => "address type not supported".to_string(),
        other => format!("unknown reply code {other:#04x}"),
    }
}

fn protocol(message: impl Into<String>) -> UpstreamError {
    e!(UpstreamError::Protocol {
        message: message.into()
    })
}

async fn write_frame(
    stream: &mut (impl AsyncWrite + Unpin),
    frame: &[u8],
) -> Result<(), UpstreamError> {
    stream
        .write_all(frame)
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))?;
    stream
        .flush()
        .await
        .map_err(|source| e!(UpstreamError::Io { source }))
}

/// Fills `buf` completely; a premature EOF is a protocol violation.
async fn read_exact(
    stream: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
    what: &str,
) -> Result<(), UpstreamError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(protocol(format!(
            "connection closed while reading {what}"
        ))),
        Err(source) => Err(e!(UpstreamError::Io { source })),
    }
}
