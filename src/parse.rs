use std::fmt;

use bytes::Bytes;
use http::{HeaderValue, StatusCode};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Default port for CONNECT targets without a usable port.
pub const DEFAULT_CONNECT_PORT: u16 = 443;
/// Default port for plain HTTP destinations without a usable port.
pub const DEFAULT_HTTP_PORT: u16 = 80;

const MAX_HEADERS: usize = 100;

/// Host and port of a tunnel destination.
///
/// IPv6 literals are stored without brackets and displayed with them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Authority {
    /// Hostname or IP literal.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, falling back to `default_port` when the port is
    /// missing, unparsable or zero.
    ///
    /// Accepts bracketed IPv6 literals (`[::1]:8080`). Returns `None` for an
    /// empty host.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']')?;
            (host, after.strip_prefix(':'))
        } else {
            match s.rsplit_once(':') {
                // An unbracketed IPv6 literal has no port segment.
                Some((host, _)) if host.contains(':') => (s, None),
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };
        let host = host.trim();
        if host.is_empty() {
            return None;
        }
        let port = port
            .and_then(|p| p.trim().parse::<u16>().ok())
            .filter(|p| *p != 0)
            .unwrap_or(default_port);
        Some(Self::new(host, port))
    }

    /// Extracts the authority from an absolute `http://host[:port]/path` URI.
    pub fn from_absolute_uri(uri: &str) -> Option<Self> {
        let rest = strip_http_scheme(uri)?;
        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = &rest[..end];
        // Drop userinfo, it never addresses the destination.
        let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
        Self::parse_with_default_port(authority, DEFAULT_HTTP_PORT)
    }
}

fn strip_http_scheme(uri: &str) -> Option<&str> {
    let scheme = uri.get(..7)?;
    scheme
        .eq_ignore_ascii_case("http://")
        .then(|| &uri[7..])
}

/// Converts a request target to origin form.
///
/// Absolute `http://` targets lose scheme and authority; targets that are
/// already in origin form (or `*`) are returned unchanged.
pub fn to_origin_form(target: &str) -> String {
    let Some(rest) = strip_http_scheme(target) else {
        return target.to_string();
    };
    match rest.find(['/', '?', '#']) {
        None => "/".to_string(),
        Some(idx) => match &rest[idx..] {
            path if path.starts_with('/') => path.to_string(),
            path if path.starts_with('?') => format!("/{path}"),
            _ => "/".to_string(),
        },
    }
}

/// Parsed client request head.
///
/// Keeps the raw header lines so that plain HTTP requests can be forwarded
/// verbatim after their request line is rewritten.
#[derive(derive_more::Debug)]
pub struct HttpRequest {
    /// Method token exactly as sent by the client.
    pub method: String,
    /// Request target exactly as sent by the client.
    pub target: String,
    /// Minor HTTP version (`1` for HTTP/1.1, `0` for HTTP/1.0).
    pub version: u8,
    /// Parsed header map.
    pub headers: http::HeaderMap<HeaderValue>,
    /// Header lines following the request line, including the final empty line.
    #[debug("{} bytes", raw_headers.len())]
    raw_headers: Bytes,
}

impl HttpRequest {
    /// Reads and parses the request line and header section.
    ///
    /// Removes the header section from `reader`; body bytes that arrived with
    /// the head stay buffered. Returns `Ok(None)` if the client closed the
    /// connection without sending anything or sent an empty first line.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Option<Self>> {
        loop {
            if reader.is_full() {
                return Err(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "Buffer size limit reached before end of request header section",
                )
                .into());
            }
            let n = reader.buffer_more().await?;
            if starts_with_empty_line(reader.buffer()) {
                return Ok(None);
            }
            if n == 0 {
                if reader.buffer().is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection closed before end of request header section",
                )
                .into());
            }
            if let Some((len, request)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(Some(request));
            }
        }
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        Ok(Self::parse_with_len(buf)?.map(|(_len, req)| req))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req.parse(buf).std_context("Invalid HTTP request")? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };
        let method = req.method.context("Missing HTTP method")?.to_string();
        let target = req.path.context("Missing request target")?.to_string();
        let version = req.version.context("Missing HTTP version")?;
        let headers = http::HeaderMap::from_iter(req.headers.iter().flat_map(|h| {
            let value = HeaderValue::from_bytes(h.value).ok()?;
            let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            Some((name, value))
        }));
        let line_end = buf[..header_len]
            .iter()
            .position(|b| *b == b'\n')
            .context("Missing request line terminator")?
            + 1;
        let raw_headers = Bytes::copy_from_slice(&buf[line_end..header_len]);
        Ok(Some((
            header_len,
            Self {
                method,
                target,
                version,
                headers,
                raw_headers,
            },
        )))
    }

    /// Returns true for a CONNECT request, ignoring case.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Returns the tunnel destination of a CONNECT request.
    pub fn connect_target(&self) -> Option<Authority> {
        Authority::parse_with_default_port(&self.target, DEFAULT_CONNECT_PORT)
    }

    /// Returns the destination of a plain HTTP request.
    ///
    /// Prefers the `Host` header and falls back to an absolute-form target.
    pub fn forward_target(&self) -> Option<Authority> {
        self.host()
            .and_then(|host| Authority::parse_with_default_port(host, DEFAULT_HTTP_PORT))
            .or_else(|| Authority::from_absolute_uri(&self.target))
    }

    /// Returns the `Host` header value.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|x| x.to_str().ok())
    }

    /// Formats the request line with an origin-form target.
    pub fn origin_form_request_line(&self) -> String {
        format!(
            "{} {} HTTP/1.{}\r\n",
            self.method,
            to_origin_form(&self.target),
            self.version
        )
    }

    /// Writes the origin-form request line followed by the client's header
    /// lines and the terminating empty line.
    pub async fn write_origin_form(
        &self,
        writer: &mut (impl AsyncWrite + Send + Unpin),
    ) -> io::Result<()> {
        let mut head = Vec::with_capacity(self.target.len() + self.raw_headers.len() + 32);
        head.extend_from_slice(self.origin_form_request_line().as_bytes());
        head.extend_from_slice(&self.raw_headers);
        writer.write_all(&head).await?;
        writer.flush().await
    }
}

fn starts_with_empty_line(buf: &[u8]) -> bool {
    buf.starts_with(b"\r\n") || buf.starts_with(b"\n")
}

/// Parsed HTTP response head with status, reason, and headers.
#[derive(derive_more::Debug)]
pub struct HttpResponse {
    /// Minor HTTP version of the status line.
    pub version: u8,
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    /// Raw header map as received.
    pub headers: http::HeaderMap<HeaderValue>,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: 1,
            status,
            reason: None,
            headers: http::HeaderMap::new(),
        }
    }

    pub fn with_reason(status: StatusCode, reason: impl ToString) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(status)
        }
    }

    /// Writes the status line, headers, and the terminating empty line.
    pub async fn write(&self, writer: &mut (impl AsyncWrite + Send + Unpin)) -> io::Result<()> {
        let mut head = self.status_line();
        for (key, value) in self.headers.iter() {
            head.push_str(key.as_str());
            head.push_str(": ");
            head.push_str(value.to_str().unwrap_or_default());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        writer.write_all(head.as_bytes()).await?;
        writer.flush().await
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats the status line, including its line terminator.
    pub fn status_line(&self) -> String {
        format!(
            "HTTP/1.{} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.reason()
        )
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let version = res.version.context("Missing response version")?;
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let reason = res
                    .reason
                    .filter(|r| !r.is_empty())
                    .map(ToOwned::to_owned);
                let headers = http::HeaderMap::from_iter(res.headers.iter().flat_map(|h| {
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    let name = http::HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    header_len,
                    HttpResponse {
                        version,
                        status,
                        reason,
                        headers,
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Removes the header section from `reader`; bytes after it stay buffered.
    pub async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        loop {
            if reader.is_full() {
                return Err(anyerr!(
                    "Buffer size limit reached before end of response header section"
                ));
            }
            if reader.buffer_more().await? == 0 {
                return Err(anyerr!(
                    "Connection closed before end of response header section"
                ));
            }
            if let Some((len, response)) = Self::parse_with_len(reader.buffer())? {
                reader.discard(len);
                return Ok(response);
            }
        }
    }
}
