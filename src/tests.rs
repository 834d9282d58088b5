use std::{net::SocketAddr, time::Duration};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, e};
use n0_future::task::AbortOnDropHandle;
use n0_tracing_test::traced_test;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
};
use tokio_util::time::FutureExt;
use tracing::debug;

use crate::{
    Authority, HttpResponse, LocalProxyServer, ServerError, ServerOpts, TunnelStream,
    UpstreamConfig, UpstreamConnector, UpstreamError, UpstreamKind, util::Prebuffered,
};

const CONNECT_OK: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

// -- Test helpers --

/// Spawns a mock HTTP proxy that accepts CONNECT and tunnels to the target.
///
/// With `required_auth`, requests without that `Proxy-Authorization` value get a 407.
async fn spawn_http_upstream(
    required_auth: Option<&'static str>,
) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    debug!(%addr, "spawned http upstream");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Err(err) = mock_upstream::serve_http(stream, required_auth).await {
                    debug!("mock http upstream failed: {err:#}");
                }
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a mock SOCKS5 proxy, optionally requiring username/password auth.
async fn spawn_socks5_upstream(
    credentials: Option<(&'static str, &'static str)>,
) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    debug!(%addr, "spawned socks5 upstream");
    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if let Err(err) = mock_upstream::serve_socks5(stream, credentials).await {
                    debug!("mock socks5 upstream failed: {err:#}");
                }
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a simple HTTP origin server that echoes back "{label} {method} {path}".
async fn spawn_origin_server(label: &'static str) -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let tcp_addr = listener.local_addr()?;
    debug!(%label, %tcp_addr, "spawned origin server");
    let task = tokio::spawn(async move { origin_server::run(listener, label).await });
    Ok((tcp_addr, AbortOnDropHandle::new(task)))
}

/// Spawns a simple TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a server that accepts one connection and returns the first request head.
///
/// Answers with an empty `200 OK` and closes.
async fn spawn_capturing_origin() -> Result<(SocketAddr, oneshot::Receiver<String>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            match stream.read(&mut byte).await {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await
            .ok();
        tx.send(String::from_utf8_lossy(&head).into_owned()).ok();
    });
    Ok((addr, rx))
}

/// Starts a local proxy on an ephemeral port.
async fn spawn_local_proxy(config: UpstreamConfig) -> Result<(SocketAddr, LocalProxyServer)> {
    let server = LocalProxyServer::from_config(&config, ServerOpts::ephemeral());
    let addr = server.start().await?;
    Ok((addr, server))
}

/// Sends a CONNECT request for `target` and returns the raw stream.
async fn send_connect(proxy_addr: SocketAddr, target: impl std::fmt::Display) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;
    Ok(stream)
}

async fn read_exact_timeout(stream: &mut TcpStream, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    stream
        .read_exact(&mut buf)
        .timeout(TEST_TIMEOUT)
        .await
        .anyerr()??;
    Ok(buf)
}

async fn read_to_end_timeout(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream
        .read_to_end(&mut buf)
        .timeout(TEST_TIMEOUT)
        .await
        .anyerr()??;
    Ok(buf)
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> Result {
    async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    .timeout(TEST_TIMEOUT)
    .await
    .anyerr()
}

fn closed_port_addr() -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?)
}

/// Connector that dials the target directly, without any proxy.
#[derive(Debug)]
struct DirectConnector;

impl UpstreamConnector for DirectConnector {
    async fn connect<'a>(&'a self, target: &'a Authority) -> Result<TunnelStream, UpstreamError> {
        let addr = target.to_string();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| e!(UpstreamError::Connect { addr, source }))?;
        Ok(Prebuffered::new(stream, 0))
    }
}

// -- Tests --

/// CONNECT through an HTTP upstream, with bytes pipelined after the request head.
#[tokio::test]
#[traced_test]
async fn test_connect_via_http_upstream() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (upstream_addr, _upstream) = spawn_http_upstream(Some("Basic dXNlcjpwYXNz")).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port())
        .with_credentials("user", "pass");
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(
            format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\nhello").as_bytes(),
        )
        .await?;
    assert_eq!(read_exact_timeout(&mut stream, CONNECT_OK.len()).await?, CONNECT_OK);
    assert_eq!(read_exact_timeout(&mut stream, 5).await?, b"hello");

    stream.write_all(b"more data").await?;
    assert_eq!(read_exact_timeout(&mut stream, 9).await?, b"more data");
    Ok(())
}

/// CONNECT through a SOCKS5 upstream with username/password auth.
#[tokio::test]
#[traced_test]
async fn test_connect_via_socks5_upstream() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (upstream_addr, _upstream) = spawn_socks5_upstream(Some(("user", "pass"))).await?;
    let config = UpstreamConfig::new(UpstreamKind::Socks5, "127.0.0.1", upstream_addr.port())
        .with_credentials("user", "pass");
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, echo_addr).await?;
    assert_eq!(read_exact_timeout(&mut stream, CONNECT_OK.len()).await?, CONNECT_OK);
    stream.write_all(b"ping").await?;
    assert_eq!(read_exact_timeout(&mut stream, 4).await?, b"ping");
    Ok(())
}

/// Unreachable upstream yields exactly a 502 response, then close.
#[tokio::test]
#[traced_test]
async fn test_connect_unreachable_upstream() -> Result {
    let dead = closed_port_addr()?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", dead.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, "example.com:443").await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_GATEWAY);
    Ok(())
}

/// Upstream answering 407 yields a 502 to the client.
#[tokio::test]
#[traced_test]
async fn test_connect_upstream_rejects_credentials() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (upstream_addr, _upstream) = spawn_http_upstream(Some("Basic dXNlcjpwYXNz")).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port())
        .with_credentials("user", "wrong");
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, echo_addr).await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_GATEWAY);
    Ok(())
}

/// SOCKS5 upstream refusing the target yields a 502 to the client.
#[tokio::test]
#[traced_test]
async fn test_connect_socks5_target_refused() -> Result {
    let dead = closed_port_addr()?;
    let (upstream_addr, _upstream) = spawn_socks5_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Socks5, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, dead).await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_GATEWAY);
    Ok(())
}

/// Plain requests get a 502 when the upstream cannot be reached.
#[tokio::test]
#[traced_test]
async fn test_plain_request_unreachable_upstream() -> Result {
    let dead = closed_port_addr()?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", dead.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_GATEWAY);
    Ok(())
}

/// Absolute-form requests are forwarded in origin form with headers unchanged.
#[tokio::test]
#[traced_test]
async fn test_plain_request_rewritten_to_origin_form() -> Result {
    let (origin_addr, captured) = spawn_capturing_origin().await?;
    let (upstream_addr, _upstream) = spawn_http_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(
            format!(
                "GET http://{origin_addr}/a?x=1 HTTP/1.1\r\nHost: {origin_addr}\r\nX-Test: yes\r\n\r\n"
            )
            .as_bytes(),
        )
        .await?;
    let response = read_to_end_timeout(&mut stream).await?;
    let (_, response) = HttpResponse::parse_with_len(&response)?.context("incomplete response")?;
    assert_eq!(response.status, StatusCode::OK);

    let head = captured.timeout(TEST_TIMEOUT).await.anyerr()?.anyerr()?;
    assert_eq!(
        head,
        format!("GET /a?x=1 HTTP/1.1\r\nHost: {origin_addr}\r\nX-Test: yes\r\n\r\n")
    );
    Ok(())
}

/// Without a Host header the destination comes from the absolute URI.
#[tokio::test]
#[traced_test]
async fn test_plain_request_without_host_header() -> Result {
    let (origin_addr, captured) = spawn_capturing_origin().await?;
    let (proxy_addr, _server) = {
        let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
        (server.start().await?, server)
    };

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(format!("GET http://{origin_addr} HTTP/1.0\r\n\r\n").as_bytes())
        .await?;
    read_to_end_timeout(&mut stream).await?;
    let head = captured.timeout(TEST_TIMEOUT).await.anyerr()?.anyerr()?;
    assert_eq!(head, "GET / HTTP/1.0\r\n\r\n");
    Ok(())
}

/// Requests without any destination host are closed without a response.
#[tokio::test]
#[traced_test]
async fn test_plain_request_without_destination() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    let proxy_addr = server.start().await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"GET /path HTTP/1.0\r\n\r\n").await?;
    assert!(read_to_end_timeout(&mut stream).await?.is_empty());
    Ok(())
}

/// A connection that sends nothing, or an empty first line, is closed silently.
#[tokio::test]
#[traced_test]
async fn test_empty_request_closes_silently() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    let proxy_addr = server.start().await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.shutdown().await?;
    assert!(read_to_end_timeout(&mut stream).await?.is_empty());

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"\r\n").await?;
    assert!(read_to_end_timeout(&mut stream).await?.is_empty());
    Ok(())
}

/// Invalid HTTP request returns 400 Bad Request.
#[tokio::test]
#[traced_test]
async fn test_invalid_http_request() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    let proxy_addr = server.start().await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(b"NOT VALID HTTP\r\n\r\n").await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_REQUEST);
    Ok(())
}

/// Request heads larger than the configured limit return 400 Bad Request.
#[tokio::test]
#[traced_test]
async fn test_oversized_request_head() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral().max_header_len(64));
    let proxy_addr = server.start().await?;

    // Exactly the limit, without the end of the header section.
    let mut request = b"GET http://example.com/ HTTP/1.1\r\nX-Padding: ".to_vec();
    request.resize(64, b'a');
    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream.write_all(&request).await?;
    assert_eq!(read_to_end_timeout(&mut stream).await?, BAD_REQUEST);
    Ok(())
}

/// Plain HTTP through an HTTP upstream with a regular client.
#[tokio::test]
#[traced_test]
async fn test_reqwest_via_http_upstream() -> Result {
    let (origin_addr, _origin) = spawn_origin_server("origin").await?;
    let (upstream_addr, _upstream) = spawn_http_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;
    let res = client
        .get(format!("http://{origin_addr}/test/path"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin GET /test/path");
    Ok(())
}

/// Plain HTTP through a SOCKS5 upstream with a regular client.
#[tokio::test]
#[traced_test]
async fn test_reqwest_via_socks5_upstream() -> Result {
    let (origin_addr, _origin) = spawn_origin_server("origin").await?;
    let (upstream_addr, _upstream) = spawn_socks5_upstream(Some(("user", "pass"))).await?;
    let config = UpstreamConfig::new(UpstreamKind::Socks5, "127.0.0.1", upstream_addr.port())
        .with_credentials("user", "pass");
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;
    let res = client
        .post(format!("http://{origin_addr}/submit"))
        .body("payload")
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin POST /submit");
    Ok(())
}

/// Multiple concurrent requests through the same proxy.
#[tokio::test]
#[traced_test]
async fn test_concurrent_requests() -> Result {
    let (origin_addr, _origin) = spawn_origin_server("origin").await?;
    let (upstream_addr, _upstream) = spawn_http_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let client = reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy_addr}")).anyerr()?)
        .build()
        .anyerr()?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        let url = format!("http://{origin_addr}/request/{i}");
        handles.push(tokio::spawn(async move {
            let res = client.get(&url).send().await?;
            let text = res.text().await?;
            Ok::<_, reqwest::Error>(text)
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let text = handle.await.anyerr()?.anyerr()?;
        assert_eq!(text, format!("origin GET /request/{i}"));
    }
    Ok(())
}

/// Closing the client side of a tunnel closes the target side.
#[tokio::test]
#[traced_test]
async fn test_client_close_propagates() -> Result {
    let target = TcpListener::bind("127.0.0.1:0").await?;
    let target_addr = target.local_addr()?;
    let (tx, rx) = oneshot::channel();
    let _target = AbortOnDropHandle::new(tokio::spawn(async move {
        let Ok((mut stream, _)) = target.accept().await else {
            return;
        };
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.ok();
        tx.send(received).ok();
    }));
    let (upstream_addr, _upstream) = spawn_socks5_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Socks5, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, target_addr).await?;
    assert_eq!(read_exact_timeout(&mut stream, CONNECT_OK.len()).await?, CONNECT_OK);
    stream.write_all(b"bye").await?;
    drop(stream);

    let received = rx.timeout(TEST_TIMEOUT).await.anyerr()?.anyerr()?;
    assert_eq!(received, b"bye");
    Ok(())
}

/// Closing the target side of a tunnel closes the client side.
#[tokio::test]
#[traced_test]
async fn test_target_close_propagates() -> Result {
    let target = TcpListener::bind("127.0.0.1:0").await?;
    let target_addr = target.local_addr()?;
    let _target = AbortOnDropHandle::new(tokio::spawn(async move {
        if let Ok((mut stream, _)) = target.accept().await {
            stream.write_all(b"hi").await.ok();
        }
    }));
    let (upstream_addr, _upstream) = spawn_http_upstream(None).await?;
    let config = UpstreamConfig::new(UpstreamKind::Http, "127.0.0.1", upstream_addr.port());
    let (proxy_addr, _server) = spawn_local_proxy(config).await?;

    let mut stream = send_connect(proxy_addr, target_addr).await?;
    let mut expected = CONNECT_OK.to_vec();
    expected.extend_from_slice(b"hi");
    assert_eq!(read_to_end_timeout(&mut stream).await?, expected);
    Ok(())
}

/// Start and stop are idempotent and the port is closed after stop.
#[tokio::test]
#[traced_test]
async fn test_server_lifecycle() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);
    server.stop().await;

    let addr = server.start().await?;
    assert!(server.is_running());
    assert_eq!(server.local_addr(), Some(addr));
    assert_eq!(server.start().await?, addr);

    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);
    assert!(TcpStream::connect(addr).await.is_err());
    server.stop().await;
    assert!(!server.is_running());

    // A stopped server can be started again.
    let addr = server.start().await?;
    assert!(server.is_running());
    TcpStream::connect(addr).await?;
    server.stop().await;
    Ok(())
}

/// A start racing a stop leaves the server running on the new listener.
#[tokio::test]
#[traced_test]
async fn test_start_during_stop() -> Result {
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    server.start().await?;

    let ((), second) = tokio::join!(server.stop(), server.start());
    let second = second?;
    assert!(server.is_running());
    assert_eq!(server.local_addr(), Some(second));
    TcpStream::connect(second).await?;

    server.stop().await;
    assert!(!server.is_running());
    Ok(())
}

/// Stopping the server leaves established tunnels running.
#[tokio::test]
#[traced_test]
async fn test_stop_keeps_active_tunnels() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::ephemeral());
    let proxy_addr = server.start().await?;

    let mut stream = send_connect(proxy_addr, echo_addr).await?;
    assert_eq!(read_exact_timeout(&mut stream, CONNECT_OK.len()).await?, CONNECT_OK);
    wait_until(|| server.active_connections() == 1).await?;

    server.stop().await;
    stream.write_all(b"still here").await?;
    assert_eq!(read_exact_timeout(&mut stream, 10).await?, b"still here");

    drop(stream);
    wait_until(|| server.active_connections() == 0).await?;
    Ok(())
}

/// A port that is already taken fails with a bind error.
#[tokio::test]
#[traced_test]
async fn test_bind_conflict() -> Result {
    let blocker = TcpListener::bind("127.0.0.1:0").await?;
    let addr = blocker.local_addr()?;
    let server = LocalProxyServer::new(DirectConnector, ServerOpts::default().listen(addr));
    let err = server.start().await.err().context("expected bind error")?;
    assert!(matches!(err, ServerError::Bind { .. }), "{err:#}");
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);
    Ok(())
}

mod mock_upstream {
    use http::StatusCode;
    use n0_error::{Result, StackResultExt, StdResultExt, anyerr};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use crate::{
        parse::{HttpRequest, HttpResponse},
        util::{Prebuffered, relay},
    };

    pub(super) async fn serve_http(stream: TcpStream, required_auth: Option<&str>) -> Result {
        let mut stream = Prebuffered::new(stream, 8192);
        let request = HttpRequest::read(&mut stream)
            .await?
            .context("client sent no request")?;
        if !request.is_connect() {
            HttpResponse::new(StatusCode::METHOD_NOT_ALLOWED)
                .write(&mut stream)
                .await?;
            return Ok(());
        }
        if let Some(expected) = required_auth {
            let auth = request
                .headers
                .get(http::header::PROXY_AUTHORIZATION)
                .and_then(|value| value.to_str().ok());
            if auth != Some(expected) {
                HttpResponse::new(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
                    .write(&mut stream)
                    .await?;
                return Ok(());
            }
        }
        let target = request.connect_target().context("invalid target")?;
        let origin = match TcpStream::connect(target.to_string()).await {
            Ok(origin) => origin,
            Err(_) => {
                HttpResponse::new(StatusCode::BAD_GATEWAY)
                    .write(&mut stream)
                    .await?;
                return Ok(());
            }
        };
        HttpResponse::with_reason(StatusCode::OK, "Connection established")
            .write(&mut stream)
            .await?;
        relay(stream, origin).await;
        Ok(())
    }

    pub(super) async fn serve_socks5(
        mut stream: TcpStream,
        credentials: Option<(&str, &str)>,
    ) -> Result {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        if greeting[0] != 0x05 {
            return Err(anyerr!("bad version {}", greeting[0]));
        }
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;

        match credentials {
            Some((user, pass)) => {
                if !methods.contains(&0x02) {
                    stream.write_all(&[0x05, 0xff]).await?;
                    return Ok(());
                }
                stream.write_all(&[0x05, 0x02]).await?;
                let mut header = [0u8; 2];
                stream.read_exact(&mut header).await?;
                let mut got_user = vec![0u8; header[1] as usize];
                stream.read_exact(&mut got_user).await?;
                let mut pass_len = [0u8; 1];
                stream.read_exact(&mut pass_len).await?;
                let mut got_pass = vec![0u8; pass_len[0] as usize];
                stream.read_exact(&mut got_pass).await?;
                if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
                    stream.write_all(&[0x01, 0x01]).await?;
                    return Ok(());
                }
                stream.write_all(&[0x01, 0x00]).await?;
            }
            None => stream.write_all(&[0x05, 0x00]).await?,
        }

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[1] != 0x01 || request[3] != 0x03 {
            return Err(anyerr!("unexpected request {request:?}"));
        }
        let mut host_len = [0u8; 1];
        stream.read_exact(&mut host_len).await?;
        let mut host = vec![0u8; host_len[0] as usize];
        stream.read_exact(&mut host).await?;
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        let host = String::from_utf8(host).anyerr()?;
        let port = u16::from_be_bytes(port);

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(origin) => {
                let bound = origin.local_addr()?.port().to_be_bytes();
                stream
                    .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, bound[0], bound[1]])
                    .await?;
                relay(stream, origin).await;
            }
            Err(_) => {
                stream
                    .write_all(&[0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await?;
            }
        }
        Ok(())
    }
}

mod origin_server {
    use std::{convert::Infallible, sync::Arc};

    use http_body_util::Full;
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Returns "{label} {METHOD} {PATH}" as response body.
    pub(super) async fn run(listener: TcpListener, label: &'static str) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    async move {
                        let body = format!("{} {} {}", *label, req.method(), req.uri().path());
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
