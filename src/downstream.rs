use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use http::StatusCode;
use n0_error::{AnyError, anyerr, e, stack_error};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, info, warn};

pub use self::opts::{DEFAULT_LISTEN_PORT, ServerOpts};
use crate::{
    config::UpstreamConfig,
    error::ServerError,
    parse::{HttpRequest, HttpResponse},
    upstream::{DynUpstreamConnector, TunnelStream, Upstream, UpstreamConnector},
    util::{Prebuffered, relay},
};

pub(crate) mod opts;

const LISTEN_BACKLOG: u32 = 1024;

/// Local forward proxy that tunnels every client connection through an
/// upstream proxy.
///
/// Clients speak HTTP/1.x to the listener, either `CONNECT host:port` for
/// opaque tunnels or plain requests which are rewritten to origin form. Each
/// connection gets a fresh tunnel from the [`UpstreamConnector`] and then
/// bytes are relayed until either side closes.
///
/// The server starts stopped. [`start`](Self::start) binds the listener and
/// [`stop`](Self::stop) closes it again; both are idempotent.
#[derive(derive_more::Debug)]
pub struct LocalProxyServer {
    #[debug("Arc<dyn UpstreamConnector>")]
    connector: Arc<DynUpstreamConnector<'static>>,
    opts: ServerOpts,
    running: Arc<AtomicBool>,
    #[debug(skip)]
    run: Mutex<Option<RunState>>,
    tasks: TaskTracker,
    conn_id: Arc<AtomicU64>,
}

/// State of one start/stop cycle.
struct RunState {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl LocalProxyServer {
    /// Creates a stopped server that opens tunnels with `connector`.
    pub fn new(connector: impl UpstreamConnector + 'static, opts: ServerOpts) -> Self {
        Self {
            connector: DynUpstreamConnector::new_arc(connector),
            opts,
            running: Default::default(),
            run: Mutex::new(None),
            tasks: TaskTracker::new(),
            conn_id: Default::default(),
        }
    }

    /// Creates a stopped server for the upstream described by `config`.
    pub fn from_config(config: &UpstreamConfig, opts: ServerOpts) -> Self {
        Self::new(Upstream::from_config(config), opts)
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Returns the bound address. If the server is already running this does
    /// nothing and returns the address it is listening on.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut run = self.run_state();
        if let Some(state) = run.as_ref() {
            if self.running.load(Ordering::SeqCst) {
                return Ok(state.local_addr);
            }
            // The accept loop ended on its own after a fatal accept error.
            if let Some(state) = run.take() {
                state.shutdown.cancel();
            }
        }

        let addr = self.opts.listen;
        let listener = bind(addr).map_err(|source| e!(ServerError::Bind { addr, source }))?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| e!(ServerError::Bind { addr, source }))?;

        let shutdown = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);
        let accept_loop = AcceptLoop {
            listener,
            connector: self.connector.clone(),
            max_header_len: self.opts.max_header_len,
            running: self.running.clone(),
            tasks: self.tasks.clone(),
            conn_id: self.conn_id.clone(),
            shutdown: shutdown.clone(),
        };
        let accept_task =
            tokio::spawn(accept_loop.run().instrument(error_span!("listen", %local_addr)));
        *run = Some(RunState {
            local_addr,
            shutdown,
            accept_task,
        });
        info!(%local_addr, "local proxy listening");
        Ok(local_addr)
    }

    /// Stops accepting connections and closes the listener.
    ///
    /// When this returns the listening port is closed. Connections that are
    /// already being served are not interrupted and end when their sockets
    /// close. Calling `stop` on a stopped server does nothing.
    pub async fn stop(&self) {
        let state = {
            let mut run = self.run_state();
            self.running.store(false, Ordering::SeqCst);
            run.take()
        };
        let Some(state) = state else {
            return;
        };
        state.shutdown.cancel();
        if let Err(err) = state.accept_task.await {
            warn!("accept loop failed: {err:#}");
        }
        info!(
            local_addr = %state.local_addr,
            active = self.tasks.len(),
            "local proxy stopped"
        );
    }

    /// Returns true while the listener is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the address the listener is bound to, if running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if !self.is_running() {
            return None;
        }
        self.run_state().as_ref().map(|state| state.local_addr)
    }

    /// Returns the number of client connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.tasks.len()
    }

    fn run_state(&self) -> MutexGuard<'_, Option<RunState>> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LocalProxyServer {
    fn drop(&mut self) {
        if let Some(state) = self.run_state().take() {
            state.shutdown.cancel();
        }
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

struct AcceptLoop {
    listener: TcpListener,
    connector: Arc<DynUpstreamConnector<'static>>,
    max_header_len: usize,
    running: Arc<AtomicBool>,
    tasks: TaskTracker,
    conn_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let (stream, client_addr) =
                match self.shutdown.run_until_cancelled(self.listener.accept()).await {
                    None => break,
                    Some(Ok(conn)) => conn,
                    Some(Err(err)) => {
                        if !self.shutdown.is_cancelled() {
                            warn!("failed to accept connection, stop listening: {err:#}");
                            self.running.store(false, Ordering::SeqCst);
                        }
                        break;
                    }
                };
            let id = self.conn_id.fetch_add(1, Ordering::SeqCst);
            let connector = self.connector.clone();
            let shutdown = self.shutdown.clone();
            let max_header_len = self.max_header_len;
            self.tasks.spawn(
                async move {
                    debug!(%client_addr, "accepted connection");
                    if let Err(err) = serve_connection(stream, connector, max_header_len).await {
                        if shutdown.is_cancelled() {
                            debug!("connection failed after shutdown: {err:#}");
                        } else {
                            warn!("failed to handle connection: {err:#}");
                        }
                    }
                }
                .instrument(error_span!("conn", id)),
            );
        }
        debug!("accept loop finished");
    }
}

/// Serves one client connection.
///
/// On error the status attached to the error, if any, is sent to the client
/// before the connection is closed.
async fn serve_connection(
    stream: TcpStream,
    connector: Arc<DynUpstreamConnector<'static>>,
    max_header_len: usize,
) -> Result<(), ProxyError> {
    stream.set_nodelay(true).ok();
    let mut client = Prebuffered::new(stream, max_header_len);
    match open_tunnel(&mut client, &connector).await {
        Ok(Some(tunnel)) => {
            let stats = relay(client, tunnel).await;
            debug!(
                up = stats.client_to_upstream,
                down = stats.upstream_to_client,
                "connection closed"
            );
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if let Some(status) = err.response_status() {
                // Best effort; the client may already be gone.
                HttpResponse::new(status).write(&mut client).await.ok();
            }
            Err(err)
        }
    }
}

/// Reads the client request and opens the matching upstream tunnel.
///
/// Returns `Ok(None)` if the connection should be closed without a response.
async fn open_tunnel(
    client: &mut Prebuffered<TcpStream>,
    connector: &DynUpstreamConnector<'static>,
) -> Result<Option<TunnelStream>, ProxyError> {
    let request = match HttpRequest::read(client).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("client sent no request");
            return Ok(None);
        }
        Err(err) => return Err(ProxyError::bad_request(err)),
    };
    debug!(?request, "client request");

    if request.is_connect() {
        let target = request
            .connect_target()
            .ok_or_else(|| ProxyError::bad_request(anyerr!("invalid CONNECT target")))?;
        let tunnel = connector
            .connect(&target)
            .await
            .map_err(ProxyError::bad_gateway)?;
        debug!(%target, "tunnel established");
        HttpResponse::with_reason(StatusCode::OK, "Connection established")
            .write(client)
            .await
            .map_err(ProxyError::io)?;
        Ok(Some(tunnel))
    } else {
        let Some(target) = request.forward_target() else {
            debug!(request_target = %request.target, "request without destination host");
            return Ok(None);
        };
        let mut tunnel = connector
            .connect(&target)
            .await
            .map_err(ProxyError::bad_gateway)?;
        debug!(%target, "forwarding request in origin form");
        request
            .write_origin_form(&mut tunnel)
            .await
            .map_err(ProxyError::io)?;
        Ok(Some(tunnel))
    }
}

/// Error from serving a single client connection.
#[stack_error(add_meta, derive)]
pub struct ProxyError {
    response_status: Option<StatusCode>,
    #[error(source)]
    source: AnyError,
}

impl ProxyError {
    /// Returns the HTTP status code to surface to the client, if any.
    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    fn bad_request(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_REQUEST), source.into())
    }

    fn bad_gateway(source: impl Into<AnyError>) -> Self {
        Self::new(Some(StatusCode::BAD_GATEWAY), source.into())
    }

    fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }
}
