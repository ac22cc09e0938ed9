//! Forward proxy engine.
//!
//! One [`ProxyEngine`] serves one blocklist. Starting it binds the listener
//! and spawns the accept loop; the returned [`EngineHandle`] is the only way
//! to reach the running instance. A session restart stops the handle and
//! starts a fresh engine instead of touching the live one.
//!
//! ## Connection flow
//!
//! ```text
//! accept → register → read first request head
//!                          │
//!            ┌─────────────┴─────────────┐
//!            │ CONNECT                   │ anything else
//!            ▼                           ▼
//!     raw tunnel (connect.rs)     hyper HTTP/1.1 (handler.rs)
//! ```

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::blocklist::Blocklist;
use crate::config::EngineConfig;
use crate::connect;
use crate::error::{ProxyError, Result};
use crate::handler;
use crate::registry::ConnectionRegistry;
use crate::rewind::Rewind;

/// Raw response for a request that could not be parsed.
pub(crate) const BAD_REQUEST_RESPONSE: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Upper bound on headers in the first request head.
const MAX_HEADERS: usize = 100;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by every connection of one engine instance.
#[derive(Debug)]
pub(crate) struct ConnectionContext {
    /// Blocklist snapshot of this engine instance.
    pub(crate) blocklist: Arc<Blocklist>,
    /// Registry of the engine that accepted the connection.
    pub(crate) registry: ConnectionRegistry,
    /// Upstream connect timeout.
    pub(crate) connect_timeout: Duration,
    /// Maximum first request head size.
    pub(crate) max_head_bytes: usize,
}

/// Binds `host:port`, moving to the next port while the address is in use.
///
/// Any other bind error is returned as is.
pub async fn bind_with_retry(host: IpAddr, port: u16) -> Result<TcpListener> {
    let mut candidate = port;
    loop {
        match TcpListener::bind(SocketAddr::new(host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                debug!("Port {} in use, trying next", candidate);
                candidate = candidate
                    .checked_add(1)
                    .ok_or(ProxyError::PortsExhausted { start: port })?;
            }
            Err(source) => {
                return Err(ProxyError::Bind {
                    port: candidate,
                    source,
                })
            }
        }
    }
}

/// A proxy engine that has not been started yet.
#[derive(Debug)]
pub struct ProxyEngine {
    config: EngineConfig,
    blocklist: Arc<Blocklist>,
}

impl ProxyEngine {
    /// Creates an engine serving the given blocklist.
    pub fn new(config: EngineConfig, blocklist: Blocklist) -> Self {
        Self {
            config,
            blocklist: Arc::new(blocklist),
        }
    }

    /// Returns the blocklist this engine will serve.
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// Resolves once the listener is bound.
    pub async fn start(self) -> Result<EngineHandle> {
        self.config.validate()?;

        let listener = bind_with_retry(self.config.host, self.config.port).await?;
        let addr = listener.local_addr()?;
        let registry = ConnectionRegistry::new();

        let ctx = Arc::new(ConnectionContext {
            blocklist: Arc::clone(&self.blocklist),
            registry: registry.clone(),
            connect_timeout: self.config.connect_timeout(),
            max_head_bytes: self.config.max_head_bytes,
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        info!(
            "Proxy listening on {} ({} blocked sites)",
            addr,
            self.blocklist.len()
        );

        Ok(EngineHandle {
            addr,
            blocklist: self.blocklist,
            registry,
            shutdown_tx,
            handle,
        })
    }
}

/// Handle for controlling a running engine.
///
/// Dropping the handle without calling [`EngineHandle::stop`] also closes the
/// listener and every connection, but does not wait for it.
#[derive(Debug)]
pub struct EngineHandle {
    addr: SocketAddr,
    blocklist: Arc<Blocklist>,
    registry: ConnectionRegistry,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<usize>,
}

impl EngineHandle {
    /// Returns the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns the blocklist being served.
    pub fn blocklist(&self) -> &Blocklist {
        &self.blocklist
    }

    /// Returns the live connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Returns the number of open client connections.
    pub fn active_connections(&self) -> usize {
        self.registry.len()
    }

    /// Signals the accept loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stops accepting, releases the port and destroys every connection.
    ///
    /// Resolves once the listener is closed. Returns how many connections
    /// were destroyed.
    pub async fn stop(self) -> usize {
        self.shutdown();
        match self.handle.await {
            Ok(closed) => closed,
            Err(e) => {
                warn!("Proxy accept loop failed: {}", e);
                self.registry.destroy_all()
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> usize {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("Proxy shutdown signal received");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    let registry = ctx.registry.clone();
                    registry.register(handle_connection(stream, peer, Arc::clone(&ctx)));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    let addr = listener.local_addr().ok();
    drop(listener);
    let closed = ctx.registry.destroy_all();
    info!(
        "Proxy on {} stopped, destroyed {} connections",
        addr.map(|a| a.to_string()).unwrap_or_default(),
        closed
    );
    closed
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: Arc<ConnectionContext>) {
    if let Err(e) = serve_connection(stream, ctx).await {
        if e.is_disconnect() {
            debug!(%peer, "Connection ended: {}", e);
        } else {
            warn!(%peer, "Connection error: {}", e);
        }
    }
}

async fn serve_connection(mut stream: TcpStream, ctx: Arc<ConnectionContext>) -> Result<()> {
    let head = match read_head(&mut stream, ctx.max_head_bytes).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(ProxyError::BadRequest(reason)) => {
            debug!("Rejecting malformed request: {}", reason);
            respond_bad_request(&mut stream).await;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let RequestHead {
        method,
        target,
        len,
        buf,
    } = head;

    if method.eq_ignore_ascii_case("CONNECT") {
        let buffered = buf.freeze().slice(len..);
        connect::handle_connect(stream, &target, buffered, &ctx).await
    } else {
        handler::serve_http(Rewind::new(stream, buf.freeze()), ctx).await
    }
}

/// Writes a raw `400` and closes the write side.
pub(crate) async fn respond_bad_request(stream: &mut TcpStream) {
    if let Err(e) = stream.write_all(BAD_REQUEST_RESPONSE).await {
        debug!("Failed to write 400 response: {}", e);
        return;
    }
    let _ = stream.shutdown().await;
}

/// First request head read off a raw socket.
#[derive(Debug)]
struct RequestHead {
    method: String,
    target: String,
    /// Length of the head within `buf`.
    len: usize,
    /// Everything read so far, head included.
    buf: BytesMut,
}

/// Reads until the first request head is complete.
///
/// Returns `None` if the client closed the connection without sending
/// anything.
async fn read_head(stream: &mut TcpStream, max_head_bytes: usize) -> Result<Option<RequestHead>> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::BadRequest(
                "connection closed mid-request".into(),
            ));
        }

        if let Some((method, target, len)) = parse_head(&buf)? {
            return Ok(Some(RequestHead {
                method,
                target,
                len,
                buf,
            }));
        }

        if buf.len() >= max_head_bytes {
            return Err(ProxyError::BadRequest(format!(
                "request head exceeds {} bytes",
                max_head_bytes
            )));
        }
    }
}

/// Parses a request head. `None` means more bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<(String, String, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let method = req.method.unwrap_or_default().to_string();
            let target = req.path.unwrap_or_default().to_string();
            Ok(Some((method, target, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(ProxyError::BadRequest(e.to_string())),
    }
}
