//! HTTP CONNECT tunneling.
//!
//! The tunnel is opaque: after `200 Connection Established` the proxy only
//! copies bytes. The flow is:
//!
//! 1. Client sends `CONNECT host:port HTTP/1.1`
//! 2. Blocked host: raw `403` and the socket is closed
//! 3. Otherwise connect upstream, answer `200`, forward any bytes the client
//!    sent after the request head, then splice both directions
//!
//! When either side closes or errors, both sockets are dropped together.

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::CONNECTION;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::handler::{empty_body, full_body, status_response, ProxyBody};
use crate::proxy::{respond_bad_request, ConnectionContext};

/// Raw response for a blocked CONNECT.
pub const BLOCKED_CONNECT_RESPONSE: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\nBlocked.\r\n";

/// Raw response once the upstream tunnel is open.
pub const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Default port when the CONNECT target has none.
const DEFAULT_CONNECT_PORT: u16 = 443;

/// Handles a CONNECT read directly off the raw socket.
///
/// `buffered` holds bytes the client sent after the request head.
pub(crate) async fn handle_connect(
    mut client: TcpStream,
    target: &str,
    buffered: Bytes,
    ctx: &ConnectionContext,
) -> Result<()> {
    let (host, port) = match parse_host_port(target, DEFAULT_CONNECT_PORT) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("Rejecting CONNECT to {:?}: {}", target, e);
            respond_bad_request(&mut client).await;
            return Ok(());
        }
    };

    if ctx.blocklist.matches(&host) {
        info!("Blocked CONNECT to {}:{}", host, port);
        client.write_all(BLOCKED_CONNECT_RESPONSE).await?;
        let _ = client.shutdown().await;
        return Ok(());
    }

    let mut upstream = match connect_upstream(&host, port, ctx).await {
        Ok(stream) => stream,
        Err(e) => {
            // Dropping the client socket is the whole answer.
            debug!("Tunnel to {}:{} not opened: {}", host, port, e);
            return Ok(());
        }
    };

    client.set_nodelay(true).ok();
    client.write_all(CONNECT_ESTABLISHED_RESPONSE).await?;
    if !buffered.is_empty() {
        upstream.write_all(&buffered).await?;
    }

    debug!("Tunnel open to {}:{}", host, port);
    splice(client, upstream).await;
    debug!("Tunnel closed for {}:{}", host, port);
    Ok(())
}

/// Handles a CONNECT that arrived on a keep-alive connection served by hyper.
///
/// The tunnel itself runs as a separate registered connection once hyper
/// hands over the upgraded socket.
pub(crate) async fn handle_upgrade(
    req: Request<Incoming>,
    ctx: &ConnectionContext,
) -> Response<ProxyBody> {
    let target = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => return status_response(StatusCode::BAD_REQUEST, "Bad Request"),
    };
    let (host, port) = match parse_host_port(&target, DEFAULT_CONNECT_PORT) {
        Ok(parsed) => parsed,
        Err(_) => return status_response(StatusCode::BAD_REQUEST, "Bad Request"),
    };

    if ctx.blocklist.matches(&host) {
        info!("Blocked CONNECT to {}:{}", host, port);
        // hyper closes the connection after writing a `Connection: close` response.
        return Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header(CONNECTION, "close")
            .body(full_body(Bytes::from_static(b"Blocked.\r\n")))
            .unwrap_or_else(|_| Response::new(empty_body()));
    }

    let upstream = match connect_upstream(&host, port, ctx).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Tunnel to {}:{} not opened: {}", host, port, e);
            return status_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    ctx.registry.register(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                splice(TokioIo::new(upgraded), upstream).await;
                debug!("Tunnel closed for {}:{}", host, port);
            }
            Err(e) => debug!("Upgrade for {}:{} failed: {}", host, port, e),
        }
    });

    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

/// Opens a TCP connection to the destination within the connect timeout.
pub(crate) async fn connect_upstream(host: &str, port: u16, ctx: &ConnectionContext) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(ctx.connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: "connect timed out".into(),
        })?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr,
            message: e.to_string(),
        })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

/// Copies bytes both ways until either side closes or errors.
///
/// Both streams are dropped on return, so neither outlives the other.
pub(crate) async fn splice<C, U>(client: C, upstream: U)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            if let Err(e) = result {
                debug!("Client->upstream copy ended: {}", e);
            }
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            if let Err(e) = result {
                debug!("Upstream->client copy ended: {}", e);
            }
        }
    }
}

/// Parses `host:port` from a request target or `Host` value.
///
/// - `api.example.com:8443` -> ("api.example.com", 8443)
/// - `api.example.com` -> ("api.example.com", default_port)
/// - `[::1]:443` -> ("::1", 443)
pub(crate) fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16)> {
    let authority = authority.trim();

    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ProxyError::BadRequest(format!("invalid IPv6 target: {}", authority)))?;
        match after.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if after.is_empty() => (host, None),
            None => {
                return Err(ProxyError::BadRequest(format!(
                    "invalid CONNECT target: {}",
                    authority
                )))
            }
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(ProxyError::BadRequest(format!(
            "missing host in CONNECT target: {:?}",
            authority
        )));
    }

    let port = match port.filter(|p| !p.is_empty()) {
        Some(port) => port
            .parse::<u16>()
            .map_err(|_| ProxyError::BadRequest(format!("invalid port: {}", port)))?,
        None => default_port,
    };

    Ok((host.to_ascii_lowercase(), port))
}
