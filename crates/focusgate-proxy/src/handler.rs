//! Plain HTTP request handling.
//!
//! Serves the client connection with hyper, checks each request's `Host`
//! against the blocklist, and either answers with the block page or relays
//! the request to the real destination and streams the response back.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::uri::PathAndQuery;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::connect;
use crate::error::{ProxyError, Result};
use crate::proxy::ConnectionContext;

/// Response body type used by the proxy.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Default port for plain HTTP destinations.
const DEFAULT_HTTP_PORT: u16 = 80;

/// Block page HTML template.
const BLOCK_PAGE_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Blocked by Focusgate</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            justify-content: center;
            align-items: center;
            min-height: 100vh;
            margin: 0;
            background: #1f2430;
            color: #e6e6e6;
        }
        .container {
            text-align: center;
            padding: 2rem;
            max-width: 500px;
        }
        h1 {
            margin: 0 0 1rem 0;
            font-size: 2rem;
        }
        p {
            margin: 0.5rem 0;
            opacity: 0.9;
        }
        .host {
            background: rgba(255,255,255,0.1);
            padding: 1rem;
            border-radius: 8px;
            margin-top: 1rem;
        }
    </style>
</head>
<body>
    <div class="container">
        <h1>Stay focused</h1>
        <p>This site is blocked for the rest of your focus session.</p>
        <div class="host">
            <p><strong>Site:</strong> {{HOST}}</p>
        </div>
    </div>
</body>
</html>"#;

/// Renders the block page for a host.
pub fn block_page(host: &str) -> String {
    BLOCK_PAGE_HTML.replace("{{HOST}}", &escape_html(host))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Plain text response with the given status.
pub(crate) fn status_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn blocked_response(host: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(block_page(host)));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// Serves HTTP/1.1 on a client connection until it closes.
pub(crate) async fn serve_http<I>(io: I, ctx: Arc<ConnectionContext>) -> Result<()>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = Arc::clone(&ctx);
        async move { Ok::<_, Infallible>(handle_request(req, &ctx).await) }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .auto_date_header(false)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await?;
    Ok(())
}

/// Decides a single request: block page, relay, or error status.
async fn handle_request(req: Request<Incoming>, ctx: &ConnectionContext) -> Response<ProxyBody> {
    if req.method() == Method::CONNECT {
        return connect::handle_upgrade(req, ctx).await;
    }

    let Some(authority) = request_authority(&req) else {
        debug!("Request without Host: {} {}", req.method(), req.uri());
        return status_response(StatusCode::BAD_REQUEST, "Bad Request");
    };

    let hostname = host_without_port(&authority).to_ascii_lowercase();
    if ctx.blocklist.matches(&hostname) {
        info!("Blocked {} http://{}{}", req.method(), authority, req.uri().path());
        return blocked_response(&hostname);
    }

    match forward(req, &authority, ctx).await {
        Ok(response) => response,
        Err(e) => error_response(&authority, e),
    }
}

/// Maps a relay failure to the status sent before any upstream response.
fn error_response(authority: &str, err: ProxyError) -> Response<ProxyBody> {
    match err {
        e @ ProxyError::UpstreamConnect { .. } | e @ ProxyError::Http(_) => {
            warn!("Upstream {} failed: {}", authority, e);
            status_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
        ProxyError::BadRequest(reason) => {
            debug!("Rejecting request for {:?}: {}", authority, reason);
            status_response(StatusCode::BAD_REQUEST, "Bad Request")
        }
        e => {
            error!("Proxy error for {}: {}", authority, e);
            status_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Proxy Error")
        }
    }
}

/// Returns the forwarding target: the `Host` header, else the URI authority.
fn request_authority<B>(req: &Request<B>) -> Option<String> {
    let from_header = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|host| !host.is_empty());

    match from_header {
        Some(host) => Some(host.to_string()),
        None => req.uri().authority().map(|a| a.to_string()),
    }
}

/// Strips a port suffix from a `Host` value.
///
/// Bracketed IPv6 literals lose their brackets.
pub(crate) fn host_without_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split_once(']').map(|(host, _)| host).unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Relays a request to its destination and returns the upstream response.
async fn forward(
    mut req: Request<Incoming>,
    authority: &str,
    ctx: &ConnectionContext,
) -> Result<Response<ProxyBody>> {
    let (host, port) = connect::parse_host_port(authority, DEFAULT_HTTP_PORT)?;
    let addr = format!("{}:{}", host, port);
    let stream = connect::connect_upstream(&host, port, ctx).await?;

    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await?;

    let upstream_addr = addr.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection to {} ended: {}", upstream_addr, e);
        }
    });

    // Origin servers expect origin-form, proxies receive absolute-form.
    let path = req
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *req.uri_mut() = Uri::from(path);
    req.headers_mut().remove("proxy-connection");

    debug!("Relaying {} http://{}{}", req.method(), addr, req.uri());
    let response = sender.send_request(req).await?;
    Ok(response.map(|body| body.boxed()))
}
