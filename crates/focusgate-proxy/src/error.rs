//! Error types for the proxy engine.

use std::io;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Binding the listener failed with something other than "address in use".
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Port that was being bound.
        port: u16,
        /// Underlying bind error.
        #[source]
        source: io::Error,
    },

    /// Every port from the configured start up to 65535 was in use.
    #[error("no free port at or above {start}")]
    PortsExhausted {
        /// First port that was tried.
        start: u16,
    },

    /// Malformed request from the client.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The real destination could not be reached.
    #[error("upstream connect to {addr} failed: {message}")]
    UpstreamConnect {
        /// Destination address.
        addr: String,
        /// Reason reported by the connect attempt.
        message: String,
    },

    /// HTTP protocol error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// System proxy configuration could not be attempted.
    #[error("system proxy error: {0}")]
    SystemProxy(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProxyError {
    /// Returns true when the error only means the peer went away.
    ///
    /// Resets and broken pipes are routine for a browser-facing proxy and are
    /// logged at debug level instead of being reported.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => is_disconnect_kind(e.kind()),
            Self::Http(e) => {
                if e.is_incomplete_message() || e.is_closed() || e.is_canceled() {
                    return true;
                }
                let mut source = std::error::Error::source(e);
                while let Some(err) = source {
                    if let Some(io_err) = err.downcast_ref::<io::Error>() {
                        return is_disconnect_kind(io_err.kind());
                    }
                    source = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
