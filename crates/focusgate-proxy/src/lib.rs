//! Focusgate Proxy - site-blocking forward proxy for focus sessions.
//!
//! This crate provides a local HTTP/HTTPS forward proxy that refuses traffic
//! to a list of distracting sites while a focus session runs, and points the
//! operating system's proxy settings at itself for the session's duration.
//!
//! ## Features
//!
//! - Plain HTTP relaying with an HTML block page for blocked hosts
//! - CONNECT tunneling with a raw `403` for blocked hosts (no TLS interception)
//! - Binds the next free port when the configured one is taken
//! - Graceful restart with a fresh blocklist, destroying open connections
//! - macOS, Windows and GNOME system proxy configuration
//!
//! ## Architecture
//!
//! ```text
//! SessionController ── start(sites) ──▶ Blocklist
//!        │                                  │
//!        │                                  ▼
//!        ├──────── (re)start ─────────▶ ProxyEngine ──▶ ConnectionRegistry
//!        │                                  │
//!        └──── enable(port)/disable ──▶ SystemProxy
//! ```

mod blocklist;
mod config;
mod connect;
mod error;
mod handler;
mod proxy;
mod registry;
mod rewind;
mod session;
pub mod setup;

pub use blocklist::{normalize, Blocklist};
pub use config::{EngineConfig, SessionConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_HEAD_BYTES};
pub use connect::{BLOCKED_CONNECT_RESPONSE, CONNECT_ESTABLISHED_RESPONSE};
pub use error::{ProxyError, Result};
pub use handler::block_page;
pub use proxy::{bind_with_retry, EngineHandle, ProxyEngine};
pub use registry::{ConnectionId, ConnectionRegistry};
pub use session::{
    OnProxyActionCallback, ProxyAction, SessionController, SessionResult, SessionState,
    SessionStatus,
};
pub use setup::{ConfigureReport, SystemProxy};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 8080;
