//! Focus session control.
//!
//! [`SessionController`] turns `start(sites)` / `stop()` into engine
//! bring-up, graceful restart and teardown, and points the OS proxy at the
//! engine while a session runs.
//!
//! ```text
//! Idle ──start──▶ Running ──stop──▶ Idle
//!                  │   ▲
//!                  └───┘ start (restart: old engine stopped before rebind)
//! ```

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::blocklist::Blocklist;
use crate::config::{EngineConfig, SessionConfig};
use crate::proxy::{EngineHandle, ProxyEngine};
use crate::setup::SystemProxy;

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No engine is running.
    Idle,
    /// An engine is listening and the system proxy points at it.
    Running,
}

/// Result of a session operation, as reported to the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionResult {
    /// Successful result.
    pub fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// Failed result with a user-facing message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub blocked_sites: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Action applied to the system proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyAction {
    /// System proxy pointed at the engine.
    Enabled,
    /// System proxy cleared.
    Disabled,
}

impl ProxyAction {
    /// Returns the action as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for ProxyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Callback type for system proxy actions: (action, host, port).
pub type OnProxyActionCallback = Arc<dyn Fn(ProxyAction, &str, u16) + Send + Sync>;

/// The engine of a running session.
#[derive(Debug)]
struct RunningSession {
    engine: EngineHandle,
    started_at: DateTime<Utc>,
}

/// Drives focus sessions.
///
/// Clones share the same session. `start` and `stop` are serialized: a call
/// waits until any in-progress call has fully settled.
#[derive(Clone)]
pub struct SessionController {
    config: EngineConfig,
    system_proxy: SystemProxy,
    state: Arc<Mutex<Option<RunningSession>>>,
    on_proxy_action: Option<OnProxyActionCallback>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("config", &self.config)
            .field("system_proxy", &self.system_proxy)
            .finish()
    }
}

impl SessionController {
    /// Creates an idle controller.
    pub fn new(config: EngineConfig, system_proxy: SystemProxy) -> Self {
        Self {
            config,
            system_proxy,
            state: Arc::new(Mutex::new(None)),
            on_proxy_action: None,
        }
    }

    /// Creates a controller from a session config.
    ///
    /// `system_proxy: false` selects [`SystemProxy::Detached`].
    pub fn from_config(config: &SessionConfig) -> Self {
        let system_proxy = if config.system_proxy {
            SystemProxy::for_current_platform()
        } else {
            SystemProxy::Detached
        };
        Self::new(config.engine.clone(), system_proxy)
    }

    /// Sets the callback for system proxy actions.
    ///
    /// Invoked after every enable or disable attempt with the host and port
    /// handed to the configurator.
    pub fn on_proxy_action<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProxyAction, &str, u16) + Send + Sync + 'static,
    {
        self.on_proxy_action = Some(Arc::new(callback));
        self
    }

    /// Returns the system proxy variant in use.
    pub fn system_proxy(&self) -> SystemProxy {
        self.system_proxy
    }

    /// Starts a session blocking `sites`, restarting if one is running.
    ///
    /// An empty list is accepted and blocks nothing.
    pub async fn start<I, S>(&self, sites: I) -> SessionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let blocklist = Blocklist::build(sites);
        let mut state = self.state.lock().await;

        let previous_port = match state.take() {
            Some(previous) => {
                let port = previous.engine.port();
                info!(
                    "Restarting session on port {} ({} connections open)",
                    port,
                    previous.engine.active_connections()
                );
                previous.engine.stop().await;
                Some(port)
            }
            None => None,
        };

        let engine = match ProxyEngine::new(self.config.clone(), blocklist).start().await {
            Ok(engine) => engine,
            Err(e) => {
                error!("Failed to start proxy: {}", e);
                if let Some(port) = previous_port {
                    // The OS proxy still points at the engine that was just stopped.
                    self.disable_system_proxy(port).await;
                }
                return SessionResult::failure(e.to_string());
            }
        };

        let port = engine.port();
        let host = proxy_host(engine.addr().ip());
        info!(
            "Session started on port {} blocking {} sites",
            port,
            engine.blocklist().len()
        );
        *state = Some(RunningSession {
            engine,
            started_at: Utc::now(),
        });

        self.enable_system_proxy(&host, port).await;
        SessionResult::success()
    }

    /// Ends the running session. A no-op when idle.
    pub async fn stop(&self) -> SessionResult {
        let mut state = self.state.lock().await;
        let Some(running) = state.take() else {
            return SessionResult::success();
        };

        let port = running.engine.port();
        let closed = running.engine.stop().await;
        info!("Session on port {} stopped ({} connections closed)", port, closed);

        self.disable_system_proxy(port).await;
        SessionResult::success()
    }

    /// Host-facing alias for [`SessionController::start`].
    pub async fn start_session<I, S>(&self, sites: I) -> SessionResult
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.start(sites).await
    }

    /// Host-facing alias for [`SessionController::stop`].
    pub async fn end_session(&self) -> SessionResult {
        self.stop().await
    }

    /// Returns a snapshot of the session.
    pub async fn status(&self) -> SessionStatus {
        let state = self.state.lock().await;
        match state.as_ref() {
            Some(running) => SessionStatus {
                state: SessionState::Running,
                port: Some(running.engine.port()),
                blocked_sites: running.engine.blocklist().entries().to_vec(),
                started_at: Some(running.started_at),
            },
            None => SessionStatus {
                state: SessionState::Idle,
                port: None,
                blocked_sites: Vec::new(),
                started_at: None,
            },
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> SessionState {
        self.status().await.state
    }

    /// Returns the bound port while running.
    pub async fn port(&self) -> Option<u16> {
        self.state.lock().await.as_ref().map(|r| r.engine.port())
    }

    async fn enable_system_proxy(&self, host: &str, port: u16) {
        match self.system_proxy.enable(host, port).await {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!("System proxy: {}", warning);
                }
                info!("{}", report.message);
            }
            Err(e) => warn!("Failed to enable system proxy: {}", e),
        }
        self.notify(ProxyAction::Enabled, host, port);
    }

    async fn disable_system_proxy(&self, port: u16) {
        match self.system_proxy.disable().await {
            Ok(report) => {
                for warning in &report.warnings {
                    warn!("System proxy: {}", warning);
                }
                info!("{}", report.message);
            }
            Err(e) => warn!("Failed to disable system proxy: {}", e),
        }
        let host = proxy_host(self.config.host);
        self.notify(ProxyAction::Disabled, &host, port);
    }

    fn notify(&self, action: ProxyAction, host: &str, port: u16) {
        if let Some(ref callback) = self.on_proxy_action {
            callback(action, host, port);
        }
    }
}

/// Address clients should use to reach a listener bound to `ip`.
fn proxy_host(ip: IpAddr) -> String {
    if ip.is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST).to_string()
    } else {
        ip.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SessionController {
        SessionController::new(EngineConfig::default().with_port(0), SystemProxy::Detached)
    }

    #[test]
    fn session_result_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionResult::success()).unwrap(),
            r#"{"ok":true}"#
        );
        assert_eq!(
            serde_json::to_string(&SessionResult::failure("port busy")).unwrap(),
            r#"{"ok":false,"error":"port busy"}"#
        );
    }

    #[test]
    fn proxy_host_maps_unspecified() {
        assert_eq!(proxy_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED)), "127.0.0.1");
        assert_eq!(proxy_host(IpAddr::V4(Ipv4Addr::LOCALHOST)), "127.0.0.1");
    }

    #[test]
    fn proxy_action_names() {
        assert_eq!(ProxyAction::Enabled.to_string(), "enabled");
        assert_eq!(ProxyAction::Disabled.as_str(), "disabled");
    }

    #[test]
    fn from_config_respects_system_proxy_flag() {
        let config = SessionConfig {
            system_proxy: false,
            ..SessionConfig::default()
        };
        assert_eq!(
            SessionController::from_config(&config).system_proxy(),
            SystemProxy::Detached
        );
    }

    #[tokio::test]
    async fn starts_idle() {
        let controller = controller();
        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Idle);
        assert!(status.port.is_none());
        assert!(status.started_at.is_none());
    }

    #[tokio::test]
    async fn start_then_stop() {
        let controller = controller();

        let result = controller.start(["example.com", "Example.com "]).await;
        assert!(result.ok);

        let status = controller.status().await;
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.blocked_sites, vec!["example.com".to_string()]);
        assert!(status.port.is_some());

        assert!(controller.stop().await.ok);
        assert_eq!(controller.state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let controller = controller();
        assert_eq!(controller.stop().await, SessionResult::success());
    }

    #[tokio::test]
    async fn empty_site_list_is_accepted() {
        let controller = controller();
        let result = controller.start(Vec::<String>::new()).await;
        assert!(result.ok);
        assert!(controller.status().await.blocked_sites.is_empty());
        controller.stop().await;
    }

    #[tokio::test]
    async fn failed_restart_disables_proxy_for_stopped_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let configured = taken.local_addr().unwrap().port();

        // Restarts of this controller always fail validation.
        let mut config = EngineConfig::default().with_port(configured);
        config.connect_timeout_secs = 0;

        let actions = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = Arc::clone(&actions);
        let controller = SessionController::new(config, SystemProxy::Detached).on_proxy_action(
            move |action, _host, port| recorded.lock().unwrap().push((action, port)),
        );

        // Running engine that had to move past the configured port.
        let engine = ProxyEngine::new(
            EngineConfig::default().with_port(configured),
            Blocklist::default(),
        )
        .start()
        .await
        .unwrap();
        let running_port = engine.port();
        assert_ne!(running_port, configured);
        *controller.state.lock().await = Some(RunningSession {
            engine,
            started_at: Utc::now(),
        });

        let result = controller.start(["example.com"]).await;
        assert!(!result.ok);
        assert_eq!(controller.state().await, SessionState::Idle);
        assert_eq!(
            *actions.lock().unwrap(),
            vec![(ProxyAction::Disabled, running_port)]
        );
    }

    #[tokio::test]
    async fn status_serializes_lowercase_state() {
        let controller = controller();
        let json = serde_json::to_value(controller.status().await).unwrap();
        assert_eq!(json["state"], "idle");
        assert!(json.get("port").is_none());
    }
}
