//! Cross-platform system proxy configuration.
//!
//! Points the OS HTTP and HTTPS proxy settings at the engine and clears them
//! again. Each platform variant drives the platform's own command line tool:
//!
//! - macOS: `networksetup`, once per enabled network service
//! - Windows: PowerShell writing the WinINet Internet Settings key
//! - Linux: GNOME `gsettings`
//!
//! Operations are best effort. A failing sub-target (one network service, one
//! settings key) is logged and reported as a warning; the operation only
//! fails when no sub-target could be attempted at all.

use std::io;
use std::process::Output;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Proxy settings key on Windows.
const WINDOWS_INTERNET_SETTINGS: &str =
    r"HKCU:\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Outcome of a best-effort enable or disable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureReport {
    /// Human-readable summary.
    pub message: String,
    /// Sub-targets that failed.
    pub warnings: Vec<String>,
}

impl ConfigureReport {
    fn new(message: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            message: message.into(),
            warnings,
        }
    }

    /// Returns true if every sub-target succeeded.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Platform variant of the system proxy configurator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemProxy {
    /// macOS network services via `networksetup`.
    MacOs,
    /// Windows Internet Settings via PowerShell.
    Windows,
    /// GNOME proxy settings via `gsettings`.
    Linux,
    /// Leaves the OS settings alone.
    Detached,
}

impl SystemProxy {
    /// Returns the variant for the platform this binary was built for.
    ///
    /// Platforms without a known proxy setting get [`SystemProxy::Detached`].
    pub fn for_current_platform() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Detached
        }
    }

    /// Returns the variant name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::Detached => "detached",
        }
    }

    /// Points the OS HTTP and HTTPS proxy at `host:port`.
    pub async fn enable(&self, host: &str, port: u16) -> Result<ConfigureReport> {
        match self {
            Self::MacOs => enable_proxy_macos(host, port).await,
            Self::Windows => enable_proxy_windows(host, port).await,
            Self::Linux => enable_proxy_linux(host, port).await,
            Self::Detached => Ok(ConfigureReport::new(
                format!("System proxy left unchanged ({}:{})", host, port),
                Vec::new(),
            )),
        }
    }

    /// Clears the OS HTTP and HTTPS proxy.
    pub async fn disable(&self) -> Result<ConfigureReport> {
        match self {
            Self::MacOs => disable_proxy_macos().await,
            Self::Windows => disable_proxy_windows().await,
            Self::Linux => disable_proxy_linux().await,
            Self::Detached => Ok(ConfigureReport::new(
                "System proxy left unchanged",
                Vec::new(),
            )),
        }
    }

    /// Checks if the OS proxy currently points at `host:port`.
    pub async fn is_enabled(&self, host: &str, port: u16) -> bool {
        match self {
            Self::MacOs => is_proxy_enabled_macos(host, port).await,
            Self::Windows => is_proxy_enabled_windows(host, port).await,
            Self::Linux => is_proxy_enabled_linux(host, port).await,
            Self::Detached => false,
        }
    }
}

impl std::fmt::Display for SystemProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Sub-target execution
// ============================================================================

/// One independently failing part of an operation.
#[derive(Debug, Clone)]
struct SubTarget {
    /// Name used in warnings.
    name: String,
    /// Program to run for every step.
    program: &'static str,
    /// Argument lists, run in order.
    steps: Vec<Vec<String>>,
}

impl SubTarget {
    fn new(name: impl Into<String>, program: &'static str) -> Self {
        Self {
            name: name.into(),
            program,
            steps: Vec::new(),
        }
    }

    fn step<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(args.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Default)]
struct SubTargetOutcome {
    attempted: bool,
    warnings: Vec<String>,
}

async fn run(program: &str, args: &[String]) -> io::Result<Output> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    #[cfg(target_os = "windows")]
    command.creation_flags(CREATE_NO_WINDOW);
    command.output().await
}

async fn run_sub_target(target: SubTarget) -> SubTargetOutcome {
    let mut outcome = SubTargetOutcome::default();

    for args in &target.steps {
        match run(target.program, args).await {
            Ok(output) if output.status.success() => {
                outcome.attempted = true;
            }
            Ok(output) => {
                outcome.attempted = true;
                let stderr = String::from_utf8_lossy(&output.stderr);
                let warning = format!(
                    "{}: {} {} failed: {}",
                    target.name,
                    target.program,
                    args.join(" "),
                    stderr.trim()
                );
                warn!("{}", warning);
                outcome.warnings.push(warning);
            }
            Err(e) => {
                let warning = format!("{}: failed to run {}: {}", target.name, target.program, e);
                warn!("{}", warning);
                outcome.warnings.push(warning);
                // Later steps depend on this one.
                break;
            }
        }
    }

    outcome
}

/// Runs all sub-targets concurrently and aggregates their outcome.
async fn apply(operation: &str, targets: Vec<SubTarget>) -> Result<ConfigureReport> {
    let names: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
    let outcomes = join_all(targets.into_iter().map(run_sub_target)).await;

    let attempted = outcomes.iter().filter(|o| o.attempted).count();
    let warnings: Vec<String> = outcomes.into_iter().flat_map(|o| o.warnings).collect();

    if attempted == 0 {
        return Err(ProxyError::SystemProxy(format!(
            "could not {}: {}",
            operation,
            if warnings.is_empty() {
                "nothing to configure".to_string()
            } else {
                warnings.join("; ")
            }
        )));
    }

    debug!("{} applied to {}", operation, names.join(", "));
    Ok(ConfigureReport::new(
        format!("{} on {} of {} targets", operation, attempted, names.len()),
        warnings,
    ))
}

// ============================================================================
// macOS Implementation
// ============================================================================

/// Parses `networksetup -listallnetworkservices` output.
///
/// Skips the header line and disabled services (prefixed with `*`).
fn parse_network_services(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

async fn list_network_services() -> Result<Vec<String>> {
    let output = run("networksetup", &["-listallnetworkservices".to_string()])
        .await
        .map_err(|e| ProxyError::SystemProxy(format!("failed to run networksetup: {}", e)))?;

    if !output.status.success() {
        return Err(ProxyError::SystemProxy(format!(
            "networksetup -listallnetworkservices failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let services = parse_network_services(&String::from_utf8_lossy(&output.stdout));
    if services.is_empty() {
        return Err(ProxyError::SystemProxy(
            "no enabled network services found".into(),
        ));
    }
    Ok(services)
}

async fn enable_proxy_macos(host: &str, port: u16) -> Result<ConfigureReport> {
    let port = port.to_string();
    let targets = list_network_services()
        .await?
        .into_iter()
        .map(|service| {
            SubTarget::new(service.clone(), "networksetup")
                .step(["-setwebproxy", service.as_str(), host, port.as_str()])
                .step(["-setsecurewebproxy", service.as_str(), host, port.as_str()])
                .step(["-setwebproxystate", service.as_str(), "on"])
                .step(["-setsecurewebproxystate", service.as_str(), "on"])
        })
        .collect();

    apply("enable system proxy", targets).await
}

async fn disable_proxy_macos() -> Result<ConfigureReport> {
    let targets = list_network_services()
        .await?
        .into_iter()
        .map(|service| {
            SubTarget::new(service.clone(), "networksetup")
                .step(["-setwebproxystate", service.as_str(), "off"])
                .step(["-setsecurewebproxystate", service.as_str(), "off"])
        })
        .collect();

    apply("disable system proxy", targets).await
}

async fn is_proxy_enabled_macos(host: &str, port: u16) -> bool {
    let Ok(services) = list_network_services().await else {
        return false;
    };

    for service in services {
        let Ok(output) = run("networksetup", &["-getwebproxy".to_string(), service]).await else {
            continue;
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.contains("Enabled: Yes")
            && stdout.contains(&format!("Server: {}", host))
            && stdout.contains(&format!("Port: {}", port))
        {
            return true;
        }
    }
    false
}

// ============================================================================
// Windows Implementation
// ============================================================================

fn powershell_target(name: &str, script: String) -> SubTarget {
    SubTarget::new(name, "powershell").step([
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
        script,
    ])
}

async fn enable_proxy_windows(host: &str, port: u16) -> Result<ConfigureReport> {
    let script = format!(
        r#"
        $regPath = '{}'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 1
        Set-ItemProperty -Path $regPath -Name ProxyServer -Value '{}:{}'
        Set-ItemProperty -Path $regPath -Name ProxyOverride -Value '<local>'
        "#,
        WINDOWS_INTERNET_SETTINGS, host, port
    );

    apply(
        "enable system proxy",
        vec![powershell_target("Internet Settings", script)],
    )
    .await
}

async fn disable_proxy_windows() -> Result<ConfigureReport> {
    let script = format!(
        r#"
        $regPath = '{}'
        Set-ItemProperty -Path $regPath -Name ProxyEnable -Value 0
        "#,
        WINDOWS_INTERNET_SETTINGS
    );

    apply(
        "disable system proxy",
        vec![powershell_target("Internet Settings", script)],
    )
    .await
}

async fn is_proxy_enabled_windows(host: &str, port: u16) -> bool {
    let script = format!(
        r#"
        $regPath = '{}'
        $enabled = (Get-ItemProperty -Path $regPath -Name ProxyEnable -ErrorAction SilentlyContinue).ProxyEnable
        $server = (Get-ItemProperty -Path $regPath -Name ProxyServer -ErrorAction SilentlyContinue).ProxyServer
        Write-Output "$enabled|$server"
        "#,
        WINDOWS_INTERNET_SETTINGS
    );
    let target = powershell_target("Internet Settings", script);

    match run(target.program, &target.steps[0]).await {
        Ok(out) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            stdout.contains("1|") && stdout.contains(&format!("{}:{}", host, port))
        }
        Err(_) => false,
    }
}

// ============================================================================
// Linux Implementation
// ============================================================================

fn gsettings_target(name: &str, schema: &str, values: &[(&str, &str)]) -> SubTarget {
    values
        .iter()
        .fold(SubTarget::new(name, "gsettings"), |target, &(key, value)| {
            target.step(["set", schema, key, value])
        })
}

async fn enable_proxy_linux(host: &str, port: u16) -> Result<ConfigureReport> {
    let port = port.to_string();
    let targets = vec![
        gsettings_target("proxy mode", "org.gnome.system.proxy", &[("mode", "manual")]),
        gsettings_target(
            "http proxy",
            "org.gnome.system.proxy.http",
            &[("host", host), ("port", port.as_str())],
        ),
        gsettings_target(
            "https proxy",
            "org.gnome.system.proxy.https",
            &[("host", host), ("port", port.as_str())],
        ),
    ];

    apply("enable system proxy", targets).await
}

async fn disable_proxy_linux() -> Result<ConfigureReport> {
    apply(
        "disable system proxy",
        vec![gsettings_target(
            "proxy mode",
            "org.gnome.system.proxy",
            &[("mode", "none")],
        )],
    )
    .await
}

async fn gsettings_get(schema: &str, key: &str) -> Option<String> {
    let output = run(
        "gsettings",
        &["get".to_string(), schema.to_string(), key.to_string()],
    )
    .await
    .ok()?;
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn is_proxy_enabled_linux(host: &str, port: u16) -> bool {
    if let Some(mode) = gsettings_get("org.gnome.system.proxy", "mode").await {
        if mode.contains("manual") {
            let configured_host = gsettings_get("org.gnome.system.proxy.http", "host").await;
            let configured_port = gsettings_get("org.gnome.system.proxy.http", "port").await;
            if let (Some(h), Some(p)) = (configured_host, configured_port) {
                return h.contains(host) && p == port.to_string();
            }
        }
    }

    std::env::var("http_proxy")
        .or_else(|_| std::env::var("HTTP_PROXY"))
        .map(|v| v.contains(&format!("{}:{}", host, port)))
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
