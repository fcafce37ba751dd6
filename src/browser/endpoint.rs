//! Browser control endpoint resolution
//!
//! Turns attach/launch settings into a reachable DevTools socket URL. The
//! debugger's `/json/version` document is not populated immediately after
//! Chrome starts, so the socket URL lookup is retried on a fixed interval.

use crate::config::{BrowserMode, BrowserSettings, Timings};
use crate::error::{BridgeError, Result};
use crate::Progress;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Resolved DevTools endpoint for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserEndpoint {
    pub control_url: String,
    pub socket_url: String,
}

#[derive(Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: Option<String>,
}

/// A Chrome process started by this crate
#[derive(Debug)]
pub struct ManagedBrowser {
    child: Child,
    port: u16,
    user_data_dir: PathBuf,
    keep_alive: bool,
}

impl ManagedBrowser {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Terminate the process and remove its profile directory
    pub async fn stop(mut self) -> Result<()> {
        log::info!("Stopping managed Chrome on port {}", self.port);
        if let Err(e) = self.child.kill().await {
            log::warn!("Failed to kill Chrome on port {}: {}", self.port, e);
        }
        if self.user_data_dir.exists() {
            let _ = tokio::fs::remove_dir_all(&self.user_data_dir).await;
        }
        Ok(())
    }
}

/// Endpoint plus the process that backs it, when we launched one
#[derive(Debug)]
pub struct ResolvedBrowser {
    pub endpoint: BrowserEndpoint,
    pub managed: Option<ManagedBrowser>,
}

impl ResolvedBrowser {
    /// Release the browser according to ownership: attached browsers are left
    /// alone, launched ones are stopped unless they were asked to stay alive.
    pub async fn release(self) -> Result<()> {
        match self.managed {
            Some(managed) if !managed.keep_alive() => managed.stop().await,
            Some(managed) => {
                log::info!("Keeping managed Chrome alive on port {}", managed.port());
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Resolve a DevTools endpoint for the given settings.
pub async fn resolve(
    settings: &BrowserSettings,
    timings: &Timings,
    progress: &Progress<'_>,
) -> Result<ResolvedBrowser> {
    let control_url = settings.control_url();

    let managed = match settings.mode {
        BrowserMode::Attach => {
            progress(&format!("Connecting to existing Chrome at {}...", control_url));
            if !is_reachable(&control_url, Duration::from_secs(1)).await {
                return Err(BridgeError::ConnectionFailed(format!(
                    "Cannot connect to Chrome at {}. \
                     Make sure Chrome is running with --remote-debugging-port={}",
                    control_url, settings.cdp_port
                )));
            }
            None
        }
        BrowserMode::Launch => {
            kill_existing_on_port(settings.cdp_port, progress).await;
            progress("Launching browser...");
            Some(launch(settings)?)
        }
    };

    progress("Waiting for browser debugger...");
    let socket_url = match fetch_socket_url(&control_url, timings).await {
        Ok(url) => url,
        Err(e) => {
            if let Some(managed) = managed {
                let _ = managed.stop().await;
            }
            return Err(e);
        }
    };

    Ok(ResolvedBrowser {
        endpoint: BrowserEndpoint {
            control_url,
            socket_url,
        },
        managed,
    })
}

/// Read `webSocketDebuggerUrl`, retrying `timings.resolve_attempts` times.
pub async fn fetch_socket_url(control_url: &str, timings: &Timings) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(timings.resolve_request_timeout)
        .build()
        .map_err(|e| BridgeError::Other(format!("Failed to build HTTP client: {}", e)))?;

    for attempt in 1..=timings.resolve_attempts {
        match probe(&client, control_url).await {
            Ok(url) => {
                log::debug!("Resolved debugger socket on attempt {}: {}", attempt, url);
                return Ok(url);
            }
            Err(reason) => {
                log::debug!("Attempt {}: debugger not ready ({})", attempt, reason);
            }
        }
        if attempt < timings.resolve_attempts {
            tokio::time::sleep(timings.resolve_interval).await;
        }
    }

    Err(BridgeError::ResolutionTimeout(format!(
        "Failed to resolve Chrome WebSocket URL from {} after {} attempts",
        control_url, timings.resolve_attempts
    )))
}

async fn probe(client: &reqwest::Client, control_url: &str) -> std::result::Result<String, String> {
    let url = format!("{}/json/version", control_url.trim_end_matches('/'));
    let resp = client.get(&url).send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("status {}", resp.status()));
    }
    let body: JsonVersion = resp.json().await.map_err(|e| e.to_string())?;
    body.web_socket_debugger_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| "no webSocketDebuggerUrl in /json/version".to_string())
}

/// True when the control endpoint answers `/json/version` within `timeout`
pub async fn is_reachable(control_url: &str, timeout: Duration) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(timeout).build() else {
        return false;
    };
    let url = format!("{}/json/version", control_url.trim_end_matches('/'));
    matches!(client.get(&url).send().await, Ok(resp) if resp.status().is_success())
}

/// Terminate whatever is bound to `port` so a fresh launch can bind it.
#[cfg(unix)]
async fn kill_existing_on_port(port: u16, progress: &Progress<'_>) {
    let output = match Command::new("lsof")
        .args(["-ti", &format!("tcp:{}", port)])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            log::debug!("lsof unavailable, skipping port cleanup: {}", e);
            return;
        }
    };

    let pids: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter(|p| p.parse::<u32>().is_ok())
        .map(str::to_string)
        .collect();
    if pids.is_empty() {
        return;
    }

    progress(&format!("Closing existing browser on port {}...", port));
    for pid in &pids {
        log::info!("Killing process {} holding port {}", pid, port);
        let _ = Command::new("kill").arg(pid).status().await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
}

#[cfg(not(unix))]
async fn kill_existing_on_port(port: u16, _progress: &Progress<'_>) {
    log::debug!("Port cleanup not supported on this platform (port {})", port);
}

fn launch(settings: &BrowserSettings) -> Result<ManagedBrowser> {
    let executable = find_chrome_executable(settings)?;

    // Unique profile dir per launch so parallel flows never share state
    let unique_id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let user_data_dir = std::env::temp_dir().join(format!("provider-bridge-{}", unique_id));
    std::fs::create_dir_all(&user_data_dir).map_err(|e| {
        BridgeError::LaunchFailed(format!("Failed to create temp directory: {}", e))
    })?;

    let mut cmd = Command::new(&executable);
    cmd.arg(format!("--remote-debugging-port={}", settings.cdp_port))
        .arg(format!("--user-data-dir={}", user_data_dir.display()))
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // Dropping the handle kills the process unless it should outlive us
        .kill_on_drop(!settings.keep_alive);
    if settings.headless {
        cmd.arg("--headless=new");
    }
    if settings.no_sandbox {
        cmd.arg("--no-sandbox");
    }

    let child = cmd.spawn().map_err(|e| {
        BridgeError::LaunchFailed(format!(
            "{} ({}). Install Chrome or pass --chrome-path /path/to/chrome",
            e,
            executable.display()
        ))
    })?;

    log::info!(
        "Launched Chrome {} on port {}",
        executable.display(),
        settings.cdp_port
    );

    Ok(ManagedBrowser {
        child,
        port: settings.cdp_port,
        user_data_dir,
        keep_alive: settings.keep_alive,
    })
}

fn find_chrome_executable(settings: &BrowserSettings) -> Result<PathBuf> {
    if let Some(path) = &settings.chrome_path {
        return Ok(path.clone());
    }

    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    ];

    candidates
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| {
            BridgeError::LaunchFailed(
                "Chrome not found. Install Chrome or Chromium, or pass --chrome-path".to_string(),
            )
        })
}
