//! Runtime settings shared by every provider flow.
//!
//! `Timings` holds every deadline and interval the bridge waits on, so that a
//! single value can be injected into the resolver, the capture machine, the
//! chat transport and the task client. Defaults match the production values.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CDP_PORT: u16 = 9222;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Attempts made to read `webSocketDebuggerUrl` from the control endpoint
    pub resolve_attempts: u32,
    #[serde(with = "millis")]
    pub resolve_interval: Duration,
    #[serde(with = "millis")]
    pub resolve_request_timeout: Duration,

    #[serde(with = "millis")]
    pub capture_deadline: Duration,
    #[serde(with = "millis")]
    pub cookie_poll_interval: Duration,

    /// Ceiling on the direct in-page request; hitting it triggers DOM fallback
    #[serde(with = "millis")]
    pub direct_request_ceiling: Duration,
    #[serde(with = "millis")]
    pub dom_poll_interval: Duration,
    #[serde(with = "millis")]
    pub dom_max_wait: Duration,
    /// Consecutive unchanged snapshots needed before a DOM reply counts as final
    pub dom_stable_polls: u32,

    #[serde(with = "millis")]
    pub task_poll_interval: Duration,
    #[serde(with = "millis")]
    pub task_deadline: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            resolve_attempts: 10,
            resolve_interval: Duration::from_millis(500),
            resolve_request_timeout: Duration::from_secs(2),
            capture_deadline: Duration::from_secs(300),
            cookie_poll_interval: Duration::from_secs(2),
            direct_request_ceiling: Duration::from_secs(120),
            dom_poll_interval: Duration::from_secs(2),
            dom_max_wait: Duration::from_secs(90),
            dom_stable_polls: 2,
            task_poll_interval: Duration::from_secs(2),
            task_deadline: Duration::from_secs(120),
        }
    }
}

/// How the browser for a login or chat flow is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserMode {
    /// Connect to an externally managed browser; never terminated by us
    Attach,
    /// Start a browser owned by the flow
    Launch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub mode: BrowserMode,
    pub cdp_port: u16,
    /// Explicit control URL for attach mode; overrides `cdp_port`
    pub cdp_url: Option<String>,
    pub chrome_path: Option<PathBuf>,
    pub headless: bool,
    pub no_sandbox: bool,
    /// Leave a launched browser running after the flow for reuse
    pub keep_alive: bool,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            mode: BrowserMode::Attach,
            cdp_port: DEFAULT_CDP_PORT,
            cdp_url: None,
            chrome_path: None,
            headless: false,
            no_sandbox: false,
            keep_alive: false,
        }
    }
}

impl BrowserSettings {
    pub fn control_url(&self) -> String {
        match (&self.mode, &self.cdp_url) {
            (BrowserMode::Attach, Some(url)) => url.trim_end_matches('/').to_string(),
            _ => format!("http://127.0.0.1:{}", self.cdp_port),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
