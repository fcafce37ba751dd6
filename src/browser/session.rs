//! Session handle over one DevTools connection and one page.
//!
//! Flows that observe or drive a page go through the [`BrowserSession`]
//! trait; [`ChromeSession`] is the chromiumoxide-backed implementation.

use super::endpoint::BrowserEndpoint;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network;
use chromiumoxide::cdp::browser_protocol::page::{EventLoadEventFired, NavigateParams};
use chromiumoxide::cdp::browser_protocol::target::EventTargetDestroyed;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
}

impl Cookie {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
        }
    }
}

/// `name=value; name=value` form used in Cookie headers
pub fn cookie_header(cookies: &[Cookie]) -> String {
    cookies
        .iter()
        .map(|c| format!("{}={}", c.name, c.value))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Split a Cookie header back into cookies scoped to `domain`
pub fn parse_cookie_header(header: &str, domain: &str) -> Vec<Cookie> {
    header
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(Cookie::new(name, value.trim(), domain))
        })
        .collect()
}

/// Network and lifecycle signals observed on the session's page
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Outbound request; header names are lowercased
    Request {
        url: String,
        headers: HashMap<String, String>,
    },
    /// Inbound response; `body` is only fetched for subscribed URL patterns
    Response {
        url: String,
        status: u16,
        body: Option<String>,
    },
    /// The page was closed underneath us
    Closed,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn user_agent(&self) -> Result<String>;

    /// Cookies visible to any of `urls`
    async fn cookies(&self, urls: &[String]) -> Result<Vec<Cookie>>;

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()>;

    /// Evaluate `script` in page context, awaiting promises, returning by value
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;

    /// Start observing page traffic. Response bodies are read for URLs that
    /// contain one of `body_patterns`. Dropping the receiver stops delivery.
    async fn subscribe(&self, body_patterns: Vec<String>) -> Result<mpsc::Receiver<SessionEvent>>;
}

/// A connected Chrome page
pub struct ChromeSession {
    browser: Browser,
    page: Page,
    handler_task: JoinHandle<()>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl ChromeSession {
    /// Connect to the endpoint's socket URL and pick a page to drive
    pub async fn connect(endpoint: &BrowserEndpoint) -> Result<Self> {
        let (mut browser, mut handler) = Browser::connect(&endpoint.socket_url)
            .await
            .map_err(|e| {
                BridgeError::ConnectionFailed(format!(
                    "Failed to connect to {}: {}",
                    endpoint.socket_url, e
                ))
            })?;

        let handler_task = tokio::spawn(async move {
            while (handler.next().await).is_some() {
                // Drive the connection
            }
        });

        // Existing tabs are only known after target discovery
        if let Err(e) = browser.fetch_targets().await {
            log::debug!("Target discovery failed: {}", e);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let page = Self::pick_page(&browser).await?;
        page.execute(network::EnableParams::default())
            .await
            .map_err(|e| BridgeError::ConnectionFailed(format!("Network.enable failed: {}", e)))?;

        Ok(Self {
            browser,
            page,
            handler_task,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// First non-`chrome://` page, else the last page, else a fresh one
    async fn pick_page(browser: &Browser) -> Result<Page> {
        let pages = browser.pages().await?;

        for page in pages.iter() {
            if let Ok(Some(url)) = page.url().await {
                if !url.starts_with("chrome://") {
                    return Ok(page.clone());
                }
            }
        }

        if let Some(page) = pages.last() {
            return Ok(page.clone());
        }

        browser
            .new_page("about:blank")
            .await
            .map_err(|e| BridgeError::Other(format!("Failed to create page: {}", e)))
    }

    /// Find an open page whose URL contains `needle`
    pub async fn find_page(&self, needle: &str) -> Option<Page> {
        let pages = self.browser.pages().await.ok()?;
        for page in pages {
            if let Ok(Some(url)) = page.url().await {
                if url.contains(needle) {
                    return Some(page);
                }
            }
        }
        None
    }

    /// Switch the driven page, e.g. to an already-open chat tab
    pub fn use_page(&mut self, page: Page) {
        self.page = page;
    }

    /// Drop listeners and the connection. The browser process is untouched.
    pub fn close(self) {
        // Drop does the work
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut guard) = self.listeners.lock() {
            guard.push(task);
        }
    }
}

impl Drop for ChromeSession {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.listeners.lock() {
            for task in guard.drain(..) {
                task.abort();
            }
        }
        self.handler_task.abort();
    }
}

fn normalize_url(url: &str) -> String {
    let has_scheme = ["http://", "https://", "file://", "about:", "data:"]
        .iter()
        .any(|p| url.starts_with(p));
    if has_scheme {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

fn header_map(headers: &network::Headers) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Ok(serde_json::Value::Object(obj)) = serde_json::to_value(headers) {
        for (k, v) in obj {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            map.insert(k.to_ascii_lowercase(), value);
        }
    }
    map
}

async fn read_body(page: &Page, request_id: network::RequestId) -> Option<String> {
    let resp = page
        .execute(network::GetResponseBodyParams::new(request_id))
        .await
        .map_err(|e| log::debug!("Network.getResponseBody failed: {}", e))
        .ok()?;
    let body = resp.result;
    if body.base64_encoded {
        let bytes = general_purpose::STANDARD.decode(body.body.as_bytes()).ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    } else {
        Some(body.body)
    }
}

enum ResponseSignal {
    Received(std::sync::Arc<network::EventResponseReceived>),
    Finished(std::sync::Arc<network::EventLoadingFinished>),
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = normalize_url(url);
        log::info!("Navigating to {}", url);

        let mut load_events = self.page.event_listener::<EventLoadEventFired>().await?;

        let params = NavigateParams::builder()
            .url(&url)
            .build()
            .map_err(|e| BridgeError::NavigationFailed(format!("Invalid URL {}: {}", url, e)))?;

        let response = self.page.execute(params).await.map_err(|e| {
            if e.to_string().contains("oneshot canceled") {
                BridgeError::NavigationFailed(
                    "Browser connection lost. The browser may have been closed.".to_string(),
                )
            } else {
                BridgeError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e))
            }
        })?;

        if let Some(error_text) = response.result.error_text {
            return Err(BridgeError::NavigationFailed(format!(
                "Navigation error: {}",
                error_text
            )));
        }

        match tokio::time::timeout(Duration::from_secs(30), load_events.next()).await {
            Ok(Some(_)) => log::debug!("Load event fired for {}", url),
            Ok(None) => log::warn!("Load event stream ended for {}", url),
            Err(_) => log::warn!("No load event for {} after 30s, continuing", url),
        }

        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        self.page
            .url()
            .await
            .map_err(|e| BridgeError::Other(e.to_string()))?
            .ok_or_else(|| BridgeError::Other("Page has no URL".to_string()))
    }

    async fn user_agent(&self) -> Result<String> {
        match self.evaluate("navigator.userAgent").await? {
            serde_json::Value::String(ua) => Ok(ua),
            other => Err(BridgeError::Other(format!(
                "Unexpected navigator.userAgent value: {}",
                other
            ))),
        }
    }

    async fn cookies(&self, urls: &[String]) -> Result<Vec<Cookie>> {
        let resp = self
            .page
            .execute(network::GetCookiesParams {
                urls: Some(urls.to_vec()),
            })
            .await
            .map_err(|e| BridgeError::Other(format!("Network.getCookies failed: {}", e)))?;

        Ok(resp
            .result
            .cookies
            .into_iter()
            .map(|c| Cookie::new(c.name, c.value, c.domain))
            .collect())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        let params = cookies
            .iter()
            .map(|c| {
                let mut param = network::CookieParam::new(c.name.clone(), c.value.clone());
                param.domain = Some(c.domain.clone());
                param.path = Some("/".to_string());
                param
            })
            .collect::<Vec<_>>();

        self.page
            .set_cookies(params)
            .await
            .map_err(|e| BridgeError::Other(format!("Failed to set cookies: {}", e)))?;
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BridgeError::Other)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| BridgeError::Other(format!("Script execution failed: {}", e)))?;

        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }

    async fn subscribe(&self, body_patterns: Vec<String>) -> Result<mpsc::Receiver<SessionEvent>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut requests = self
            .page
            .event_listener::<network::EventRequestWillBeSent>()
            .await?;
        let request_tx = tx.clone();
        self.track(tokio::spawn(async move {
            while let Some(ev) = requests.next().await {
                let event = SessionEvent::Request {
                    url: ev.request.url.clone(),
                    headers: header_map(&ev.request.headers),
                };
                if request_tx.send(event).await.is_err() {
                    break;
                }
            }
        }));

        let received = self
            .page
            .event_listener::<network::EventResponseReceived>()
            .await?
            .map(ResponseSignal::Received);
        let finished = self
            .page
            .event_listener::<network::EventLoadingFinished>()
            .await?
            .map(ResponseSignal::Finished);
        let mut responses = futures::stream::select(received, finished);
        let response_tx = tx.clone();
        let page = self.page.clone();
        self.track(tokio::spawn(async move {
            // Bodies are only complete once loading finished
            let mut pending: HashMap<network::RequestId, (String, u16)> = HashMap::new();
            while let Some(signal) = responses.next().await {
                let event = match signal {
                    ResponseSignal::Received(ev) => {
                        let url = ev.response.url.clone();
                        let status = u16::try_from(ev.response.status).unwrap_or_default();
                        if body_patterns.iter().any(|p| url.contains(p.as_str())) {
                            pending.insert(ev.request_id.clone(), (url, status));
                            continue;
                        }
                        SessionEvent::Response {
                            url,
                            status,
                            body: None,
                        }
                    }
                    ResponseSignal::Finished(ev) => {
                        let Some((url, status)) = pending.remove(&ev.request_id) else {
                            continue;
                        };
                        let body = read_body(&page, ev.request_id.clone()).await;
                        SessionEvent::Response { url, status, body }
                    }
                };
                if response_tx.send(event).await.is_err() {
                    break;
                }
            }
        }));

        let mut destroyed = self.browser.event_listener::<EventTargetDestroyed>().await?;
        let target_id = self.page.target_id().clone();
        let closed_tx = tx;
        self.track(tokio::spawn(async move {
            while let Some(ev) = destroyed.next().await {
                if ev.target_id == target_id {
                    let _ = closed_tx.send(SessionEvent::Closed).await;
                    break;
                }
            }
        }));

        Ok(rx)
    }
}
