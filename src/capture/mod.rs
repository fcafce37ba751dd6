//! Credential capture state machine
//!
//! Watches a live browser session until the provider's completion predicate
//! holds. Three sources race to resolve one outcome: outbound requests
//! carrying an authorization header, inbound responses carrying a token in
//! their body, and a periodic cookie-jar poll that also covers sessions that
//! were already logged in before we attached. A closed page fails the flow
//! immediately; the whole flow is bounded by `Timings::capture_deadline`.

pub mod latch;
pub mod policy;

pub use latch::Latch;
pub use policy::{BundleShape, CapturePolicy, CookieRule, TokenSource};

use crate::browser::session::{BrowserSession, Cookie, SessionEvent};
use crate::config::Timings;
use crate::credentials::CredentialBundle;
use crate::error::{BridgeError, Result};
use crate::Progress;
use std::collections::HashMap;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    WaitingForSignal,
    Captured,
    TimedOut,
    Aborted,
}

/// Flow-local capture state. Signals are fed in, the completion predicate is
/// evaluated through [`CaptureMachine::evaluate`] only.
pub struct CaptureMachine<'a> {
    policy: &'a CapturePolicy,
    user_agent: String,
    token: Latch<String>,
    outcome: Latch<CredentialBundle>,
    state: CaptureState,
}

impl<'a> CaptureMachine<'a> {
    pub fn new(policy: &'a CapturePolicy, user_agent: impl Into<String>) -> Self {
        Self {
            policy,
            user_agent: user_agent.into(),
            token: Latch::new(),
            outcome: Latch::new(),
            state: CaptureState::WaitingForSignal,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn token(&self) -> Option<&str> {
        self.token.get().map(String::as_str)
    }

    fn is_terminal(&self) -> bool {
        self.state != CaptureState::WaitingForSignal
    }

    /// Feed one session event. Returns true when the predicate should be
    /// re-evaluated.
    pub fn observe(&mut self, event: &SessionEvent) -> bool {
        if self.is_terminal() {
            return false;
        }
        match event {
            SessionEvent::Request { url, headers } => self.observe_request(url, headers),
            SessionEvent::Response { url, status, body } => {
                self.observe_response(url, *status, body.as_deref())
            }
            SessionEvent::Closed => {
                self.abort();
                false
            }
        }
    }

    fn observe_request(&mut self, url: &str, headers: &HashMap<String, String>) -> bool {
        let mut check = false;
        for source in &self.policy.token_sources {
            let TokenSource::RequestHeader {
                url_contains,
                header,
                prefix,
            } = source
            else {
                continue;
            };
            if !url.contains(url_contains.as_str()) {
                continue;
            }
            let Some(value) = headers.get(&header.to_ascii_lowercase()) else {
                continue;
            };
            let token = match prefix {
                Some(p) => match value.strip_prefix(p.as_str()) {
                    Some(rest) => rest,
                    None => continue,
                },
                None => value.as_str(),
            };
            if token.is_empty() {
                continue;
            }
            if self.token.set(token.to_string()) {
                log::info!("[{}] Captured bearer token from request header", self.policy.name);
            }
            check = true;
        }
        check || self.matches_recheck(url)
    }

    fn observe_response(&mut self, url: &str, status: u16, body: Option<&str>) -> bool {
        if !(200..300).contains(&status) {
            return false;
        }
        let mut check = false;
        for source in &self.policy.token_sources {
            let TokenSource::ResponseBody {
                url_contains,
                pointer,
            } = source
            else {
                continue;
            };
            if !url.contains(url_contains.as_str()) {
                continue;
            }
            let token = body
                .and_then(|b| serde_json::from_str::<serde_json::Value>(b).ok())
                .and_then(|v| v.pointer(pointer).and_then(|t| t.as_str()).map(str::to_string))
                .filter(|t| !t.is_empty());
            if let Some(token) = token {
                if self.token.set(token) {
                    log::info!("[{}] Captured token from {} response", self.policy.name, url);
                }
                check = true;
            }
        }
        check || self.matches_recheck(url)
    }

    fn matches_recheck(&self, url: &str) -> bool {
        self.policy.recheck_on.iter().any(|p| url.contains(p.as_str()))
    }

    /// Evaluate the completion predicate against a fresh cookie read
    pub fn evaluate(&mut self, cookies: &[Cookie]) -> Option<&CredentialBundle> {
        if self.is_terminal() {
            return None;
        }
        let bundle = self
            .policy
            .complete(cookies, self.token(), &self.user_agent)?;
        if self.outcome.set(bundle) {
            self.state = CaptureState::Captured;
            log::info!(
                "[{}] Credentials captured ({} cookies)",
                self.policy.name,
                cookies.len()
            );
        }
        self.outcome.get()
    }

    pub fn abort(&mut self) {
        if !self.is_terminal() {
            self.state = CaptureState::Aborted;
        }
    }

    pub fn time_out(&mut self) {
        if !self.is_terminal() {
            self.state = CaptureState::TimedOut;
        }
    }
}

/// Drive a login on `session` until credentials are captured, the page is
/// closed or the deadline passes.
pub async fn capture(
    session: &dyn BrowserSession,
    policy: &CapturePolicy,
    timings: &Timings,
    progress: &Progress<'_>,
) -> Result<CredentialBundle> {
    let deadline = timings.capture_deadline;
    let mut machine = CaptureMachine::new(policy, String::new());

    let result =
        tokio::time::timeout(deadline, run(session, &mut machine, timings, progress)).await;

    match result {
        Ok(outcome) => outcome,
        Err(_) => {
            machine.time_out();
            log::warn!("[{}] Login timed out after {:?}", policy.name, deadline);
            Err(BridgeError::CaptureTimeout(deadline.as_secs()))
        }
    }
}

async fn run(
    session: &dyn BrowserSession,
    machine: &mut CaptureMachine<'_>,
    timings: &Timings,
    progress: &Progress<'_>,
) -> Result<CredentialBundle> {
    let policy = machine.policy;

    // Subscribe before navigating so the first API calls are observed
    let mut events = session.subscribe(policy.body_patterns()).await?;
    session.navigate(&policy.start_url).await?;
    machine.user_agent = session.user_agent().await?;

    progress(&policy.login_prompt);

    let mut ticker = tokio::time::interval(timings.cookie_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let check = tokio::select! {
            event = events.recv() => match event {
                Some(event) => machine.observe(&event),
                None => {
                    machine.abort();
                    false
                }
            },
            _ = ticker.tick() => true,
        };

        if machine.state() == CaptureState::Aborted {
            log::warn!("[{}] Page closed before login was captured", policy.name);
            return Err(BridgeError::CaptureAborted);
        }
        if !check {
            continue;
        }

        let cookies = match session.cookies(&policy.cookie_urls).await {
            Ok(cookies) => cookies,
            Err(e) => {
                log::error!("[{}] Failed to fetch cookies: {}", policy.name, e);
                continue;
            }
        };
        if cookies.is_empty() {
            log::debug!("[{}] No cookies found yet", policy.name);
            continue;
        }

        if let Some(bundle) = machine.evaluate(&cookies) {
            let bundle = bundle.clone();
            progress(&format!("{} login captured.", policy.name));
            return Ok(bundle);
        }
    }
}
