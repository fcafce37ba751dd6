//! DOM simulation
//!
//! Sends a message the way a person would (type, click send) and reads the
//! reply back by polling the rendered page until its text stops changing.
//! Page layouts change without notice, so this is best-effort and bounded
//! by `Timings::dom_max_wait`.

use super::site::DomSelectors;
use crate::browser::session::BrowserSession;
use crate::config::Timings;
use crate::error::{BridgeError, Result};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SEND_SCRIPT: &str = r#"
(() => {
    const msg = __MESSAGE__;
    const inputSelectors = __INPUT__;
    const sendSelectors = __SEND__;

    let inputEl = null;
    for (const sel of inputSelectors) {
        const el = document.querySelector(sel);
        if (el && el.offsetParent !== null) { inputEl = el; break; }
    }
    if (!inputEl) return { ok: false, error: "no visible input element" };

    inputEl.focus();
    if (inputEl.tagName === "TEXTAREA" || inputEl.tagName === "INPUT") {
        inputEl.value = msg;
        inputEl.dispatchEvent(new Event("input", { bubbles: true }));
    } else {
        inputEl.innerText = msg;
        inputEl.dispatchEvent(new Event("input", { bubbles: true }));
        inputEl.dispatchEvent(new Event("change", { bubbles: true }));
    }

    for (const sel of sendSelectors) {
        const btn = document.querySelector(sel);
        if (btn && !btn.disabled) { btn.click(); return { ok: true, via: "button" }; }
    }
    const formBtn = inputEl.closest("form")?.querySelector("button[type=submit]");
    if (formBtn) { formBtn.click(); return { ok: true, via: "form" }; }

    inputEl.dispatchEvent(new KeyboardEvent("keydown", {
        key: "Enter", code: "Enter", keyCode: 13, which: 13, bubbles: true,
    }));
    return { ok: true, via: "enter" };
})()
"#;

const POLL_SCRIPT: &str = r#"
(() => {
    const clean = (t) => t.replace(/[\u200B-\u200D\uFEFF]/g, "").trim();
    const contentSelectors = __CONTENT__;
    const stopSelectors = __STOP__;
    const exclude = __EXCLUDE__;

    let text = "";
    for (const sel of contentSelectors) {
        const els = document.querySelectorAll(sel);
        const last = els.length > 0 ? els[els.length - 1] : null;
        if (last) {
            const t = clean(last.textContent ?? "");
            if (t.length > __MIN_CONTENT__) { text = t; break; }
        }
    }
    if (!text) {
        const all = document.querySelectorAll(__SCAN__);
        for (let i = all.length - 1; i >= 0; i--) {
            const t = clean(all[i].textContent ?? "");
            if (t.length > __MIN_SCAN__ && !(exclude && t.includes(exclude))) { text = t; break; }
        }
    }
    const streaming = stopSelectors.some((sel) => !!document.querySelector(sel));
    return { text, streaming };
})()
"#;

fn js<T: serde::Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// Script that fills the input and activates the send control
pub fn send_script(selectors: &DomSelectors, message: &str) -> String {
    // Message goes in last so its content is never rescanned for placeholders
    SEND_SCRIPT
        .replace("__INPUT__", &js(&selectors.input))
        .replace("__SEND__", &js(&selectors.send))
        .replace("__MESSAGE__", &js(message))
}

/// Script returning `{ text, streaming }` for the current reply
pub fn poll_script(selectors: &DomSelectors) -> String {
    POLL_SCRIPT
        .replace("__MIN_CONTENT__", &selectors.min_content_chars.to_string())
        .replace("__MIN_SCAN__", &selectors.min_scan_chars.to_string())
        .replace("__CONTENT__", &js(&selectors.content))
        .replace("__STOP__", &js(&selectors.stop))
        .replace("__SCAN__", &js(&selectors.scan))
        .replace("__EXCLUDE__", &js(&selectors.exclude_phrase))
}

#[derive(Debug, Deserialize)]
struct SendOutcome {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    via: Option<String>,
}

/// One poll of the page
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub streaming: bool,
}

/// Stability detector over successive snapshots
#[derive(Debug)]
pub struct ReplyTracker {
    last: String,
    stable: u32,
    needed: u32,
}

impl ReplyTracker {
    pub fn new(needed: u32) -> Self {
        Self {
            last: String::new(),
            stable: 0,
            needed,
        }
    }

    /// Record a snapshot; true once the reply is complete
    pub fn observe(&mut self, snapshot: &Snapshot) -> bool {
        if snapshot.text.is_empty() {
            return false;
        }
        if snapshot.text != self.last {
            self.last = snapshot.text.clone();
            self.stable = 0;
            return false;
        }
        self.stable += 1;
        !snapshot.streaming && self.stable >= self.needed
    }

    pub fn text(&self) -> &str {
        &self.last
    }
}

/// Drive one chat turn through the page. Returns the final reply text.
pub async fn run_dom_turn(
    session: &dyn BrowserSession,
    selectors: &DomSelectors,
    message: &str,
    timings: &Timings,
    cancel: &CancellationToken,
    site: &str,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(BridgeError::Cancelled);
    }

    let started = Instant::now();
    let send = send_script(selectors, message);
    let value = tokio::select! {
        _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
        sent = tokio::time::timeout(timings.dom_max_wait, session.evaluate(&send)) => match sent {
            Ok(value) => value?,
            Err(_) => {
                return Err(BridgeError::DomInteractionFailure(format!(
                    "{}: message send timed out",
                    site
                )))
            }
        },
    };
    let outcome: SendOutcome = serde_json::from_value(value)
        .map_err(|e| BridgeError::DomInteractionFailure(format!("Unexpected send result: {}", e)))?;
    if !outcome.ok {
        return Err(BridgeError::DomInteractionFailure(format!(
            "{}: {}",
            site,
            outcome.error.unwrap_or_else(|| "send failed".to_string())
        )));
    }
    log::info!(
        "[{}] DOM message sent via {}, polling for reply...",
        site,
        outcome.via.as_deref().unwrap_or("unknown")
    );

    let script = poll_script(selectors);
    let mut tracker = ReplyTracker::new(timings.dom_stable_polls);

    while started.elapsed() < timings.dom_max_wait {
        let remaining = timings.dom_max_wait.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            _ = tokio::time::sleep(timings.dom_poll_interval.min(remaining)) => {}
        }

        // A hung page script must not outlive the wait
        let remaining = timings.dom_max_wait.saturating_sub(started.elapsed());
        let polled = tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            polled = tokio::time::timeout(remaining, session.evaluate(&script)) => polled,
        };
        let snapshot = match polled {
            Ok(Ok(value)) => serde_json::from_value::<Snapshot>(value).unwrap_or_default(),
            Ok(Err(e)) => {
                log::warn!("[{}] Reply poll failed: {}", site, e);
                continue;
            }
            Err(_) => {
                log::warn!("[{}] Reply poll still running at the end of the wait", site);
                break;
            }
        };
        if cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }
        if tracker.observe(&snapshot) {
            log::debug!("[{}] Reply stable after {:?}", site, started.elapsed());
            break;
        }
    }

    if tracker.text().is_empty() {
        return Err(BridgeError::NoReplyDetected(format!(
            "{} page produced no reply. Make sure the page is open, logged in, and the input box is visible.",
            site
        )));
    }
    Ok(tracker.text().to_string())
}
