//! Scripted browser session for tests
//!
//! Implements `BrowserSession` without a browser: tests push network events,
//! change the cookie jar and decide what each page script evaluates to.

use async_trait::async_trait;
use provider_bridge::{BridgeError, BrowserSession, Cookie, Result, SessionEvent};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

type Evaluator = Box<dyn Fn(&str, usize) -> Result<Value> + Send + Sync>;

pub struct FakeSession {
    url: Mutex<String>,
    cookies: Mutex<Vec<Cookie>>,
    installed: Mutex<Vec<Cookie>>,
    navigations: Mutex<Vec<String>>,
    scripts: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<SessionEvent>>>,
    evaluator: Mutex<Option<Evaluator>>,
    evaluations: AtomicUsize,
    delays: Mutex<Vec<(String, Duration)>>,
    reject_cookies: AtomicBool,
}

#[allow(dead_code)]
impl FakeSession {
    pub fn new(url: &str) -> Self {
        Self {
            url: Mutex::new(url.to_string()),
            cookies: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            evaluator: Mutex::new(None),
            evaluations: AtomicUsize::new(0),
            delays: Mutex::new(Vec::new()),
            reject_cookies: AtomicBool::new(false),
        }
    }

    /// Answer every `evaluate` with `f(script, call_index)`
    pub fn on_evaluate<F>(&self, f: F)
    where
        F: Fn(&str, usize) -> Result<Value> + Send + Sync + 'static,
    {
        *self.evaluator.lock().unwrap() = Some(Box::new(f));
    }

    /// Scripts containing `marker` take `delay` before answering
    pub fn delay_scripts(&self, marker: &str, delay: Duration) {
        self.delays.lock().unwrap().push((marker.to_string(), delay));
    }

    /// Make every `set_cookies` call fail
    pub fn reject_cookies(&self) {
        self.reject_cookies.store(true, Ordering::SeqCst);
    }

    pub fn set_cookies_now(&self, cookies: Vec<Cookie>) {
        *self.cookies.lock().unwrap() = cookies;
    }

    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = url.to_string();
    }

    pub fn is_subscribed(&self) -> bool {
        self.events.lock().unwrap().is_some()
    }

    pub async fn wait_subscribed(&self) {
        while !self.is_subscribed() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn emit(&self, event: SessionEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(tx) = sender {
            let _ = tx.send(event).await;
        }
    }

    /// Drop the event channel, as when the browser connection goes away
    pub fn disconnect(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn installed_cookies(&self) -> Vec<Cookie> {
        self.installed.lock().unwrap().clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    async fn navigate(&self, url: &str) -> Result<()> {
        self.navigations.lock().unwrap().push(url.to_string());
        *self.url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn user_agent(&self) -> Result<String> {
        Ok("Mozilla/5.0 (FakeSession)".to_string())
    }

    async fn cookies(&self, _urls: &[String]) -> Result<Vec<Cookie>> {
        Ok(self.cookies.lock().unwrap().clone())
    }

    async fn set_cookies(&self, cookies: &[Cookie]) -> Result<()> {
        if self.reject_cookies.load(Ordering::SeqCst) {
            return Err(BridgeError::Other("Network.setCookies rejected".to_string()));
        }
        self.installed.lock().unwrap().extend(cookies.iter().cloned());
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        self.scripts.lock().unwrap().push(script.to_string());
        let index = self.evaluations.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .find(|(marker, _)| script.contains(marker.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let guard = self.evaluator.lock().unwrap();
        match guard.as_ref() {
            Some(f) => f(script, index),
            None => Err(BridgeError::Other("no evaluator scripted".to_string())),
        }
    }

    async fn subscribe(&self, _body_patterns: Vec<String>) -> Result<mpsc::Receiver<SessionEvent>> {
        let (tx, rx) = mpsc::channel(32);
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}
