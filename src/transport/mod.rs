//! Chat transport
//!
//! A turn first goes out as a direct network call made from inside the
//! authenticated page. When that call is classified as blocked (or runs past
//! its ceiling) the turn is retried through DOM simulation instead of failing.

pub mod dom;
pub mod site;
pub mod web_chat;

pub use site::{DirectApi, DomSelectors, SiteProfile};
pub use web_chat::WebChatTransport;

use crate::error::Result;
use crate::normalize::RawChunk;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ChatTurnRequest {
    pub message: String,
    /// Required after the first turn; resolved from the page when absent
    pub conversation_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub model_profile: String,
    pub cancel: CancellationToken,
}

impl ChatTurnRequest {
    pub fn new(message: impl Into<String>, model_profile: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            parent_message_id: None,
            model_profile: model_profile.into(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPath {
    Direct,
    Dom,
}

/// Raw output of one turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutput {
    pub chunks: Vec<RawChunk>,
    /// Conversation the turn landed in, for the caller's next turn
    pub conversation_id: Option<String>,
    pub path: TurnPath,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_turn(&self, request: &ChatTurnRequest) -> Result<TurnOutput>;
}

/// Heuristic: was a direct call rejected by anti-automation defenses?
pub fn is_blocking_failure(status: Option<u16>, message: &str) -> bool {
    if status == Some(403) {
        return true;
    }
    let lower = message.to_ascii_lowercase();
    ["403", "anti-bot", "cloudflare", "captcha"]
        .iter()
        .any(|marker| lower.contains(marker))
}
