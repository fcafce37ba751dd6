use super::dom::run_dom_turn;
use super::site::{DirectApi, SiteProfile};
use super::{is_blocking_failure, ChatTransport, ChatTurnRequest, TurnOutput, TurnPath};
use crate::browser::session::{parse_cookie_header, BrowserSession};
use crate::config::Timings;
use crate::credentials::CredentialBundle;
use crate::error::{BridgeError, Result};
use crate::normalize::RawChunk;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// In-page request. Runs with the page's own cookies and origin, so the
/// backend sees an ordinary same-site fetch.
const DIRECT_SCRIPT: &str = r#"
(async () => {
    const args = __ARGS__;
    try {
        let convId = args.conversationId;
        if (!convId) {
            for (const url of args.listUrls) {
                try {
                    const res = await fetch(url, { credentials: "include" });
                    if (!res.ok) continue;
                    const list = await res.json();
                    convId = args.listIdPath.reduce((v, k) => (v == null ? null : v[k]), list) ?? null;
                    if (convId) break;
                } catch (_) {}
            }
        }
        if (!convId) {
            return {
                ok: false,
                kind: "conversation",
                message: "conversationId required. Current page: " + window.location.href +
                    ". Open or start a conversation first, then retry.",
            };
        }

        const body = Object.assign({}, args.body, {
            message: args.message,
            parentResponseId: args.parentResponseId ?? crypto.randomUUID(),
        });
        const res = await fetch(args.endpoint.replace("{conversationId}", convId), {
            method: "POST",
            headers: { "Content-Type": "application/json" },
            credentials: "include",
            body: JSON.stringify(body),
        });
        if (!res.ok) {
            const errText = await res.text();
            return {
                ok: false,
                kind: "http",
                status: res.status,
                message: res.status + " " + res.statusText + " - " + errText.slice(0, 300),
            };
        }

        const reader = res.body?.getReader();
        if (!reader) return { ok: false, kind: "body", message: "No response body" };
        const decoder = new TextDecoder();
        const chunks = [];
        while (true) {
            const { done, value } = await reader.read();
            if (done) break;
            chunks.push(decoder.decode(value, { stream: true }));
        }
        const tail = decoder.decode();
        if (tail) chunks.push(tail);
        return { ok: true, chunks, conversationId: convId };
    } catch (e) {
        return { ok: false, kind: "error", message: String((e && e.message) || e) };
    }
})()
"#;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectReply {
    ok: bool,
    #[serde(default)]
    chunks: Vec<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

pub fn direct_script(
    api: &DirectApi,
    request: &ChatTurnRequest,
    conversation_id: Option<&str>,
) -> String {
    let args = json!({
        "conversationId": conversation_id,
        "parentResponseId": request.parent_message_id,
        "message": request.message,
        "model": request.model_profile,
        "endpoint": api.endpoint,
        "listUrls": api.list_urls,
        "listIdPath": api.list_id_path,
        "body": api.body,
    });
    DIRECT_SCRIPT.replace("__ARGS__", &args.to_string())
}

/// Chat transport for sites driven through a logged-in browser page
pub struct WebChatTransport {
    session: Arc<dyn BrowserSession>,
    site: SiteProfile,
    timings: Timings,
}

impl WebChatTransport {
    pub fn new(session: Arc<dyn BrowserSession>, site: SiteProfile, timings: Timings) -> Self {
        Self {
            session,
            site,
            timings,
        }
    }

    pub fn site(&self) -> &SiteProfile {
        &self.site
    }

    /// Install the bundle's cookies and make sure a site page is showing
    pub async fn prepare(&self, bundle: &CredentialBundle) -> Result<()> {
        if let Some(header) = bundle.cookie() {
            let cookies = parse_cookie_header(header, &self.site.cookie_domain);
            if !cookies.is_empty() {
                log::debug!("[{}] Installing {} cookies", self.site.name, cookies.len());
                if let Err(e) = self.session.set_cookies(&cookies).await {
                    log::warn!("[{}] Failed to install cookies: {}", self.site.name, e);
                }
            }
        }

        let current = self.session.current_url().await.unwrap_or_default();
        if !current.contains(&self.site.host) {
            log::info!("[{}] Opening {}", self.site.name, self.site.home_url);
            self.session.navigate(&self.site.home_url).await?;
        }
        Ok(())
    }

    async fn page_conversation(&self) -> Option<String> {
        let url = self.session.current_url().await.ok()?;
        self.site.conversation_from_url(&url)
    }

    async fn direct_turn(&self, api: &DirectApi, request: &ChatTurnRequest) -> Result<TurnOutput> {
        let conversation_id = match &request.conversation_id {
            Some(id) => Some(id.clone()),
            None => self.page_conversation().await,
        };
        log::info!(
            "[{}] Sending request... conversationId={} messageLen={}",
            self.site.name,
            conversation_id.as_deref().unwrap_or("(resolve from page)"),
            request.message.len()
        );

        let script = direct_script(api, request, conversation_id.as_deref());
        let value = self.session.evaluate(&script).await.map_err(|e| {
            let message = e.to_string();
            if is_blocking_failure(None, &message) {
                BridgeError::TransportBlocked(message)
            } else {
                e
            }
        })?;

        let reply: DirectReply = serde_json::from_value(value).map_err(|e| {
            BridgeError::Api(format!("{}: unexpected in-page reply: {}", self.site.name, e))
        })?;

        if !reply.ok {
            let message = format!(
                "{} API error: {}",
                self.site.name,
                reply.message.as_deref().unwrap_or("request failed")
            );
            log::debug!("[{}] Direct request failed ({:?})", self.site.name, reply.kind);
            return Err(if is_blocking_failure(reply.status, &message) {
                BridgeError::TransportBlocked(message)
            } else {
                BridgeError::Api(message)
            });
        }

        log::debug!("[{}] Direct request returned {} chunks", self.site.name, reply.chunks.len());
        Ok(TurnOutput {
            chunks: reply
                .chunks
                .into_iter()
                .map(|c| RawChunk::Bytes(c.into_bytes()))
                .collect(),
            conversation_id: reply.conversation_id.or(conversation_id),
            path: TurnPath::Direct,
        })
    }

    async fn dom_turn(&self, request: &ChatTurnRequest) -> Result<TurnOutput> {
        let text = run_dom_turn(
            self.session.as_ref(),
            &self.site.dom,
            &request.message,
            &self.timings,
            &request.cancel,
            &self.site.name,
        )
        .await?;

        let conversation_id = match self.page_conversation().await {
            Some(id) => Some(id),
            None => request.conversation_id.clone(),
        };
        Ok(TurnOutput {
            chunks: vec![RawChunk::Text(text)],
            conversation_id,
            path: TurnPath::Dom,
        })
    }
}

#[async_trait]
impl ChatTransport for WebChatTransport {
    async fn send_turn(&self, request: &ChatTurnRequest) -> Result<TurnOutput> {
        if request.cancel.is_cancelled() {
            return Err(BridgeError::Cancelled);
        }

        let Some(api) = &self.site.direct else {
            return self.dom_turn(request).await;
        };

        let ceiling = self.timings.direct_request_ceiling;
        let attempt = tokio::select! {
            _ = request.cancel.cancelled() => return Err(BridgeError::Cancelled),
            result = tokio::time::timeout(ceiling, self.direct_turn(api, request)) => match result {
                Ok(result) => result,
                Err(_) => Err(BridgeError::TransportBlocked(format!(
                    "{} request got no reply within {}s",
                    self.site.name,
                    ceiling.as_secs()
                ))),
            },
        };

        match attempt {
            Err(e) if e.is_blocking() => {
                log::warn!("[{}] {}; switching to DOM simulation", self.site.name, e);
                self.dom_turn(request).await
            }
            other => other,
        }
    }
}
