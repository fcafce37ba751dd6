//! Provider flows
//!
//! `login_flow` captures and stores credentials through a browser;
//! `chat_turn` runs one turn against a connected backend and yields the
//! normalized event stream.

use crate::browser::endpoint::resolve;
use crate::browser::session::{BrowserSession, ChromeSession};
use crate::capture::{capture, CapturePolicy};
use crate::config::{BrowserSettings, Timings};
use crate::credentials::{CredentialBundle, CredentialStore};
use crate::error::{BridgeError, Result};
use crate::normalize::{normalize, MessageMeta, NormalizedEvent, Normalizer, RawChunk};
use crate::registry::ModelRegistry;
use crate::task::TaskClient;
use crate::transport::{ChatTransport, ChatTurnRequest, SiteProfile, WebChatTransport};
use crate::Progress;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    DeepseekWeb,
    DoubaoWeb,
    GrokWeb,
    ManusApi,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::DeepseekWeb,
        ProviderKind::DoubaoWeb,
        ProviderKind::GrokWeb,
        ProviderKind::ManusApi,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::DeepseekWeb => "deepseek-web",
            ProviderKind::DoubaoWeb => "doubao-web",
            ProviderKind::GrokWeb => "grok-web",
            ProviderKind::ManusApi => "manus-api",
        }
    }

    /// None for providers authenticated by API key
    pub fn capture_policy(&self) -> Option<CapturePolicy> {
        match self {
            ProviderKind::DeepseekWeb => Some(CapturePolicy::deepseek()),
            ProviderKind::DoubaoWeb => Some(CapturePolicy::doubao()),
            ProviderKind::GrokWeb => Some(CapturePolicy::grok()),
            ProviderKind::ManusApi => None,
        }
    }

    /// Browser chat site, for providers whose turns run through a page
    pub fn site(&self) -> Option<SiteProfile> {
        match self {
            ProviderKind::GrokWeb => Some(SiteProfile::grok()),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for ProviderKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        ProviderKind::ALL
            .into_iter()
            .find(|p| p.id() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = ProviderKind::ALL.iter().map(|p| p.id()).collect();
                BridgeError::Unsupported(format!(
                    "unknown provider '{}' (known: {})",
                    s,
                    known.join(", ")
                ))
            })
    }
}

/// Per-conversation state owned by the caller and carried between turns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub conversation_id: Option<String>,
}

/// Capture credentials for `provider` through a browser and store them
pub async fn login_flow(
    provider: ProviderKind,
    settings: &BrowserSettings,
    timings: &Timings,
    store: &dyn CredentialStore,
    progress: &Progress<'_>,
) -> Result<CredentialBundle> {
    let policy = provider.capture_policy().ok_or_else(|| {
        BridgeError::Unsupported(format!(
            "{} is configured with an API key, not a browser login",
            provider
        ))
    })?;

    let resolved = resolve(settings, timings, progress).await?;
    progress("Connecting to browser...");

    let outcome = match ChromeSession::connect(&resolved.endpoint).await {
        Ok(session) => {
            let outcome = capture(&session, &policy, timings, progress).await;
            session.close();
            outcome
        }
        Err(e) => Err(e),
    };

    if let Err(e) = resolved.release().await {
        log::warn!("[{}] Failed to release browser: {}", policy.name, e);
    }

    let bundle = outcome?;
    store.save(provider.id(), &bundle)?;
    log::info!("[{}] Credentials stored for {}", policy.name, provider);
    Ok(bundle)
}

/// Store an API key for providers that don't log in through a browser
pub fn store_api_key(
    provider: ProviderKind,
    api_key: &str,
    store: &dyn CredentialStore,
) -> Result<CredentialBundle> {
    if provider.capture_policy().is_some() {
        return Err(BridgeError::Unsupported(format!("{} logs in through a browser", provider)));
    }
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(BridgeError::Api(format!("{} API key is required", provider)));
    }
    let bundle = CredentialBundle::ApiKey {
        api_key: api_key.to_string(),
    };
    store.save(provider.id(), &bundle)?;
    Ok(bundle)
}

/// Backend a turn is sent to
pub enum ChatBackend {
    Web {
        provider: ProviderKind,
        transport: WebChatTransport,
    },
    Task {
        provider: ProviderKind,
        client: TaskClient,
    },
}

impl ChatBackend {
    /// Browser-driven backend; installs the bundle's cookies on the page
    pub async fn web(
        provider: ProviderKind,
        session: Arc<dyn BrowserSession>,
        bundle: &CredentialBundle,
        timings: Timings,
    ) -> Result<Self> {
        let site = provider.site().ok_or_else(|| {
            BridgeError::Unsupported(format!("{} has no browser chat transport", provider))
        })?;
        let transport = WebChatTransport::new(session, site, timings);
        transport.prepare(bundle).await?;
        Ok(ChatBackend::Web { provider, transport })
    }

    /// Task backend; `base_url` overrides the public endpoint
    pub fn task(
        provider: ProviderKind,
        bundle: &CredentialBundle,
        timings: Timings,
        base_url: Option<&str>,
    ) -> Result<Self> {
        let CredentialBundle::ApiKey { api_key } = bundle else {
            return Err(BridgeError::Unsupported(format!(
                "{} requires an API key bundle",
                provider
            )));
        };
        let client = match base_url {
            Some(url) => TaskClient::with_base_url(url, api_key, timings)?,
            None => TaskClient::new(api_key, timings)?,
        };
        Ok(ChatBackend::Task { provider, client })
    }

    pub fn provider(&self) -> ProviderKind {
        match self {
            ChatBackend::Web { provider, .. } | ChatBackend::Task { provider, .. } => *provider,
        }
    }
}

/// Run one chat turn. Failures arrive as the stream's terminal `Error` event;
/// `state` is updated with the conversation the turn landed in.
pub async fn chat_turn(
    backend: &ChatBackend,
    registry: &dyn ModelRegistry,
    model: &str,
    message: &str,
    state: &mut SessionState,
    cancel: CancellationToken,
) -> ReceiverStream<NormalizedEvent> {
    let provider = backend.provider();
    let meta = MessageMeta::new(provider.id(), model);
    let profile = registry.profile_for(provider, model);

    let (result, normalizer) = match backend {
        ChatBackend::Web { transport, .. } => {
            let request = ChatTurnRequest::new(message, profile)
                .with_conversation(state.conversation_id.clone())
                .with_cancel(cancel);
            let normalizer = match &transport.site().direct {
                Some(api) => Normalizer::new(meta, Box::new(api.decoder())),
                None => Normalizer::text_only(meta),
            };
            let result = transport.send_turn(&request).await.map(|output| {
                log::info!("[{}] Turn completed via {:?}", provider, output.path);
                if output.conversation_id.is_some() {
                    state.conversation_id = output.conversation_id;
                }
                output.chunks
            });
            (result, normalizer)
        }
        ChatBackend::Task { client, .. } => {
            log::info!(
                "[{}] Conversation ID: {}",
                provider,
                state.conversation_id.as_deref().unwrap_or("new")
            );
            let result = client
                .chat(message, &profile, state.conversation_id.as_deref(), &cancel)
                .await
                .map(|reply| {
                    state.conversation_id = Some(reply.task_id);
                    vec![RawChunk::Text(reply.text)]
                });
            (result, Normalizer::text_only(meta))
        }
    };

    let items: Vec<Result<RawChunk>> = match result {
        Ok(chunks) => chunks.into_iter().map(Ok).collect(),
        Err(e) => vec![Err(e)],
    };
    normalize(futures::stream::iter(items), normalizer)
}
