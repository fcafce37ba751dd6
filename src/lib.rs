pub mod browser;
pub mod capture;
pub mod config;
pub mod credentials;
pub mod error;
pub mod normalize;
pub mod provider;
pub mod registry;
pub mod task;
pub mod transport;

/// Human-readable progress sink for interactive flows
pub type Progress<'a> = dyn Fn(&str) + Send + Sync + 'a;

//  Re-export commonly used items
pub use browser::{
    BrowserEndpoint, BrowserSession, ChromeSession, Cookie, ResolvedBrowser, SessionEvent,
};
pub use capture::{capture, CaptureMachine, CapturePolicy, CaptureState, Latch};
pub use config::{BrowserMode, BrowserSettings, Timings};
pub use credentials::{CredentialBundle, CredentialStore, JsonFileStore};
pub use error::{BridgeError, Result};
pub use normalize::{
    normalize, normalize_result, MessageMeta, NormalizedEvent, Normalizer, RawChunk, StopReason,
};
pub use provider::{chat_turn, login_flow, store_api_key, ChatBackend, ProviderKind, SessionState};
pub use registry::{DefaultModelRegistry, ModelRegistry};
pub use task::{TaskClient, TaskReply, TaskStatus};
pub use transport::{
    ChatTransport, ChatTurnRequest, SiteProfile, TurnOutput, TurnPath, WebChatTransport,
};
