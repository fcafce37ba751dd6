pub mod endpoint;
pub mod session;

pub use endpoint::{BrowserEndpoint, ManagedBrowser, ResolvedBrowser};
pub use session::{BrowserSession, ChromeSession, Cookie, SessionEvent};
