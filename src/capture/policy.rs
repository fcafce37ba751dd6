//! Per-provider login completion rules.
//!
//! Each backend signals "logged in" differently and the rules below are kept
//! exactly as observed per site rather than unified.

use crate::browser::session::{cookie_header, Cookie};
use crate::credentials::CredentialBundle;

/// Where a bearer-like token can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    /// Outbound request header on URLs containing `url_contains`
    RequestHeader {
        url_contains: String,
        header: String,
        /// Required value prefix, stripped from the latched token
        prefix: Option<String>,
    },
    /// JSON body of a successful response, read at `pointer`
    ResponseBody {
        url_contains: String,
        pointer: String,
    },
}

/// Cookie-side half of the completion predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieRule {
    /// The cookie header mentions any `marker=`, or there are more than
    /// `more_than` cookies in the jar
    AnyMarker {
        markers: Vec<String>,
        more_than: Option<usize>,
    },
    /// A cookie with one of these exact names exists
    AnyNamed(Vec<String>),
}

impl CookieRule {
    pub fn is_satisfied(&self, cookies: &[Cookie]) -> bool {
        if cookies.is_empty() {
            return false;
        }
        match self {
            CookieRule::AnyMarker { markers, more_than } => {
                let header = cookie_header(cookies);
                markers
                    .iter()
                    .any(|m| header.contains(&format!("{}=", m)))
                    || more_than.is_some_and(|n| cookies.len() > n)
            }
            CookieRule::AnyNamed(names) => cookies.iter().any(|c| names.contains(&c.name)),
        }
    }
}

/// How a finished capture is packaged
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleShape {
    Bearer,
    Session {
        session_cookie: String,
        secondary_cookie: Option<String>,
    },
    Cookie,
}

#[derive(Debug, Clone)]
pub struct CapturePolicy {
    pub name: String,
    /// Page opened for the user to log in on
    pub start_url: String,
    /// URLs whose cookie jar is inspected
    pub cookie_urls: Vec<String>,
    pub token_sources: Vec<TokenSource>,
    /// Capture must not resolve without a latched token
    pub token_required: bool,
    pub cookie_rule: CookieRule,
    /// Traffic on these URL fragments re-evaluates the predicate
    pub recheck_on: Vec<String>,
    pub shape: BundleShape,
    pub login_prompt: String,
}

impl CapturePolicy {
    pub fn deepseek() -> Self {
        Self {
            name: "DeepSeek".to_string(),
            start_url: "https://chat.deepseek.com".to_string(),
            cookie_urls: vec![
                "https://chat.deepseek.com".to_string(),
                "https://deepseek.com".to_string(),
            ],
            token_sources: vec![
                TokenSource::RequestHeader {
                    url_contains: "/api/v0/".to_string(),
                    header: "authorization".to_string(),
                    prefix: Some("Bearer ".to_string()),
                },
                TokenSource::ResponseBody {
                    url_contains: "/api/v0/users/current".to_string(),
                    pointer: "/data/biz_data/token".to_string(),
                },
            ],
            token_required: true,
            cookie_rule: CookieRule::AnyMarker {
                markers: vec![
                    "d_id".to_string(),
                    "ds_session_id".to_string(),
                    "HWSID".to_string(),
                    "uuid".to_string(),
                ],
                more_than: Some(3),
            },
            recheck_on: Vec::new(),
            shape: BundleShape::Bearer,
            login_prompt: "Please login to DeepSeek in the opened browser window. \
                           The session token will be captured automatically once you are logged in."
                .to_string(),
        }
    }

    pub fn doubao() -> Self {
        Self {
            name: "Doubao".to_string(),
            start_url: "https://www.doubao.com/chat/".to_string(),
            cookie_urls: vec![
                "https://www.doubao.com".to_string(),
                "https://doubao.com".to_string(),
            ],
            token_sources: Vec::new(),
            token_required: false,
            cookie_rule: CookieRule::AnyNamed(vec!["sessionid".to_string()]),
            recheck_on: vec!["doubao.com".to_string()],
            shape: BundleShape::Session {
                session_cookie: "sessionid".to_string(),
                secondary_cookie: Some("ttwid".to_string()),
            },
            login_prompt: "Please login to Doubao in the opened browser window...".to_string(),
        }
    }

    pub fn grok() -> Self {
        Self {
            name: "Grok".to_string(),
            start_url: "https://grok.com".to_string(),
            cookie_urls: vec!["https://grok.com".to_string()],
            token_sources: Vec::new(),
            token_required: false,
            cookie_rule: CookieRule::AnyNamed(vec!["sso".to_string(), "sso-rw".to_string()]),
            recheck_on: vec!["grok.com/rest/".to_string()],
            shape: BundleShape::Cookie,
            login_prompt: "Please login to Grok in the opened browser window...".to_string(),
        }
    }

    /// Response URL fragments whose bodies the session must read
    pub fn body_patterns(&self) -> Vec<String> {
        self.token_sources
            .iter()
            .filter_map(|s| match s {
                TokenSource::ResponseBody { url_contains, .. } => Some(url_contains.clone()),
                TokenSource::RequestHeader { .. } => None,
            })
            .collect()
    }

    /// The single completion predicate. Every trigger goes through here.
    pub fn complete(
        &self,
        cookies: &[Cookie],
        token: Option<&str>,
        user_agent: &str,
    ) -> Option<CredentialBundle> {
        if self.token_required && token.is_none() {
            return None;
        }
        if !self.cookie_rule.is_satisfied(cookies) {
            return None;
        }

        let cookie = cookie_header(cookies);
        let find = |name: &str| {
            cookies
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.value.clone())
        };

        match &self.shape {
            BundleShape::Bearer => Some(CredentialBundle::Bearer {
                cookie,
                bearer: token?.to_string(),
                user_agent: user_agent.to_string(),
            }),
            BundleShape::Session {
                session_cookie,
                secondary_cookie,
            } => Some(CredentialBundle::Session {
                session_id: find(session_cookie.as_str())?,
                secondary_token: secondary_cookie.as_deref().and_then(find),
                user_agent: user_agent.to_string(),
                cookie: Some(cookie),
            }),
            BundleShape::Cookie => Some(CredentialBundle::Cookie {
                cookie,
                user_agent: user_agent.to_string(),
            }),
        }
    }
}
