//! Site descriptions for browser-driven chat backends.
//!
//! Everything that depends on a third-party page layout or endpoint shape
//! lives here as data, so a new site is a new `SiteProfile` value.

use crate::normalize::NdjsonDecoder;
use serde::{Deserialize, Serialize};

/// Ordered candidate selectors for DOM simulation. Every list is evaluated
/// top to bottom and the first qualifying element wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomSelectors {
    /// Text inputs; first visible match wins
    pub input: Vec<String>,
    /// Send controls; first enabled match wins
    pub send: Vec<String>,
    /// Reply containers; the last element of the first selector with enough text wins
    pub content: Vec<String>,
    /// Generic fallback scan when no content selector produced text
    pub scan: String,
    /// Presence of any of these means the reply is still being generated
    pub stop: Vec<String>,
    /// Scan hits containing this phrase are page chrome, not replies
    pub exclude_phrase: Option<String>,
    pub min_content_chars: usize,
    pub min_scan_chars: usize,
}

/// Direct in-page API call description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectApi {
    /// POST target; `{conversationId}` is substituted
    pub endpoint: String,
    /// Tried in order when no conversation id is known
    pub list_urls: Vec<String>,
    /// Path from a list response to the first conversation id
    pub list_id_path: Vec<String>,
    /// Static request body; `message` and `parentResponseId` are added per turn
    pub body: serde_json::Value,
    /// NDJSON pointers holding reply text
    pub text_pointers: Vec<String>,
    /// NDJSON pointers that mark a line as non-reply output when true
    pub skip_pointers: Vec<String>,
}

impl DirectApi {
    pub fn decoder(&self) -> NdjsonDecoder {
        NdjsonDecoder::new(self.text_pointers.clone()).skip_when_true(self.skip_pointers.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteProfile {
    pub name: String,
    pub home_url: String,
    /// Fragment identifying the site's pages among open tabs
    pub host: String,
    pub cookie_domain: String,
    /// Regex over the page path; group 1 is the conversation id
    pub conversation_pattern: String,
    pub direct: Option<DirectApi>,
    pub dom: DomSelectors,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl SiteProfile {
    pub fn grok() -> Self {
        Self {
            name: "Grok".to_string(),
            home_url: "https://grok.com".to_string(),
            host: "grok.com".to_string(),
            cookie_domain: ".grok.com".to_string(),
            conversation_pattern: r"/c/([a-f0-9-]{36})".to_string(),
            direct: Some(DirectApi {
                endpoint: "https://grok.com/rest/app-chat/conversations/{conversationId}/responses"
                    .to_string(),
                list_urls: strings(&[
                    "https://grok.com/rest/app-chat/conversations?limit=1",
                    "https://grok.com/rest/app-chat/conversations",
                ]),
                list_id_path: strings(&["conversations", "0", "conversationId"]),
                body: serde_json::json!({
                    "disableSearch": false,
                    "enableImageGeneration": true,
                    "imageAttachments": [],
                    "returnImageBytes": false,
                    "returnRawGrokInXaiRequest": false,
                    "fileAttachments": [],
                    "enableImageStreaming": true,
                    "imageGenerationCount": 2,
                    "forceConcise": false,
                    "toolOverrides": {},
                    "enableSideBySide": true,
                    "sendFinalMetadata": true,
                    "isReasoning": false,
                    "metadata": { "request_metadata": { "mode": "auto" } },
                    "disableTextFollowUps": false,
                    "disableArtifact": false,
                    "isFromGrokFiles": false,
                    "disableMemory": false,
                    "forceSideBySide": false,
                    "modelMode": "MODEL_MODE_AUTO",
                    "isAsyncChat": false,
                    "skipCancelCurrentInflightRequests": false,
                    "isRegenRequest": false,
                    "disableSelfHarmShortCircuit": false,
                    "deviceEnvInfo": {
                        "darkModeEnabled": false,
                        "devicePixelRatio": 1,
                        "screenWidth": 2560,
                        "screenHeight": 1440,
                        "viewportWidth": 1440,
                        "viewportHeight": 719
                    }
                }),
                text_pointers: strings(&[
                    "/result/response/token",
                    "/result/token",
                    "/contentDelta",
                ]),
                skip_pointers: strings(&["/result/response/isThinking", "/result/isThinking"]),
            }),
            dom: DomSelectors {
                input: strings(&[
                    r#"[contenteditable="true"]"#,
                    "textarea[placeholder]",
                    "textarea",
                    r#"div[role="textbox"]"#,
                    r#"div[contenteditable="true"]"#,
                ]),
                send: strings(&[
                    r#"button[aria-label*="Send"]"#,
                    r#"button[aria-label*="send"]"#,
                    r#"button[type="submit"]"#,
                    r#"button[data-testid*="send"]"#,
                    "form button[type=submit]",
                    "button:has(svg)",
                    ".send-button",
                    "[class*='send']",
                ]),
                content: strings(&[
                    r#"[data-role="assistant"]"#,
                    r#"[class*="assistant"]"#,
                    r#"[class*="response"]"#,
                    r#"[class*="message"]"#,
                    "article",
                    "[class*='markdown']",
                    ".prose",
                ]),
                scan: "p, div[class]".to_string(),
                stop: strings(&[r#"[aria-label*="Stop"]"#, r#"[aria-label*="stop"]"#]),
                exclude_phrase: Some("Ask Grok".to_string()),
                min_content_chars: 10,
                min_scan_chars: 20,
            },
        }
    }

    /// Conversation id embedded in a page URL, if any
    pub fn conversation_from_url(&self, url: &str) -> Option<String> {
        let re = regex::Regex::new(&self.conversation_pattern)
            .map_err(|e| log::warn!("[{}] Bad conversation pattern: {}", self.name, e))
            .ok()?;
        re.captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_from_url() {
        let site = SiteProfile::grok();
        let id = "0b6f2c1e-1c2d-4e5f-8a9b-0c1d2e3f4a5b";
        assert_eq!(
            site.conversation_from_url(&format!("https://grok.com/c/{}?rid=1", id)),
            Some(id.to_string())
        );
        assert_eq!(site.conversation_from_url("https://grok.com/"), None);
    }

    #[test]
    fn test_profile_is_configuration() {
        let site = SiteProfile::grok();
        let json = serde_json::to_string(&site).unwrap();
        let back: SiteProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, site);
        assert_eq!(back.dom.input.first().map(String::as_str), Some(r#"[contenteditable="true"]"#));
    }
}
