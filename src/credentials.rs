//! Captured credentials and the storage seam they are handed to.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Provider-specific credential set. Immutable once captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CredentialBundle {
    /// Cookie jar plus a bearer token the chat API insists on
    Bearer {
        cookie: String,
        bearer: String,
        user_agent: String,
    },
    /// Named session cookie, optionally with a secondary token cookie
    Session {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secondary_token: Option<String>,
        user_agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cookie: Option<String>,
    },
    /// Cookie jar alone
    Cookie { cookie: String, user_agent: String },
    /// Key for an official API
    ApiKey { api_key: String },
}

impl CredentialBundle {
    pub fn cookie(&self) -> Option<&str> {
        match self {
            CredentialBundle::Bearer { cookie, .. } | CredentialBundle::Cookie { cookie, .. } => {
                Some(cookie)
            }
            CredentialBundle::Session { cookie, .. } => cookie.as_deref(),
            CredentialBundle::ApiKey { .. } => None,
        }
    }
}

/// Persists a bundle once it has been captured
pub trait CredentialStore: Send + Sync {
    fn save(&self, provider: &str, bundle: &CredentialBundle) -> Result<()>;

    fn load(&self, provider: &str) -> Result<Option<CredentialBundle>>;
}

/// JSON file keyed by provider id
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/provider-bridge/credentials.json`
    pub fn default_location() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| BridgeError::Storage("Cannot determine config directory".to_string()))?
            .join("provider-bridge");
        Ok(Self::new(dir.join("credentials.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, CredentialBundle>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            BridgeError::Storage(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| BridgeError::Storage(format!("Invalid credentials file: {}", e)))
    }
}

impl CredentialStore for JsonFileStore {
    fn save(&self, provider: &str, bundle: &CredentialBundle) -> Result<()> {
        let mut all = self.read_all()?;
        all.insert(provider.to_string(), bundle.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BridgeError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        let json = serde_json::to_string_pretty(&all)
            .map_err(|e| BridgeError::Storage(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| {
            BridgeError::Storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        log::info!("Saved {} credentials to {}", provider, self.path.display());
        Ok(())
    }

    fn load(&self, provider: &str) -> Result<Option<CredentialBundle>> {
        Ok(self.read_all()?.remove(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_serialization_tagged() {
        let bundle = CredentialBundle::Bearer {
            cookie: "d_id=x".to_string(),
            bearer: "T1".to_string(),
            user_agent: "UA".to_string(),
        };
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["kind"], "bearer");
        assert_eq!(json["bearer"], "T1");
    }

    #[test]
    fn test_store_roundtrip_keeps_other_providers() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested/credentials.json"));

        let grok = CredentialBundle::Cookie {
            cookie: "sso=1".to_string(),
            user_agent: "UA".to_string(),
        };
        let manus = CredentialBundle::ApiKey {
            api_key: "k".to_string(),
        };
        store.save("grok-web", &grok).unwrap();
        store.save("manus-api", &manus).unwrap();

        assert_eq!(store.load("grok-web").unwrap(), Some(grok));
        assert_eq!(store.load("manus-api").unwrap(), Some(manus));
        assert_eq!(store.load("doubao-web").unwrap(), None);
    }

    #[test]
    fn test_accessors() {
        let bundle = CredentialBundle::Session {
            session_id: "s".to_string(),
            secondary_token: None,
            user_agent: "UA".to_string(),
            cookie: None,
        };
        assert_eq!(bundle.cookie(), None);
    }
}
