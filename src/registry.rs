use crate::provider::ProviderKind;
use crate::task::{DEFAULT_PROFILE, LITE_PROFILE};

/// Maps a caller-facing model id to the backend profile a provider expects
pub trait ModelRegistry: Send + Sync {
    fn profile_for(&self, provider: ProviderKind, model_id: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultModelRegistry;

impl ModelRegistry for DefaultModelRegistry {
    fn profile_for(&self, provider: ProviderKind, model_id: &str) -> String {
        match provider {
            ProviderKind::ManusApi if model_id.contains("lite") => LITE_PROFILE.to_string(),
            ProviderKind::ManusApi => DEFAULT_PROFILE.to_string(),
            _ => model_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_profiles() {
        let r = DefaultModelRegistry;
        assert_eq!(r.profile_for(ProviderKind::ManusApi, "manus-1.6-lite"), "manus-1.6-lite");
        assert_eq!(r.profile_for(ProviderKind::ManusApi, "manus-1.6"), "manus-1.6");
        assert_eq!(r.profile_for(ProviderKind::ManusApi, ""), "manus-1.6");
        assert_eq!(r.profile_for(ProviderKind::GrokWeb, "grok-3"), "grok-3");
    }
}
