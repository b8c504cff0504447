//! Model-access policy: per-API-key profile allowlists and request-model
//! aliasing, applied between the inbound transformer and candidate
//! selection (spec.md 3's "model mapper" field, §7's `InvalidModel` row
//! for "model not allowed by profile").

use crate::error::{RouterError, RouterResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One API key's access profile: an optional model allowlist plus a set of
/// per-key model aliases (e.g. `"fast"` resolving to `"gpt-4o-mini"`).
/// `allowed_models: None` means the key has no restriction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessProfile {
    #[serde(default)]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
}

/// Rejects `model` when `profile` names an explicit allowlist that doesn't
/// include it. No profile, or a profile with no allowlist, permits anything.
pub fn check_model_access(profile: Option<&AccessProfile>, model: &str) -> RouterResult<()> {
    let Some(allowed) = profile.and_then(|p| p.allowed_models.as_ref()) else {
        return Ok(());
    };
    if allowed.iter().any(|m| m == model) {
        Ok(())
    } else {
        Err(RouterError::InvalidModel(model.to_string()))
    }
}

/// Per-API-key profile registry, shared across requests and threaded
/// through `PersistenceState` as the request's model mapper.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyModelMapper {
    profiles: HashMap<String, AccessProfile>,
}

impl ApiKeyModelMapper {
    pub fn new(profiles: HashMap<String, AccessProfile>) -> Self {
        Self { profiles }
    }

    pub fn profile_for(&self, api_key: Option<&str>) -> Option<&AccessProfile> {
        api_key.and_then(|k| self.profiles.get(k))
    }

    /// Resolves `requested_model` through the key's alias table, or hands
    /// it back unchanged if the key has no matching alias.
    pub fn resolve_model<'a>(&'a self, api_key: Option<&str>, requested_model: &'a str) -> &'a str {
        self.profile_for(api_key)
            .and_then(|p| p.model_aliases.get(requested_model))
            .map(String::as_str)
            .unwrap_or(requested_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowlist(models: &[&str]) -> AccessProfile {
        AccessProfile {
            allowed_models: Some(models.iter().map(|s| s.to_string()).collect()),
            model_aliases: HashMap::new(),
        }
    }

    #[test]
    fn no_profile_allows_any_model() {
        assert!(check_model_access(None, "gpt-4").is_ok());
    }

    #[test]
    fn profile_without_allowlist_allows_any_model() {
        assert!(check_model_access(Some(&AccessProfile::default()), "gpt-4").is_ok());
    }

    #[test]
    fn profile_rejects_model_outside_allowlist() {
        let profile = allowlist(&["gpt-4"]);
        let err = check_model_access(Some(&profile), "gpt-5").unwrap_err();
        assert!(matches!(err, RouterError::InvalidModel(_)));
    }

    #[test]
    fn profile_allows_model_inside_allowlist() {
        let profile = allowlist(&["gpt-4", "gpt-5"]);
        assert!(check_model_access(Some(&profile), "gpt-5").is_ok());
    }

    #[test]
    fn mapper_resolves_alias_for_known_key() {
        let mut aliases = HashMap::new();
        aliases.insert("fast".to_string(), "gpt-4o-mini".to_string());
        let mut profiles = HashMap::new();
        profiles.insert(
            "key-1".to_string(),
            AccessProfile {
                allowed_models: None,
                model_aliases: aliases,
            },
        );
        let mapper = ApiKeyModelMapper::new(profiles);
        assert_eq!(mapper.resolve_model(Some("key-1"), "fast"), "gpt-4o-mini");
    }

    #[test]
    fn mapper_passes_through_unmapped_or_keyless_requests() {
        let mapper = ApiKeyModelMapper::default();
        assert_eq!(mapper.resolve_model(Some("key-1"), "gpt-4"), "gpt-4");
        assert_eq!(mapper.resolve_model(None, "gpt-4"), "gpt-4");
    }
}
