//! Channel / model data model.
//!
//! `Channel` and `RouterModel` are loaded from configuration and treated
//! as immutable snapshots once loaded. `ChannelModelEntry` sets are
//! derived once at load time: a deterministic, precomputed view over raw
//! config rather than something recomputed per request.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

pub type ChannelId = u64;
pub type ModelId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPolicy {
    Require,
    Forbid,
    Unlimited,
    #[serde(other)]
    Unset,
}

impl Default for StreamPolicy {
    fn default() -> Self {
        StreamPolicy::Unset
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelPolicies {
    #[serde(default)]
    pub stream: StreamPolicy,
    #[serde(default)]
    pub supports_google_native_tools: bool,
    #[serde(default)]
    pub supports_anthropic_native_tools: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransformOptions {
    #[serde(default)]
    pub force_array_instructions: bool,
    #[serde(default)]
    pub force_array_inputs: bool,
    #[serde(default)]
    pub developer_role_to_system: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Raw persisted override-operations for the request body; see
    /// `overrides::parse_body_overrides`.
    #[serde(default)]
    pub override_request_body: serde_json::Value,
    #[serde(default)]
    pub override_request_headers: serde_json::Value,
    #[serde(default)]
    pub transform_options: TransformOptions,
    #[serde(default)]
    pub policies: ChannelPolicies,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenAi,
    Anthropic,
    Google,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub from: String,
    pub to: String,
}

/// A persistent configuration describing one backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mappings: Vec<ModelMapping>,
    #[serde(default)]
    pub extra_prefix: Option<String>,
    #[serde(default)]
    pub auto_trim_prefix: Option<String>,
    /// Ordering weight, 0-100.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: ChannelSettings,
    /// Maximum concurrent in-flight requests this channel accepts; 0 means
    /// unlimited (see `ConnectionAware`).
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub updated_at: i64,
}

fn default_weight() -> u32 {
    50
}

/// Where a `ChannelModelEntry`'s `actual_model` came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Direct,
    Prefix,
    AutoTrim,
    Mapping,
}

/// A resolved `(request_model, actual_model, source)` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelModelEntry {
    pub request_model: String,
    pub actual_model: String,
    pub source: EntrySource,
}

impl Channel {
    /// Deterministically derive the full unified-model-entry set for this
    /// channel from its supported models and mapping rules. Keyed by
    /// `request_model`, unique within the channel (mappings and prefix
    /// rules can only add request_model keys that don't collide with a
    /// direct entry; direct entries always win).
    pub fn unified_model_entries(&self) -> HashMap<String, ChannelModelEntry> {
        let mut out: HashMap<String, ChannelModelEntry> = HashMap::new();

        for model in &self.models {
            out.entry(model.clone()).or_insert(ChannelModelEntry {
                request_model: model.clone(),
                actual_model: model.clone(),
                source: EntrySource::Direct,
            });

            if let Some(prefix) = &self.extra_prefix {
                let request_model = format!("{prefix}{model}");
                out.entry(request_model.clone()).or_insert(ChannelModelEntry {
                    request_model,
                    actual_model: model.clone(),
                    source: EntrySource::Prefix,
                });
            }

            if let Some(trim) = &self.auto_trim_prefix {
                if let Some(stripped) = model.strip_prefix(trim.as_str()) {
                    out.entry(stripped.to_string()).or_insert(ChannelModelEntry {
                        request_model: stripped.to_string(),
                        actual_model: model.clone(),
                        source: EntrySource::AutoTrim,
                    });
                }
            }
        }

        for mapping in &self.model_mappings {
            out.entry(mapping.from.clone()).or_insert(ChannelModelEntry {
                request_model: mapping.from.clone(),
                actual_model: mapping.to.clone(),
                source: EntrySource::Mapping,
            });
        }

        out
    }

    pub fn lookup_entry(&self, request_model: &str) -> Option<ChannelModelEntry> {
        self.unified_model_entries().get(request_model).cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Association {
    ChannelModel { priority: i32, channel_id: ChannelId, model_id: String },
    ChannelRegex { priority: i32, channel_id: ChannelId, pattern: String },
    Regex { priority: i32, pattern: String },
    Model { priority: i32, model_id: String },
}

impl Association {
    pub fn priority(&self) -> i32 {
        match self {
            Association::ChannelModel { priority, .. }
            | Association::ChannelRegex { priority, .. }
            | Association::Regex { priority, .. }
            | Association::Model { priority, .. } => *priority,
        }
    }
}

/// A virtual model with a stable id and ordered associations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterModel {
    pub model_id: ModelId,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub associations: Vec<Association>,
    #[serde(default)]
    pub updated_at: i64,
}

/// Elementary selector output unit: one channel, a priority, and the
/// ordered list of models to try on it.
#[derive(Debug, Clone)]
pub struct ChannelModelsCandidate {
    pub channel: std::sync::Arc<Channel>,
    pub priority: i32,
    pub models: Vec<ChannelModelEntry>,
}

impl ChannelModelsCandidate {
    pub fn dedup_by_actual_model(models: Vec<ChannelModelEntry>) -> Vec<ChannelModelEntry> {
        let mut seen = HashSet::new();
        models
            .into_iter()
            .filter(|e| seen.insert(e.actual_model.clone()))
            .collect()
    }
}

pub fn compile_regex(pattern: &str) -> Option<Regex> {
    Regex::new(pattern).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> Channel {
        Channel {
            id: 1,
            name: "test".into(),
            channel_type: ChannelType::OpenAi,
            base_url: "https://api.example.com".into(),
            api_key: "sk-test".into(),
            models: vec!["gpt-4".into()],
            model_mappings: vec![ModelMapping {
                from: "gpt-4-alias".into(),
                to: "gpt-4".into(),
            }],
            extra_prefix: Some("vendor/".into()),
            auto_trim_prefix: Some("vendor/".into()),
            weight: 100,
            tags: HashSet::new(),
            enabled: true,
            settings: ChannelSettings::default(),
            max_connections: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn direct_entry_present() {
        let entries = test_channel().unified_model_entries();
        let e = entries.get("gpt-4").unwrap();
        assert_eq!(e.actual_model, "gpt-4");
        assert_eq!(e.source, EntrySource::Direct);
    }

    #[test]
    fn mapping_entry_present_without_colliding_with_direct() {
        let entries = test_channel().unified_model_entries();
        let e = entries.get("gpt-4-alias").unwrap();
        assert_eq!(e.actual_model, "gpt-4");
        assert_eq!(e.source, EntrySource::Mapping);
    }

    #[test]
    fn direct_entry_wins_over_prefix_collision() {
        let mut ch = test_channel();
        ch.models.push("vendor/gpt-4".into());
        let entries = ch.unified_model_entries();
        // "vendor/gpt-4" is both a direct model and the prefixed form of "gpt-4";
        // direct insertion happens first in iteration order for that model so it
        // is not overwritten by the prefix rule (or_insert is a no-op on collision).
        let e = entries.get("vendor/gpt-4").unwrap();
        assert_eq!(e.source, EntrySource::Direct);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let entries = vec![
            ChannelModelEntry {
                request_model: "a".into(),
                actual_model: "gpt-4".into(),
                source: EntrySource::Direct,
            },
            ChannelModelEntry {
                request_model: "b".into(),
                actual_model: "gpt-4".into(),
                source: EntrySource::Mapping,
            },
        ];
        let deduped = ChannelModelsCandidate::dedup_by_actual_model(entries);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].request_model, "a");
    }
}
