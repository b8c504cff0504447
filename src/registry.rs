//! Channel/model registry: owns enabled-channel and model state, read by
//! strategies and selectors, and expected to provide a stable snapshot
//! per call. This in-process implementation loads its contents once from
//! `Config` at startup (see `config::Config::build_registry`) — swapping
//! in a database-backed registry later only means implementing the same
//! `ChannelRegistry` surface.

use crate::model::{Channel, ChannelId, ModelId, RouterModel};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<ChannelId, Arc<Channel>>,
    models: HashMap<ModelId, Arc<RouterModel>>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Channel>, models: Vec<RouterModel>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id, Arc::new(c))).collect(),
            models: models.into_iter().map(|m| (m.model_id.clone(), Arc::new(m))).collect(),
        }
    }

    pub fn enabled_channels(&self) -> Vec<Arc<Channel>> {
        self.channels.values().filter(|c| c.enabled).cloned().collect()
    }

    pub fn get_channel(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    /// Bypasses enablement, used only by the explicit test-only selector.
    pub fn get_channel_any(&self, id: ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(&id).cloned()
    }

    pub fn get_model(&self, model_id: &str) -> Option<Arc<RouterModel>> {
        self.models.get(model_id).filter(|m| m.enabled).cloned()
    }

    /// Stable snapshot used by the association cache's invalidation check:
    /// count of enabled channels plus the most recent `updated_at` among
    /// them.
    pub fn enabled_channel_fingerprint(&self) -> (usize, i64) {
        let enabled = self.enabled_channels();
        let latest = enabled.iter().map(|c| c.updated_at).max().unwrap_or(0);
        (enabled.len(), latest)
    }

    pub fn model_updated_at(&self, model_id: &str) -> i64 {
        self.models.get(model_id).map(|m| m.updated_at).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Association, ChannelSettings, ChannelType};
    use std::collections::HashSet;

    fn channel(id: ChannelId, enabled: bool) -> Channel {
        Channel {
            id,
            name: format!("ch{id}"),
            channel_type: ChannelType::OpenAi,
            base_url: "https://example.com".into(),
            api_key: "sk".into(),
            models: vec!["gpt-4".into()],
            model_mappings: vec![],
            extra_prefix: None,
            auto_trim_prefix: None,
            weight: 50,
            tags: HashSet::new(),
            enabled,
            settings: ChannelSettings::default(),
            max_connections: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn enabled_channels_excludes_disabled() {
        let reg = ChannelRegistry::new(vec![channel(1, true), channel(2, false)], vec![]);
        let ids: Vec<_> = reg.enabled_channels().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn disabled_model_is_not_returned() {
        let reg = ChannelRegistry::new(
            vec![],
            vec![RouterModel {
                model_id: "virtual".into(),
                enabled: false,
                associations: vec![Association::Model {
                    priority: 0,
                    model_id: "gpt-4".into(),
                }],
                updated_at: 0,
            }],
        );
        assert!(reg.get_model("virtual").is_none());
    }
}
