use std::time::Duration;

use serde::Deserialize;

use crate::hal::{DeviceDesc, FeatureLevel};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Block on the fence after every present.
    #[default]
    Lockstep,
    /// Block only before reusing a ring slot the GPU may still own.
    FramesInFlight,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RendererConfig {
    /// Swap chain images, and therefore ring slots.
    pub frame_count: usize,
    pub sync_policy: SyncPolicy,
    pub present_interval: u32,
    pub clear_color: [f32; 4],
    /// `None` waits forever.
    pub fence_timeout_ms: Option<u64>,
    pub min_feature_level: FeatureLevel,
    pub debug_layer: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frame_count: 2,
            sync_policy: SyncPolicy::Lockstep,
            present_interval: 1,
            clear_color: [0.0, 0.2, 0.4, 1.0],
            fence_timeout_ms: None,
            min_feature_level: FeatureLevel::Level11_0,
            debug_layer: cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }

    pub fn device_desc(&self) -> DeviceDesc {
        DeviceDesc {
            min_feature_level: self.min_feature_level,
            debug_layer: self.debug_layer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: RendererConfig = toml::from_str("").unwrap();
        assert_eq!(config, RendererConfig::default());
        assert_eq!(config.fence_timeout(), None);
    }

    #[test]
    fn parses_every_field() {
        let config: RendererConfig = toml::from_str(
            r#"
            frame_count = 3
            sync_policy = "frames_in_flight"
            present_interval = 0
            clear_color = [1.0, 1.0, 1.0, 1.0]
            fence_timeout_ms = 250
            min_feature_level = "12_0"
            debug_layer = false
            "#,
        )
        .unwrap();
        assert_eq!(config.frame_count, 3);
        assert_eq!(config.sync_policy, SyncPolicy::FramesInFlight);
        assert_eq!(config.fence_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.device_desc().min_feature_level, FeatureLevel::Level12_0);
        assert!(!config.device_desc().debug_layer);
    }
}
