use serde::{Deserialize, Serialize};

/// Default base topic of `zigbee2mqtt`.
pub const DEFAULT_Z2M_BASE: &str = "zigbee2mqtt";

/// Default base topic of the canonical tree.
pub const DEFAULT_CANONICAL_BASE: &str = "canonical";

/// Base topics of the supported protocols.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Base topic of `zigbee2mqtt` devices.
    pub z2m_base: String,
    /// Base topic prepended to the Tasmota topics, if any.
    pub tasmota_base: Option<String>,
    /// Base topic of the canonical tree.
    pub canonical_base: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            z2m_base: DEFAULT_Z2M_BASE.into(),
            tasmota_base: None,
            canonical_base: DEFAULT_CANONICAL_BASE.into(),
        }
    }
}

impl TopicConfig {
    /// Sets the `zigbee2mqtt` base topic.
    #[must_use]
    pub fn z2m_base(mut self, base: impl Into<String>) -> Self {
        self.z2m_base = base.into();
        self
    }

    /// Sets the Tasmota base topic.
    #[must_use]
    pub fn tasmota_base(mut self, base: impl Into<String>) -> Self {
        self.tasmota_base = Some(base.into());
        self
    }

    /// Sets the canonical base topic.
    #[must_use]
    pub fn canonical_base(mut self, base: impl Into<String>) -> Self {
        self.canonical_base = base.into();
        self
    }
}
