use hashbrown::HashMap;

use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::codec::{Bindings, Codec, DeviceIdentity, Model, Protocol, Slot, tasmota, z2m};
use crate::config::TopicConfig;
use crate::error::{Error, ErrorKind, Result};

type Constructor =
    Box<dyn Fn(DeviceIdentity, &TopicConfig, Bindings) -> Box<dyn Codec> + Send + Sync>;

struct Entry {
    slots: Vec<Slot>,
    constructor: Constructor,
}

/// A physical device as reported by a discovery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Protocol.
    pub protocol: Protocol,
    /// Model.
    pub model: Model,
    /// Name of the device on its protocol.
    pub device_name: String,
    /// Network address, if any.
    pub address: Option<String>,
}

/// Creates codecs by protocol and model.
///
/// The registry is filled once at start-up.
pub struct CodecRegistry {
    topics: TopicConfig,
    entries: HashMap<(Protocol, Model), Entry>,
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("topics", &self.topics)
            .field("models", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodecRegistry {
    /// Creates an empty [`CodecRegistry`].
    #[must_use]
    pub fn new(topics: TopicConfig) -> Self {
        Self {
            topics,
            entries: HashMap::new(),
        }
    }

    /// Creates a [`CodecRegistry`] with every `zigbee2mqtt` and Tasmota
    /// codec of this crate.
    #[must_use]
    pub fn with_builtin_codecs(topics: TopicConfig) -> Self {
        tasmota::register(z2m::register(Self::new(topics)))
    }

    /// Registers a codec constructor for `protocol` and `model`.
    ///
    /// `slots` are the bindings the codec requires. They are checked before
    /// the constructor runs.
    #[must_use]
    pub fn register<F>(
        mut self,
        protocol: Protocol,
        model: Model,
        slots: Vec<Slot>,
        constructor: F,
    ) -> Self
    where
        F: Fn(DeviceIdentity, &TopicConfig, Bindings) -> Box<dyn Codec> + Send + Sync + 'static,
    {
        let entry = Entry {
            slots,
            constructor: Box::new(constructor),
        };
        if self.entries.insert((protocol, model.clone()), entry).is_some() {
            debug!("Codec for {protocol} `{model}` replaced");
        }
        self
    }

    /// Returns the topic configuration.
    #[must_use]
    pub const fn topics(&self) -> &TopicConfig {
        &self.topics
    }

    /// Whether a codec is registered for `protocol` and `model`.
    #[must_use]
    pub fn contains(&self, protocol: Protocol, model: &Model) -> bool {
        self.entries.contains_key(&(protocol, model.clone()))
    }

    /// Returns the slots required by the codec of `protocol` and `model`.
    #[must_use]
    pub fn slots(&self, protocol: Protocol, model: &Model) -> Option<&[Slot]> {
        self.entries
            .get(&(protocol, model.clone()))
            .map(|entry| entry.slots.as_slice())
    }

    /// Creates the codec of `device_name`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::UnknownModel`] when no codec is registered
    /// for `protocol` and `model`, and with [`ErrorKind::BindingMismatch`]
    /// when `bindings` are missing, extra, or of the wrong kind.
    pub fn create(
        &self,
        protocol: Protocol,
        model: Model,
        device_name: impl Into<String>,
        bindings: Bindings,
    ) -> Result<Box<dyn Codec>> {
        let key = (protocol, model);
        let Some(entry) = self.entries.get(&key) else {
            return Err(Error::new(
                ErrorKind::UnknownModel,
                format!("No codec for {} model `{}`", key.0, key.1),
            ));
        };
        bindings.check(&entry.slots)?;

        let (protocol, model) = key;
        let identity = DeviceIdentity::new(protocol, model, device_name);
        debug!("Creating the codec of {identity}");
        Ok((entry.constructor)(identity, &self.topics, bindings))
    }

    /// Creates the codec of a discovered device.
    ///
    /// # Errors
    ///
    /// Same as [`CodecRegistry::create`].
    pub fn create_from_descriptor(
        &self,
        descriptor: &DeviceDescriptor,
        bindings: Bindings,
    ) -> Result<Box<dyn Codec>> {
        self.create(
            descriptor.protocol,
            descriptor.model.clone(),
            descriptor.device_name.clone(),
            bindings,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::codec::{Bindings, Model, Protocol, Slot};
    use crate::config::TopicConfig;
    use crate::device::VirtualDevice;
    use crate::error::ErrorKind;
    use crate::value::DeviceKind;

    use super::{CodecRegistry, DeviceDescriptor};

    #[test]
    fn builtin_models() {
        let registry = CodecRegistry::with_builtin_codecs(TopicConfig::default());

        for model in [
            Model::ZbminiL,
            Model::Ts0002,
            Model::NasAb02b2,
            Model::Ts0601Soil,
            Model::Snzb02,
            Model::Snzb01,
            Model::Snzb03,
        ] {
            assert!(registry.contains(Protocol::Zigbee2Mqtt, &model));
            assert!(!registry.contains(Protocol::Tasmota, &model));
        }
        assert!(registry.contains(Protocol::Tasmota, &Model::ShellyPlugS));
        assert!(registry.contains(Protocol::Tasmota, &Model::ShellyUni));
        assert_eq!(
            registry.slots(Protocol::Zigbee2Mqtt, &Model::Ts0002),
            Some([Slot::Switch0, Slot::Switch1].as_slice())
        );
    }

    #[test]
    fn unknown_model() {
        let registry = CodecRegistry::with_builtin_codecs(TopicConfig::default());
        let error = registry
            .create(
                Protocol::Zigbee2Mqtt,
                Model::Unknown("WXKG11LM".into()),
                "remote",
                Bindings::new(),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnknownModel);

        let error = registry
            .create(Protocol::Tasmota, Model::Snzb02, "sensor", Bindings::new())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnknownModel);
    }

    #[test]
    fn binding_mismatch() {
        let registry = CodecRegistry::with_builtin_codecs(TopicConfig::default());
        let temperature = Arc::new(VirtualDevice::new(DeviceKind::Temperature, "garden"));

        let error = registry
            .create(
                Protocol::Zigbee2Mqtt,
                Model::Snzb02,
                "sensor",
                Bindings::new().with(Slot::Temperature, &temperature),
            )
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::BindingMismatch);
    }

    #[test]
    fn switch_bindings() {
        let registry = CodecRegistry::with_builtin_codecs(TopicConfig::default());
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let motion = Arc::new(VirtualDevice::new(DeviceKind::Motion, "hall"));
        let temperature = Arc::new(VirtualDevice::new(DeviceKind::Temperature, "hall"));

        for bindings in [
            Bindings::new(),
            Bindings::new()
                .with(Slot::Switch, &lamp)
                .with(Slot::Temperature, &temperature),
            Bindings::new().with(Slot::Switch, &motion),
        ] {
            let error = registry
                .create(Protocol::Zigbee2Mqtt, Model::ZbminiL, "lamp", bindings)
                .unwrap_err();
            assert_eq!(error.kind(), ErrorKind::BindingMismatch);
        }
        assert!(!lamp.is_bound());

        let codec = registry
            .create(
                Protocol::Zigbee2Mqtt,
                Model::ZbminiL,
                "lamp",
                Bindings::new().with(Slot::Switch, &lamp),
            )
            .unwrap();
        assert_eq!(codec.identity().model, Model::ZbminiL);
    }

    #[test]
    fn from_descriptor() {
        let registry = CodecRegistry::with_builtin_codecs(TopicConfig::default());
        let motion = Arc::new(VirtualDevice::new(DeviceKind::Motion, "hall"));
        let descriptor: DeviceDescriptor = serde_json::from_str(
            r#"{"protocol":"Zigbee2MQTT","model":"SNZB-03","device_name":"hall_motion","address":"0x00124b0022ebac5e"}"#,
        )
        .unwrap();

        let codec = registry
            .create_from_descriptor(&descriptor, Bindings::new().with(Slot::Motion, &motion))
            .unwrap();
        assert_eq!(codec.identity().model, Model::Snzb03);
        assert_eq!(codec.identity().device_name, "hall_motion");
        assert_eq!(codec.availability_topic(), "zigbee2mqtt/hall_motion/availability");
    }
}
