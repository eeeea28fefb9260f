//! Codecs translating vendor payloads into canonical updates and back.
//!
//! A codec is bound to the virtual devices its model requires. Each
//! binding fills a [`Slot`] and the bound device must have the
//! [`DeviceKind`] the slot requires.

/// `zigbee2mqtt` codecs.
pub mod z2m;

/// Tasmota codecs.
pub mod tasmota;

use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::device::VirtualDevice;
use crate::error::{Error, Result};
use crate::value::{Availability, DeviceKind, Property, Value};

/// A device protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// `zigbee2mqtt`.
    #[serde(rename = "Zigbee2MQTT")]
    Zigbee2Mqtt,
    /// Tasmota.
    Tasmota,
}

impl Protocol {
    /// Returns the protocol label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Zigbee2Mqtt => "Zigbee2MQTT",
            Self::Tasmota => "Tasmota",
        }
    }

    /// Parses a protocol from its label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "Zigbee2MQTT" => Some(Self::Zigbee2Mqtt),
            "Tasmota" => Some(Self::Tasmota),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.label().fmt(f)
    }
}

/// A device model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Model {
    /// Sonoff ZBMINI-L switch.
    ZbminiL,
    /// Tuya TS0002 dual switch.
    Ts0002,
    /// Neo NAS-AB02B2 siren.
    NasAb02b2,
    /// Tuya TS0601 soil sensor.
    Ts0601Soil,
    /// Sonoff SNZB-02 temperature and humidity sensor.
    Snzb02,
    /// Sonoff SNZB-01 button.
    Snzb01,
    /// Sonoff SNZB-03 motion sensor.
    Snzb03,
    /// Shelly Plug S running Tasmota.
    ShellyPlugS,
    /// Shelly Uni running Tasmota.
    ShellyUni,
    /// A model with no codec, carrying its vendor label.
    Unknown(String),
}

impl Model {
    /// Returns the vendor label of the model.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::ZbminiL => "ZBMINI-L",
            Self::Ts0002 => "TS0002",
            Self::NasAb02b2 => "NAS-AB02B2",
            Self::Ts0601Soil => "TS0601_soil",
            Self::Snzb02 => "SNZB-02",
            Self::Snzb01 => "SNZB-01",
            Self::Snzb03 => "SNZB-03",
            Self::ShellyPlugS => "Shelly Plug S",
            Self::ShellyUni => "Shelly Uni",
            Self::Unknown(label) => label.as_str(),
        }
    }

    /// Parses a model from its vendor label.
    ///
    /// Unrecognised labels give [`Model::Unknown`].
    #[must_use]
    pub fn from_label(label: &str) -> Self {
        match label {
            "ZBMINI-L" => Self::ZbminiL,
            "TS0002" => Self::Ts0002,
            "NAS-AB02B2" => Self::NasAb02b2,
            "TS0601_soil" => Self::Ts0601Soil,
            "SNZB-02" => Self::Snzb02,
            "SNZB-01" => Self::Snzb01,
            "SNZB-03" => Self::Snzb03,
            "Shelly Plug S" => Self::ShellyPlugS,
            "Shelly Uni" => Self::ShellyUni,
            label => Self::Unknown(label.into()),
        }
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.label().fmt(f)
    }
}

impl Serialize for Model {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Model {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let label = String::deserialize(deserializer)?;
        Ok(Self::from_label(&label))
    }
}

/// The identity of a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Protocol.
    pub protocol: Protocol,
    /// Model.
    pub model: Model,
    /// Name of the device on its protocol.
    pub device_name: String,
}

impl DeviceIdentity {
    /// Creates a [`DeviceIdentity`].
    pub fn new(protocol: Protocol, model: Model, device_name: impl Into<String>) -> Self {
        Self {
            protocol,
            model,
            device_name: device_name.into(),
        }
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} {})", self.device_name, self.protocol, self.model)
    }
}

/// A binding slot of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Single-channel switch.
    Switch,
    /// First channel of a dual switch.
    Switch0,
    /// Second channel of a dual switch.
    Switch1,
    /// Temperature sensor.
    Temperature,
    /// Humidity sensor.
    Humidity,
    /// Button.
    Button,
    /// Motion sensor.
    Motion,
    /// Siren.
    Alarm,
    /// Analog-to-digital converter.
    Adc,
}

impl Slot {
    /// Returns the slot name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Switch => "v_switch",
            Self::Switch0 => "v_switch0",
            Self::Switch1 => "v_switch1",
            Self::Temperature => "v_temp",
            Self::Humidity => "v_humi",
            Self::Button => "v_button",
            Self::Motion => "v_motion",
            Self::Alarm => "v_alarm",
            Self::Adc => "v_adc",
        }
    }

    /// Returns the [`DeviceKind`] a device bound to the slot must have.
    #[must_use]
    pub const fn kind(self) -> DeviceKind {
        match self {
            Self::Switch => DeviceKind::Switch,
            Self::Switch0 => DeviceKind::Switch0,
            Self::Switch1 => DeviceKind::Switch1,
            Self::Temperature => DeviceKind::Temperature,
            Self::Humidity => DeviceKind::Humidity,
            Self::Button => DeviceKind::Button,
            Self::Motion => DeviceKind::Motion,
            Self::Alarm => DeviceKind::Alarm,
            Self::Adc => DeviceKind::Adc,
        }
    }

    /// Returns the property carried by the slot.
    #[must_use]
    pub const fn property(self) -> Property {
        self.kind().property()
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name().fmt(f)
    }
}

/// The virtual devices bound to a codec, by slot.
#[derive(Debug, Clone, Default)]
pub struct Bindings(IndexMap<Slot, Arc<VirtualDevice>>);

impl Bindings {
    /// Creates empty [`Bindings`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `device` to `slot`.
    #[must_use]
    pub fn with(mut self, slot: Slot, device: &Arc<VirtualDevice>) -> Self {
        let _ = self.insert(slot, device);
        self
    }

    /// Binds `device` to `slot`, returning the device previously bound.
    pub fn insert(
        &mut self,
        slot: Slot,
        device: &Arc<VirtualDevice>,
    ) -> Option<Arc<VirtualDevice>> {
        self.0.insert(slot, device.clone())
    }

    /// Returns the device bound to `slot`.
    #[must_use]
    pub fn get(&self, slot: Slot) -> Option<&Arc<VirtualDevice>> {
        self.0.get(&slot)
    }

    /// Returns the device owning `property`.
    #[must_use]
    pub fn device_for(&self, property: Property) -> Option<&Arc<VirtualDevice>> {
        self.0
            .iter()
            .find(|(slot, _)| slot.property() == property)
            .map(|(_, device)| device)
    }

    /// Returns the bound devices in binding order.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<VirtualDevice>> {
        self.0.values()
    }

    /// Returns the bound slots in binding order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.0.keys().copied()
    }

    /// Returns the number of bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there is no binding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Checks that exactly the `required` slots are bound, each to a device
    // of the kind the slot requires.
    pub(crate) fn check(&self, required: &[Slot]) -> Result<()> {
        if let Some(slot) = required.iter().find(|slot| !self.0.contains_key(*slot)) {
            return Err(Error::binding(format!("Missing binding `{slot}`")));
        }

        for (slot, device) in &self.0 {
            if !required.contains(slot) {
                return Err(Error::binding(format!("Unexpected binding `{slot}`")));
            }
            if device.kind() != slot.kind() {
                return Err(Error::binding(format!(
                    "`{slot}` requires a {:?} device, got {device}",
                    slot.kind()
                )));
            }
        }
        Ok(())
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Topic.
    pub topic: String,
    /// Payload.
    pub payload: String,
    /// Whether the broker retains the message.
    pub retain: bool,
}

impl Command {
    pub(crate) fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }
}

/// A property update decoded from a payload.
pub type PropertyUpdate = (Property, Value);

/// Translates the payloads of one physical device.
pub trait Codec: std::fmt::Debug + Send + Sync {
    /// Returns the identity of the device.
    fn identity(&self) -> &DeviceIdentity;

    /// Returns the bound virtual devices.
    fn bindings(&self) -> &Bindings;

    /// Returns the availability topic.
    fn availability_topic(&self) -> &str;

    /// Returns the topics carrying values.
    fn value_topics(&self) -> Vec<String>;

    /// Returns the availability topic and every value topic.
    fn topics_for_device(&self) -> IndexSet<String> {
        let mut topics = IndexSet::new();
        let _ = topics.insert(self.availability_topic().to_owned());
        topics.extend(self.value_topics());
        topics
    }

    /// Decodes an availability payload.
    ///
    /// Unrecognised payloads give [`Availability::Unknown`].
    fn decode_availability(&self, payload: &[u8]) -> Availability;

    /// Decodes the updates carried by `payload` received on `topic`.
    ///
    /// Unknown fields are ignored and missing fields give no update.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::ErrorKind::DecodeFailure`] when the payload
    /// is malformed.
    fn parse(&self, topic: &str, payload: &[u8]) -> Result<Vec<PropertyUpdate>>;

    /// Same as [`Codec::parse`], logging and dropping malformed payloads.
    fn decode(&self, topic: &str, payload: &[u8]) -> Vec<PropertyUpdate> {
        self.parse(topic, payload).unwrap_or_else(|e| {
            warn!("{} dropped the message on `{topic}`: {e}", self.identity());
            Vec::new()
        })
    }

    /// Encodes a command setting `property` to `value`.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::ErrorKind::UnsupportedOperation`] when the
    /// property cannot be commanded.
    fn encode(&self, property: Property, value: Value) -> Result<Command>;

    /// Returns the commands asking the device to report its current state.
    fn state_requests(&self) -> Vec<Command> {
        Vec::new()
    }

    /// Returns the command configuring the device.
    fn configure_command(&self) -> Option<Command> {
        None
    }
}

pub(crate) fn payload_str<'a>(topic: &str, payload: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(payload)
        .map_err(|e| Error::decode(format!("Payload on `{topic}` is not UTF-8: {e}")))
}

pub(crate) fn power_state(topic: &str, state: &str) -> Result<bool> {
    match state {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        state => Err(Error::decode(format!(
            "Unexpected power state `{state}` on `{topic}`"
        ))),
    }
}

pub(crate) const fn power_label(active: bool) -> &'static str {
    if active { "ON" } else { "OFF" }
}

pub(crate) fn expect_bool(property: Property, value: Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| {
        Error::new(
            crate::error::ErrorKind::InvalidValue,
            format!("`{property}` expects a boolean, got `{value}`"),
        )
    })
}
