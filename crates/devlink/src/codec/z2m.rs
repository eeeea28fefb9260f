use serde::{Deserialize, Serialize};

use serde_json::{Map, Value as Json};

use tracing::warn;

use crate::codec::{
    Bindings, Codec, Command, DeviceIdentity, Model, PropertyUpdate, Protocol, Slot, expect_bool,
    payload_str, power_label, power_state,
};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::CodecRegistry;
use crate::value::{Availability, ButtonAction, Property, Value};

// Alarm sound sent along with every alarm command. The alarm value is a
// plain boolean, so the sound is not part of the device state.
const ALARM_MELODY: u8 = 1;
const ALARM_VOLUME: &str = "low";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Power,
    Bool,
    Float,
    Int,
    Action,
    Alarm,
}

#[derive(Debug)]
struct Field {
    key: &'static str,
    slot: Slot,
    encoding: Encoding,
}

impl Field {
    const fn new(key: &'static str, slot: Slot, encoding: Encoding) -> Self {
        Self {
            key,
            slot,
            encoding,
        }
    }

    fn decode(&self, raw: &Json) -> Result<Option<Value>> {
        let value = match self.encoding {
            Encoding::Power => raw
                .as_str()
                .map(|state| power_state(self.key, state))
                .transpose()?
                .map(Value::Bool),
            Encoding::Bool | Encoding::Alarm => raw.as_bool().map(Value::Bool),
            Encoding::Float => raw.as_f64().map(Value::Float),
            #[allow(clippy::cast_possible_truncation)]
            Encoding::Int => raw
                .as_i64()
                .or_else(|| raw.as_f64().map(|value| value.trunc() as i64))
                .map(Value::Int),
            Encoding::Action => match raw.as_str() {
                // Sent by zigbee2mqtt right after every action.
                Some("") => return Ok(None),
                Some(label) => ButtonAction::from_label(label).map(Value::Action),
                None => None,
            },
        };

        value.map(Some).ok_or_else(|| {
            Error::decode(format!(
                "Unexpected value `{raw}` for `{}` ({:?})",
                self.key, self.encoding
            ))
        })
    }
}

/// The payload layout of a `zigbee2mqtt` model.
#[derive(Debug)]
pub struct Zigbee2MqttModel {
    model: Model,
    fields: &'static [Field],
    state_request: Option<&'static str>,
}

impl Zigbee2MqttModel {
    /// Returns the model.
    #[must_use]
    pub const fn model(&self) -> &Model {
        &self.model
    }

    /// Returns the slots the model requires.
    #[must_use]
    pub fn slots(&self) -> Vec<Slot> {
        self.fields.iter().map(|field| field.slot).collect()
    }
}

/// The `zigbee2mqtt` models with a codec.
pub static MODELS: [Zigbee2MqttModel; 7] = [
    Zigbee2MqttModel {
        model: Model::ZbminiL,
        fields: &[Field::new("state", Slot::Switch, Encoding::Power)],
        state_request: Some(r#"{"state":""}"#),
    },
    Zigbee2MqttModel {
        model: Model::Ts0002,
        fields: &[
            Field::new("state_right", Slot::Switch0, Encoding::Power),
            Field::new("state_left", Slot::Switch1, Encoding::Power),
        ],
        state_request: Some(r#"{"state_left":"","state_right":""}"#),
    },
    Zigbee2MqttModel {
        model: Model::Snzb02,
        fields: &[
            Field::new("temperature", Slot::Temperature, Encoding::Float),
            Field::new("humidity", Slot::Humidity, Encoding::Int),
        ],
        state_request: None,
    },
    Zigbee2MqttModel {
        model: Model::Ts0601Soil,
        fields: &[
            Field::new("temperature", Slot::Temperature, Encoding::Float),
            Field::new("soil_moisture", Slot::Humidity, Encoding::Int),
        ],
        state_request: None,
    },
    Zigbee2MqttModel {
        model: Model::Snzb01,
        fields: &[Field::new("action", Slot::Button, Encoding::Action)],
        state_request: None,
    },
    Zigbee2MqttModel {
        model: Model::Snzb03,
        fields: &[Field::new("occupancy", Slot::Motion, Encoding::Bool)],
        state_request: None,
    },
    Zigbee2MqttModel {
        model: Model::NasAb02b2,
        fields: &[Field::new("alarm", Slot::Alarm, Encoding::Alarm)],
        state_request: None,
    },
];

pub(crate) fn register(registry: CodecRegistry) -> CodecRegistry {
    MODELS.iter().fold(registry, |registry, layout| {
        registry.register(
            Protocol::Zigbee2Mqtt,
            layout.model.clone(),
            layout.slots(),
            move |identity, topics, bindings| -> Box<dyn Codec> {
                Box::new(Zigbee2MqttCodec::new(
                    layout,
                    identity,
                    &topics.z2m_base,
                    bindings,
                ))
            },
        )
    })
}

#[derive(Deserialize)]
struct AvailabilityPayload {
    state: String,
}

#[derive(Serialize)]
struct AlarmCommand {
    alarm: bool,
    melody: u8,
    volume: &'static str,
    duration: Option<u32>,
}

/// A `zigbee2mqtt` device.
///
/// ```text
/// <base>
/// └── <device_name>             values, JSON object
///     ├── availability          online | offline
///     ├── set                   commands, JSON object
///     └── get                   state requests, JSON object
/// ```
///
/// Alarm commands always ring melody `1` at `low` volume, with no duration
/// limit.
#[derive(Debug)]
pub struct Zigbee2MqttCodec {
    identity: DeviceIdentity,
    bindings: Bindings,
    layout: &'static Zigbee2MqttModel,
    root_topic: String,
    availability_topic: String,
}

impl Zigbee2MqttCodec {
    pub(crate) fn new(
        layout: &'static Zigbee2MqttModel,
        identity: DeviceIdentity,
        base: &str,
        bindings: Bindings,
    ) -> Self {
        let root_topic = format!("{base}/{}", identity.device_name);
        Self {
            availability_topic: format!("{root_topic}/availability"),
            root_topic,
            identity,
            bindings,
            layout,
        }
    }

    /// Returns the root topic of the device.
    #[must_use]
    pub fn root_topic(&self) -> &str {
        &self.root_topic
    }
}

impl Codec for Zigbee2MqttCodec {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    fn availability_topic(&self) -> &str {
        &self.availability_topic
    }

    fn value_topics(&self) -> Vec<String> {
        vec![self.root_topic.clone()]
    }

    fn decode_availability(&self, payload: &[u8]) -> Availability {
        let payload = String::from_utf8_lossy(payload);
        let state = match payload.trim() {
            state @ ("online" | "offline") => state.to_owned(),
            json => match serde_json::from_str::<AvailabilityPayload>(json) {
                Ok(AvailabilityPayload { state }) => state,
                Err(_) => {
                    warn!("{} sent an unknown availability `{payload}`", self.identity);
                    return Availability::Unknown;
                }
            },
        };

        match state.as_str() {
            "online" => Availability::Available,
            "offline" => Availability::Unavailable,
            state => {
                warn!("{} sent an unknown availability state `{state}`", self.identity);
                Availability::Unknown
            }
        }
    }

    fn parse(&self, topic: &str, payload: &[u8]) -> Result<Vec<PropertyUpdate>> {
        if topic != self.root_topic {
            return Err(Error::decode(format!(
                "`{topic}` is not a value topic of {}",
                self.identity
            )));
        }

        let Json::Object(object) = serde_json::from_str::<Json>(payload_str(topic, payload)?)?
        else {
            return Err(Error::decode(format!(
                "Payload on `{topic}` is not a JSON object"
            )));
        };

        let mut updates = Vec::new();
        for field in self.layout.fields {
            let Some(raw) = object.get(field.key).filter(|raw| !raw.is_null()) else {
                continue;
            };
            if let Some(value) = field.decode(raw)? {
                updates.push((field.slot.property(), value));
            }
        }
        Ok(updates)
    }

    fn encode(&self, property: Property, value: Value) -> Result<Command> {
        let field = self
            .layout
            .fields
            .iter()
            .find(|field| field.slot.property() == property)
            .filter(|field| matches!(field.encoding, Encoding::Power | Encoding::Alarm))
            .ok_or_else(|| {
                Error::unsupported(format!("{} cannot command `{property}`", self.identity))
            })?;

        let active = expect_bool(property, value)?;
        let payload = if field.encoding == Encoding::Alarm {
            serde_json::to_string(&AlarmCommand {
                alarm: active,
                melody: ALARM_MELODY,
                volume: ALARM_VOLUME,
                duration: None,
            })
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidValue,
                    format!("Cannot encode the alarm command: {e}"),
                )
            })?
        } else {
            let mut object = Map::new();
            let _ = object.insert(field.key.into(), power_label(active).into());
            Json::Object(object).to_string()
        };

        Ok(Command::new(format!("{}/set", self.root_topic), payload))
    }

    fn state_requests(&self) -> Vec<Command> {
        self.layout
            .state_request
            .map(|payload| Command::new(format!("{}/get", self.root_topic), payload))
            .into_iter()
            .collect()
    }
}
