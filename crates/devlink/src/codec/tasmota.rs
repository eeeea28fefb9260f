use serde_json::Value as Json;

use tracing::{debug, info, warn};

use crate::codec::{
    Bindings, Codec, Command, DeviceIdentity, Model, PropertyUpdate, Protocol, Slot, expect_bool,
    payload_str, power_label, power_state,
};
use crate::error::{Error, Result};
use crate::registry::CodecRegistry;
use crate::value::{Availability, Property, Value};

#[derive(Debug)]
enum Source {
    // Relay state on `stat/<dev>/<topic>`, commanded on `cmnd/<dev>/<command>`.
    Relay {
        topic: &'static str,
        command: &'static str,
    },
    // Reading in a `tele/<dev>/SENSOR` section, divided by `divisor`.
    Sensor {
        section: &'static str,
        key: &'static str,
        divisor: f64,
    },
}

#[derive(Debug)]
struct Field {
    slot: Slot,
    source: Source,
}

/// The topic and payload layout of a Tasmota model.
#[derive(Debug)]
pub struct TasmotaModel {
    model: Model,
    fields: &'static [Field],
    backlog: &'static str,
}

impl TasmotaModel {
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

/// The Tasmota models with a codec.
pub static MODELS: [TasmotaModel; 2] = [
    TasmotaModel {
        model: Model::ShellyPlugS,
        fields: &[
            Field {
                slot: Slot::Switch,
                source: Source::Relay {
                    topic: "POWER",
                    command: "Power",
                },
            },
            Field {
                slot: Slot::Temperature,
                source: Source::Sensor {
                    section: "ANALOG",
                    key: "Temperature",
                    divisor: 1.,
                },
            },
            Field {
                slot: Slot::Adc,
                source: Source::Sensor {
                    section: "ENERGY",
                    key: "Voltage",
                    divisor: 1.,
                },
            },
        ],
        backlog: "PulseTime 0",
    },
    TasmotaModel {
        model: Model::ShellyUni,
        fields: &[
            Field {
                slot: Slot::Switch0,
                source: Source::Relay {
                    topic: "POWER0",
                    command: "Power0",
                },
            },
            Field {
                slot: Slot::Switch1,
                source: Source::Relay {
                    topic: "POWER1",
                    command: "Power1",
                },
            },
            Field {
                slot: Slot::Adc,
                source: Source::Sensor {
                    section: "ANALOG",
                    key: "Range",
                    divisor: 100.,
                },
            },
        ],
        backlog: "PulseTime 0; AdcParam 6,0,71,0,100",
    },
];

pub(crate) fn register(registry: CodecRegistry) -> CodecRegistry {
    MODELS.iter().fold(registry, |registry, layout| {
        registry.register(
            Protocol::Tasmota,
            layout.model.clone(),
            layout.slots(),
            move |identity, topics, bindings| -> Box<dyn Codec> {
                Box::new(TasmotaCodec::new(
                    layout,
                    identity,
                    topics.tasmota_base.as_deref(),
                    bindings,
                ))
            },
        )
    })
}

/// A Tasmota device.
///
/// ```text
/// [<base>/]
/// ├── tele/<device_name>
/// │   ├── LWT           Online | Offline
/// │   └── SENSOR        readings, JSON object
/// ├── stat/<device_name>
/// │   └── POWER[n]      ON | OFF
/// └── cmnd/<device_name>
///     ├── Power[n]      ON | OFF, empty to query
///     └── Backlog       configuration
/// ```
#[derive(Debug)]
pub struct TasmotaCodec {
    identity: DeviceIdentity,
    bindings: Bindings,
    layout: &'static TasmotaModel,
    stat_topic: String,
    cmnd_topic: String,
    sensor_topic: String,
    availability_topic: String,
}

impl TasmotaCodec {
    pub(crate) fn new(
        layout: &'static TasmotaModel,
        identity: DeviceIdentity,
        base: Option<&str>,
        bindings: Bindings,
    ) -> Self {
        let prefix = base.map(|base| format!("{base}/")).unwrap_or_default();
        let device_name = &identity.device_name;
        let tele_topic = format!("{prefix}tele/{device_name}");

        Self {
            stat_topic: format!("{prefix}stat/{device_name}"),
            cmnd_topic: format!("{prefix}cmnd/{device_name}"),
            sensor_topic: format!("{tele_topic}/SENSOR"),
            availability_topic: format!("{tele_topic}/LWT"),
            identity,
            bindings,
            layout,
        }
    }

    fn relay_topic(&self, topic: &str) -> String {
        format!("{}/{topic}", self.stat_topic)
    }

    fn command_topic(&self, command: &str) -> String {
        format!("{}/{command}", self.cmnd_topic)
    }

    fn parse_sensors(&self, topic: &str, payload: &[u8]) -> Result<Vec<PropertyUpdate>> {
        let Json::Object(object) = serde_json::from_str::<Json>(payload_str(topic, payload)?)?
        else {
            return Err(Error::decode(format!(
                "Payload on `{topic}` is not a JSON object"
            )));
        };

        let mut updates = Vec::new();
        for field in self.layout.fields {
            let Source::Sensor {
                section,
                key,
                divisor,
            } = field.source
            else {
                continue;
            };

            let Some(raw) = object
                .get(section)
                .and_then(|readings| readings.get(key))
                .filter(|raw| !raw.is_null())
            else {
                debug!("{} has no `{section}.{key}` reading", self.identity);
                continue;
            };

            let reading = raw.as_f64().ok_or_else(|| {
                Error::decode(format!("Unexpected `{section}.{key}` reading `{raw}`"))
            })?;
            updates.push((field.slot.property(), Value::Float(reading / divisor)));
        }
        Ok(updates)
    }
}

impl Codec for TasmotaCodec {
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
        let mut topics: Vec<String> = self
            .layout
            .fields
            .iter()
            .filter_map(|field| match field.source {
                Source::Relay { topic, .. } => Some(self.relay_topic(topic)),
                Source::Sensor { .. } => None,
            })
            .collect();
        if self
            .layout
            .fields
            .iter()
            .any(|field| matches!(field.source, Source::Sensor { .. }))
        {
            topics.push(self.sensor_topic.clone());
        }
        topics
    }

    fn decode_availability(&self, payload: &[u8]) -> Availability {
        match payload {
            b"Online" => Availability::Available,
            b"Offline" => Availability::Unavailable,
            payload => {
                warn!(
                    "{} sent an unknown availability `{}`",
                    self.identity,
                    String::from_utf8_lossy(payload)
                );
                Availability::Unknown
            }
        }
    }

    fn parse(&self, topic: &str, payload: &[u8]) -> Result<Vec<PropertyUpdate>> {
        if topic == self.sensor_topic {
            return self.parse_sensors(topic, payload);
        }

        let relay = self.layout.fields.iter().find(|field| match field.source {
            Source::Relay { topic: relay, .. } => self.relay_topic(relay) == topic,
            Source::Sensor { .. } => false,
        });
        let Some(relay) = relay else {
            return Err(Error::decode(format!(
                "`{topic}` is not a value topic of {}",
                self.identity
            )));
        };

        match payload_str(topic, payload)? {
            // Sent when the device comes back online.
            "" => Ok(Vec::new()),
            state => Ok(vec![(
                relay.slot.property(),
                Value::Bool(power_state(topic, state)?),
            )]),
        }
    }

    fn encode(&self, property: Property, value: Value) -> Result<Command> {
        let command = self
            .layout
            .fields
            .iter()
            .find_map(|field| match field.source {
                Source::Relay { command, .. } if field.slot.property() == property => {
                    Some(command)
                }
                _ => None,
            })
            .ok_or_else(|| {
                Error::unsupported(format!("{} cannot command `{property}`", self.identity))
            })?;

        let payload = power_label(expect_bool(property, value)?);
        info!("{} sending `{payload}` to {command}", self.identity);
        Ok(Command::new(self.command_topic(command), payload))
    }

    fn state_requests(&self) -> Vec<Command> {
        self.layout
            .fields
            .iter()
            .filter_map(|field| match field.source {
                Source::Relay { command, .. } => {
                    Some(Command::new(self.command_topic(command), ""))
                }
                Source::Sensor { .. } => None,
            })
            .collect()
    }

    fn configure_command(&self) -> Option<Command> {
        Some(Command::new(self.command_topic("Backlog"), self.layout.backlog))
    }
}
