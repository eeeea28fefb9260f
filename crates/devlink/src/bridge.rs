use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error, info, warn};

use crate::codec::{Codec, Command};
use crate::device::{CommandSink, lock};
use crate::error::{Error, Result};
use crate::processor::AvailabilityProcessor;
use crate::transport::{MessageHandler, Transport};
use crate::value::{Availability, Property, Value};

/// Connects a [`Codec`] to a [`Transport`].
///
/// A bridge routes the messages of its device to the bound virtual devices
/// and publishes the commands they issue.
pub struct Bridge {
    transport: Arc<dyn Transport>,
    codec: Box<dyn Codec>,
    availability: Mutex<Availability>,
    availability_processors: Mutex<Vec<Arc<dyn AvailabilityProcessor>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("codec", &self.codec)
            .field("availability", &self.availability())
            .finish_non_exhaustive()
    }
}

impl Bridge {
    /// Creates a [`Bridge`].
    ///
    /// Every virtual device bound to `codec` publishes its commands through
    /// the new bridge. The bridge subscribes to the topics of the device once
    /// it is registered on a [`crate::transport::Dispatcher`].
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::ErrorKind::BindingMismatch`] when a virtual
    /// device is already bound to another bridge.
    pub fn new(transport: Arc<dyn Transport>, codec: Box<dyn Codec>) -> Result<Arc<Self>> {
        if let Some(device) = codec.bindings().devices().find(|device| device.is_bound()) {
            return Err(Error::binding(format!("{device} is already bound to a bridge")));
        }

        let bridge = Arc::new(Self {
            transport,
            codec,
            availability: Mutex::new(Availability::Unknown),
            availability_processors: Mutex::new(Vec::new()),
        });

        let sink: Weak<dyn CommandSink> = Arc::<Self>::downgrade(&bridge);
        for device in bridge.codec.bindings().devices() {
            device.bind(sink.clone())?;
        }

        debug!("Bridge of {} created", bridge.codec.identity());
        Ok(bridge)
    }

    /// Returns the codec.
    #[must_use]
    pub fn codec(&self) -> &dyn Codec {
        self.codec.as_ref()
    }

    /// Returns the last known availability of the device.
    #[must_use]
    pub fn availability(&self) -> Availability {
        *lock(&self.availability)
    }

    /// Appends an availability processor run on availability changes.
    pub fn availability_processor_append(&self, processor: Arc<dyn AvailabilityProcessor>) {
        lock(&self.availability_processors).push(processor);
    }

    fn subscribe(&self) {
        for topic in self.codec.topics_for_device() {
            if let Err(e) = self.transport.subscribe(&topic) {
                warn!("{} cannot subscribe to `{topic}`: {e}", self.codec.identity());
            }
        }
    }

    fn send(&self, command: &Command) -> Result<()> {
        self.transport
            .publish(&command.topic, command.payload.as_bytes(), command.retain)
    }

    fn handle_availability(&self, payload: &[u8]) {
        let availability = self.codec.decode_availability(payload);

        for device in self.codec.bindings().devices() {
            let _ = device.set_availability(availability);
        }

        {
            let mut current = lock(&self.availability);
            if *current == availability {
                return;
            }
            *current = availability;
        }

        let name = &self.codec.identity().device_name;
        let processors = lock(&self.availability_processors).clone();
        for processor in processors {
            if let Err(e) = processor.process_availability_update(name, availability) {
                error!("Availability processor of {name} failed: {e}");
            }
        }
    }

    fn handle_values(&self, topic: &str, payload: &[u8]) {
        for (property, value) in self.codec.decode(topic, payload) {
            let Some(device) = self.codec.bindings().device_for(property) else {
                warn!(
                    "{} has no virtual device for `{property}`",
                    self.codec.identity()
                );
                continue;
            };

            if let Err(e) = device.apply_update(property, value) {
                warn!("{device} rejected {property} = {value}: {e}");
            }
        }
    }
}

impl CommandSink for Bridge {
    fn publish_command(&self, property: Property, value: Value) -> Result<()> {
        let command = self.codec.encode(property, value)?;
        info!(
            "{} publishing `{}` on `{}`",
            self.codec.identity(),
            command.payload,
            command.topic
        );
        self.send(&command)
    }
}

impl MessageHandler for Bridge {
    fn topics(&self) -> Vec<String> {
        self.codec.topics_for_device().into_iter().collect()
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic == self.codec.availability_topic() {
            self.handle_availability(payload);
        } else {
            self.handle_values(topic, payload);
        }
    }

    fn on_register(&self) {
        self.subscribe();
    }

    fn on_connect(&self) {
        self.subscribe();

        let identity = self.codec.identity();
        for command in self
            .codec
            .configure_command()
            .into_iter()
            .chain(self.codec.state_requests())
        {
            if let Err(e) = self.send(&command) {
                warn!(
                    "{identity} cannot send `{}` on `{}`: {e}",
                    command.payload, command.topic
                );
            }
        }

        for device in self.codec.bindings().devices() {
            device.retry_pending_command();
        }
    }

    fn on_disconnect(&self) {
        debug!("{} lost its transport", self.codec.identity());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::codec::{Bindings, Model, Protocol, Slot};
    use crate::config::TopicConfig;
    use crate::device::{CommandSink, VirtualDevice};
    use crate::error::ErrorKind;
    use crate::processor::Verdict;
    use crate::registry::CodecRegistry;
    use crate::tests::{MockTransport, RecordingAvailability, record};
    use crate::transport::{Dispatcher, MessageHandler};
    use crate::value::{Availability, DeviceKind, Property, Value};

    use super::Bridge;

    fn registry() -> CodecRegistry {
        CodecRegistry::with_builtin_codecs(TopicConfig::default())
    }

    fn switch_bridge(lamp: &Arc<VirtualDevice>) -> (Arc<Bridge>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let codec = registry()
            .create(
                Protocol::Zigbee2Mqtt,
                Model::ZbminiL,
                "lamp",
                Bindings::new().with(Slot::Switch, lamp),
            )
            .unwrap();
        let bridge = Bridge::new(transport.clone(), codec).unwrap();
        (bridge, transport)
    }

    #[test]
    fn subscribes_once_registered() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (bridge, transport) = switch_bridge(&lamp);
        assert!(transport.subscriptions().is_empty());

        let dispatcher = Dispatcher::new();
        dispatcher.register(bridge.clone());

        assert_eq!(
            transport.subscriptions(),
            ["zigbee2mqtt/lamp/availability", "zigbee2mqtt/lamp"]
        );
        assert_eq!(bridge.topics(), transport.subscriptions());

        assert!(dispatcher.dispatch("zigbee2mqtt/lamp", br#"{"state":"ON"}"#));
        assert!(lamp.is_active());
    }

    #[test]
    fn device_bound_twice() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (_bridge, transport) = switch_bridge(&lamp);

        let codec = registry()
            .create(
                Protocol::Zigbee2Mqtt,
                Model::ZbminiL,
                "other",
                Bindings::new().with(Slot::Switch, &lamp),
            )
            .unwrap();
        assert_eq!(
            Bridge::new(transport, codec).unwrap_err().kind(),
            ErrorKind::BindingMismatch
        );
    }

    #[test]
    fn values_reach_devices() {
        let transport = Arc::new(MockTransport::default());
        let temperature = Arc::new(VirtualDevice::new(DeviceKind::Temperature, "garden"));
        let humidity = Arc::new(VirtualDevice::new(DeviceKind::Humidity, "garden"));
        let codec = registry()
            .create(
                Protocol::Zigbee2Mqtt,
                Model::Snzb02,
                "sensor",
                Bindings::new()
                    .with(Slot::Temperature, &temperature)
                    .with(Slot::Humidity, &humidity),
            )
            .unwrap();
        let bridge = Bridge::new(transport, codec).unwrap();
        let log = record(&temperature, "log", Verdict::Pass);

        bridge.on_message(
            "zigbee2mqtt/sensor",
            br#"{"temperature":19.84,"humidity":61,"battery":97}"#,
        );
        assert_eq!(temperature.value(), Some(Value::Float(19.8)));
        assert_eq!(humidity.value(), Some(Value::Int(61)));
        assert_eq!(*log.lock().unwrap(), ["log:sensor.temperature=19.8"]);

        // Malformed payloads are dropped.
        bridge.on_message("zigbee2mqtt/sensor", b"{\"temperature\":");
        assert_eq!(temperature.value(), Some(Value::Float(19.8)));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn availability_changes() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (bridge, _) = switch_bridge(&lamp);
        let processor = Arc::new(RecordingAvailability::default());
        bridge.availability_processor_append(processor.clone());

        let payloads: [&[u8]; 4] = [b"online", b"online", b"offline", b"nonsense"];
        for payload in payloads {
            bridge.on_message("zigbee2mqtt/lamp/availability", payload);
        }

        assert_eq!(
            processor.log(),
            ["lamp:available", "lamp:unavailable", "lamp:unknown"]
        );
        assert_eq!(bridge.availability(), Availability::Unknown);
        assert_eq!(lamp.availability(), Availability::Unknown);
    }

    #[test]
    fn triggers_publish_commands() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (_bridge, transport) = switch_bridge(&lamp);

        lamp.trigger_start().unwrap();
        lamp.trigger_start().unwrap();
        lamp.trigger_stop().unwrap();

        assert_eq!(
            transport.published_on("zigbee2mqtt/lamp/set"),
            [r#"{"state":"ON"}"#, r#"{"state":"OFF"}"#]
        );
        assert!(transport.published().iter().all(|(_, _, retain)| !retain));
    }

    #[test]
    fn publish_failure_keeps_local_state() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (_bridge, transport) = switch_bridge(&lamp);
        transport.set_connected(false);

        assert_eq!(
            lamp.trigger_start().unwrap_err().kind(),
            ErrorKind::PublishFailure
        );
        assert!(lamp.is_active());
        assert!(transport.published().is_empty());
    }

    #[test]
    fn reconnection_requests_state() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (bridge, transport) = switch_bridge(&lamp);
        transport.clear();

        bridge.on_connect();

        assert_eq!(
            transport.subscriptions(),
            ["zigbee2mqtt/lamp/availability", "zigbee2mqtt/lamp"]
        );
        assert_eq!(
            transport.published_on("zigbee2mqtt/lamp/get"),
            [r#"{"state":""}"#]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reversion_is_replayed_once() {
        let lamp = Arc::new(
            VirtualDevice::new(DeviceKind::Switch, "lamp").countdown(Duration::from_secs(2)),
        );
        let (bridge, transport) = switch_bridge(&lamp);

        lamp.trigger_start().unwrap();
        transport.set_connected(false);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!lamp.is_active());
        assert!(lamp.has_pending_command());

        transport.set_connected(true);
        bridge.on_connect();
        bridge.on_connect();

        assert!(!lamp.has_pending_command());
        assert_eq!(
            transport.published_on("zigbee2mqtt/lamp/set"),
            [r#"{"state":"ON"}"#, r#"{"state":"OFF"}"#]
        );
    }

    #[test]
    fn sensors_cannot_be_commanded() {
        let lamp = Arc::new(VirtualDevice::new(DeviceKind::Switch, "lamp"));
        let (bridge, _) = switch_bridge(&lamp);

        let error = bridge
            .publish_command(Property::Temperature, Value::Float(1.))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::UnsupportedOperation);
    }
}
