use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use devlink::codec::{Model, Protocol};
use devlink::config::TopicConfig;
use devlink::error::{Error, ErrorKind, Result};
use devlink::registry::DeviceDescriptor;
use devlink::transport::{MessageHandler, Transport};

use serde::Deserialize;

use tracing::{debug, error, info, warn};

const END_DEVICE: &str = "EndDevice";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Receives the devices found by a discovery service.
pub trait DiscoveryProcessor: Send + Sync {
    /// Processes the whole list of discovered devices.
    ///
    /// # Errors
    ///
    /// A failure is logged and does not prevent the next processors from
    /// running.
    fn process_discovery_update(&self, devices: &[DeviceDescriptor]) -> Result<()>;
}

/// Logs every discovered device.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryLogger;

impl DiscoveryProcessor for DiscoveryLogger {
    fn process_discovery_update(&self, devices: &[DeviceDescriptor]) -> Result<()> {
        for device in devices {
            info!(
                "Discovered {} `{}` ({}) at {}",
                device.protocol,
                device.device_name,
                device.model,
                device.address.as_deref().unwrap_or("unknown address")
            );
        }
        Ok(())
    }
}

#[derive(Deserialize)]
struct Definition {
    model: Option<String>,
}

#[derive(Deserialize)]
struct BridgeDevice {
    #[serde(rename = "type", default)]
    device_type: String,
    friendly_name: String,
    ieee_address: Option<String>,
    definition: Option<Definition>,
}

impl BridgeDevice {
    fn into_descriptor(self) -> DeviceDescriptor {
        let model = self
            .definition
            .and_then(|definition| definition.model)
            .unwrap_or_default();

        DeviceDescriptor {
            protocol: Protocol::Zigbee2Mqtt,
            model: Model::from_label(&model),
            device_name: self.friendly_name,
            address: self.ieee_address,
        }
    }
}

/// Lists the end devices known by a `zigbee2mqtt` bridge.
///
/// The bridge publishes its device list, retained, on
/// `<z2m_base>/bridge/devices`. The coordinator and the routers are left out.
pub struct Zigbee2MqttDiscovery {
    topic: String,
    transport: Arc<dyn Transport>,
    devices: Mutex<Vec<DeviceDescriptor>>,
    processors: Mutex<Vec<Arc<dyn DiscoveryProcessor>>>,
}

impl std::fmt::Debug for Zigbee2MqttDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zigbee2MqttDiscovery")
            .field("topic", &self.topic)
            .field("devices", &self.devices())
            .finish_non_exhaustive()
    }
}

impl Zigbee2MqttDiscovery {
    /// Creates a [`Zigbee2MqttDiscovery`].
    ///
    /// The device list is subscribed once the discovery is registered on a
    /// [`devlink::transport::Dispatcher`].
    pub fn new(transport: Arc<dyn Transport>, topics: &TopicConfig) -> Arc<Self> {
        let discovery = Arc::new(Self {
            topic: format!("{}/bridge/devices", topics.z2m_base),
            transport,
            devices: Mutex::new(Vec::new()),
            processors: Mutex::new(Vec::new()),
        });
        discovery
    }

    /// Returns the topic of the device list.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the devices of the last received list.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        lock(&self.devices).clone()
    }

    /// Appends a discovery processor.
    pub fn processor_append(&self, processor: Arc<dyn DiscoveryProcessor>) {
        lock(&self.processors).push(processor);
    }

    /// Parses a device list.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::DecodeFailure`] when the payload is not a list
    /// of devices.
    pub fn parse(payload: &[u8]) -> Result<Vec<DeviceDescriptor>> {
        let devices: Vec<BridgeDevice> = serde_json::from_slice(payload).map_err(|e| {
            Error::new(ErrorKind::DecodeFailure, format!("Invalid device list: {e}"))
        })?;

        Ok(devices
            .into_iter()
            .filter(|device| device.device_type == END_DEVICE)
            .map(BridgeDevice::into_descriptor)
            .collect())
    }

    fn subscribe(&self) {
        if let Err(e) = self.transport.subscribe(&self.topic) {
            warn!("Cannot subscribe to `{}`: {e}", self.topic);
        }
    }
}

impl MessageHandler for Zigbee2MqttDiscovery {
    fn topics(&self) -> Vec<String> {
        vec![self.topic.clone()]
    }

    fn on_message(&self, _topic: &str, payload: &[u8]) {
        let devices = match Self::parse(payload) {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device list on `{}` discarded: {e}", self.topic);
                return;
            }
        };
        debug!("{} end devices listed on `{}`", devices.len(), self.topic);

        *lock(&self.devices) = devices.clone();

        let processors = lock(&self.processors).clone();
        for processor in processors {
            if let Err(e) = processor.process_discovery_update(&devices) {
                error!("Discovery processor failed: {e}");
            }
        }
    }

    fn on_register(&self) {
        self.subscribe();
    }

    fn on_connect(&self) {
        self.subscribe();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use devlink::codec::{Model, Protocol};
    use devlink::config::TopicConfig;
    use devlink::error::{Error, ErrorKind, Result};
    use devlink::registry::DeviceDescriptor;
    use devlink::transport::{Dispatcher, MessageHandler, Transport};

    use super::{DiscoveryProcessor, Zigbee2MqttDiscovery};

    const DEVICES: &str = r#"[
        {
            "ieee_address": "0x00124b0024c1d9b8",
            "type": "Coordinator",
            "friendly_name": "Coordinator",
            "definition": null
        },
        {
            "ieee_address": "0xa4c138f4d2b93a1e",
            "type": "Router",
            "friendly_name": "kitchen_switch",
            "definition": {"model": "TS0002", "vendor": "TuYa"}
        },
        {
            "ieee_address": "0x00124b0022ebac5e",
            "type": "EndDevice",
            "friendly_name": "hall_motion",
            "definition": {"model": "SNZB-03", "vendor": "SONOFF"}
        },
        {
            "ieee_address": "0x54ef441000a3c1f2",
            "type": "EndDevice",
            "friendly_name": "desk_cube",
            "definition": {"model": "MFKZQ01LM", "vendor": "Aqara"}
        },
        {
            "ieee_address": "0x54ef441000a3c1f3",
            "type": "EndDevice",
            "friendly_name": "new_device",
            "definition": null
        }
    ]"#;

    #[derive(Default)]
    struct RecordingTransport {
        subscriptions: Mutex<Vec<String>>,
    }

    impl Transport for RecordingTransport {
        fn subscribe(&self, topic: &str) -> Result<()> {
            self.subscriptions.lock().unwrap().push(topic.into());
            Ok(())
        }

        fn publish(&self, _topic: &str, _payload: &[u8], _retain: bool) -> Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    struct Recorder {
        names: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                names: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    impl DiscoveryProcessor for Recorder {
        fn process_discovery_update(&self, devices: &[DeviceDescriptor]) -> Result<()> {
            self.names
                .lock()
                .unwrap()
                .extend(devices.iter().map(|device| device.device_name.clone()));
            if self.fail {
                Err(Error::new(ErrorKind::Processor, "Recorder failure"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn keeps_end_devices() {
        let devices = Zigbee2MqttDiscovery::parse(DEVICES.as_bytes()).unwrap();

        assert_eq!(
            devices,
            [
                DeviceDescriptor {
                    protocol: Protocol::Zigbee2Mqtt,
                    model: Model::Snzb03,
                    device_name: "hall_motion".into(),
                    address: Some("0x00124b0022ebac5e".into()),
                },
                DeviceDescriptor {
                    protocol: Protocol::Zigbee2Mqtt,
                    model: Model::Unknown("MFKZQ01LM".into()),
                    device_name: "desk_cube".into(),
                    address: Some("0x54ef441000a3c1f2".into()),
                },
                DeviceDescriptor {
                    protocol: Protocol::Zigbee2Mqtt,
                    model: Model::Unknown(String::new()),
                    device_name: "new_device".into(),
                    address: Some("0x54ef441000a3c1f3".into()),
                },
            ]
        );
    }

    #[test]
    fn invalid_lists() {
        let payloads: [&[u8]; 3] = [b"{}", b"not json", br#"[{"type":"EndDevice"}]"#];
        for payload in payloads {
            assert_eq!(
                Zigbee2MqttDiscovery::parse(payload).unwrap_err().kind(),
                ErrorKind::DecodeFailure
            );
        }
    }

    #[test]
    fn processors_receive_lists() {
        let transport = Arc::new(RecordingTransport::default());
        let discovery = Zigbee2MqttDiscovery::new(
            transport.clone(),
            &TopicConfig::default().z2m_base("z2m"),
        );
        let failing = Recorder::new(true);
        let recorder = Recorder::new(false);
        discovery.processor_append(failing.clone());
        discovery.processor_append(recorder.clone());

        assert_eq!(discovery.topics(), ["z2m/bridge/devices"]);
        assert!(transport.subscriptions.lock().unwrap().is_empty());

        let dispatcher = Dispatcher::new();
        dispatcher.register(discovery.clone());
        assert_eq!(
            *transport.subscriptions.lock().unwrap(),
            ["z2m/bridge/devices"]
        );

        assert!(dispatcher.dispatch("z2m/bridge/devices", DEVICES.as_bytes()));
        assert!(dispatcher.dispatch("z2m/bridge/devices", b"garbage"));

        let names = ["hall_motion", "desk_cube", "new_device"];
        assert_eq!(*failing.names.lock().unwrap(), names);
        assert_eq!(*recorder.names.lock().unwrap(), names);
        assert_eq!(discovery.devices().len(), 3);

        discovery.on_connect();
        assert_eq!(transport.subscriptions.lock().unwrap().len(), 2);
    }
}
