use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashbrown::HashMap;

use tokio::time::Instant;

use tracing::{debug, info, warn};

use crate::device::{VirtualDevice, lock};
use crate::error::{Error, ErrorKind, Result};
use crate::transport::Transport;
use crate::value::{Availability, ButtonAction, Property, Value};

/// The verdict of a [`VirtualDeviceProcessor`] on an update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Forward the update unchanged.
    Pass,
    /// Forward the given value in place of the update.
    Replace(Value),
    /// Do not forward the update to the observers.
    Suppress,
}

/// A hook run on every update of a [`VirtualDevice`].
pub trait VirtualDeviceProcessor: Send + Sync {
    /// Processes `value` of `property` notified by `device`.
    ///
    /// # Errors
    ///
    /// A failure is logged by the device and counts as [`Verdict::Pass`].
    fn process_value_update(
        &self,
        device: &VirtualDevice,
        property: Property,
        value: Value,
    ) -> Result<Verdict>;
}

/// A hook run on every availability change.
pub trait AvailabilityProcessor: Send + Sync {
    /// Processes the new `availability` of the device named `name`.
    ///
    /// # Errors
    ///
    /// A failure is logged and does not stop the other processors.
    fn process_availability_update(&self, name: &str, availability: Availability) -> Result<()>;
}

/// Logs availability transitions.
///
/// Unavailability is always a warning. Availability is logged at `info`
/// level in verbose mode only.
#[derive(Debug, Default)]
pub struct AvailabilityLogger {
    verbose: bool,
    last: Mutex<HashMap<String, Availability>>,
}

impl AvailabilityLogger {
    /// Creates an [`AvailabilityLogger`].
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            last: Mutex::new(HashMap::new()),
        }
    }
}

impl AvailabilityProcessor for AvailabilityLogger {
    fn process_availability_update(&self, name: &str, availability: Availability) -> Result<()> {
        if lock(&self.last).insert(name.into(), availability) == Some(availability) {
            return Ok(());
        }

        match availability {
            Availability::Available if self.verbose => info!("{name} is available"),
            Availability::Unavailable => warn!("{name} is unavailable"),
            Availability::Unknown if self.verbose => debug!("{name} availability is unknown"),
            Availability::Available | Availability::Unknown => {}
        }
        Ok(())
    }
}

/// Logs every update, at `info` level in verbose mode and at `debug` level
/// otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtualDeviceLogger {
    verbose: bool,
}

impl VirtualDeviceLogger {
    /// Creates a [`VirtualDeviceLogger`].
    #[must_use]
    pub const fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl VirtualDeviceProcessor for VirtualDeviceLogger {
    fn process_value_update(
        &self,
        device: &VirtualDevice,
        property: Property,
        value: Value,
    ) -> Result<Verdict> {
        if self.verbose {
            info!("[{}] {property} = {value}", device.friendly_name());
        } else {
            debug!("[{}] {property} = {value}", device.friendly_name());
        }
        Ok(Verdict::Pass)
    }
}

/// Publishes every update on the canonical tree.
///
/// An update of `property` is published, retained, on
/// `<canonical_base>/device/<friendly_name>/<node>/<name>`.
pub struct PropertyPublisher {
    transport: Arc<dyn Transport>,
    canonical_base: String,
}

impl PropertyPublisher {
    /// Creates a [`PropertyPublisher`].
    pub fn new(transport: Arc<dyn Transport>, canonical_base: impl Into<String>) -> Self {
        Self {
            transport,
            canonical_base: canonical_base.into(),
        }
    }

    /// Returns the topic on which `property` of `friendly_name` is published.
    #[must_use]
    pub fn topic(&self, friendly_name: &str, property: Property) -> String {
        format!(
            "{}/device/{friendly_name}/{}/{}",
            self.canonical_base,
            property.node(),
            property.name()
        )
    }
}

impl VirtualDeviceProcessor for PropertyPublisher {
    fn process_value_update(
        &self,
        device: &VirtualDevice,
        property: Property,
        value: Value,
    ) -> Result<Verdict> {
        let topic = self.topic(device.friendly_name(), property);
        self.transport
            .publish(&topic, value.to_string().as_bytes(), true)?;
        Ok(Verdict::Pass)
    }
}

/// Publishes availability changes on the canonical tree.
///
/// The state of a device named `name` is published, retained, on
/// `<canonical_base>/device/<name>/$state` as `init`, `ready` or
/// `disconnected`.
pub struct AvailabilityPublisher {
    transport: Arc<dyn Transport>,
    canonical_base: String,
}

impl AvailabilityPublisher {
    /// Creates an [`AvailabilityPublisher`].
    pub fn new(transport: Arc<dyn Transport>, canonical_base: impl Into<String>) -> Self {
        Self {
            transport,
            canonical_base: canonical_base.into(),
        }
    }

    /// Returns the canonical state of `availability`.
    #[must_use]
    pub const fn state(availability: Availability) -> &'static str {
        match availability {
            Availability::Unknown => "init",
            Availability::Available => "ready",
            Availability::Unavailable => "disconnected",
        }
    }
}

impl AvailabilityProcessor for AvailabilityPublisher {
    fn process_availability_update(&self, name: &str, availability: Availability) -> Result<()> {
        let topic = format!("{}/device/{name}/$state", self.canonical_base);
        self.transport
            .publish(&topic, Self::state(availability).as_bytes(), true)
    }
}

fn wrong_property(processor: &str, device: &VirtualDevice, property: Property) -> Error {
    Error::new(
        ErrorKind::Processor,
        format!("{processor} attached to {device} cannot process `{property}`"),
    )
}

/// Forwards occupancy to the observers only when motion is detected.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionTrigger;

impl VirtualDeviceProcessor for MotionTrigger {
    fn process_value_update(
        &self,
        device: &VirtualDevice,
        property: Property,
        value: Value,
    ) -> Result<Verdict> {
        if property != Property::Occupancy {
            return Err(wrong_property("Motion trigger", device, property));
        }

        if value.as_bool() == Some(true) {
            info!("[{}] motion detected", device.friendly_name());
            Ok(Verdict::Pass)
        } else {
            Ok(Verdict::Suppress)
        }
    }
}

/// Turns raw button actions into presses.
///
/// `press` is held back until the matching `release`, which is forwarded
/// as a single press if it comes before `long_press` has elapsed and as a
/// long press otherwise. Other actions are forwarded unchanged.
#[derive(Debug)]
pub struct ButtonTrigger {
    long_press: Duration,
    pressed_at: Mutex<HashMap<String, Instant>>,
}

impl ButtonTrigger {
    /// Creates a [`ButtonTrigger`].
    #[must_use]
    pub fn new(long_press: Duration) -> Self {
        Self {
            long_press,
            pressed_at: Mutex::new(HashMap::new()),
        }
    }
}

impl VirtualDeviceProcessor for ButtonTrigger {
    fn process_value_update(
        &self,
        device: &VirtualDevice,
        property: Property,
        value: Value,
    ) -> Result<Verdict> {
        let Some(action) = value.as_action() else {
            return Err(wrong_property("Button trigger", device, property));
        };

        let name = device.friendly_name();
        match action {
            ButtonAction::Press => {
                let _ = lock(&self.pressed_at).insert(name.into(), Instant::now());
                Ok(Verdict::Suppress)
            }
            ButtonAction::Release => {
                let Some(pressed_at) = lock(&self.pressed_at).remove(name) else {
                    debug!("[{name}] release without press");
                    return Ok(Verdict::Suppress);
                };

                let action = if pressed_at.elapsed() < self.long_press {
                    ButtonAction::Single
                } else {
                    ButtonAction::Long
                };
                debug!("[{name}] release detected as {action}");
                Ok(Verdict::Replace(action.into()))
            }
            ButtonAction::Single | ButtonAction::Double | ButtonAction::Long => {
                Ok(Verdict::Pass)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::device::VirtualDevice;
    use crate::error::ErrorKind;
    use crate::tests::MockTransport;
    use crate::transport::Transport;
    use crate::value::{Availability, ButtonAction, DeviceKind, Property, Value};

    use super::{
        AvailabilityProcessor, AvailabilityPublisher, ButtonTrigger, MotionTrigger,
        PropertyPublisher, Verdict, VirtualDeviceProcessor,
    };

    #[test]
    fn property_publisher_topics() {
        let transport = Arc::new(MockTransport::default());
        let publisher = PropertyPublisher::new(transport.clone(), "canonical");
        let device = VirtualDevice::new(DeviceKind::Temperature, "kitchen");

        assert_eq!(
            publisher.process_value_update(&device, Property::Temperature, Value::Float(21.5)),
            Ok(Verdict::Pass)
        );
        assert_eq!(
            transport.published(),
            [(
                String::from("canonical/device/kitchen/sensor/temperature"),
                String::from("21.5"),
                true
            )]
        );
        assert_eq!(
            publisher.topic("lamp", Property::Power1),
            "canonical/device/lamp/switch1/power"
        );
    }

    #[test]
    fn property_publisher_disconnected() {
        let transport = Arc::new(MockTransport::default());
        transport.set_connected(false);
        let publisher = PropertyPublisher::new(transport.clone(), "canonical");
        let device = VirtualDevice::new(DeviceKind::Switch, "lamp");

        let error = publisher
            .process_value_update(&device, Property::Power, Value::Bool(true))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::PublishFailure);
        assert!(!transport.is_connected());
    }

    #[test]
    fn availability_publisher_states() {
        let transport = Arc::new(MockTransport::default());
        let publisher = AvailabilityPublisher::new(transport.clone(), "canonical");

        for availability in [
            Availability::Unknown,
            Availability::Available,
            Availability::Unavailable,
        ] {
            publisher
                .process_availability_update("hall", availability)
                .unwrap();
        }

        let payloads: Vec<_> = transport
            .published()
            .into_iter()
            .map(|(topic, payload, retain)| {
                assert_eq!(topic, "canonical/device/hall/$state");
                assert!(retain);
                payload
            })
            .collect();
        assert_eq!(payloads, ["init", "ready", "disconnected"]);
    }

    #[test]
    fn motion_trigger() {
        let device = VirtualDevice::new(DeviceKind::Motion, "hall");
        let trigger = MotionTrigger;

        assert_eq!(
            trigger.process_value_update(&device, Property::Occupancy, Value::Bool(true)),
            Ok(Verdict::Pass)
        );
        assert_eq!(
            trigger.process_value_update(&device, Property::Occupancy, Value::Bool(false)),
            Ok(Verdict::Suppress)
        );
        assert_eq!(
            trigger
                .process_value_update(&device, Property::Temperature, Value::Float(1.))
                .unwrap_err()
                .kind(),
            ErrorKind::Processor
        );
    }

    #[tokio::test(start_paused = true)]
    async fn button_trigger_press_duration() {
        let device = VirtualDevice::new(DeviceKind::Button, "remote");
        let trigger = ButtonTrigger::new(Duration::from_secs(2));
        let press: Value = ButtonAction::Press.into();
        let release: Value = ButtonAction::Release.into();

        assert_eq!(
            trigger.process_value_update(&device, Property::Action, press),
            Ok(Verdict::Suppress)
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(
            trigger.process_value_update(&device, Property::Action, release),
            Ok(Verdict::Replace(ButtonAction::Single.into()))
        );

        let _ = trigger.process_value_update(&device, Property::Action, press);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            trigger.process_value_update(&device, Property::Action, release),
            Ok(Verdict::Replace(ButtonAction::Long.into()))
        );

        // Release without a press.
        assert_eq!(
            trigger.process_value_update(&device, Property::Action, release),
            Ok(Verdict::Suppress)
        );
        assert_eq!(
            trigger.process_value_update(&device, Property::Action, ButtonAction::Double.into()),
            Ok(Verdict::Pass)
        );
    }
}
