use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// The kind of value a [`Property`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// A boolean.
    Bool,
    /// A signed integer.
    Int,
    /// A floating point number.
    Float,
    /// A [`ButtonAction`].
    Action,
}

/// A canonical property of a virtual device.
///
/// A property is written as `node.name`, for example `switch.power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    /// Alarm state.
    Alarm,
    /// Analog voltage reading.
    Voltage,
    /// Button action.
    Action,
    /// Soil conductivity.
    Conductivity,
    /// Relative humidity.
    Humidity,
    /// Light level.
    Light,
    /// Motion occupancy.
    Occupancy,
    /// Power state of a single-channel switch.
    Power,
    /// Power state of the first channel of a dual switch.
    Power0,
    /// Power state of the second channel of a dual switch.
    Power1,
    /// Temperature.
    Temperature,
}

impl Property {
    /// Returns the node owning the property.
    #[must_use]
    pub const fn node(self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::Power => "switch",
            Self::Power0 => "switch0",
            Self::Power1 => "switch1",
            Self::Voltage
            | Self::Action
            | Self::Conductivity
            | Self::Humidity
            | Self::Light
            | Self::Occupancy
            | Self::Temperature => "sensor",
        }
    }

    /// Returns the property name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::Voltage => "voltage",
            Self::Action => "action",
            Self::Conductivity => "conductivity",
            Self::Humidity => "humidity",
            Self::Light => "light",
            Self::Occupancy => "occupancy",
            Self::Power | Self::Power0 | Self::Power1 => "power",
            Self::Temperature => "temperature",
        }
    }

    /// Returns the [`ValueKind`] the property holds.
    #[must_use]
    pub const fn kind(self) -> ValueKind {
        match self {
            Self::Alarm | Self::Occupancy | Self::Power | Self::Power0 | Self::Power1 => {
                ValueKind::Bool
            }
            Self::Voltage | Self::Temperature => ValueKind::Float,
            Self::Conductivity | Self::Humidity | Self::Light => ValueKind::Int,
            Self::Action => ValueKind::Action,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node(), self.name())
    }
}

/// An action reported by a button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ButtonAction {
    /// Single, or short, press.
    Single,
    /// Double press.
    Double,
    /// Long press.
    Long,
    /// The button has been pressed and is still held.
    Press,
    /// The button has been released.
    Release,
}

impl ButtonAction {
    /// Returns the wire label of the action.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Double => "double",
            Self::Long => "long",
            Self::Press => "press",
            Self::Release => "release",
        }
    }

    /// Parses an action from its wire label.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "single" => Some(Self::Single),
            "double" => Some(Self::Double),
            "long" => Some(Self::Long),
            "press" | "hold" => Some(Self::Press),
            "release" => Some(Self::Release),
            _ => None,
        }
    }
}

impl fmt::Display for ButtonAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.label().fmt(f)
    }
}

/// A property value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating point value.
    Float(f64),
    /// A button action.
    Action(ButtonAction),
}

impl Value {
    /// Returns the [`ValueKind`] of the value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
            Self::Action(_) => ValueKind::Action,
        }
    }

    /// Returns the boolean value, if any.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the button action, if any.
    #[must_use]
    pub const fn as_action(&self) -> Option<ButtonAction> {
        match self {
            Self::Action(action) => Some(*action),
            _ => None,
        }
    }

    // Checks the value against the kind a property expects and normalises it.
    //
    // Integers are accepted where floats are expected, and floats are rounded
    // to one decimal.
    pub(crate) fn conform_to(self, property: Property) -> Result<Self> {
        match (property.kind(), self) {
            (ValueKind::Float, Self::Float(v)) => Ok(Self::Float(round_tenth(v))),
            #[allow(clippy::cast_precision_loss)]
            (ValueKind::Float, Self::Int(v)) => Ok(Self::Float(v as f64)),
            (kind, value) if kind == value.kind() => Ok(value),
            (kind, value) => Err(Error::new(
                ErrorKind::InvalidValue,
                format!("Value `{value}` is not of kind {kind:?} for property `{property}`"),
            )),
        }
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.).round() / 10.
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => value.fmt(f),
            Self::Int(value) => value.fmt(f),
            Self::Float(value) => value.fmt(f),
            Self::Action(action) => action.fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<ButtonAction> for Value {
    fn from(action: ButtonAction) -> Self {
        Self::Action(action)
    }
}

/// Availability of a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Availability {
    /// No availability information has been received yet, or it could not
    /// be understood.
    #[default]
    Unknown,
    /// The device is online.
    Available,
    /// The device is offline.
    Unavailable,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => "unknown",
            Self::Available => "available",
            Self::Unavailable => "unavailable",
        }
        .fmt(f)
    }
}

/// The kind of a virtual device.
///
/// The kind fixes the primary property of a device and whether it can be
/// commanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A single-channel switch.
    Switch,
    /// The first channel of a dual switch.
    Switch0,
    /// The second channel of a dual switch.
    Switch1,
    /// A siren.
    Alarm,
    /// A temperature sensor.
    Temperature,
    /// A humidity sensor.
    Humidity,
    /// A light sensor.
    Light,
    /// A conductivity sensor.
    Conductivity,
    /// An analog-to-digital converter.
    Adc,
    /// A button.
    Button,
    /// A motion sensor.
    Motion,
}

impl DeviceKind {
    /// Returns the primary [`Property`] of the kind.
    #[must_use]
    pub const fn property(self) -> Property {
        match self {
            Self::Switch => Property::Power,
            Self::Switch0 => Property::Power0,
            Self::Switch1 => Property::Power1,
            Self::Alarm => Property::Alarm,
            Self::Temperature => Property::Temperature,
            Self::Humidity => Property::Humidity,
            Self::Light => Property::Light,
            Self::Conductivity => Property::Conductivity,
            Self::Adc => Property::Voltage,
            Self::Button => Property::Action,
            Self::Motion => Property::Occupancy,
        }
    }

    /// Whether a device of this kind can be commanded.
    #[must_use]
    pub const fn is_operable(self) -> bool {
        matches!(
            self,
            Self::Switch | Self::Switch0 | Self::Switch1 | Self::Alarm
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{ButtonAction, DeviceKind, Property, Value, ValueKind};
    use crate::error::ErrorKind;

    #[test]
    fn property_names() {
        assert_eq!(Property::Power.to_string(), "switch.power");
        assert_eq!(Property::Power0.to_string(), "switch0.power");
        assert_eq!(Property::Temperature.to_string(), "sensor.temperature");
        assert_eq!(Property::Alarm.to_string(), "alarm.alarm");
    }

    #[test]
    fn conform_values() {
        assert_eq!(
            Value::Float(21.345).conform_to(Property::Temperature),
            Ok(Value::Float(21.3))
        );
        assert_eq!(
            Value::Int(12).conform_to(Property::Voltage),
            Ok(Value::Float(12.))
        );
        assert_eq!(
            Value::Bool(true).conform_to(Property::Power),
            Ok(Value::Bool(true))
        );

        let error = Value::Int(1).conform_to(Property::Occupancy).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn button_labels() {
        assert_eq!(ButtonAction::from_label("hold"), Some(ButtonAction::Press));
        assert_eq!(ButtonAction::from_label("long"), Some(ButtonAction::Long));
        assert_eq!(ButtonAction::from_label("triple"), None);
        assert_eq!(Value::from(ButtonAction::Double).to_string(), "double");
        assert_eq!(Value::from(ButtonAction::Double).kind(), ValueKind::Action);
    }

    #[test]
    fn operable_kinds() {
        assert!(DeviceKind::Switch1.is_operable());
        assert!(DeviceKind::Alarm.is_operable());
        assert!(!DeviceKind::Motion.is_operable());
        assert_eq!(DeviceKind::Adc.property(), Property::Voltage);
    }
}
