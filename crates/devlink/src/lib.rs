//! The `devlink` library crate translates vendor device messages into a
//! canonical device model and back.
//!
//! A physical device publishes its state on a message bus using the
//! conventions of its protocol. This crate provides APIs to:
//!
//! - Decode and encode the payloads of each supported protocol and model
//!   through a [`codec::Codec`] created by a [`registry::CodecRegistry`]
//! - Represent each facet of a physical device as a
//!   [`device::VirtualDevice`], which stores property values and can be
//!   started and stopped when it is operable
//! - Chain processors and observers on value and availability updates, so
//!   that a motion sensor or a button can drive a switch
//! - Bind codecs to a message-bus [`transport::Transport`] through a
//!   [`bridge::Bridge`]
//!
//! The transport itself is not part of this crate. The `devlink-mqtt` crate
//! implements it over `MQTT`.
//!
//! Countdowns run on the `tokio` runtime which is current when a device is
//! started.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod countdown;

/// A bridge between a codec and a transport.
pub mod bridge;
/// Protocol codecs.
pub mod codec;
/// Topic configuration.
pub mod config;
/// Virtual devices.
pub mod device;
/// Error management.
pub mod error;
/// Value and availability processors.
pub mod processor;
/// A registry of codec constructors.
pub mod registry;
/// The transport interface and its message dispatcher.
pub mod transport;
/// Canonical properties and values.
pub mod value;
