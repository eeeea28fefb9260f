//! The `devlink-mqtt` library crate connects `devlink` bridges to an `MQTT`
//! broker.
//!
//! It provides:
//!
//! - An `MQTT` v5 client implementing the `devlink` transport interface. The
//!   client runs its network loop on `tokio`, reconnects after failures and
//!   reports every (re)connection to the registered message handlers
//! - A configuration loadable from `JSON`
//! - A listener of the device list published by `zigbee2mqtt`, which turns
//!   each end device into a descriptor usable by the codec registry

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// An `MQTT` client.
pub mod client;
/// Broker configuration.
pub mod config;
/// Device discovery.
pub mod discovery;
