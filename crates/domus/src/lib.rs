//! The data model shared between a `domus` driver and the applications
//! subscribed to it.
//!
//! This crate provides:
//!
//! - Value identifiers. A value is a single named attribute of a node, such
//!   as the level of a dimmer or the state of a door sensor, and it is
//!   identified across the whole system by its network, its node and its
//!   value type.
//! - Notifications. Every observable change inside a driver, from a driver
//!   becoming ready to a single value changing, is described by an immutable
//!   notification delivered to subscribers.
//! - Query stages. A discovered node goes through a fixed sequence of
//!   discovery stages before its values are considered complete.
//!
//! All structures are serializable and deserializable, so that
//! notifications can be forwarded to other processes.
//!
//! This crate can be compiled for both `std` and `no_std` environments.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![no_std]

extern crate alloc;

/// Notification kinds and payloads.
pub mod notification;
/// Discovery stages of a node.
pub mod stage;
/// Value identifiers.
pub mod value;

#[cfg(test)]
pub(crate) fn serialize<T: serde::Serialize>(value: T) -> serde_json::Value {
    serde_json::to_value(value).unwrap()
}

#[cfg(test)]
pub(crate) fn deserialize<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> T {
    serde_json::from_value(value).unwrap()
}
