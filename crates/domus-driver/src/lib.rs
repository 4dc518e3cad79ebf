//! The `domus-driver` library crate drives networked home-automation
//! controllers, such as the Fibaro Home Center 2, and notifies every change
//! of their devices and variables to the subscribed applications.
//!
//! Each controller network is served by a driver running on its own
//! thread. A driver:
//!
//! - opens and, when lost, reopens the controller session, waiting between
//!   attempts according to a retry policy
//! - discovers devices and variables as nodes and drives each of them
//!   through a sequence of discovery stages
//! - materializes node attributes into values and keeps them up to date by
//!   long-polling the controller for state changes
//! - writes values back to the controller
//!
//! A driver thread blocks on an ordered set of signals and does exactly one
//! unit of work at every wake-up, so that stopping a driver, delivering
//! notifications, and processing controller responses always take
//! precedence over outbound requests.
//!
//! All drivers are owned by a `Manager`, which exposes nodes and values to
//! applications and delivers notifications to subscribers through a
//! notification bus.
//!
//! This crate does not depend on an asynchronous runtime: network requests
//! are performed by blocking worker threads.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

/// Notification bus and per-driver notification buffer.
pub mod bus;
/// Driver and manager configuration.
pub mod config;
/// The Home Center 2 transport.
pub mod controller;
/// The driver of a single controller network.
pub mod driver;
/// Error management.
pub mod error;
/// Binary event signals with watchers.
pub mod event;
/// The owner of all drivers.
pub mod manager;
/// Nodes and their discovery stages.
pub mod node;
/// Outbound work queues.
pub mod queue;
/// The transport contract and response routing.
pub mod transport;
/// Node values.
pub mod value;
/// Waits on multiple signals.
pub mod wait;
