use std::borrow::Cow;
use std::path::Path;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};

use domus::notification::{Notification, NotificationKind};
use domus::value::ValueId;

use indexmap::IndexMap;

use parking_lot::Mutex;

use tracing::{debug, error, info, warn};

use crate::bus::{NotificationBus, SubscriberCallback};
use crate::config::{DriverConfig, ManagerConfig, RetryPolicy};
use crate::controller::Hc2Controller;
use crate::driver::{Driver, Registry};
use crate::error::{Error, ErrorKind, Result};
use crate::event::WatcherContext;
use crate::node::Node;
use crate::transport::Transport;
use crate::value::Value;

fn registry_error(description: impl Into<Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Registry, description)
}

/// The lifecycle state of a managed driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    /// The driver has not yet identified its controller.
    Pending,
    /// The driver has identified its controller.
    Ready,
    /// The driver could not identify its controller, possibly after having
    /// been ready, and has stopped.
    Failed,
}

#[derive(Debug)]
struct ManagedDriver {
    driver: Driver,
    state: DriverState,
}

/// The owner of all drivers and of the [`NotificationBus`] they publish to.
///
/// A [`Manager`] is always shared through an [`Arc`], since every driver
/// reports its readiness back to it.
///
/// Values and nodes are only reachable through drivers which have
/// identified their controller.
#[derive(Debug)]
pub struct Manager {
    this: Weak<Manager>,
    drivers: Mutex<IndexMap<String, ManagedDriver>>,
    bus: Arc<NotificationBus>,
}

impl Manager {
    /// Creates a [`Manager`] without drivers.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            drivers: Mutex::new(IndexMap::new()),
            bus: Arc::new(NotificationBus::new()),
        })
    }

    /// Adds and starts the driver for a Home Center 2 controller.
    ///
    /// # Errors
    ///
    /// Fails when a driver for the same network exists and has not failed,
    /// or when the driver cannot be started.
    pub fn add_driver(&self, config: DriverConfig) -> Result<()> {
        let network_id = config.network_id().to_owned();
        let policy = config.reconnect_policy();
        self.add_driver_with(network_id, Hc2Controller::new(config), policy)
    }

    /// Adds and starts a driver over the given transport.
    ///
    /// A failed driver for the same network is replaced.
    ///
    /// # Errors
    ///
    /// Fails when a driver for the same network exists and has not failed,
    /// or when the driver cannot be started.
    pub fn add_driver_with(
        &self,
        network_id: impl Into<String>,
        transport: impl Transport + 'static,
        policy: impl RetryPolicy + 'static,
    ) -> Result<()> {
        let network_id = network_id.into();

        // A replaced driver is joined once the lock has been released.
        let _replaced = {
            let mut drivers = self.drivers.lock();

            let replaced = match drivers.get(&network_id) {
                Some(managed) if managed.state != DriverState::Failed => {
                    error!("Cannot add the driver for `{network_id}`, it already exists");
                    return Err(registry_error(format!(
                        "A driver for `{network_id}` already exists"
                    )));
                }
                Some(_) => drivers.shift_remove(&network_id),
                None => None,
            };

            let registry: Weak<dyn Registry> = self.this.clone();
            let driver = Driver::builder(network_id.as_str(), transport, Arc::clone(&self.bus))
                .policy(policy)
                .registry(registry)
                .start()?;

            info!("Driver for `{network_id}` added");
            let _ = drivers.insert(
                network_id,
                ManagedDriver {
                    driver,
                    state: DriverState::Pending,
                },
            );
            replaced
        };

        Ok(())
    }

    /// Reads a configuration file and adds all of its drivers.
    ///
    /// A driver which cannot be added is logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails when the configuration cannot be read.
    pub fn read_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let config = ManagerConfig::read(path)?;
        for driver in config.drivers {
            let network_id = driver.network_id().to_owned();
            if let Err(e) = self.add_driver(driver) {
                error!("Driver for `{network_id}` not added: {e}");
            }
        }
        Ok(())
    }

    /// Removes the driver of the given network, or all drivers when no
    /// network is given.
    ///
    /// Each removed driver is stopped and its thread joined.
    ///
    /// Returns the number of removed drivers.
    pub fn remove_driver(&self, network_id: Option<&str>) -> usize {
        let removed = {
            let mut drivers = self.drivers.lock();
            match network_id {
                Some(network_id) => drivers
                    .shift_remove(network_id)
                    .into_iter()
                    .collect::<Vec<_>>(),
                None => drivers.drain(..).map(|(_, managed)| managed).collect(),
            }
        };

        for managed in &removed {
            managed.driver.join();
            info!("Driver for `{}` removed", managed.driver.network_id());
        }
        removed.len()
    }

    /// Removes all drivers.
    pub fn close(&self) {
        let _ = self.remove_driver(None);
    }

    /// Returns the networks of all drivers in insertion order.
    #[must_use]
    pub fn network_ids(&self) -> Vec<String> {
        self.drivers.lock().keys().cloned().collect()
    }

    /// Returns the state of the driver of a network.
    #[must_use]
    pub fn driver_state(&self, network_id: &str) -> Option<DriverState> {
        self.drivers
            .lock()
            .get(network_id)
            .map(|managed| managed.state)
    }

    /// Checks whether the driver of a network has identified its
    /// controller.
    #[must_use]
    pub fn is_driver_ready(&self, network_id: &str) -> bool {
        self.driver_state(network_id) == Some(DriverState::Ready)
    }

    /// Subscribes to the notifications of all drivers.
    ///
    /// Returns `false` when the same pair is already subscribed.
    pub fn subscribe(&self, callback: SubscriberCallback, context: WatcherContext) -> bool {
        self.bus.subscribe(callback, context)
    }

    /// Removes a subscription.
    ///
    /// Returns `false` when the pair is not subscribed.
    pub fn unsubscribe(&self, callback: SubscriberCallback, context: &WatcherContext) -> bool {
        self.bus.unsubscribe(callback, context)
    }

    fn with_driver<R>(&self, network_id: &str, f: impl FnOnce(&Driver) -> Result<R>) -> Result<R> {
        let drivers = self.drivers.lock();
        match drivers.get(network_id) {
            Some(managed) if managed.state == DriverState::Ready => f(&managed.driver),
            Some(_) => Err(registry_error(format!(
                "The driver for `{network_id}` is not ready"
            ))),
            None => Err(registry_error(format!(
                "No driver for `{network_id}`"
            ))),
        }
    }

    fn with_node<R>(
        &self,
        network_id: &str,
        node_id: &str,
        f: impl FnOnce(&Node) -> R,
    ) -> Result<R> {
        self.with_driver(network_id, |driver| {
            driver.with_node(node_id, f).ok_or_else(|| {
                Error::new(
                    ErrorKind::Value,
                    format!("Node `{node_id}` does not exist in `{network_id}`"),
                )
            })
        })
    }

    /// Returns a copy of a value.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the value does not exist.
    pub fn value(&self, value_id: &ValueId) -> Result<Value> {
        self.with_driver(value_id.network_id(), |driver| {
            driver.value(value_id).ok_or_else(|| {
                Error::new(
                    ErrorKind::Value,
                    format!("Value `{value_id}` does not exist"),
                )
            })
        })
    }

    /// Returns the display form of a value.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the value does not exist.
    pub fn value_as_string(&self, value_id: &ValueId) -> Result<String> {
        self.value(value_id).map(|value| value.as_display_string())
    }

    /// Returns the units of a value.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the value does not exist.
    pub fn value_units(&self, value_id: &ValueId) -> Result<String> {
        self.value(value_id).map(|value| value.units().to_owned())
    }

    /// Returns when a value has last changed.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the value does not exist.
    pub fn value_last_changed(&self, value_id: &ValueId) -> Result<DateTime<Utc>> {
        self.value(value_id).map(|value| value.last_changed())
    }

    /// Writes a value to its controller.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready, or when the value does not exist
    /// or cannot be written.
    pub fn set_value(&self, value_id: &ValueId, content: &str) -> Result<()> {
        self.with_driver(value_id.network_id(), |driver| {
            driver.set_value(value_id, content)
        })
    }

    /// Returns the identifiers of all nodes of a network.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready.
    pub fn node_ids(&self, network_id: &str) -> Result<Vec<String>> {
        self.with_driver(network_id, |driver| Ok(driver.node_ids()))
    }

    /// Returns the identifiers of all values of a node, in creation order.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn value_ids(&self, network_id: &str, node_id: &str) -> Result<Vec<ValueId>> {
        self.with_node(network_id, node_id, |node| {
            node.values().iter().map(|value| value.id().clone()).collect()
        })
    }

    /// Returns the name of a node.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn node_name(&self, network_id: &str, node_id: &str) -> Result<String> {
        self.with_node(network_id, node_id, Node::name)
    }

    /// Returns the type of a node.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn node_type(&self, network_id: &str, node_id: &str) -> Result<String> {
        self.with_node(network_id, node_id, Node::node_type)
    }

    /// Returns the description of a node.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn node_description(&self, network_id: &str, node_id: &str) -> Result<String> {
        self.with_node(network_id, node_id, Node::description)
    }

    /// Returns the name of the location of a node.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn node_location_name(&self, network_id: &str, node_id: &str) -> Result<String> {
        self.with_driver(network_id, |driver| {
            driver.location_name(node_id).ok_or_else(|| {
                Error::new(
                    ErrorKind::Value,
                    format!("Node `{node_id}` does not exist in `{network_id}`"),
                )
            })
        })
    }

    /// Checks whether a node is a light.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn is_node_light(&self, network_id: &str, node_id: &str) -> Result<bool> {
        self.with_node(network_id, node_id, Node::is_light)
    }

    /// Checks whether a node is reported as dead.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn is_node_dead(&self, network_id: &str, node_id: &str) -> Result<bool> {
        self.with_node(network_id, node_id, Node::is_dead)
    }

    /// Checks whether a node is battery operated.
    ///
    /// # Errors
    ///
    /// Fails when the driver is not ready or the node does not exist.
    pub fn is_node_battery_operated(&self, network_id: &str, node_id: &str) -> Result<bool> {
        self.with_node(network_id, node_id, Node::is_battery_operated)
    }
}

impl Registry for Manager {
    fn set_driver_ready(&self, network_id: &str, success: bool) {
        let mut drivers = self.drivers.lock();

        let Some(managed) = drivers.get_mut(network_id) else {
            warn!("Readiness reported by the unknown driver `{network_id}`");
            return;
        };

        // A reopened session reports ready again, while a failure is final.
        let repeated = match managed.state {
            DriverState::Pending => false,
            DriverState::Ready => success,
            DriverState::Failed => true,
        };
        if repeated {
            debug!("Driver for `{network_id}` is already {:?}", managed.state);
            return;
        }

        let kind = if success {
            info!("Driver for `{network_id}` is now ready");
            managed.state = DriverState::Ready;
            NotificationKind::DriverReady
        } else {
            error!("Driver for `{network_id}` has failed");
            managed.state = DriverState::Failed;
            managed.driver.stop();
            NotificationKind::DriverFailed
        };

        managed
            .driver
            .queue_notification(Notification::driver(kind, network_id));
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use domus::notification::NotificationKind;
    use domus::value::ValueId;

    use crate::config::BackoffPolicy;
    use crate::error::ErrorKind;
    use crate::tests::{Recorder, Script, ScriptedTransport, device_list, settings};

    use super::{DriverState, Manager};

    const NETWORK: &str = "HC2-000001";

    fn recorded(manager: &Manager) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        assert!(manager.subscribe(Recorder::callback(), recorder.clone()));
        recorder
    }

    fn add(manager: &Manager, network_id: &str) -> Arc<Script> {
        let script = Script::new(0);
        manager
            .add_driver_with(network_id, ScriptedTransport::new(&script), BackoffPolicy::new())
            .unwrap();
        assert!(script.wait_sent("/api/settings/info"));
        script
    }

    #[test]
    fn ready_driver_exposes_nodes_and_values() {
        let manager = Manager::new();
        let recorder = recorded(&manager);
        let script = add(&manager, NETWORK);

        assert_eq!(manager.driver_state(NETWORK), Some(DriverState::Pending));
        let error = manager.node_ids(NETWORK).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Registry);

        script.respond("/api/settings/info", &settings(NETWORK));
        assert!(recorder.wait_for(NotificationKind::DriverReady, 1));
        assert!(manager.is_driver_ready(NETWORK));

        script.respond("/api/rooms", r#"[{"id": 2, "name": "Kitchen"}]"#);
        script.respond("/api/devices", &device_list(&[4]));
        assert!(recorder.wait_for(NotificationKind::NodeQueriesComplete, 1));

        assert_eq!(manager.node_ids(NETWORK).unwrap(), ["4"]);
        assert_eq!(
            manager.value_ids(NETWORK, "4").unwrap(),
            [
                ValueId::new(NETWORK, "4", "dead"),
                ValueId::new(NETWORK, "4", "value")
            ]
        );
        assert_eq!(manager.node_name(NETWORK, "4").unwrap(), "Light 4");
        assert_eq!(manager.node_type(NETWORK, "4").unwrap(), "binary_light");
        assert_eq!(manager.node_location_name(NETWORK, "4").unwrap(), "Kitchen");
        assert!(manager.is_node_light(NETWORK, "4").unwrap());
        assert!(!manager.is_node_dead(NETWORK, "4").unwrap());
        assert!(!manager.is_node_battery_operated(NETWORK, "4").unwrap());

        let value_id = ValueId::new(NETWORK, "4", "value");
        assert_eq!(manager.value(&value_id).unwrap().as_str(), "0");
        assert_eq!(manager.value_as_string(&value_id).unwrap(), "off");
        assert_eq!(manager.value_units(&value_id).unwrap(), "");
        assert!(manager.value_last_changed(&value_id).is_ok());

        manager.set_value(&value_id, "1").unwrap();
        assert!(script.wait_sent("/api/callAction?deviceID=4&name=setValue&arg1=1"));

        let error = manager
            .value(&ValueId::new(NETWORK, "4", "armed"))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Value);
        let error = manager.node_name(NETWORK, "5").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Value);
        let error = manager.node_name("HC2-000002", "4").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Registry);
    }

    #[test]
    fn ready_is_reported_once() {
        let manager = Manager::new();
        let recorder = recorded(&manager);
        let script = add(&manager, NETWORK);

        script.respond("/api/settings/info", &settings(NETWORK));
        assert!(recorder.wait_for(NotificationKind::DriverReady, 1));

        // A reinitialized session identifies the controller again.
        script.fail("Connection reset");
        assert!(recorder.wait_for(NotificationKind::DriverReset, 1));
        assert!(script.wait_sent_count("/api/settings/info", 2));
        script.respond("/api/settings/info", &settings(NETWORK));
        assert!(script.wait_sent_count("/api/rooms", 2));

        assert_eq!(recorder.count(NotificationKind::DriverReady), 1);
        assert_eq!(recorder.count(NotificationKind::DriverFailed), 0);
        assert!(manager.is_driver_ready(NETWORK));
    }

    #[test]
    fn ready_driver_fails_after_reset() {
        let manager = Manager::new();
        let recorder = recorded(&manager);
        let script = add(&manager, NETWORK);

        script.respond("/api/settings/info", &settings(NETWORK));
        assert!(recorder.wait_for(NotificationKind::DriverReady, 1));

        // The controller answering the reopened session is another one.
        script.fail("Connection reset");
        assert!(script.wait_sent_count("/api/settings/info", 2));
        script.respond("/api/settings/info", &settings("HC2-999999"));

        assert!(recorder.wait_for(NotificationKind::DriverFailed, 1));
        assert_eq!(manager.driver_state(NETWORK), Some(DriverState::Failed));
        assert!(!manager.is_driver_ready(NETWORK));
        let error = manager.node_ids(NETWORK).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Registry);
        assert_eq!(recorder.count(NotificationKind::DriverReady), 1);
        assert_eq!(recorder.count(NotificationKind::DriverFailed), 1);
    }

    #[test]
    fn failed_driver_is_stopped_and_replaceable() {
        let manager = Manager::new();
        let recorder = recorded(&manager);
        let script = add(&manager, NETWORK);

        let error = manager
            .add_driver_with(NETWORK, ScriptedTransport::new(&Script::new(0)), BackoffPolicy::new())
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Registry);

        script.respond("/api/settings/info", &settings("HC2-999999"));
        assert!(recorder.wait_for(NotificationKind::DriverFailed, 1));
        assert_eq!(manager.driver_state(NETWORK), Some(DriverState::Failed));
        assert_eq!(recorder.count(NotificationKind::DriverFailed), 1);

        let script = add(&manager, NETWORK);
        script.respond("/api/settings/info", &settings(NETWORK));
        assert!(recorder.wait_for(NotificationKind::DriverReady, 1));
        assert_eq!(manager.network_ids(), [NETWORK]);
    }

    #[test]
    fn remove_drivers() {
        let manager = Manager::new();
        let _first = add(&manager, "HC2-000001");
        let _second = add(&manager, "HC2-000002");
        let _third = add(&manager, "HC2-000003");

        assert_eq!(manager.remove_driver(Some("HC2-000002")), 1);
        assert_eq!(manager.remove_driver(Some("HC2-000002")), 0);
        assert_eq!(manager.network_ids(), ["HC2-000001", "HC2-000003"]);

        manager.close();
        assert!(manager.network_ids().is_empty());
        assert_eq!(manager.driver_state("HC2-000001"), None);
    }

    #[test]
    fn subscriptions() {
        let manager = Manager::new();
        let recorder = recorded(&manager);
        let context: crate::event::WatcherContext = recorder.clone();

        assert!(!manager.subscribe(Recorder::callback(), context.clone()));
        assert!(manager.unsubscribe(Recorder::callback(), &context));
        assert!(!manager.unsubscribe(Recorder::callback(), &context));
    }

    #[test]
    fn missing_config_file() {
        let manager = Manager::new();
        let error = manager
            .read_config("/nonexistent/domus/manager.json")
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
