use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use domus::notification::{Notification, NotificationKind};
use domus::stage::QueryStage;
use domus::value::ValueId;

use hashbrown::HashSet;

use indexmap::IndexMap;

use parking_lot::Mutex;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use tracing::{debug, error, info, warn};

use crate::bus::{NotificationBuffer, NotificationBus};
use crate::config::{BackoffPolicy, RetryPolicy};
use crate::error::{Error, ErrorKind, Result};
use crate::event::EventSignal;
use crate::node::{
    Advance, DEVICE_VALUE_TYPES, Node, NodeContext, NodeInfo, NodeKind, VARIABLE_VALUE_TYPE,
};
use crate::queue::{MessageQueue, MessageQueueItem, QueueKind, Request};
use crate::transport::{Command, Inbound, Transport};
use crate::value::Value;
use crate::wait;

// Name of the location of devices outside of any room.
const UNASSIGNED_LOCATION: &str = "Unassigned";

// Controller statuses reported while devices are being included or excluded.
const LEARN_MODE_STATUSES: &[&str] = &["ZWAVE_LEARN_MODE_ADDING", "ZWAVE_LEARN_MODE_REMOVING"];

/// The owner of a set of drivers.
///
/// A driver reports to its registry whether it has managed to reach and
/// identify its controller.
pub trait Registry: Send + Sync {
    /// Marks the driver of the given network as ready or failed.
    ///
    /// It is called exactly once per transition of a driver into the ready
    /// or failed state.
    fn set_driver_ready(&self, network_id: &str, success: bool);
}

/// The identity and versions of a controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerInfo {
    /// Serial number, which identifies the network.
    pub serial_number: String,
    /// MAC address.
    #[serde(default)]
    pub mac: String,
    /// Firmware version.
    #[serde(default)]
    pub soft_version: String,
    /// Z-Wave stack version.
    #[serde(default)]
    pub zwave_version: String,
    /// Default user interface language.
    #[serde(default)]
    pub default_language: String,
}

#[derive(Deserialize)]
struct Room {
    id: u64,
    name: String,
}

#[derive(Deserialize)]
struct RefreshStates {
    status: String,
    #[serde(default)]
    changes: Vec<NodeInfo>,
}

// Nodes and everything they are resolved against, guarded by one lock.
#[derive(Debug, Default)]
struct NodeTable {
    nodes: IndexMap<String, Node>,
    locations: IndexMap<u64, String>,
    controller: ControllerInfo,
}

// Data shared between a driver handle and its thread.
#[derive(Debug)]
struct DriverShared {
    network_id: String,
    exit: EventSignal,
    notifications: Arc<NotificationBuffer>,
    command: Arc<MessageQueue>,
    query: Arc<MessageQueue>,
    table: Mutex<NodeTable>,
}

impl DriverShared {
    fn new(network_id: String) -> Self {
        Self {
            network_id,
            exit: EventSignal::new("Exit"),
            notifications: Arc::new(NotificationBuffer::new()),
            command: Arc::new(MessageQueue::new(QueueKind::Command)),
            query: Arc::new(MessageQueue::new(QueueKind::Query)),
            table: Mutex::new(NodeTable::default()),
        }
    }

    fn node_context(&self) -> NodeContext {
        NodeContext::new(
            &self.network_id,
            Arc::clone(&self.command),
            Arc::clone(&self.query),
            Arc::clone(&self.notifications),
        )
    }

    fn send(&self, path: impl Into<String>) {
        self.command
            .enqueue(MessageQueueItem::SendRequest(Request::get(path)));
    }

    fn notify(&self, kind: NotificationKind) {
        self.notifications
            .push(Notification::driver(kind, &*self.network_id));
    }

    // Signals a driver waits on, in priority order.
    fn signals<'a>(&'a self, data: &'a EventSignal) -> [&'a EventSignal; 5] {
        [
            &self.exit,
            self.notifications.signal(),
            data,
            self.command.signal(),
            self.query.signal(),
        ]
    }
}

// The sources a driver waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitSource {
    Exit,
    Notifications,
    Data,
    Command,
    Query,
}

impl WaitSource {
    const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::Exit),
            1 => Some(Self::Notifications),
            2 => Some(Self::Data),
            3 => Some(Self::Command),
            4 => Some(Self::Query),
            _ => None,
        }
    }
}

// What a driver does once a controller session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Stop,
    Reinitialize,
}

/// A builder of a [`Driver`].
pub struct DriverBuilder {
    network_id: String,
    transport: Box<dyn Transport>,
    bus: Arc<NotificationBus>,
    policy: Box<dyn RetryPolicy>,
    registry: Option<Weak<dyn Registry>>,
}

impl DriverBuilder {
    /// Sets the [`RetryPolicy`] used when the controller session cannot be
    /// opened.
    ///
    /// A [`BackoffPolicy`] with default parameters is used otherwise.
    #[must_use]
    #[inline]
    pub fn policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Sets the [`Registry`] the driver reports to.
    ///
    /// Without a registry, the driver notifies its own readiness and stops
    /// itself on failure.
    #[must_use]
    #[inline]
    pub fn registry(mut self, registry: Weak<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Starts the driver thread.
    ///
    /// # Errors
    ///
    /// Fails when the driver thread cannot be spawned.
    pub fn start(self) -> Result<Driver> {
        let shared = Arc::new(DriverShared::new(self.network_id));

        let driver_loop = DriverLoop {
            shared: Arc::clone(&shared),
            transport: self.transport,
            policy: self.policy,
            registry: self.registry,
            bus: self.bus,
            devices: HashSet::new(),
            variables: HashSet::new(),
            devices_listed: false,
            variables_listed: false,
            all_nodes_queried: false,
        };

        let handle = thread::Builder::new()
            .name(format!("driver-{}", shared.network_id))
            .spawn(move || driver_loop.run())
            .map_err(|e| {
                Error::new(
                    ErrorKind::Initialization,
                    format!("Cannot spawn the driver thread: {e}"),
                )
            })?;

        Ok(Driver {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// A driver for a single controller network.
///
/// Each driver runs on its own thread, which opens the controller session,
/// discovers all devices and variables as nodes, and keeps their values up
/// to date. Every observable change is delivered to the subscribers of the
/// [`NotificationBus`] the driver has been started with.
///
/// The thread waits on, in priority order: its exit signal, its pending
/// notifications, the controller responses, its command queue and its
/// query queue. Exactly one unit of work is done at every wake-up.
#[derive(Debug)]
pub struct Driver {
    shared: Arc<DriverShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Driver {
    /// Creates a [`DriverBuilder`] for the given network, transport, and
    /// notification bus.
    #[must_use]
    pub fn builder(
        network_id: impl Into<String>,
        transport: impl Transport + 'static,
        bus: Arc<NotificationBus>,
    ) -> DriverBuilder {
        DriverBuilder {
            network_id: network_id.into(),
            transport: Box::new(transport),
            bus,
            policy: Box::new(BackoffPolicy::default()),
            registry: None,
        }
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.shared.network_id
    }

    /// Asks the driver thread to terminate.
    ///
    /// The thread terminates at its next wake-up, without processing any
    /// queued work.
    pub fn stop(&self) {
        self.shared.exit.set();
    }

    /// Stops the driver and waits for its thread to terminate.
    ///
    /// Nothing is awaited when called from the driver thread itself.
    pub fn join(&self) {
        self.stop();
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("The driver thread for `{}` has panicked", self.network_id());
        }
    }

    /// Checks whether the driver thread has terminated.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Queues a notification for delivery by the driver thread.
    pub fn queue_notification(&self, notification: Notification) {
        self.shared.notifications.push(notification);
    }

    /// Returns the identity of the controller, once received.
    #[must_use]
    pub fn controller_info(&self) -> ControllerInfo {
        self.shared.table.lock().controller.clone()
    }

    /// Returns the identifiers of all nodes in discovery order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.shared.table.lock().nodes.keys().cloned().collect()
    }

    /// Runs a closure on a node under the node table lock.
    ///
    /// Returns [`None`] when the node does not exist.
    pub fn with_node<R>(&self, node_id: &str, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.shared.table.lock().nodes.get(node_id).map(f)
    }

    /// Returns a copy of a value.
    #[must_use]
    pub fn value(&self, value_id: &ValueId) -> Option<Value> {
        self.with_node(value_id.node_id(), |node| {
            node.value(value_id.value_type()).cloned()
        })
        .flatten()
    }

    /// Writes a value to the controller.
    ///
    /// # Errors
    ///
    /// Fails when the value does not exist or cannot be written.
    pub fn set_value(&self, value_id: &ValueId, content: &str) -> Result<()> {
        let table = self.shared.table.lock();
        let node = table.nodes.get(value_id.node_id()).ok_or_else(|| {
            Error::new(
                ErrorKind::Value,
                format!("Node `{}` does not exist", value_id.node_id()),
            )
        })?;
        node.set_value(value_id.value_type(), content)
    }

    /// Returns the name of the location of a node.
    ///
    /// Devices outside of any room are `Unassigned`, devices in an unknown
    /// room and variables are located on the controller itself.
    #[must_use]
    pub fn location_name(&self, node_id: &str) -> Option<String> {
        let table = self.shared.table.lock();
        let node = table.nodes.get(node_id)?;

        Some(match (node.kind(), node.location()) {
            (NodeKind::Variable, _) => self.shared.network_id.clone(),
            (NodeKind::Device, Some(0)) => UNASSIGNED_LOCATION.into(),
            (NodeKind::Device, location) => location
                .and_then(|location| table.locations.get(&location).cloned())
                .unwrap_or_else(|| table.controller.serial_number.clone()),
        })
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.join();
    }
}

// The state owned by a driver thread.
struct DriverLoop {
    shared: Arc<DriverShared>,
    transport: Box<dyn Transport>,
    policy: Box<dyn RetryPolicy>,
    registry: Option<Weak<dyn Registry>>,
    bus: Arc<NotificationBus>,
    devices: HashSet<String>,
    variables: HashSet<String>,
    devices_listed: bool,
    variables_listed: bool,
    all_nodes_queried: bool,
}

impl DriverLoop {
    fn run(mut self) {
        let network_id = self.shared.network_id.clone();
        info!(network = %network_id, "Driver started");

        let mut failed_attempts = 0;

        while !self.shared.exit.is_set() {
            self.devices_listed = false;
            self.variables_listed = false;
            self.all_nodes_queried = false;

            info!(network = %network_id, "Opening the controller session, attempt {failed_attempts}");

            match self.transport.open(&network_id) {
                Ok(()) => {
                    failed_attempts = 0;
                    if self.serve() == Flow::Stop {
                        break;
                    }
                }
                Err(e) => {
                    error!(network = %network_id, "Cannot open the controller session: {e}");
                    failed_attempts += 1;

                    let Some(delay) = self.policy.delay(failed_attempts) else {
                        error!(network = %network_id, "Maximum number of attempts exceeded");
                        self.report_ready(false);
                        let _ = self.shared.notifications.drain_into(&self.bus);
                        break;
                    };

                    debug!(network = %network_id, "Waiting {delay:?} before the next attempt");
                    if wait::single(&self.shared.exit, Some(delay)) {
                        break;
                    }
                }
            }
        }

        self.transport.close();
        info!(network = %network_id, "Driver stopped");
    }

    fn serve(&mut self) -> Flow {
        let data = self.transport.data_signal();
        let shared = Arc::clone(&self.shared);

        loop {
            let signals = shared.signals(&data);
            let Some(source) = wait::multiple(&signals, None).and_then(WaitSource::from_index)
            else {
                continue;
            };

            match source {
                WaitSource::Exit => {
                    debug!(network = %shared.network_id, "Exit signaled");
                    return Flow::Stop;
                }
                WaitSource::Notifications => {
                    let _ = shared.notifications.drain_into(&self.bus);
                }
                WaitSource::Data => {
                    if let Some(inbound) = self.transport.receive()
                        && let Some(flow) = self.handle(inbound)
                    {
                        return flow;
                    }
                }
                WaitSource::Command => {
                    if let Some(item) = shared.command.dequeue()
                        && let Some(flow) = self.execute(item)
                    {
                        return flow;
                    }
                }
                WaitSource::Query => {
                    if let Some(item) = shared.query.dequeue()
                        && let Some(flow) = self.execute(item)
                    {
                        return flow;
                    }
                }
            }
        }
    }

    fn execute(&mut self, item: MessageQueueItem) -> Option<Flow> {
        match item {
            MessageQueueItem::SendRequest(request) => {
                debug!(
                    network = %self.shared.network_id,
                    "Sending `{} {}`",
                    request.method(),
                    request.path()
                );
                if let Err(e) = self.transport.send(&request) {
                    error!(network = %self.shared.network_id, "Cannot send a request: {e}");
                    return Some(self.reset_session());
                }
                None
            }
            MessageQueueItem::QueryStageComplete { node_id, stage } => {
                self.stage_complete(&node_id, stage);
                None
            }
        }
    }

    fn stage_complete(&mut self, node_id: &str, stage: QueryStage) {
        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock();

        let Some(node) = table.nodes.get_mut(node_id) else {
            debug!(network = %shared.network_id, node = %node_id, "Stage complete for a removed node");
            return;
        };

        if node.accept_stage_complete(stage) {
            info!(network = %shared.network_id, node = %node_id, "Query stage {stage} complete");
            if node.advance() == Advance::Complete {
                self.check_all_nodes_queried(&table);
            }
        }
    }

    fn check_all_nodes_queried(&mut self, table: &NodeTable) {
        if self.all_nodes_queried || !self.devices_listed || !self.variables_listed {
            return;
        }

        if let Some(node) = table
            .nodes
            .values()
            .find(|node| !node.query_stage().is_complete())
        {
            debug!(
                network = %self.shared.network_id,
                node = %node.id(),
                "Node still at stage {}",
                node.query_stage()
            );
            return;
        }

        info!(network = %self.shared.network_id, "All node queries complete");
        self.all_nodes_queried = true;
        self.shared.notify(NotificationKind::AllNodesQueried);
        self.shared.send("/api/refreshStates");
    }

    fn report_ready(&self, success: bool) {
        match self.registry.as_ref().and_then(Weak::upgrade) {
            Some(registry) => registry.set_driver_ready(&self.shared.network_id, success),
            None => {
                self.shared.notify(if success {
                    NotificationKind::DriverReady
                } else {
                    NotificationKind::DriverFailed
                });
                if !success {
                    self.shared.exit.set();
                }
            }
        }
    }

    // Drops the session and notifies the reset.
    fn reset_session(&mut self) -> Flow {
        let _ = self.shared.notifications.drain_into(&self.bus);
        self.transport.close();
        self.shared.notify(NotificationKind::DriverReset);
        let _ = self.shared.notifications.drain_into(&self.bus);
        Flow::Reinitialize
    }

    fn handle(&mut self, inbound: Inbound) -> Option<Flow> {
        let Inbound {
            command,
            params,
            response,
        } = inbound;

        match command {
            Command::SettingsInfo => return self.settings_info(&response),
            Command::Rooms => self.rooms(&response),
            Command::Devices => self.nodes(NodeKind::Device, &response),
            Command::GlobalVariables => self.nodes(NodeKind::Variable, &response),
            Command::RefreshStates => self.refresh_states(&response),
            Command::CallAction => {
                debug!(network = %self.shared.network_id, "Action executed: {}", params.unwrap_or_default());
            }
            Command::Error => {
                error!(
                    network = %self.shared.network_id,
                    "Controller error reported, reinitializing the session: {response}"
                );
                return Some(self.reset_session());
            }
            Command::LoginStatus | Command::Unknown(_) => {
                warn!(
                    network = %self.shared.network_id,
                    "Unhandled response: command={command}, parameters={}, response={response}",
                    params.unwrap_or_default()
                );
            }
        }
        None
    }

    fn settings_info(&mut self, response: &str) -> Option<Flow> {
        let controller: ControllerInfo = match serde_json::from_str(response) {
            Ok(controller) => controller,
            Err(e) => {
                error!(network = %self.shared.network_id, "Invalid settings: {e}");
                return None;
            }
        };

        let serial_number = controller.serial_number.clone();
        self.shared.table.lock().controller = controller;

        if serial_number != self.shared.network_id {
            error!(
                network = %self.shared.network_id,
                "Serial number mismatch: configured `{}`, received `{serial_number}`",
                self.shared.network_id
            );
            self.report_ready(false);
            let _ = self.shared.notifications.drain_into(&self.bus);
            return Some(Flow::Stop);
        }

        info!(network = %self.shared.network_id, "Controller identified");
        self.report_ready(true);

        self.shared.send("/api/rooms");
        self.shared.send("/api/devices");
        self.shared.send("/api/globalVariables");
        None
    }

    fn rooms(&mut self, response: &str) {
        match serde_json::from_str::<Vec<Room>>(response) {
            Ok(rooms) => {
                self.shared.table.lock().locations =
                    rooms.into_iter().map(|room| (room.id, room.name)).collect();
            }
            Err(e) => error!(network = %self.shared.network_id, "Invalid rooms: {e}"),
        }
    }

    fn nodes(&mut self, kind: NodeKind, response: &str) {
        let (infos, full_list) = match serde_json::from_str::<JsonValue>(response) {
            Ok(JsonValue::Object(info)) => (vec![info], false),
            Ok(JsonValue::Array(list)) => (
                list.into_iter()
                    .filter_map(|info| match info {
                        JsonValue::Object(info) => Some(info),
                        _ => None,
                    })
                    .collect(),
                true,
            ),
            Ok(other) => {
                error!(network = %self.shared.network_id, "Unexpected {} list: {other}", kind.name());
                return;
            }
            Err(e) => {
                error!(network = %self.shared.network_id, "Invalid {} list: {e}", kind.name());
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock();
        let mut listed = HashSet::new();

        for info in infos {
            let id_field = match kind {
                NodeKind::Device => "id",
                NodeKind::Variable => "name",
            };
            let Some(node_id) = info.get(id_field).and_then(parse_node_id) else {
                warn!(network = %shared.network_id, "{} without `{id_field}`", kind.name());
                continue;
            };

            let _ = listed.insert(node_id.clone());
            self.update_node(&mut table, kind, node_id, info);
        }

        if full_list {
            let known = match kind {
                NodeKind::Device => &mut self.devices,
                NodeKind::Variable => &mut self.variables,
            };

            let missing = known
                .iter()
                .filter(|node_id| !listed.contains(*node_id))
                .cloned()
                .collect::<Vec<_>>();

            for node_id in missing {
                let _ = known.remove(&node_id);
                if let Some(mut node) = table.nodes.shift_remove(&node_id) {
                    info!(network = %shared.network_id, node = %node_id, "Node removed");
                    node.remove_values();
                    shared.notifications.push(Notification::node(
                        NotificationKind::NodeRemoved,
                        &*shared.network_id,
                        node_id,
                    ));
                }
            }

            match kind {
                NodeKind::Device => self.devices_listed = true,
                NodeKind::Variable => self.variables_listed = true,
            }
            self.check_all_nodes_queried(&table);
        }
    }

    fn update_node(
        &mut self,
        table: &mut NodeTable,
        kind: NodeKind,
        node_id: String,
        info: NodeInfo,
    ) {
        let (known, other) = match kind {
            NodeKind::Device => (&mut self.devices, &mut self.variables),
            NodeKind::Variable => (&mut self.variables, &mut self.devices),
        };

        let advance = match table.nodes.get_mut(&node_id) {
            Some(node) if known.contains(&node_id) => {
                debug!(network = %self.shared.network_id, node = %node_id, "Node updated");
                let _ = node.update_node_info(info);
                node.advance()
            }
            _ => {
                // Devices and variables share the identifier space.
                if other.remove(&node_id) {
                    warn!(network = %self.shared.network_id, node = %node_id, "{} replaces a node with the same id", kind.name());
                    self.shared.notifications.push(Notification::node(
                        NotificationKind::NodeRemoved,
                        &*self.shared.network_id,
                        node_id.as_str(),
                    ));
                }

                info!(network = %self.shared.network_id, node = %node_id, "{} added", kind.name());
                let _ = known.insert(node_id.clone());

                let mut node = Node::new(kind, node_id.as_str(), self.shared.node_context());
                let _ = node.update_node_info(info);

                self.shared.notifications.push(Notification::node(
                    NotificationKind::NodeAdded,
                    &*self.shared.network_id,
                    node_id.as_str(),
                ));

                let advance = node.advance();
                let _ = table.nodes.insert(node_id, node);
                advance
            }
        };

        if advance == Advance::Complete {
            self.check_all_nodes_queried(table);
        }
    }

    fn refresh_states(&mut self, response: &str) {
        if response.is_empty() {
            return;
        }

        let states: RefreshStates = match serde_json::from_str(response) {
            Ok(states) => states,
            Err(e) => {
                error!(network = %self.shared.network_id, "Invalid state changes: {e}");
                return;
            }
        };

        if states.status != "IDLE" {
            if LEARN_MODE_STATUSES.contains(&states.status.as_str()) {
                debug!(network = %self.shared.network_id, "Controller status {}", states.status);
            } else {
                error!(network = %self.shared.network_id, "Unhandled controller status {}", states.status);
            }
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut table = shared.table.lock();

        for change in &states.changes {
            let Some(node_id) = change.get("id").and_then(parse_node_id) else {
                continue;
            };

            for (name, content) in &log_variables(change) {
                let content = string_content(content);
                match table.nodes.get_mut(name) {
                    Some(node) if node.is_info_received() => {
                        let _ = node.refresh_value(VARIABLE_VALUE_TYPE, &content);
                    }
                    Some(_) => {
                        debug!(network = %shared.network_id, node = %name, "Refresh skipped, attributes not received");
                    }
                    None => {
                        debug!(network = %shared.network_id, node = %name, "Refresh of an unknown variable");
                        shared.send(format!("/api/globalVariables?name={name}"));
                    }
                }
            }

            let mut fetch = false;
            for value_type in DEVICE_VALUE_TYPES {
                let Some(content) = change.get(*value_type) else {
                    continue;
                };
                match table.nodes.get_mut(&node_id) {
                    Some(node) if node.is_info_received() => {
                        let _ = node.refresh_value(value_type, &string_content(content));
                    }
                    Some(_) => {
                        debug!(network = %shared.network_id, node = %node_id, "Refresh skipped, attributes not received");
                    }
                    None => fetch = true,
                }
            }

            if fetch {
                debug!(network = %shared.network_id, node = %node_id, "Refresh of an unknown device");
                shared.send(format!("/api/devices?id={node_id}"));
            }
        }
    }
}

// Node identifiers are reported either as numbers or as strings.
fn parse_node_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(id) if !id.is_empty() => Some(id.clone()),
        JsonValue::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

// Variables changed along with a state change, carried in its `log`
// attribute as a JSON object text.
fn log_variables(change: &NodeInfo) -> NodeInfo {
    let Some(JsonValue::String(log)) = change.get("log") else {
        return NodeInfo::new();
    };
    if !log.starts_with('{') {
        return NodeInfo::new();
    }

    match serde_json::from_str::<NodeInfo>(log) {
        Ok(mut log) => match log.remove("var") {
            Some(JsonValue::Object(variables)) => variables,
            _ => NodeInfo::new(),
        },
        Err(e) => {
            warn!("Invalid change log `{log}`: {e}");
            NodeInfo::new()
        }
    }
}

fn string_content(value: &JsonValue) -> String {
    match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use domus::notification::NotificationKind;
    use domus::stage::QueryStage;
    use domus::value::ValueId;

    use crate::bus::NotificationBus;
    use crate::config::BackoffPolicy;
    use crate::event::EventSignal;
    use crate::node::NodeKind;
    use crate::queue::{MessageQueueItem, Request};
    use crate::tests::{Recorder, Script, ScriptedTransport, device_list, settings};
    use crate::wait;

    use super::{Driver, DriverShared, WaitSource};

    const NETWORK: &str = "HC2-000001";

    struct Harness {
        driver: Driver,
        script: Arc<Script>,
        recorder: Arc<Recorder>,
    }

    fn start(policy: BackoffPolicy, failing_opens: usize) -> Harness {
        let script = Script::new(failing_opens);
        let bus = Arc::new(NotificationBus::new());
        let recorder = Recorder::subscribe(&bus);

        let driver = Driver::builder(NETWORK, ScriptedTransport::new(&script), bus)
            .policy(policy)
            .start()
            .unwrap();

        Harness {
            driver,
            script,
            recorder,
        }
    }

    fn ready() -> Harness {
        let harness = start(BackoffPolicy::new(), 0);
        assert!(harness.script.wait_sent("/api/settings/info"));
        harness.script.respond("/api/settings/info", &settings(NETWORK));
        assert!(harness.recorder.wait_for(NotificationKind::DriverReady, 1));
        harness
    }

    #[test]
    fn command_queue_has_priority_over_query_queue() {
        let shared = DriverShared::new(NETWORK.into());
        let data = EventSignal::new("Data");

        shared.query.enqueue(MessageQueueItem::QueryStageComplete {
            node_id: "1".into(),
            stage: QueryStage::NodeInfo,
        });
        shared
            .command
            .enqueue(MessageQueueItem::SendRequest(Request::get("/api/rooms")));

        let index = wait::multiple(&shared.signals(&data), Some(Duration::ZERO)).unwrap();
        assert_eq!(WaitSource::from_index(index), Some(WaitSource::Command));

        data.set();
        let index = wait::multiple(&shared.signals(&data), Some(Duration::ZERO)).unwrap();
        assert_eq!(WaitSource::from_index(index), Some(WaitSource::Data));

        shared.exit.set();
        let index = wait::multiple(&shared.signals(&data), Some(Duration::ZERO)).unwrap();
        assert_eq!(WaitSource::from_index(index), Some(WaitSource::Exit));
    }

    #[test]
    fn ready_driver_requests_initial_data() {
        let harness = ready();

        assert!(harness.script.wait_sent("/api/globalVariables"));
        assert_eq!(
            harness.script.sent_paths(),
            [
                "/api/settings/info",
                "/api/rooms",
                "/api/devices",
                "/api/globalVariables"
            ]
        );
        assert_eq!(harness.driver.controller_info().serial_number, NETWORK);
    }

    #[test]
    fn serial_number_mismatch_stops_the_driver() {
        let harness = start(BackoffPolicy::new(), 0);
        assert!(harness.script.wait_sent("/api/settings/info"));
        harness
            .script
            .respond("/api/settings/info", &settings("HC2-999999"));

        assert!(harness.recorder.wait_for(NotificationKind::DriverFailed, 1));
        harness.driver.join();
        assert!(harness.driver.is_finished());
        assert_eq!(harness.recorder.count(NotificationKind::DriverReady), 0);
        assert_eq!(harness.script.opens(), 1);
    }

    #[test]
    fn open_is_retried() {
        let harness = start(BackoffPolicy::new().short_delay(Duration::ZERO), 2);

        assert!(harness.script.wait_sent("/api/settings/info"));
        assert_eq!(harness.script.opens(), 3);
    }

    #[test]
    fn open_gives_up_after_max_attempts() {
        let harness = start(
            BackoffPolicy::new()
                .short_delay(Duration::ZERO)
                .max_attempts(3),
            usize::MAX,
        );

        assert!(harness.recorder.wait_for(NotificationKind::DriverFailed, 1));
        harness.driver.join();
        assert_eq!(harness.script.opens(), 3);
    }

    #[test]
    fn exit_does_not_drain_queued_work() {
        let harness = ready();
        assert!(harness.script.wait_sent("/api/globalVariables"));

        // The loop is blocked inside the transport while work is queued.
        harness.script.hold_sends();
        harness.driver.shared.send("/api/rooms");
        assert!(harness.script.wait_sent_count("/api/rooms", 2));

        let shared = &harness.driver.shared;
        shared.send("/api/devices");
        shared.send("/api/globalVariables");
        shared.query.enqueue(MessageQueueItem::QueryStageComplete {
            node_id: "4".into(),
            stage: QueryStage::NodeInfo,
        });

        harness.driver.stop();
        harness.script.release_sends();
        harness.driver.join();

        assert!(harness.driver.is_finished());
        assert_eq!(shared.command.len(), 2);
        assert_eq!(shared.query.len(), 1);
        assert_eq!(harness.script.sent_paths().len(), 5);
    }

    #[test]
    fn removed_node_is_notified_once() {
        let harness = ready();

        let ids = (1..=10).collect::<Vec<_>>();
        harness.script.respond("/api/devices", &device_list(&ids));
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 10));

        harness.script.respond("/api/devices", &device_list(&ids[..9]));
        harness.script.respond("/api/devices", &device_list(&ids[..9]));
        harness.script.respond(
            "/api/globalVariables",
            r#"[{"name": "marker", "value": "1", "readOnly": true}]"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 11));

        assert_eq!(harness.recorder.count(NotificationKind::NodeRemoved), 1);
        assert_eq!(harness.driver.node_ids().len(), 10);
        assert!(harness.driver.with_node("10", |_| ()).is_none());
    }

    #[test]
    fn all_nodes_queried_after_both_lists() {
        let harness = ready();

        harness.script.respond(
            "/api/rooms",
            r#"[{"id": 2, "name": "Kitchen"}, {"id": 3, "name": "Garage"}]"#,
        );
        harness.script.respond("/api/devices", &device_list(&[1, 2]));
        assert!(harness.recorder.wait_for(NotificationKind::NodeQueriesComplete, 2));

        // The variable list is still missing.
        assert_eq!(harness.recorder.count(NotificationKind::AllNodesQueried), 0);

        harness.script.respond(
            "/api/globalVariables",
            r#"[{"name": "away", "value": "0", "readOnly": false}]"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::AllNodesQueried, 1));
        assert!(harness.script.wait_sent("/api/refreshStates"));

        assert_eq!(harness.driver.location_name("1").unwrap(), "Kitchen");
        assert_eq!(harness.driver.location_name("away").unwrap(), NETWORK);

        // Another full list does not notify again.
        harness.script.respond("/api/devices", &device_list(&[1, 2]));
        harness.script.respond(
            "/api/globalVariables",
            r#"[{"name": "away", "value": "0"}, {"name": "marker", "value": "1"}]"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 4));
        assert_eq!(harness.recorder.count(NotificationKind::AllNodesQueried), 1);
    }

    #[test]
    fn variable_named_as_a_device_replaces_it() {
        let harness = ready();

        harness.script.respond("/api/devices", &device_list(&[5]));
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 1));

        harness
            .script
            .respond("/api/globalVariables", r#"[{"name": "5", "value": "1"}]"#);
        assert!(harness.recorder.wait_for(NotificationKind::NodeRemoved, 1));
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 2));
        assert_eq!(
            harness.driver.with_node("5", |node| node.kind()),
            Some(NodeKind::Variable)
        );

        // The device is no longer listed, and the variable is kept.
        harness.script.respond("/api/devices", &device_list(&[]));
        harness.script.respond("/api/devices", &device_list(&[1]));
        assert!(harness.recorder.wait_for(NotificationKind::NodeAdded, 3));
        assert_eq!(harness.recorder.count(NotificationKind::NodeRemoved), 1);
        assert_eq!(harness.driver.node_ids(), ["5", "1"]);
    }

    #[test]
    fn refresh_states_updates_values() {
        let harness = ready();

        harness.script.respond("/api/devices", &device_list(&[1]));
        harness.script.respond(
            "/api/globalVariables",
            r#"[{"name": "away", "value": "0", "readOnly": false}]"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::AllNodesQueried, 1));

        harness.script.respond(
            "/api/refreshStates",
            r#"{"status": "IDLE", "last": 42, "timestamp": 1,
                "changes": [
                    {"id": 1, "value": "1"},
                    {"id": 77, "value": "5"},
                    {"id": 0, "log": "{\"var\": {\"away\": \"1\"}}"}
                ]}"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::ValueChanged, 2));
        assert!(harness.script.wait_sent("/api/devices?id=77"));

        let value = harness
            .driver
            .value(&ValueId::new(NETWORK, "1", "value"))
            .unwrap();
        assert_eq!(value.as_str(), "1");
        let value = harness
            .driver
            .value(&ValueId::new(NETWORK, "away", "value"))
            .unwrap();
        assert_eq!(value.as_str(), "1");
    }

    #[test]
    fn controller_error_resets_the_session() {
        let harness = ready();

        harness.script.fail("Connection reset");
        assert!(harness.recorder.wait_for(NotificationKind::DriverReset, 1));

        // The session is opened again and the controller identified again.
        assert!(harness.script.wait_opens(2));
        assert!(harness.script.closes() >= 1);
        assert!(harness.script.wait_sent_count("/api/settings/info", 2));
        harness.script.respond("/api/settings/info", &settings(NETWORK));
        assert!(harness.recorder.wait_for(NotificationKind::DriverReady, 2));
    }

    #[test]
    fn value_writes_are_sent() {
        let harness = ready();

        harness.script.respond(
            "/api/devices",
            r#"[{"id": 5, "type": "binary_light", "properties": {"value": "0"}}]"#,
        );
        assert!(harness.recorder.wait_for(NotificationKind::NodeQueriesComplete, 1));

        harness
            .driver
            .set_value(&ValueId::new(NETWORK, "5", "value"), "1")
            .unwrap();
        assert!(
            harness
                .script
                .wait_sent("/api/callAction?deviceID=5&name=setValue&arg1=1")
        );

        assert!(
            harness
                .driver
                .set_value(&ValueId::new(NETWORK, "6", "value"), "1")
                .is_err()
        );
    }
}
