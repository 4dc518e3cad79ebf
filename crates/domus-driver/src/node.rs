use std::sync::Arc;

use domus::notification::{Notification, NotificationKind};
use domus::stage::QueryStage;
use domus::value::ValueId;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use tracing::{debug, info};

use crate::bus::NotificationBuffer;
use crate::error::{Error, ErrorKind, Result};
use crate::queue::{MessageQueue, MessageQueueItem, Method, Request};
use crate::value::{Value, ValueKind};

/// The attributes of a node as reported by the controller.
pub type NodeInfo = Map<String, JsonValue>;

/// Device attributes materialized as values, in creation order.
pub const DEVICE_VALUE_TYPES: &[&str] = &[
    "sunriseHour",
    "sunsetHour",
    "dead",
    "valueSensor",
    "valueMeter",
    "value",
    "batteryLevel",
    "armed",
    "lastBreached",
    "color",
    "currentProgram",
    "lastColorSet",
    "lastUsedPrograms",
    "modified",
    "created",
    "nextDrenching",
    "mode",
];

// Device value types which can always be written.
const WRITABLE_VALUE_TYPES: &[&str] = &["value", "armed"];

// Device value types holding a Unix timestamp.
const TIMESTAMP_VALUE_TYPES: &[&str] = &["lastBreached", "modified", "created"];

/// The only value type of a variable.
pub const VARIABLE_VALUE_TYPE: &str = "value";

/// The kind of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A physical or virtual device.
    Device,
    /// A global variable of the controller.
    Variable,
}

impl NodeKind {
    /// Returns the [`NodeKind`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Device => "Device",
            Self::Variable => "Variable",
        }
    }
}

/// The handle through which a node reaches its driver.
///
/// It gives access to the driver outbound queues and to its notification
/// buffer.
#[derive(Debug, Clone)]
pub struct NodeContext {
    network_id: Arc<str>,
    command: Arc<MessageQueue>,
    query: Arc<MessageQueue>,
    notifications: Arc<NotificationBuffer>,
}

impl NodeContext {
    /// Creates a [`NodeContext`].
    #[must_use]
    pub fn new(
        network_id: &str,
        command: Arc<MessageQueue>,
        query: Arc<MessageQueue>,
        notifications: Arc<NotificationBuffer>,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            command,
            query,
            notifications,
        }
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    fn send(&self, request: Request) {
        self.command.enqueue(MessageQueueItem::SendRequest(request));
    }

    fn acknowledge(&self, node_id: &str, stage: QueryStage) {
        self.query.enqueue(MessageQueueItem::QueryStageComplete {
            node_id: node_id.into(),
            stage,
        });
    }

    fn notify_node(&self, kind: NotificationKind, node_id: &str) {
        self.notifications
            .push(Notification::node(kind, &*self.network_id, node_id));
    }

    fn notify_value(&self, kind: NotificationKind, value_id: &ValueId) {
        self.notifications
            .push(Notification::value(kind, value_id.clone()));
    }
}

/// The outcome of [`Node::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The node is waiting for some work to be done.
    Pending,
    /// The node has completed all its queries.
    Complete,
}

/// The outcome of [`Node::update_node_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoUpdate {
    /// The first attributes received for the node.
    New,
    /// At least one attribute present in both snapshots has changed.
    Changed,
    /// No attribute present in both snapshots has changed.
    Unchanged,
}

#[derive(Serialize)]
struct VariableWrite<'a> {
    name: &'a str,
    value: &'a str,
}

// Attribute values are kept as strings, as reported by the controller.
fn attribute_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Null => Some(String::new()),
        JsonValue::Object(_) => None,
        other => Some(other.to_string()),
    }
}

fn attribute_flag(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(flag) => Some(*flag),
        JsonValue::Number(number) => number.as_u64().map(|number| number != 0),
        JsonValue::String(text) => match text.as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// A node of a controller network.
///
/// A node is either a device or a variable. It goes through the discovery
/// stages described by [`QueryStage`], fetching its attributes and then
/// materializing them into [`Value`]s. Each stage is acknowledged through
/// the driver query queue before moving to the next one.
///
/// Every mutation of a node is expected to happen under the lock of the
/// node table of its driver.
#[derive(Debug)]
pub struct Node {
    id: String,
    kind: NodeKind,
    context: NodeContext,
    query_stage: QueryStage,
    query_pending: bool,
    query_retries: u32,
    info: Option<NodeInfo>,
    values_materialized: bool,
    awaiting_info: bool,
    completion_reported: bool,
    values: Vec<Value>,
}

impl Node {
    /// Creates a [`Node`] without attributes, at [`QueryStage::None`].
    #[must_use]
    pub fn new(kind: NodeKind, id: impl Into<String>, context: NodeContext) -> Self {
        Self {
            id: id.into(),
            kind,
            context,
            query_stage: QueryStage::None,
            query_pending: false,
            query_retries: 0,
            info: None,
            values_materialized: false,
            awaiting_info: false,
            completion_reported: false,
            values: Vec::new(),
        }
    }

    /// Returns the node identifier.
    #[must_use]
    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the [`NodeKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        self.context.network_id()
    }

    /// Returns the current [`QueryStage`].
    #[must_use]
    #[inline]
    pub const fn query_stage(&self) -> QueryStage {
        self.query_stage
    }

    /// Checks whether the node is waiting for the current stage to be
    /// acknowledged.
    #[must_use]
    #[inline]
    pub const fn is_query_pending(&self) -> bool {
        self.query_pending
    }

    /// Returns how many times the attributes have been requested in the
    /// current stage.
    #[must_use]
    #[inline]
    pub const fn query_retries(&self) -> u32 {
        self.query_retries
    }

    /// Returns the last received attributes.
    #[must_use]
    #[inline]
    pub const fn info(&self) -> Option<&NodeInfo> {
        self.info.as_ref()
    }

    /// Checks whether the attributes have been received.
    #[must_use]
    #[inline]
    pub const fn is_info_received(&self) -> bool {
        self.info.is_some()
    }

    /// Returns all node values.
    #[must_use]
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Returns the value of the given type.
    #[must_use]
    pub fn value(&self, value_type: &str) -> Option<&Value> {
        self.values.iter().find(|v| v.value_type() == value_type)
    }

    /// Drives the node through its discovery stages until it has to wait
    /// for some work to be acknowledged, or until it is complete.
    ///
    /// [`NotificationKind::NodeQueriesComplete`] is notified once per
    /// discovery pass.
    pub fn advance(&mut self) -> Advance {
        debug!(
            network = %self.context.network_id,
            node = %self.id,
            "Advancing queries: pending={} stage={}",
            self.query_pending,
            self.query_stage
        );

        let mut acknowledge = false;

        while !self.query_pending {
            match self.query_stage {
                QueryStage::None => {
                    self.query_stage = QueryStage::NodeInfo;
                    self.query_retries = 0;
                }
                QueryStage::NodeInfo => {
                    if self.info.is_none() {
                        self.query_retries += 1;
                        self.request_info();
                        self.query_pending = true;
                        acknowledge = true;
                    } else {
                        self.query_stage = QueryStage::NodeValues;
                        self.query_retries = 0;
                    }
                }
                QueryStage::NodeValues => {
                    if self.info.is_none() {
                        // Resumed by the attributes update.
                        self.awaiting_info = true;
                        self.query_pending = true;
                    } else if !self.values_materialized {
                        self.sync_values();
                        self.values_materialized = true;
                        self.query_pending = true;
                        acknowledge = true;
                    } else {
                        self.sync_values();
                        self.query_stage = QueryStage::Complete;
                        self.query_retries = 0;
                    }
                }
                QueryStage::Complete => {
                    if !self.completion_reported {
                        info!(
                            network = %self.context.network_id,
                            node = %self.id,
                            "All queries complete"
                        );
                        self.completion_reported = true;
                        self.context
                            .notify_node(NotificationKind::NodeQueriesComplete, &self.id);
                    }
                    return Advance::Complete;
                }
            }
        }

        if acknowledge {
            self.context.acknowledge(&self.id, self.query_stage);
        }

        Advance::Pending
    }

    /// Accepts the acknowledgement of a discovery stage.
    ///
    /// An acknowledgement for any stage other than the current one is
    /// discarded. When accepted, the node moves to the next stage and
    /// [`Node::advance`] has to be invoked again.
    ///
    /// Returns whether the acknowledgement has been accepted.
    pub fn accept_stage_complete(&mut self, stage: QueryStage) -> bool {
        if stage != self.query_stage || stage.is_complete() {
            debug!(
                network = %self.context.network_id,
                node = %self.id,
                "Discarding the acknowledgement of stage {stage}, current stage is {}",
                self.query_stage
            );
            return false;
        }

        self.query_pending = false;
        self.awaiting_info = false;
        self.query_stage = stage.next();
        self.query_retries = 0;
        true
    }

    /// Rewinds the node to [`QueryStage::NodeInfo`], starting a new
    /// discovery pass.
    pub fn reset_queries(&mut self) {
        debug!(
            network = %self.context.network_id,
            node = %self.id,
            "Rewinding queries from stage {}",
            self.query_stage
        );
        self.query_stage = QueryStage::NodeInfo;
        self.query_pending = false;
        self.query_retries = 0;
        self.values_materialized = false;
        self.awaiting_info = false;
        self.completion_reported = false;
    }

    /// Replaces the node attributes.
    ///
    /// When an attribute present in both the old and the new snapshot has
    /// changed, [`NotificationKind::NodeChanged`] is notified and the node
    /// is rewound to [`QueryStage::NodeInfo`]. Values of a complete node
    /// are refreshed from unchanged attributes too, since new attributes
    /// may have appeared.
    pub fn update_node_info(&mut self, info: NodeInfo) -> InfoUpdate {
        let update = match &self.info {
            None => InfoUpdate::New,
            Some(old) => {
                let changed = old
                    .iter()
                    .any(|(key, value)| info.get(key).is_some_and(|new| new != value));
                if changed {
                    InfoUpdate::Changed
                } else {
                    InfoUpdate::Unchanged
                }
            }
        };

        self.info = Some(info);

        if self.awaiting_info {
            self.awaiting_info = false;
            self.query_pending = false;
        }

        match update {
            InfoUpdate::Changed => {
                debug!(network = %self.context.network_id, node = %self.id, "Attributes changed");
                self.context
                    .notify_node(NotificationKind::NodeChanged, &self.id);
                self.reset_queries();
            }
            InfoUpdate::Unchanged if self.query_stage.is_complete() => self.sync_values(),
            InfoUpdate::New | InfoUpdate::Unchanged => {}
        }

        update
    }

    /// Refreshes the content of a value.
    ///
    /// [`NotificationKind::ValueChanged`] is notified when the content
    /// differs from the current one. When the node has no such value, its
    /// attributes are requested again.
    ///
    /// Returns whether the value has changed.
    pub fn refresh_value(&mut self, value_type: &str, content: &str) -> bool {
        match self.values.iter().position(|v| v.value_type() == value_type) {
            Some(index) => {
                let value = &mut self.values[index];
                if value.refresh(content) {
                    self.context
                        .notify_value(NotificationKind::ValueChanged, value.id());
                    true
                } else {
                    false
                }
            }
            None => {
                debug!(
                    network = %self.context.network_id,
                    node = %self.id,
                    "Refresh of the unknown value `{value_type}`, requesting attributes"
                );
                self.request_info();
                false
            }
        }
    }

    /// Writes a value to the controller.
    ///
    /// # Errors
    ///
    /// Fails when the node has no such value, when the value is read-only,
    /// or when no controller action writes it.
    pub fn set_value(&self, value_type: &str, content: &str) -> Result<()> {
        let value = self.value(value_type).ok_or_else(|| {
            Error::new(
                ErrorKind::Value,
                format!("Node `{}` has no `{value_type}` value", self.id),
            )
        })?;

        if value.is_read_only() {
            return Err(Error::new(
                ErrorKind::Value,
                format!("Value `{}` is read-only", value.id()),
            ));
        }

        let request = match self.kind {
            NodeKind::Device => {
                let action = match value_type {
                    "value" => "setValue",
                    "armed" => "setArmed",
                    _ => {
                        return Err(Error::new(
                            ErrorKind::Value,
                            format!("Value `{}` has no write action", value.id()),
                        ));
                    }
                };
                Request::get(format!(
                    "/api/callAction?deviceID={}&name={action}&arg1={content}",
                    self.id
                ))
            }
            NodeKind::Variable => {
                let body = serde_json::to_string(&VariableWrite {
                    name: &self.id,
                    value: content,
                })?;
                Request::new(Method::Put, "/api/globalVariables", Some(body))
            }
        };

        debug!(network = %self.context.network_id, node = %self.id, "Writing `{}`", value.id());
        self.context.send(request);
        Ok(())
    }

    /// Notifies the removal of all node values and drops them.
    pub fn remove_values(&mut self) {
        for value in self.values.drain(..) {
            self.context
                .notify_value(NotificationKind::ValueRemoved, value.id());
        }
    }

    /// Returns the node name.
    #[must_use]
    pub fn name(&self) -> String {
        self.top_attribute("name")
            .and_then(attribute_string)
            .unwrap_or_default()
    }

    /// Returns the node type.
    #[must_use]
    pub fn node_type(&self) -> String {
        match self.kind {
            NodeKind::Device => self
                .top_attribute("type")
                .and_then(attribute_string)
                .unwrap_or_else(|| "unknown".into()),
            NodeKind::Variable => "variable".into(),
        }
    }

    /// Returns the identifier of the room the node is placed in.
    ///
    /// Variables are never placed in a room.
    #[must_use]
    pub fn location(&self) -> Option<u64> {
        match self.kind {
            NodeKind::Device => self.top_attribute("roomID").and_then(JsonValue::as_u64),
            NodeKind::Variable => None,
        }
    }

    /// Returns the node description.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            NodeKind::Device => self
                .property("userDescription")
                .and_then(attribute_string)
                .unwrap_or_default(),
            NodeKind::Variable => "variable".into(),
        }
    }

    /// Checks whether the device is reported as dead.
    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.property("dead")
            .and_then(attribute_flag)
            .unwrap_or(false)
    }

    /// Checks whether the device is a light.
    #[must_use]
    pub fn is_light(&self) -> bool {
        self.property("deviceControlType")
            .and_then(attribute_string)
            .is_some_and(|control| control == "2" || control == "23")
    }

    /// Checks whether the device is battery operated.
    #[must_use]
    pub fn is_battery_operated(&self) -> bool {
        self.property("isBatteryOperated")
            .and_then(attribute_flag)
            .unwrap_or(false)
    }

    fn request_info(&self) {
        let path = match self.kind {
            NodeKind::Device => format!("/api/devices?id={}", self.id),
            NodeKind::Variable => format!("/api/globalVariables?name={}", self.id),
        };
        info!(
            network = %self.context.network_id,
            node = %self.id,
            "Requesting {} attributes",
            self.kind.name()
        );
        self.context.send(Request::get(path));
    }

    fn top_attribute(&self, name: &str) -> Option<&JsonValue> {
        self.info.as_ref()?.get(name)
    }

    fn property(&self, name: &str) -> Option<&JsonValue> {
        self.info.as_ref()?.get("properties")?.get(name)
    }

    // Device attributes are looked up at the top level first.
    fn attribute(&self, name: &str) -> Option<String> {
        self.top_attribute(name)
            .and_then(attribute_string)
            .or_else(|| self.property(name).and_then(attribute_string))
    }

    fn device_values(&self) -> Vec<Value> {
        let node_type = self.node_type();

        let units = self
            .property("unit")
            .and_then(attribute_string)
            .filter(|units| !units.is_empty())
            .unwrap_or_else(|| match node_type.as_str() {
                "dimmable_light" => "%".into(),
                "thermostat_setpoint" => "C".into(),
                _ => String::new(),
            });

        let writable = self
            .top_attribute("readOnly")
            .or_else(|| self.property("readOnly"))
            .and_then(attribute_flag)
            .is_some_and(|read_only| !read_only);

        DEVICE_VALUE_TYPES
            .iter()
            .filter_map(|value_type| {
                let content = self.attribute(value_type)?;

                let kind = match *value_type {
                    _ if TIMESTAMP_VALUE_TYPES.contains(value_type) => ValueKind::Timestamp,
                    "value" => match node_type.as_str() {
                        "binary_light" => ValueKind::OnOff,
                        "door_sensor" | "window_sensor" => ValueKind::OpenClose,
                        _ => ValueKind::Plain,
                    },
                    _ => ValueKind::Plain,
                };

                let value_units = match (*value_type, kind) {
                    ("valueMeter", _) => self.attribute("unitMeter").unwrap_or_default(),
                    ("valueSensor", _) => self.attribute("unitSensor").unwrap_or_default(),
                    ("value", ValueKind::Plain) => units.clone(),
                    _ => String::new(),
                };

                let read_only = !(writable || WRITABLE_VALUE_TYPES.contains(value_type));

                Some(
                    Value::new(self.value_id(value_type), kind, content, value_units)
                        .read_only(read_only)
                        .with_label(*value_type),
                )
            })
            .collect()
    }

    fn variable_values(&self) -> Vec<Value> {
        let Some(content) = self.top_attribute("value").and_then(attribute_string) else {
            return Vec::new();
        };

        let read_only = self
            .top_attribute("readOnly")
            .and_then(attribute_flag)
            .unwrap_or(true);

        vec![
            Value::new(
                self.value_id(VARIABLE_VALUE_TYPE),
                ValueKind::Plain,
                content,
                "",
            )
            .read_only(read_only)
            .with_label(self.name()),
        ]
    }

    fn value_id(&self, value_type: &str) -> ValueId {
        ValueId::new(self.context.network_id(), self.id.as_str(), value_type)
    }

    // Brings the values in line with the current attributes.
    fn sync_values(&mut self) {
        let desired = match self.kind {
            NodeKind::Device => self.device_values(),
            NodeKind::Variable => self.variable_values(),
        };

        let context = &self.context;
        self.values.retain(|value| {
            let keep = desired
                .iter()
                .any(|wanted| wanted.value_type() == value.value_type());
            if !keep {
                context.notify_value(NotificationKind::ValueRemoved, value.id());
            }
            keep
        });

        for wanted in desired {
            match self
                .values
                .iter()
                .position(|value| value.value_type() == wanted.value_type())
            {
                Some(index) => {
                    let value = &mut self.values[index];
                    if value.units() != wanted.units() {
                        value.set_units(wanted.units());
                    }
                    if value.is_read_only() != wanted.is_read_only() {
                        value.set_read_only(wanted.is_read_only());
                    }
                    if value.refresh(wanted.as_str()) {
                        context.notify_value(NotificationKind::ValueChanged, value.id());
                    }
                }
                None => {
                    debug!(
                        network = %context.network_id,
                        node = %self.id,
                        "Adding value `{}`",
                        wanted.value_type()
                    );
                    context.notify_value(NotificationKind::ValueAdded, wanted.id());
                    self.values.push(wanted);
                }
            }
        }
    }
}
