use alloc::string::String;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::value::ValueId;

/// All [`NotificationKind`]s.
pub const ALL_NOTIFICATION_KINDS: &[NotificationKind] = &[
    NotificationKind::DriverReady,
    NotificationKind::DriverFailed,
    NotificationKind::DriverReset,
    NotificationKind::NodeAdded,
    NotificationKind::NodeRemoved,
    NotificationKind::NodeChanged,
    NotificationKind::ValueAdded,
    NotificationKind::ValueRemoved,
    NotificationKind::ValueChanged,
    NotificationKind::NodeQueriesComplete,
    NotificationKind::AllNodesQueried,
];

/// All observable changes a driver may notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The driver has connected to its controller and verified its identity.
    DriverReady,
    /// The driver could not be initialized and has stopped.
    DriverFailed,
    /// The driver has lost its controller session and is reinitializing it.
    DriverReset,
    /// A node has been discovered.
    NodeAdded,
    /// A node is no longer reported by the controller.
    NodeRemoved,
    /// The attributes of a node have changed.
    NodeChanged,
    /// A value has been added to a node.
    ValueAdded,
    /// A value has been removed from a node.
    ValueRemoved,
    /// The content of a value has changed.
    ValueChanged,
    /// A node has completed all its discovery queries.
    NodeQueriesComplete,
    /// All nodes of a network have completed their discovery queries.
    AllNodesQueried,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl NotificationKind {
    /// Returns the [`NotificationKind`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DriverReady => "Driver Ready",
            Self::DriverFailed => "Driver Failed",
            Self::DriverReset => "Driver Reset",
            Self::NodeAdded => "Node Added",
            Self::NodeRemoved => "Node Removed",
            Self::NodeChanged => "Node Changed",
            Self::ValueAdded => "Value Added",
            Self::ValueRemoved => "Value Removed",
            Self::ValueChanged => "Value Changed",
            Self::NodeQueriesComplete => "Node Queries Complete",
            Self::AllNodesQueried => "All Nodes Queried",
        }
    }

    /// Checks whether the kind concerns a whole driver rather than a single
    /// node.
    #[must_use]
    pub const fn is_driver_kind(&self) -> bool {
        matches!(
            self,
            Self::DriverReady | Self::DriverFailed | Self::DriverReset | Self::AllNodesQueried
        )
    }
}

/// An immutable description of a single observable change.
///
/// Driver-level notifications only carry a network identifier, node-level
/// notifications add the node identifier, and value-level notifications
/// add the [`ValueId`] of the involved value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    kind: NotificationKind,
    network_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    value_id: Option<ValueId>,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [network {}", self.kind, self.network_id)?;
        if let Some(node_id) = &self.node_id {
            write!(f, ", node {node_id}")?;
        }
        if let Some(value_id) = &self.value_id {
            write!(f, ", value {}", value_id.value_type())?;
        }
        write!(f, "]")
    }
}

impl Notification {
    /// Creates a driver-level [`Notification`].
    #[must_use]
    #[inline]
    pub fn driver(kind: NotificationKind, network_id: impl Into<String>) -> Self {
        Self {
            kind,
            network_id: network_id.into(),
            node_id: None,
            value_id: None,
        }
    }

    /// Creates a node-level [`Notification`].
    #[must_use]
    #[inline]
    pub fn node(
        kind: NotificationKind,
        network_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            network_id: network_id.into(),
            node_id: Some(node_id.into()),
            value_id: None,
        }
    }

    /// Creates a value-level [`Notification`].
    ///
    /// Network and node identifiers are taken from the [`ValueId`].
    #[must_use]
    #[inline]
    pub fn value(kind: NotificationKind, value_id: ValueId) -> Self {
        Self {
            kind,
            network_id: value_id.network_id().into(),
            node_id: Some(value_id.node_id().into()),
            value_id: Some(value_id),
        }
    }

    /// Returns the [`NotificationKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Returns the node identifier, if any.
    #[must_use]
    #[inline]
    pub fn node_id(&self) -> Option<&str> {
        self.node_id.as_deref()
    }

    /// Returns the [`ValueId`], if any.
    #[must_use]
    #[inline]
    pub const fn value_id(&self) -> Option<&ValueId> {
        self.value_id.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use crate::value::ValueId;
    use crate::{deserialize, serialize};

    use super::{ALL_NOTIFICATION_KINDS, Notification, NotificationKind};

    #[test]
    fn driver_notification() {
        let notification = Notification::driver(NotificationKind::DriverReady, "net");

        assert_eq!(notification.kind(), NotificationKind::DriverReady);
        assert_eq!(notification.network_id(), "net");
        assert_eq!(notification.node_id(), None);
        assert_eq!(notification.value_id(), None);
        assert_eq!(notification.to_string(), "Driver Ready [network net]");
    }

    #[test]
    fn value_notification_carries_node() {
        let value_id = ValueId::new("net", "12", "value");
        let notification = Notification::value(NotificationKind::ValueChanged, value_id.clone());

        assert_eq!(notification.network_id(), "net");
        assert_eq!(notification.node_id(), Some("12"));
        assert_eq!(notification.value_id(), Some(&value_id));
        assert_eq!(
            notification.to_string(),
            "Value Changed [network net, node 12, value value]"
        );
    }

    #[test]
    fn driver_kinds() {
        let driver_kinds = ALL_NOTIFICATION_KINDS
            .iter()
            .filter(|kind| kind.is_driver_kind())
            .count();
        assert_eq!(driver_kinds, 4);
    }

    #[test]
    fn serde_notification() {
        let notification = Notification::node(NotificationKind::NodeAdded, "net", "3");
        let value = serialize(&notification);

        // Missing fields are not serialized.
        assert!(value.get("value_id").is_none());

        assert_eq!(deserialize::<Notification>(value), notification);
    }
}
