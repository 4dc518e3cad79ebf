use alloc::string::{String, ToString};

use core::fmt;

use serde::{Deserialize, Serialize};

// Separator between the fields of a textual value identifier.
const SEPARATOR: char = ':';

/// The unique identifier of a value within the whole system.
///
/// It is composed of the network the value belongs to, the node that owns
/// it, and the value type, which names the attribute of the node.
///
/// Two identifiers are equal if and only if all three fields are equal.
/// The textual form joins the three fields with a `:` separator, as in
/// `HC2-012345:42:value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId {
    network_id: String,
    node_id: String,
    value_type: String,
}

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.network_id, self.node_id, self.value_type
        )
    }
}

impl ValueId {
    /// Creates a [`ValueId`].
    #[must_use]
    #[inline]
    pub fn new(
        network_id: impl Into<String>,
        node_id: impl Into<String>,
        value_type: impl Into<String>,
    ) -> Self {
        Self {
            network_id: network_id.into(),
            node_id: node_id.into(),
            value_type: value_type.into(),
        }
    }

    /// Parses a [`ValueId`] from its textual form.
    ///
    /// The network identifier is the text before the first separator and
    /// the value type the text after the last one, so node identifiers may
    /// contain separators themselves.
    ///
    /// The return value is [`None`] when the text contains less than two
    /// separators or when one of the fields is empty.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (network_id, rest) = text.split_once(SEPARATOR)?;
        let (node_id, value_type) = rest.rsplit_once(SEPARATOR)?;

        if network_id.is_empty() || node_id.is_empty() || value_type.is_empty() {
            return None;
        }

        Some(Self::new(network_id, node_id, value_type))
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Returns the node identifier.
    #[must_use]
    #[inline]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Returns the value type.
    #[must_use]
    #[inline]
    pub fn value_type(&self) -> &str {
        &self.value_type
    }

    /// Returns the textual form of the [`ValueId`].
    #[must_use]
    #[inline]
    pub fn id(&self) -> String {
        self.to_string()
    }
}
