use core::fmt;

use serde::{Deserialize, Serialize};

/// All [`QueryStage`]s in discovery order.
pub const ALL_QUERY_STAGES: &[QueryStage] = &[
    QueryStage::None,
    QueryStage::NodeInfo,
    QueryStage::NodeValues,
    QueryStage::Complete,
];

/// The discovery stage of a node.
///
/// A node starts at [`QueryStage::None`] and moves forward one stage at a
/// time until it reaches [`QueryStage::Complete`]. Stages are ordered, so a
/// later stage always compares greater than an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueryStage {
    /// The node has just been discovered.
    None,
    /// The node attributes are being fetched.
    NodeInfo,
    /// The node values are being built from its attributes.
    NodeValues,
    /// All discovery queries have been completed.
    Complete,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl QueryStage {
    /// Returns the [`QueryStage`] name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::NodeInfo => "NodeInfo",
            Self::NodeValues => "NodeValues",
            Self::Complete => "Complete",
        }
    }

    /// Returns the stage following the current one.
    ///
    /// [`QueryStage::Complete`] is terminal and is returned unchanged.
    #[must_use]
    pub const fn next(&self) -> Self {
        match self {
            Self::None => Self::NodeInfo,
            Self::NodeInfo => Self::NodeValues,
            Self::NodeValues | Self::Complete => Self::Complete,
        }
    }

    /// Checks whether the stage is terminal.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}
