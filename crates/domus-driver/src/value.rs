use chrono::{DateTime, Utc};

use domus::value::ValueId;

// Format of timestamps rendered as strings.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a value content is rendered for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// The raw content followed by its units.
    Plain,
    /// `on` when the content is `1`, `off` otherwise.
    OnOff,
    /// `open` when the content is `1`, `close` otherwise.
    OpenClose,
    /// The content is a count of seconds since the Unix epoch.
    Timestamp,
}

/// A single named attribute of a node.
///
/// The content is always kept as a string, exactly as reported by the
/// controller. Every mutating call refreshes the last-changed timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    id: ValueId,
    kind: ValueKind,
    value: String,
    label: String,
    units: String,
    read_only: bool,
    last_changed: DateTime<Utc>,
}

impl Value {
    /// Creates a read-only [`Value`].
    #[must_use]
    pub fn new(
        id: ValueId,
        kind: ValueKind,
        value: impl Into<String>,
        units: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind,
            value: value.into(),
            label: String::new(),
            units: units.into(),
            read_only: true,
            last_changed: Utc::now(),
        }
    }

    /// Sets whether the value can be written.
    #[must_use]
    #[inline]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the value label.
    #[must_use]
    #[inline]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Returns the [`ValueId`].
    #[must_use]
    #[inline]
    pub const fn id(&self) -> &ValueId {
        &self.id
    }

    /// Returns the value type.
    #[must_use]
    #[inline]
    pub fn value_type(&self) -> &str {
        self.id.value_type()
    }

    /// Returns the [`ValueKind`].
    #[must_use]
    #[inline]
    pub const fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Returns the raw content.
    #[must_use]
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Returns the value label.
    #[must_use]
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the value units.
    #[must_use]
    #[inline]
    pub fn units(&self) -> &str {
        &self.units
    }

    /// Checks whether the value can be written.
    #[must_use]
    #[inline]
    pub const fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Returns the time of the last change.
    #[must_use]
    #[inline]
    pub const fn last_changed(&self) -> DateTime<Utc> {
        self.last_changed
    }

    /// Returns the time of the last change as `YYYY-MM-DD HH:MM:SS`.
    #[must_use]
    pub fn last_changed_string(&self) -> String {
        self.last_changed.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Renders the content according to its [`ValueKind`].
    #[must_use]
    pub fn as_display_string(&self) -> String {
        match self.kind {
            ValueKind::Plain => format!("{}{}", self.value, self.units),
            ValueKind::OnOff => self.binary_string("on", "off"),
            ValueKind::OpenClose => self.binary_string("open", "close"),
            ValueKind::Timestamp => self
                .value
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
                .map_or_else(
                    || "unknown".into(),
                    |time| time.format(TIMESTAMP_FORMAT).to_string(),
                ),
        }
    }

    /// Replaces the content when it differs from the current one.
    ///
    /// Returns whether the content has changed.
    pub fn refresh(&mut self, value: &str) -> bool {
        if self.value == value {
            return false;
        }
        self.value = value.into();
        self.touch();
        true
    }

    /// Updates the units.
    pub fn set_units(&mut self, units: impl Into<String>) {
        self.units = units.into();
        self.touch();
    }

    /// Updates whether the value can be written.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
        self.touch();
    }

    fn binary_string(&self, one: &str, other: &str) -> String {
        match self.value.trim().parse::<i64>() {
            Ok(1) => one.into(),
            Ok(_) => other.into(),
            Err(_) => "unknown".into(),
        }
    }

    fn touch(&mut self) {
        self.last_changed = Utc::now();
    }
}
