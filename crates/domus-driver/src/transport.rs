use std::sync::Arc;

use crate::error::Result;
use crate::event::EventSignal;
use crate::queue::Request;

// Prefix of every controller API path.
const API_PREFIX: &str = "api/";

/// A controller response route.
///
/// Each inbound response is routed to a handler according to the path of
/// the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    /// Long-poll of state changes.
    RefreshStates,
    /// Controller identity and versions.
    SettingsInfo,
    /// Controller rooms.
    Rooms,
    /// A single device or the whole device list.
    Devices,
    /// A single global variable or the whole variable list.
    GlobalVariables,
    /// Outcome of a device action.
    CallAction,
    /// Controller login status.
    LoginStatus,
    /// The controller session has been lost.
    Error,
    /// A route without a dedicated handler.
    Unknown(String),
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.route_key())
    }
}

impl Command {
    /// Resolves the [`Command`] of a request path.
    ///
    /// The query string is ignored, the leading `/` is removed, and the
    /// remaining `/` separators are replaced with `_`, so that
    /// `/api/settings/info?x=1` becomes `api_settings_info`. Paths outside
    /// of the API resolve to [`Command::Unknown`].
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        let path = path.trim_start_matches('/').trim_end_matches('/');

        if !path.starts_with(API_PREFIX) {
            return Self::Unknown(path.replace('/', "_"));
        }

        match &path[API_PREFIX.len()..] {
            "refreshStates" => Self::RefreshStates,
            "settings/info" => Self::SettingsInfo,
            "rooms" => Self::Rooms,
            "devices" => Self::Devices,
            "globalVariables" => Self::GlobalVariables,
            "callAction" => Self::CallAction,
            "loginStatus" => Self::LoginStatus,
            _ => Self::Unknown(path.replace('/', "_")),
        }
    }

    /// Returns the routing key of the [`Command`].
    #[must_use]
    pub fn route_key(&self) -> String {
        match self {
            Self::RefreshStates => "api_refreshStates".into(),
            Self::SettingsInfo => "api_settings_info".into(),
            Self::Rooms => "api_rooms".into(),
            Self::Devices => "api_devices".into(),
            Self::GlobalVariables => "api_globalVariables".into(),
            Self::CallAction => "api_callAction".into(),
            Self::LoginStatus => "api_loginStatus".into(),
            Self::Error => "error".into(),
            Self::Unknown(key) => key.clone(),
        }
    }
}

/// A response received from a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// The response route.
    pub command: Command,
    /// Query parameters of the originating request.
    pub params: Option<String>,
    /// Response body.
    pub response: String,
}

impl Inbound {
    /// Creates an [`Inbound`] response for the given request path.
    #[must_use]
    pub fn new(path: &str, response: impl Into<String>) -> Self {
        Self {
            command: Command::from_path(path),
            params: path.split_once('?').map(|(_, query)| query.into()),
            response: response.into(),
        }
    }

    /// Creates the synthetic response reporting a lost session.
    #[must_use]
    pub fn error(description: impl Into<String>) -> Self {
        Self {
            command: Command::Error,
            params: None,
            response: description.into(),
        }
    }
}

/// The connection between a driver and its controller.
///
/// Every method except [`Transport::open`] must return promptly: requests
/// are performed in the background and their responses are made available
/// through [`Transport::receive`], with the data signal set while at least
/// one response is waiting.
pub trait Transport: Send {
    /// Opens a controller session, blocking until the controller has
    /// accepted it or a bounded deadline has elapsed.
    ///
    /// # Errors
    ///
    /// Fails when the session cannot be opened.
    fn open(&mut self, network_id: &str) -> Result<()>;

    /// Sends a request to the controller.
    ///
    /// # Errors
    ///
    /// Fails when the request cannot be scheduled.
    fn send(&mut self, request: &Request) -> Result<()>;

    /// Takes the oldest waiting response.
    fn receive(&mut self) -> Option<Inbound>;

    /// Returns the signal set while responses are waiting.
    fn data_signal(&self) -> Arc<EventSignal>;

    /// Closes the session, discarding all waiting responses.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::{Command, Inbound};

    #[test]
    fn routes_from_paths() {
        assert_eq!(
            Command::from_path("/api/refreshStates?last=12&lang=en"),
            Command::RefreshStates
        );
        assert_eq!(
            Command::from_path("/api/settings/info"),
            Command::SettingsInfo
        );
        assert_eq!(Command::from_path("/api/devices?id=7"), Command::Devices);
        assert_eq!(
            Command::from_path("/api/globalVariables?name=alarm"),
            Command::GlobalVariables
        );
        assert_eq!(
            Command::from_path("/api/sections"),
            Command::Unknown("api_sections".into())
        );
        assert_eq!(
            Command::from_path("/index.html"),
            Command::Unknown("index.html".into())
        );
    }

    #[test]
    fn route_keys() {
        assert_eq!(Command::SettingsInfo.route_key(), "api_settings_info");
        assert_eq!(Command::Error.to_string(), "error");
        assert_eq!(
            Command::from_path(&format!("/{}", "api/panels/heating")).route_key(),
            "api_panels_heating"
        );
    }

    #[test]
    fn inbound_params() {
        let inbound = Inbound::new("/api/devices?id=7", "{}");
        assert_eq!(inbound.command, Command::Devices);
        assert_eq!(inbound.params.as_deref(), Some("id=7"));

        let inbound = Inbound::new("/api/devices", "[]");
        assert_eq!(inbound.params, None);
    }
}
