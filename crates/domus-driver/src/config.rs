use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, ErrorKind, Result};

// Default controller HTTP port.
const DEFAULT_PORT: u16 = 80;
// Default timeout of a single controller request.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
// Default deadline of the controller login.
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

// Durations are written in whole seconds in configuration files.
fn seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

/// A policy deciding how long a driver waits before trying again to open
/// its controller session.
pub trait RetryPolicy: Send + Sync {
    /// Returns the delay before the next attempt, given the number of
    /// failed attempts so far.
    ///
    /// The return value is [`None`] when the driver must give up.
    fn delay(&self, failed_attempts: u32) -> Option<Duration>;
}

/// A [`RetryPolicy`] with a short delay for the first attempts and a long
/// delay afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    #[serde(deserialize_with = "seconds")]
    short_delay: Duration,
    short_attempts: u32,
    #[serde(deserialize_with = "seconds")]
    long_delay: Duration,
    max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            short_delay: Duration::from_secs(5),
            short_attempts: 10,
            long_delay: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

impl BackoffPolicy {
    /// Creates the default [`BackoffPolicy`]: 5 seconds for the first 10
    /// attempts, 30 seconds afterwards, never giving up.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delay of the first attempts.
    #[must_use]
    #[inline]
    pub const fn short_delay(mut self, delay: Duration) -> Self {
        self.short_delay = delay;
        self
    }

    /// Sets how many attempts use the short delay.
    #[must_use]
    #[inline]
    pub const fn short_attempts(mut self, attempts: u32) -> Self {
        self.short_attempts = attempts;
        self
    }

    /// Sets the delay used after the short attempts.
    #[must_use]
    #[inline]
    pub const fn long_delay(mut self, delay: Duration) -> Self {
        self.long_delay = delay;
        self
    }

    /// Sets the maximum number of attempts, `0` meaning unlimited.
    #[must_use]
    #[inline]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

impl RetryPolicy for BackoffPolicy {
    fn delay(&self, failed_attempts: u32) -> Option<Duration> {
        if self.max_attempts > 0 && failed_attempts >= self.max_attempts {
            return None;
        }

        Some(if failed_attempts < self.short_attempts {
            self.short_delay
        } else {
            self.long_delay
        })
    }
}

/// The configuration of a single driver.
///
/// The network identifier is the serial number of the controller, which is
/// verified when the session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DriverConfig {
    network_id: String,
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
    #[serde(default = "default_request_timeout", deserialize_with = "seconds")]
    request_timeout: Duration,
    #[serde(default = "default_open_timeout", deserialize_with = "seconds")]
    open_timeout: Duration,
    #[serde(default)]
    reconnect: BackoffPolicy,
}

const fn default_port() -> u16 {
    DEFAULT_PORT
}

const fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

const fn default_open_timeout() -> Duration {
    DEFAULT_OPEN_TIMEOUT
}

impl DriverConfig {
    /// Creates a [`DriverConfig`] for the controller with the given serial
    /// number, reachable at the given host.
    #[must_use]
    pub fn new(network_id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            host: host.into(),
            port: DEFAULT_PORT,
            username: String::new(),
            password: String::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            reconnect: BackoffPolicy::default(),
        }
    }

    /// Sets the controller port.
    #[must_use]
    #[inline]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the login credentials.
    #[must_use]
    #[inline]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the timeout of every single request.
    #[must_use]
    #[inline]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets how long the controller login may take.
    #[must_use]
    #[inline]
    pub const fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Sets the reconnection policy.
    #[must_use]
    #[inline]
    pub const fn reconnect(mut self, policy: BackoffPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Returns the network identifier.
    #[must_use]
    #[inline]
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Returns the base URL of the controller.
    #[must_use]
    pub fn base_url(&self) -> String {
        if self.port == DEFAULT_PORT {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    /// Returns the login username.
    #[must_use]
    #[inline]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the login password.
    #[must_use]
    #[inline]
    pub fn password(&self) -> &str {
        &self.password
    }

    /// Returns the timeout of every single request.
    #[must_use]
    #[inline]
    pub const fn request_timeout_duration(&self) -> Duration {
        self.request_timeout
    }

    /// Returns how long the controller login may take.
    #[must_use]
    #[inline]
    pub const fn open_timeout_duration(&self) -> Duration {
        self.open_timeout
    }

    /// Returns the reconnection policy.
    #[must_use]
    #[inline]
    pub const fn reconnect_policy(&self) -> BackoffPolicy {
        self.reconnect
    }

    fn validate(&self) -> Result<()> {
        if self.network_id.is_empty() {
            return Err(Error::new(
                ErrorKind::Config,
                "A driver has an empty network identifier",
            ));
        }
        if self.host.is_empty() {
            return Err(Error::new(
                ErrorKind::Config,
                format!("The driver for `{}` has an empty host", self.network_id),
            ));
        }
        Ok(())
    }
}

/// The configuration of a whole manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ManagerConfig {
    /// Drivers to be started.
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

impl ManagerConfig {
    /// Parses a [`ManagerConfig`] from JSON text.
    ///
    /// # Errors
    ///
    /// Fails when the text is not a valid configuration, or when a driver
    /// has an empty network identifier or host.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::new(ErrorKind::Config, e.to_string()))?;
        for driver in &config.drivers {
            driver.validate()?;
        }
        Ok(config)
    }

    /// Reads a [`ManagerConfig`] from a JSON file.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or is not a valid configuration.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::error::ErrorKind;

    use super::{BackoffPolicy, DriverConfig, ManagerConfig, RetryPolicy};

    #[test]
    fn backoff_delays() {
        let policy = BackoffPolicy::new();
        assert_eq!(policy.delay(0), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay(9), Some(Duration::from_secs(5)));
        assert_eq!(policy.delay(10), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay(1000), Some(Duration::from_secs(30)));
    }

    #[test]
    fn bounded_backoff() {
        let policy = BackoffPolicy::new()
            .short_attempts(1)
            .short_delay(Duration::from_secs(1))
            .long_delay(Duration::from_secs(2))
            .max_attempts(3);
        assert_eq!(policy.delay(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay(3), None);
    }

    #[test]
    fn sub_second_durations_are_kept() {
        let policy = BackoffPolicy::new()
            .short_delay(Duration::from_millis(250))
            .long_delay(Duration::from_millis(1500));
        assert_eq!(policy.delay(0), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay(10), Some(Duration::from_millis(1500)));

        let config = DriverConfig::new("HC2-000001", "hc2.local")
            .request_timeout(Duration::from_millis(1500))
            .open_timeout(Duration::from_millis(500));
        assert_eq!(
            config.request_timeout_duration(),
            Duration::from_millis(1500)
        );
        assert_eq!(config.open_timeout_duration(), Duration::from_millis(500));
    }

    #[test]
    fn manager_config_from_json() {
        let config = ManagerConfig::from_json(
            r#"{
                "drivers": [
                    {
                        "network_id": "HC2-000001",
                        "host": "192.168.1.10",
                        "username": "admin",
                        "password": "admin",
                        "open_timeout": 3,
                        "reconnect": { "max_attempts": 5, "short_delay": 2 }
                    },
                    { "network_id": "HC2-000002", "host": "hc2.local", "port": 8080 }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.drivers.len(), 2);

        let first = &config.drivers[0];
        assert_eq!(first.network_id(), "HC2-000001");
        assert_eq!(first.base_url(), "http://192.168.1.10");
        assert_eq!(first.username(), "admin");
        assert_eq!(first.request_timeout_duration(), Duration::from_secs(60));
        assert_eq!(first.open_timeout_duration(), Duration::from_secs(3));
        assert_eq!(
            first.reconnect_policy(),
            BackoffPolicy::new()
                .max_attempts(5)
                .short_delay(Duration::from_secs(2))
        );

        assert_eq!(config.drivers[1].base_url(), "http://hc2.local:8080");
        assert_eq!(
            config.drivers[1],
            DriverConfig::new("HC2-000002", "hc2.local").port(8080)
        );
    }

    #[test]
    fn invalid_manager_config() {
        let error = ManagerConfig::from_json(r#"{"drivers": [{"network_id": "", "host": "a"}]}"#)
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);

        let error = ManagerConfig::from_json("{").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }
}
