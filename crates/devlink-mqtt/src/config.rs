use std::path::Path;
use std::time::Duration;

use devlink::config::TopicConfig;
use devlink::error::{Error, ErrorKind, Result};

use serde::{Deserialize, Serialize};

/// Default broker hostname.
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Default broker port.
pub const DEFAULT_PORT: u16 = 1883;

/// Settings of the connection to an `MQTT` broker.
///
/// Missing fields take their default value when deserialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Client identifier.
    pub client_id: String,
    /// Broker hostname.
    pub hostname: String,
    /// Broker port.
    pub port: u16,
    /// User name, if the broker requires authentication.
    pub user_name: Option<String>,
    /// User password.
    pub user_pwd: Option<String>,
    /// Keep alive interval, in seconds.
    pub keep_alive_secs: u64,
    /// Whether the broker discards the previous session.
    pub clean_start: bool,
    /// Capacity of the request channel of the client.
    pub channel_capacity: usize,
    /// Delay before a new connection attempt, in seconds.
    pub reconnect_delay_secs: u64,
    /// Base topics of the protocols.
    pub topics: TopicConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            hostname: DEFAULT_HOSTNAME.into(),
            port: DEFAULT_PORT,
            user_name: None,
            user_pwd: None,
            keep_alive_secs: 60,
            clean_start: false,
            channel_capacity: 64,
            reconnect_delay_secs: 5,
            topics: TopicConfig::default(),
        }
    }
}

impl MqttConfig {
    /// Creates a [`MqttConfig`] for `client_id` with default settings.
    #[must_use]
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Sets the broker address.
    #[must_use]
    pub fn broker(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.hostname = hostname.into();
        self.port = port;
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, user_name: impl Into<String>, user_pwd: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self.user_pwd = Some(user_pwd.into());
        self
    }

    /// Sets the base topics.
    #[must_use]
    pub fn topics(mut self, topics: TopicConfig) -> Self {
        self.topics = topics;
        self
    }

    /// Parses a [`MqttConfig`] from `JSON`.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Config`] when the text is not a valid
    /// configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| {
            Error::new(ErrorKind::Config, format!("Invalid MQTT configuration: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a [`MqttConfig`] from a `JSON` file.
    ///
    /// # Errors
    ///
    /// Fails with [`ErrorKind::Config`] when the file cannot be read or does
    /// not contain a valid configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                ErrorKind::Config,
                format!("Cannot read `{}`: {e}", path.display()),
            )
        })?;
        Self::from_json(&text)
    }

    /// Returns the keep alive interval.
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Returns the delay before a new connection attempt.
    #[must_use]
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.hostname.is_empty() {
            return Err(Error::new(ErrorKind::Config, "Empty broker hostname"));
        }
        if self.channel_capacity == 0 {
            return Err(Error::new(ErrorKind::Config, "Channel capacity must be positive"));
        }
        if self.user_pwd.is_some() && self.user_name.is_none() {
            return Err(Error::new(ErrorKind::Config, "Password without a user name"));
        }
        Ok(())
    }
}
