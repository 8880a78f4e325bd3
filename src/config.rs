//! Connection and recovery configuration.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::domain::Endpoint;
use crate::error::{Error, Result};

/// Username/password pair presented to the broker.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
}

fn default_username() -> String {
    "guest".into()
}

fn default_password() -> String {
    "guest".into()
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Strategy used to pick the next candidate endpoint per connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointSelection {
    #[default]
    RoundRobin,
    Random,
}

/// Configuration for a recovering connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Broker endpoints, each `host`, `host:port`, or an `amqp://` URI.
    pub endpoints: Vec<String>,

    /// Client-provided connection name; generated when absent.
    #[serde(default)]
    pub client_name: Option<String>,

    #[serde(default)]
    pub credentials: Credentials,

    /// Whether involuntary shutdowns trigger automatic reconnection.
    #[serde(default = "default_automatic_recovery")]
    pub automatic_recovery: bool,

    /// Whether recorded topology is replayed after a reconnect.
    #[serde(default = "default_topology_recovery")]
    pub topology_recovery: bool,

    /// Flat delay between failed recovery attempts (milliseconds).
    #[serde(default = "default_network_recovery_interval_ms")]
    pub network_recovery_interval_ms: u64,

    /// Upper bound on any single broker RPC (milliseconds).
    #[serde(default = "default_continuation_timeout_ms")]
    pub continuation_timeout_ms: u64,

    #[serde(default)]
    pub endpoint_selection: EndpointSelection,
}

const fn default_automatic_recovery() -> bool {
    true
}

const fn default_topology_recovery() -> bool {
    true
}

const fn default_network_recovery_interval_ms() -> u64 {
    5000 // 5 seconds
}

const fn default_continuation_timeout_ms() -> u64 {
    20000 // 20 seconds
}

impl ConnectionConfig {
    /// Create a configuration for the given endpoints with all defaults.
    pub fn new(endpoints: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            client_name: None,
            credentials: Credentials::default(),
            automatic_recovery: default_automatic_recovery(),
            topology_recovery: default_topology_recovery(),
            network_recovery_interval_ms: default_network_recovery_interval_ms(),
            continuation_timeout_ms: default_continuation_timeout_ms(),
            endpoint_selection: EndpointSelection::default(),
        }
    }

    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&raw)
    }

    /// Parse a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the document does not deserialize.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_network_recovery_interval(mut self, interval: Duration) -> Self {
        self.network_recovery_interval_ms = interval.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_endpoint_selection(mut self, selection: EndpointSelection) -> Self {
        self.endpoint_selection = selection;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending field:
    /// - `endpoints` must be non-empty and each entry must parse
    /// - `network_recovery_interval_ms` must be > 0
    /// - `continuation_timeout_ms` must be > 0
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        for raw in &self.endpoints {
            Endpoint::parse(raw)?;
        }
        if self.network_recovery_interval_ms == 0 {
            return Err(Error::Config(
                "network_recovery_interval_ms must be > 0".into(),
            ));
        }
        if self.continuation_timeout_ms == 0 {
            return Err(Error::Config("continuation_timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    /// Parse the configured endpoint strings.
    ///
    /// # Errors
    ///
    /// Returns the first parse failure, or [`Error::NoEndpoints`] for an
    /// empty list.
    pub fn resolved_endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        self.endpoints.iter().map(|e| Endpoint::parse(e)).collect()
    }

    #[must_use]
    pub const fn network_recovery_interval(&self) -> Duration {
        Duration::from_millis(self.network_recovery_interval_ms)
    }

    #[must_use]
    pub const fn continuation_timeout(&self) -> Duration {
        Duration::from_millis(self.continuation_timeout_ms)
    }
}
