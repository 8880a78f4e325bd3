//! Broker endpoint addressing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default AMQP port used when an endpoint omits one.
pub const DEFAULT_AMQP_PORT: u16 = 5672;

/// A broker address as `host:port`.
///
/// The inner fields are private so all construction goes through the
/// defined constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create a new `Endpoint` from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Get the host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Get the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Parse an endpoint from `host`, `host:port`, or an `amqp://` URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the input is empty, the port is not
    /// numeric, or the URI has no host.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Config("endpoint cannot be empty".into()));
        }

        if input.contains("://") {
            let uri = url::Url::parse(input)
                .map_err(|e| Error::Config(format!("invalid endpoint URI {input:?}: {e}")))?;
            let host = uri
                .host_str()
                .ok_or_else(|| Error::Config(format!("endpoint URI {input:?} has no host")))?;
            return Ok(Self::new(host, uri.port().unwrap_or(DEFAULT_AMQP_PORT)));
        }

        match input.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid port in endpoint {input:?}")))?;
                Ok(Self::new(host, port))
            }
            _ => Ok(Self::new(input, DEFAULT_AMQP_PORT)),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_only_uses_default_port() {
        let ep = Endpoint::parse("rabbit.internal").unwrap();
        assert_eq!(ep.host(), "rabbit.internal");
        assert_eq!(ep.port(), DEFAULT_AMQP_PORT);
    }

    #[test]
    fn parse_host_and_port() {
        let ep = Endpoint::parse("localhost:5673").unwrap();
        assert_eq!(ep.host(), "localhost");
        assert_eq!(ep.port(), 5673);
    }

    #[test]
    fn parse_amqp_uri() {
        let ep = Endpoint::parse("amqp://broker.example.com:5671").unwrap();
        assert_eq!(ep.host(), "broker.example.com");
        assert_eq!(ep.port(), 5671);
    }

    #[test]
    fn parse_amqp_uri_without_port() {
        let ep = Endpoint::parse("amqp://broker.example.com").unwrap();
        assert_eq!(ep.port(), DEFAULT_AMQP_PORT);
    }

    #[test]
    fn parse_rejects_empty() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("  ").is_err());
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!(Endpoint::parse("host:notaport").is_err());
    }

    #[test]
    fn display_round_trip() {
        let ep = Endpoint::new("a", 5672);
        assert_eq!(format!("{ep}"), "a:5672");
        assert_eq!("a:5672".parse::<Endpoint>().unwrap(), ep);
    }
}
