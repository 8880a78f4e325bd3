use thiserror::Error;

/// Errors surfaced by the recovering connection layer.
///
/// Recovery-path failures never reach the caller directly: the recovery
/// worker converts them into [`crate::events::ConnectionEvent`] emissions.
/// Only lifecycle violations and errors from direct application calls
/// propagate through this type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("connection has been disposed")]
    Disposed,

    #[error("connection is not open")]
    NotOpen,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("channel numbers exhausted (channel-max {max})")]
    ChannelsExhausted { max: u16 },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("protocol error {code}: {message}")]
    Protocol { code: u16, message: String },

    #[error("broker did not reply within the continuation timeout")]
    ContinuationTimeout,

    #[error("topology recovery failed for {context}: {source}")]
    TopologyRecovery {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Build a transport failure from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Wrap a per-item recovery failure with the entity it concerns.
    pub fn topology(context: impl Into<String>, source: Error) -> Self {
        Self::TopologyRecovery {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
