//! Rabbithole - auto-recovering AMQP 0-9-1 connections.
//!
//! Wraps a live broker connection and, on involuntary disconnection,
//! re-establishes the transport, re-opens channels, and re-declares the
//! recorded topology so application code sees a transient interruption
//! instead of losing all client state.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── domain/       # Endpoint + recorded-topology data types
//! ├── port/         # Traits a concrete transport implements
//! ├── recovery/     # Registry, supervisor, connection/channel proxies
//! ├── events.rs     # Listener registry with panic isolation
//! └── testkit/      # Scripted fakes (feature = "testkit")
//! ```
//!
//! The AMQP frame codec, sockets, TLS, and SASL live behind the [`port`]
//! traits; this crate owns recording, recovery orchestration, and channel
//! takeover.

pub mod config;
pub mod domain;
pub mod error;
pub mod events;
pub mod port;
pub mod recovery;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use config::{ConnectionConfig, Credentials, EndpointSelection};
pub use error::{Error, Result};
pub use events::ConnectionEvent;
pub use recovery::{Lifecycle, RecoveringChannel, RecoveringConnection, RecoveryStats};
