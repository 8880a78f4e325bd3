//! Connection recovery: the recorded-topology store, the supervisor state
//! machine, and the connection/channel proxies that survive transport
//! replacement.

mod channel;
mod connection;
mod controller;
mod endpoints;
mod registry;

pub use channel::RecoveringChannel;
pub use connection::{Lifecycle, RecoveringConnection, RecoveryStats};
pub use endpoints::{EndpointCycler, EndpointSelector, RandomSelector, RoundRobinSelector};
pub use registry::{TopologyRegistry, TopologySnapshot};
