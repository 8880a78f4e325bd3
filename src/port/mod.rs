//! Integration ports implemented by transport adapters.

mod transport;

pub use transport::{
    ChannelTransport, ClientIdentity, Connected, ConsumeOptions, DeclaredQueue, PublishOptions,
    ShutdownInitiator, ShutdownReport, Transport, TransportEvent, TransportFactory,
};
