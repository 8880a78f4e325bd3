//! Scripted transport fakes for exercising recovery without a broker.
//!
//! Enable with the `testkit` feature. [`TestBroker`] scripts broker-side
//! behavior (server-assigned names, reissued consumer tags, failing
//! entities) and records every operation; [`ScriptedFactory`] scripts
//! connect outcomes and lets tests kill the current transport on demand.

mod transport;

pub use transport::{ScriptedFactory, TestBroker};
