//! Agent session and configuration distribution engine.
//!
//! A transport drives [`callbacks::Callbacks`] for each session. Inbound
//! messages pass through the synchronizer and then the distributor; the
//! heartbeat monitor runs on its own and only touches persisted state.

pub mod callbacks;
pub mod distributor;
pub mod heartbeat;
pub mod registry;
pub mod server;
pub mod sync;
pub mod versioning;

pub use callbacks::{Callbacks, SessionCallbacks};
pub use distributor::{ConfigDistributor, PushOutcome};
pub use heartbeat::HeartbeatMonitor;
pub use registry::{AgentConnection, ConnectionRegistry, SessionId, SharedConnection};
pub use server::ControlServer;
pub use versioning::ConfigurationTracker;

#[cfg(test)]
mod tests;
