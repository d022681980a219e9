//! Control plane for a fleet of remote telemetry agents.
//!
//! Agents hold long-lived sessions with the server and receive versioned
//! configurations chosen by label selectors. [`opamp::ControlServer`] is the
//! entry point.

pub mod build_info;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod opamp;
pub mod protocol;
pub mod rpc;
pub mod rpc_server;
pub mod store;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ControlError, ControlResult, StoreError};
pub use opamp::ControlServer;
