//! Simulated CrossCode backend served over gRPC, and the matching client.

mod client;
mod service;
pub mod sim;
mod wire;

pub use client::GrpcBackend;
pub use service::BridgeSvc;
pub use sim::{register_simulated_commands, SimConfig};

use crosscode_ops::LocalBackend;

/// A [`LocalBackend`] with every simulated command registered.
pub fn simulated_backend(config: SimConfig) -> LocalBackend {
    let backend = LocalBackend::new();
    register_simulated_commands(&backend, config);
    backend
}
