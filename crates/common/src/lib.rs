//! Reusable utilities shared by every federator service: tracing setup and retry policies.

pub mod logging;
pub mod retry;

// Re-export tracing crate for convenience.
pub use tracing;
