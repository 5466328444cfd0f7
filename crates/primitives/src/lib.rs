//! General types and pure functions shared across the federator crates.
//!
//! This crate lies at the bottom of the crate hierarchy in this workspace, i.e., it does not depend
//! on any other crate in this workspace.

pub mod amount;
pub mod errors;
pub mod params;
pub mod types;
