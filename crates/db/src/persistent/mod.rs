//! SQLite-backed storage.

pub mod config;
pub mod constants;
pub mod errors;
pub mod sqlite;
