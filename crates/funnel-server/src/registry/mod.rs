//! Registry of live connections.

pub mod connection;

pub use connection::{ConnectionRegistry, RegistryEntry};
