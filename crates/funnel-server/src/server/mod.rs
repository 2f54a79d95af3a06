//! Connection multiplexing server.
//!
//! Accepts transport connections, turns each one into a session with its
//! own service manager, and tracks every live pair until it closes or the
//! server stops.

mod config;
mod mux;

pub use config::ServerConfig;
pub use mux::{MuxServer, MuxServerBuilder};
