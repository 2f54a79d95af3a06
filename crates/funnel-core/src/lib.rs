//! `funnel` Core Library
//!
//! Shared functionality for `funnel` components:
//! - Tunneled service configuration and config file loading
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{ServiceConfig, ServiceKind};
pub use error::{Error, Result};
