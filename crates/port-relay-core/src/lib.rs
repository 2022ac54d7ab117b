//! # Port-Relay Core
//!
//! Core library for the port-relay service.
//! Provides route file parsing, the non-blocking relay engine and the worker
//! pool that drives relay instances.

pub mod config;
pub mod error;
pub mod pool;
pub mod relay;
pub mod route;

pub use config::{Config, LoggingConfig, ServerConfig};
pub use error::{Error, Result};
pub use pool::{default_worker_count, distribute, worker_count, Worker};
pub use relay::{RelayInstance, BUFFER_SIZE, POLL_TIMEOUT};
pub use route::{Diagnostic, LineProblem, RouteDescriptor, RouteTable};
