//! Infrastructure adapters and runtime bootstrap.

pub mod bootstrap;
pub mod error;
pub mod http;
pub mod stores;
pub mod telemetry;
