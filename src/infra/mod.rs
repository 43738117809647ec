//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod manifests;
pub mod origin;
pub mod telemetry;
