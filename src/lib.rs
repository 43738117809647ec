//! Routing and incremental cache gateway for prerendered sites.
//!
//! Requests are resolved against the build manifests ([`routing`]), answered
//! from stored artifacts when possible ([`cache`]), and otherwise forwarded to
//! the render origin. Stale artifacts are regenerated in the background
//! through [`queue`].

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod queue;
pub mod routing;
pub mod util;
