//! Application services shared by the binary and the HTTP surface.

pub mod error;
pub mod gateway;
pub mod render;
