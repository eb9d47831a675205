//! HTTP surfaces.

pub mod streams;

pub use streams::{StreamServer, StreamServerConfig};
