// ABOUTME: Library root for sql-entity-bridge
// ABOUTME: Exposes the entity codec, sources, sinks, registry and HTTP router

pub mod config;
pub mod entity;
pub mod error;
pub mod postgres;
pub mod registry;
pub mod server;
pub mod sink;
pub mod source;
pub mod utils;

pub use config::BridgeConfig;
pub use entity::{Entity, Value};
pub use error::BridgeError;
pub use registry::Registry;
pub use sink::{Sink, WriteStats};
pub use source::{EntityStream, Source};
