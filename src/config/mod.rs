//! Engine configuration schema and startup validation.

pub mod schema;

pub use schema::{BackendConfig, BackendKind, EngineConfig};
