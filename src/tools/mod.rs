//! Tool system: descriptors, providers, schema validation, and the
//! policy-gated registry/dispatcher.

pub mod inproc;
pub mod registry;
pub mod schema;
pub mod traits;

pub use inproc::{FnTool, InProcessProvider};
pub use registry::{RegistryConfig, ToolRegistry};
pub use traits::{
    ConfirmationHandler, PermissionLevel, Tool, ToolDescriptor, ToolProvider, ToolResult,
};
