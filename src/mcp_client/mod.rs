//! MCP Client — supervised JSON-RPC over stdio to MCP server processes.
//!
//! This module handles:
//! - Discovering which tool-provider servers can run on this machine
//! - Spawning each server as a child process and owning it until shutdown
//! - JSON-RPC 2.0 over the process's stdio, many calls in flight at once
//! - Detecting process death and failing every outstanding call
//! - Routing `list_tools` / `call_tool` through one facade, [`McpManager`]

pub mod codec;
pub mod discovery;
pub mod errors;
pub mod extensions;
pub mod lifecycle;
pub mod manager;
pub mod pending;
pub mod registry;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use discovery::{PathProbe, PrerequisiteProbe};
pub use errors::McpError;
pub use extensions::{ExtensionCatalog, ExtensionDescriptor};
pub use manager::{InitReport, McpManager};
pub use registry::ServerRegistry;
pub use supervisor::{Supervisor, SupervisorSettings};
pub use types::{ConnectionState, ServerDefinition, ServerStatus, ToolDescriptor};
