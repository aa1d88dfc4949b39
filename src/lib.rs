//! mcp-hub — supervises Model Context Protocol servers as child processes
//! and exposes their tools through one async facade.
//!
//! ```no_run
//! use mcp_hub::config::ManagerConfig;
//! use mcp_hub::mcp_client::McpManager;
//!
//! # async fn demo() -> Result<(), mcp_hub::mcp_client::McpError> {
//! let manager = McpManager::new(ManagerConfig::load(None)?);
//! let report = manager.initialize_all().await;
//! for server in &report.connected {
//!     let tools = manager.list_tools(server).await?;
//!     println!("{server}: {} tools", tools.len());
//! }
//! manager.shutdown_all().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod logging;
pub mod mcp_client;
