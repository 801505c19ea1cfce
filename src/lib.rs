//! paperprobe Library
//!
//! Protocol driving harness for research-paper MCP servers: a stdio
//! transport, a JSON-RPC client, a session state machine, and a contract
//! verifier that checks what the server does at its boundary.

pub mod batch;
pub mod config;
pub mod contract;
pub mod error;
pub mod mcp;

pub use error::{HarnessError, HarnessResult};
