//! MCP (Model Context Protocol) Client Harness
//!
//! Drives a research MCP server over its standard streams.
//!
//! # Architecture
//!
//! The implementation is organized into layers, leaves first:
//!
//! 1. **Transport Layer** (`transport`): child process, newline-framed lines
//! 2. **Protocol Layer** (`protocol`): JSON-RPC 2.0 message types and decoding
//! 3. **Client Layer** (`client`): request ids, correlation, timeouts
//! 4. **Session Layer** (`session`): lifecycle state machine
//!
//! # Design Principles
//!
//! - **Explicit deadlines**: every read has one; a timeout is a value
//! - **One request in flight**: responses are matched strictly by id
//! - **No leaked servers**: every exit path terminates and reaps the child

// Protocol layer: JSON-RPC 2.0 message types
pub mod protocol;

// Transport layer: stdio child process
pub mod transport;

// Client layer: correlation and timeouts
pub mod client;

// Session layer: lifecycle state machine
pub mod session;

// Retry logic for batch runs
pub mod retry;

// Re-export commonly used types for convenience
pub use protocol::{
    ContentBlock, InitializeResult, McpError, McpMethod, McpRequest, McpResponse, ServerInfo,
    Tool, ToolCallResult,
};

pub use transport::{LaunchSpec, LineTransport, ReadOutcome, ShutdownPolicy, StdioTransport};

pub use client::{CallOutcome, ProtocolClient, ServerNotification, MAX_BUFFERED_NOTIFICATIONS};

pub use session::{
    PendingReply, Session, SessionState, TerminationCause, ToolFailureKind, ToolOutcome,
};

// In-memory transport for unit tests
#[cfg(test)]
pub(crate) mod testing;

// Property-based tests module
#[cfg(test)]
mod proptests;

#[cfg(test)]
mod tests {
    use crate::mcp::{McpError, McpRequest};

    #[test]
    fn test_protocol_module_available() {
        let req = McpRequest::new(1, "initialize", None);
        assert_eq!(req.jsonrpc, "2.0");
        assert_eq!(req.method, "initialize");
    }

    #[test]
    fn test_error_creation() {
        let err = McpError::method_not_found("tools/unknown");
        assert_eq!(err.code, -32601);
        assert!(err.message.contains("tools/unknown"));
    }
}
