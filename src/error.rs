//! Harness Error Types
//!
//! Failures are split by layer. Transport and protocol failures are fatal
//! to a [`Session`](crate::mcp::Session) and terminate it; state-machine
//! misuse only rejects the offending call. Tool-level failures are not
//! errors at all: they travel as data on
//! [`ToolOutcome`](crate::mcp::ToolOutcome), and a timeout is a value of
//! [`CallOutcome`](crate::mcp::CallOutcome).

use crate::mcp::protocol::McpError;
use crate::mcp::session::{SessionState, TerminationCause};
use std::io;

/// Result alias for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error taxonomy of the protocol driving harness
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// The server executable could not be found or started
    #[error("Failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The peer closed its end of the pipe (or the transport is gone)
    #[error("Broken pipe to MCP server: {reason}")]
    BrokenPipe { reason: String },

    /// An inbound line was not a valid JSON-RPC message
    #[error("Malformed message from MCP server ({reason}): {line}")]
    ProtocolDecode { line: String, reason: String },

    /// A message arrived that does not answer the outstanding request
    #[error("Unexpected message id: expected {expected}, got {got}")]
    UnexpectedId { expected: u64, got: String },

    /// Tool methods are only permitted in the Ready state
    #[error("Session is not ready (state: {state:?})")]
    SessionNotReady { state: SessionState },

    /// The session is terminated; no further calls are accepted
    #[error("Session is terminated: {cause}")]
    SessionTerminated { cause: TerminationCause },

    /// A request is still awaiting its response
    #[error("Request {id} is still in flight")]
    RequestInFlight { id: u64 },

    /// await_pending() was called with no request outstanding
    #[error("No request is awaiting a response")]
    NoPendingRequest,

    /// The server answered a lifecycle method with a JSON-RPC error
    #[error("MCP server returned an error: {0}")]
    Rpc(McpError),

    /// Local I/O failure outside the transport (artifact inspection etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// Whether this failure must terminate the owning session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::BrokenPipe { .. }
                | Self::ProtocolDecode { .. }
                | Self::UnexpectedId { .. }
        )
    }

    pub(crate) fn broken_pipe(reason: impl Into<String>) -> Self {
        Self::BrokenPipe {
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(line: &str, reason: impl Into<String>) -> Self {
        Self::ProtocolDecode {
            line: line.trim_end().to_string(),
            reason: reason.into(),
        }
    }
}
