//! MCP Session State Machine
//!
//! A [`Session`] wraps a [`ProtocolClient`] and enforces the lifecycle
//!
//! ```text
//! Unstarted → Starting → Initializing → Ready → Terminated
//! ```
//!
//! Tool methods are only accepted in `Ready`. `Terminated` is absorbing: every
//! later call fails immediately without touching the transport. Transport and
//! protocol failures terminate the session and reap the server; tool failures
//! are returned as data and leave the session `Ready`.

use crate::error::{HarnessError, HarnessResult};
use crate::mcp::client::{CallOutcome, ProtocolClient, ServerNotification};
use crate::mcp::protocol::{
    ContentBlock, InitializeParams, InitializeResult, McpError, McpMethod, McpResponse, Tool,
    ToolCallResult, ToolsListResult,
};
use crate::mcp::transport::{LaunchSpec, LineTransport, StdioTransport};
use serde_json::{json, Value};
use std::fmt;
use std::time::{Duration, Instant};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, server not spawned yet
    Unstarted,

    /// Server spawned, handshake not started
    Starting,

    /// `initialize` is in progress
    Initializing,

    /// Handshake complete; tool calls allowed
    Ready,

    /// Server terminated; no further calls accepted
    Terminated,
}

/// Why a session reached `Terminated`
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationCause {
    /// Explicit shutdown by the caller
    Shutdown,

    /// The server process could not be started
    SpawnFailed(String),

    /// The server answered `initialize` with an error
    InitializeRejected(McpError),

    /// No `initialize` response before the deadline
    InitializeTimedOut,

    /// Broken pipe or closed output
    Transport(String),

    /// Malformed or unexpected message
    Protocol(String),
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shut down by caller"),
            Self::SpawnFailed(reason) => write!(f, "spawn failed: {}", reason),
            Self::InitializeRejected(error) => write!(f, "initialize rejected: {}", error),
            Self::InitializeTimedOut => write!(f, "initialize timed out"),
            Self::Transport(reason) => write!(f, "transport failure: {}", reason),
            Self::Protocol(reason) => write!(f, "protocol violation: {}", reason),
        }
    }
}

impl TerminationCause {
    fn from_error(error: &HarnessError) -> Self {
        match error {
            HarnessError::Spawn { .. } => Self::SpawnFailed(error.to_string()),
            HarnessError::BrokenPipe { .. } | HarnessError::Io(_) => {
                Self::Transport(error.to_string())
            }
            _ => Self::Protocol(error.to_string()),
        }
    }
}

/// How a failed tool call should be read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The arguments were rejected before the tool ran
    Validation,

    /// The tool ran and failed (network, provider exhaustion, not found)
    Execution,
}

/// Result of one `tools/call`, success or failure
///
/// A failing tool is data: the session stays `Ready`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub tool: String,
    pub is_error: bool,
    pub failure: Option<ToolFailureKind>,
    pub text: String,
    pub content: Vec<ContentBlock>,
    pub elapsed: Duration,
}

impl ToolOutcome {
    fn from_result(tool: &str, result: ToolCallResult, elapsed: Duration) -> Self {
        let text = result.text();
        let is_error = result.is_error();
        let failure = is_error.then(|| classify_failure_text(&text));
        Self {
            tool: tool.to_string(),
            is_error,
            failure,
            text,
            content: result.content,
            elapsed,
        }
    }

    fn from_rpc_error(tool: &str, error: McpError, elapsed: Duration) -> Self {
        let failure = if error.is_invalid_params() {
            ToolFailureKind::Validation
        } else {
            classify_failure_text(&error.message)
        };
        Self {
            tool: tool.to_string(),
            is_error: true,
            failure: Some(failure),
            text: error.message.clone(),
            content: vec![ContentBlock::Text {
                text: error.message,
            }],
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        !self.is_error
    }

    pub fn is_validation_failure(&self) -> bool {
        self.failure == Some(ToolFailureKind::Validation)
    }
}

fn classify_failure_text(text: &str) -> ToolFailureKind {
    let lower = text.to_lowercase();
    let validation_markers = ["invalid", "missing", "required", "must provide", "not allowed"];
    if validation_markers.iter().any(|marker| lower.contains(marker)) {
        ToolFailureKind::Validation
    } else {
        ToolFailureKind::Execution
    }
}

/// A reply collected by [`Session::await_pending`]
#[derive(Debug, Clone, PartialEq)]
pub enum PendingReply {
    Tools(Vec<Tool>),
    Tool(ToolOutcome),
}

#[derive(Debug, Clone)]
enum PendingCall {
    ListTools,
    CallTool { name: String, started: Instant },
}

/// A stateful MCP session with one research server
///
/// # Example
///
/// ```ignore
/// let mut session = Session::launch(LaunchSpec::new("rust-research-mcp")).await?;
/// session.initialize(Duration::from_secs(10)).await?;
/// let tools = session.list_tools(Duration::from_secs(10)).await?;
/// let echo = session
///     .call_tool("debug_test", json!({"message": "hi"}), Duration::from_secs(10))
///     .await?;
/// session.shutdown().await?;
/// ```
pub struct Session<T = StdioTransport>
where
    T: LineTransport,
{
    /// Launch parameters until the server is spawned
    spec: Option<LaunchSpec>,

    client: Option<ProtocolClient<T>>,

    state: SessionState,

    cause: Option<TerminationCause>,

    /// Negotiated server details (after initialization)
    server: Option<InitializeResult>,

    /// Tools from the last successful listing
    tools: Vec<Tool>,

    pending: Option<PendingCall>,

    exit_code: Option<i32>,
}

impl Session<StdioTransport> {
    /// Create an unstarted session
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec: Some(spec),
            client: None,
            state: SessionState::Unstarted,
            cause: None,
            server: None,
            tools: Vec::new(),
            pending: None,
            exit_code: None,
        }
    }

    /// Spawn the server (`Unstarted → Starting`)
    ///
    /// A spawn failure moves the session to `Terminated`.
    pub async fn start(&mut self) -> HarnessResult<()> {
        self.ensure_state(SessionState::Unstarted)?;
        let Some(spec) = self.spec.take() else {
            return Err(HarnessError::SessionNotReady { state: self.state });
        };

        match StdioTransport::start(&spec).await {
            Ok(transport) => {
                self.client = Some(ProtocolClient::new(transport));
                self.state = SessionState::Starting;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Terminated;
                self.cause = Some(TerminationCause::from_error(&e));
                Err(e)
            }
        }
    }

    /// Create and start a session in one step
    pub async fn launch(spec: LaunchSpec) -> HarnessResult<Self> {
        let mut session = Self::new(spec);
        session.start().await?;
        Ok(session)
    }
}

impl<T> Session<T>
where
    T: LineTransport,
{
    /// Wrap an already running transport; the session starts in `Starting`
    pub fn with_transport(transport: T) -> Self {
        Self {
            spec: None,
            client: Some(ProtocolClient::new(transport)),
            state: SessionState::Starting,
            cause: None,
            server: None,
            tools: Vec::new(),
            pending: None,
            exit_code: None,
        }
    }

    /// Get the current session state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Why the session terminated, once it has
    pub fn termination_cause(&self) -> Option<&TerminationCause> {
        self.cause.as_ref()
    }

    /// Server details negotiated by `initialize`
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Tools from the most recent `list_tools`
    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    /// Exit code of the server once reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// The protocol client (absent before the server is spawned)
    pub fn client(&self) -> Option<&ProtocolClient<T>> {
        self.client.as_ref()
    }

    /// Drain the buffered server notifications
    pub fn take_notifications(&mut self) -> Vec<ServerNotification> {
        self.client
            .as_mut()
            .map(ProtocolClient::take_notifications)
            .unwrap_or_default()
    }

    /// Server notifications received over the session's lifetime
    pub fn notification_count(&self) -> u64 {
        self.client
            .as_ref()
            .map(ProtocolClient::notification_count)
            .unwrap_or_default()
    }

    /// Run the handshake (`Starting → Initializing → Ready`)
    ///
    /// Sends `initialize` with protocol version `2024-11-05`, then the
    /// `notifications/initialized` notification. An error response, a
    /// timeout or a transport failure terminates the session; a timeout is
    /// still reported as [`CallOutcome::Timeout`].
    pub async fn initialize(
        &mut self,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<InitializeResult>> {
        self.ensure_state(SessionState::Starting)?;
        self.state = SessionState::Initializing;
        tracing::info!("Initializing MCP session...");

        let params = serde_json::to_value(InitializeParams::harness())
            .map_err(std::io::Error::from)?;

        let outcome = match self.raw_call(McpMethod::Initialize, params, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e).await),
        };

        let response = match outcome {
            CallOutcome::Response(response) => response,
            CallOutcome::Timeout { id } => {
                tracing::warn!("MCP server did not answer initialize within {:?}", timeout);
                self.terminate_with(TerminationCause::InitializeTimedOut).await;
                return Ok(CallOutcome::Timeout { id });
            }
        };

        let result = match response.into_result() {
            Ok(result) => result,
            Err(error) => {
                tracing::error!("Initialize rejected: {}", error);
                self.terminate_with(TerminationCause::InitializeRejected(error.clone()))
                    .await;
                return Err(HarnessError::Rpc(error));
            }
        };

        let info: InitializeResult = match decode_payload(McpMethod::Initialize, result) {
            Ok(info) => info,
            Err(e) => return Err(self.fail(e).await),
        };

        if let Err(e) = self.notify(McpMethod::Initialized).await {
            return Err(self.fail(e).await);
        }

        tracing::info!(
            "MCP session ready: {} v{} (protocol {})",
            info.server_info.name,
            info.server_info.version,
            info.protocol_version
        );
        self.server = Some(info.clone());
        self.state = SessionState::Ready;
        Ok(CallOutcome::Response(info))
    }

    /// List the server's tools (`Ready` only)
    pub async fn list_tools(&mut self, timeout: Duration) -> HarnessResult<CallOutcome<Vec<Tool>>> {
        self.ensure_ready()?;
        tracing::debug!("Listing available tools from MCP server");

        let outcome = match self.raw_call(McpMethod::ToolsList, json!({}), timeout).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e).await),
        };

        match outcome {
            CallOutcome::Response(response) => {
                self.finish_list_tools(response).await.map(CallOutcome::Response)
            }
            CallOutcome::Timeout { id } => {
                self.pending = Some(PendingCall::ListTools);
                Ok(CallOutcome::Timeout { id })
            }
        }
    }

    /// Invoke a tool (`Ready` only)
    ///
    /// Tool failures, whether flagged `isError` or answered with a JSON-RPC
    /// error, come back as a [`ToolOutcome`] with `is_error` set.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<ToolOutcome>> {
        self.ensure_ready()?;
        tracing::debug!("Calling tool: {} with arguments: {}", name, arguments);

        let started = Instant::now();
        let params = json!({"name": name, "arguments": arguments});
        let outcome = match self.raw_call(McpMethod::ToolsCall, params, timeout).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e).await),
        };

        match outcome {
            CallOutcome::Response(response) => self
                .finish_call_tool(name, started, response)
                .await
                .map(CallOutcome::Response),
            CallOutcome::Timeout { id } => {
                tracing::warn!("Tool '{}' did not answer within {:?}", name, timeout);
                self.pending = Some(PendingCall::CallTool {
                    name: name.to_string(),
                    started,
                });
                Ok(CallOutcome::Timeout { id })
            }
        }
    }

    /// Keep waiting for a call that timed out
    pub async fn await_pending(
        &mut self,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<PendingReply>> {
        self.ensure_ready()?;
        let Some(pending) = self.pending.clone() else {
            return Err(HarnessError::NoPendingRequest);
        };

        let outcome = match self.client_mut()?.await_pending(timeout).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(e).await),
        };
        let response = match outcome {
            CallOutcome::Response(response) => response,
            CallOutcome::Timeout { id } => return Ok(CallOutcome::Timeout { id }),
        };

        self.pending = None;
        let reply = match pending {
            PendingCall::ListTools => PendingReply::Tools(self.finish_list_tools(response).await?),
            PendingCall::CallTool { name, started } => {
                PendingReply::Tool(self.finish_call_tool(&name, started, response).await?)
            }
        };
        Ok(CallOutcome::Response(reply))
    }

    /// Terminate the server; any state → `Terminated`
    ///
    /// Idempotent: later calls return the recorded exit code.
    pub async fn shutdown(&mut self) -> HarnessResult<Option<i32>> {
        if self.state != SessionState::Terminated {
            self.terminate_with(TerminationCause::Shutdown).await;
        }
        Ok(self.exit_code)
    }

    async fn finish_list_tools(&mut self, response: McpResponse) -> HarnessResult<Vec<Tool>> {
        let result = response.into_result().map_err(HarnessError::Rpc)?;
        let listed: ToolsListResult = match decode_payload(McpMethod::ToolsList, result) {
            Ok(listed) => listed,
            Err(e) => return Err(self.fail(e).await),
        };

        tracing::info!("Listed {} tools from MCP server", listed.tools.len());
        for tool in &listed.tools {
            tracing::debug!("  - {}", tool.name);
        }
        self.tools = listed.tools.clone();
        Ok(listed.tools)
    }

    async fn finish_call_tool(
        &mut self,
        name: &str,
        started: Instant,
        response: McpResponse,
    ) -> HarnessResult<ToolOutcome> {
        let elapsed = started.elapsed();
        let outcome = match response.into_result() {
            Ok(result) => match decode_payload::<ToolCallResult>(McpMethod::ToolsCall, result) {
                Ok(result) => ToolOutcome::from_result(name, result, elapsed),
                Err(e) => return Err(self.fail(e).await),
            },
            Err(error) => ToolOutcome::from_rpc_error(name, error, elapsed),
        };

        if outcome.is_error {
            tracing::info!("Tool '{}' reported failure after {:?}", name, elapsed);
        } else {
            tracing::debug!("Tool '{}' succeeded after {:?}", name, elapsed);
        }
        Ok(outcome)
    }

    async fn raw_call(
        &mut self,
        method: McpMethod,
        params: Value,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<McpResponse>> {
        self.client_mut()?.call(method.as_str(), params, timeout).await
    }

    async fn notify(&mut self, method: McpMethod) -> HarnessResult<()> {
        self.client_mut()?.notify(method.as_str(), json!({})).await
    }

    fn client_mut(&mut self) -> HarnessResult<&mut ProtocolClient<T>> {
        let state = self.state;
        self.client
            .as_mut()
            .ok_or(HarnessError::SessionNotReady { state })
    }

    fn ensure_state(&self, expected: SessionState) -> HarnessResult<()> {
        match self.state {
            SessionState::Terminated => Err(self.terminated_error()),
            state if state == expected => Ok(()),
            state => Err(HarnessError::SessionNotReady { state }),
        }
    }

    fn ensure_ready(&self) -> HarnessResult<()> {
        self.ensure_state(SessionState::Ready)
    }

    fn terminated_error(&self) -> HarnessError {
        HarnessError::SessionTerminated {
            cause: self
                .cause
                .clone()
                .unwrap_or(TerminationCause::Shutdown),
        }
    }

    /// Terminate on fatal errors and hand the error back
    async fn fail(&mut self, error: HarnessError) -> HarnessError {
        if error.is_fatal() {
            tracing::error!("Fatal MCP session error: {}", error);
            self.terminate_with(TerminationCause::from_error(&error)).await;
        }
        error
    }

    async fn terminate_with(&mut self, cause: TerminationCause) {
        tracing::debug!("MCP session terminating: {}", cause);
        self.state = SessionState::Terminated;
        self.cause = Some(cause);
        self.pending = None;
        self.spec = None;

        if let Some(client) = self.client.as_mut() {
            match client.terminate().await {
                Ok(code) => self.exit_code = code,
                Err(e) => tracing::warn!("Error while terminating MCP server: {}", e),
            }
        }
    }
}

/// Diagnostics only: logs a session dropped without [`Session::shutdown`]
///
/// The server process is stopped by the transport's own `Drop`
/// ([`StdioTransport`] kills the child), not here.
impl<T> Drop for Session<T>
where
    T: LineTransport,
{
    fn drop(&mut self) {
        if self.client.is_some() && self.state != SessionState::Terminated {
            tracing::debug!("Session dropped in state {:?} without shutdown", self.state);
        }
    }
}

fn decode_payload<P>(method: McpMethod, result: Value) -> HarnessResult<P>
where
    P: serde::de::DeserializeOwned,
{
    serde_json::from_value(result.clone()).map_err(|e| HarnessError::ProtocolDecode {
        line: result.to_string(),
        reason: format!("invalid {} result: {}", method, e),
    })
}
