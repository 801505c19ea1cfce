//! MCP Protocol Client
//!
//! Maps method calls onto transport lines and correlates the answers.
//!
//! # Correlation
//!
//! The client keeps at most one request in flight. After writing a request it
//! reads lines until one decodes as the response carrying the same id, or the
//! caller's deadline passes. Any other response, or a server-initiated
//! request, is a protocol violation in this strictly sequential design.
//! Server notifications are recorded and skipped; only the most recent
//! [`MAX_BUFFERED_NOTIFICATIONS`] are kept between drains.

use crate::error::{HarnessError, HarnessResult};
use crate::mcp::protocol::{InboundMessage, McpNotification, McpRequest, McpResponse};
use crate::mcp::transport::{LineTransport, ReadOutcome};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Either the awaited value or a timeout
///
/// A timeout is not an error: the request stays pending and the caller decides
/// whether to keep waiting or to tear the session down.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Response(T),
    Timeout { id: u64 },
}

impl<T> CallOutcome<T> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn into_response(self) -> Option<T> {
        match self {
            Self::Response(value) => Some(value),
            Self::Timeout { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CallOutcome<U> {
        match self {
            Self::Response(value) => CallOutcome::Response(f(value)),
            Self::Timeout { id } => CallOutcome::Timeout { id },
        }
    }
}

/// Notifications kept between two `take_notifications()` calls
pub const MAX_BUFFERED_NOTIFICATIONS: usize = 64;

/// A notification the server sent while a request was outstanding
#[derive(Debug, Clone, PartialEq)]
pub struct ServerNotification {
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC client over a [`LineTransport`]
pub struct ProtocolClient<T>
where
    T: LineTransport,
{
    transport: T,

    /// Next request ID (monotonically increasing, starts at 1)
    next_id: u64,

    /// Id of the request still awaiting its response
    pending: Option<u64>,

    /// Notifications received since the last take_notifications()
    notifications: VecDeque<ServerNotification>,

    /// Notifications received over the client's lifetime
    notification_count: u64,
}

impl<T> ProtocolClient<T>
where
    T: LineTransport,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            next_id: 1,
            pending: None,
            notifications: VecDeque::new(),
            notification_count: 0,
        }
    }

    /// Get the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Get a mutable reference to the underlying transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Id of the outstanding request, if any
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Id the next request will carry
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Drain the buffered server notifications, oldest first
    pub fn take_notifications(&mut self) -> Vec<ServerNotification> {
        self.notifications.drain(..).collect()
    }

    /// Total notifications received, including ones dropped from the buffer
    pub fn notification_count(&self) -> u64 {
        self.notification_count
    }

    /// Send a request and wait up to `timeout` for its response
    ///
    /// # Errors
    ///
    /// - [`HarnessError::RequestInFlight`] if an earlier call timed out and
    ///   its response has not been collected
    /// - [`HarnessError::BrokenPipe`] if the server is gone
    /// - [`HarnessError::ProtocolDecode`] for a malformed line
    /// - [`HarnessError::UnexpectedId`] for a message that is not the answer
    pub async fn call(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<McpResponse>> {
        if let Some(id) = self.pending {
            return Err(HarnessError::RequestInFlight { id });
        }

        let id = self.next_id;
        self.next_id += 1;

        let request = McpRequest::new(id, method, Some(params));
        let line = serde_json::to_string(&request).map_err(std::io::Error::from)?;

        tracing::debug!("Calling {} (id {}, timeout {:?})", method, id, timeout);
        self.transport.write_line(&line).await?;
        self.pending = Some(id);

        self.await_response(id, timeout).await
    }

    /// Keep waiting for the request that timed out earlier
    pub async fn await_pending(
        &mut self,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<McpResponse>> {
        let id = self.pending.ok_or(HarnessError::NoPendingRequest)?;
        self.await_response(id, timeout).await
    }

    /// Send a notification; no response is read
    pub async fn notify(&mut self, method: &str, params: Value) -> HarnessResult<()> {
        let notification = McpNotification::new(method, Some(params));
        let line = serde_json::to_string(&notification).map_err(std::io::Error::from)?;

        tracing::debug!("Notifying {}", method);
        self.transport.write_line(&line).await
    }

    /// Terminate the transport; the client keeps no request pending afterwards
    pub async fn terminate(&mut self) -> HarnessResult<Option<i32>> {
        self.pending = None;
        self.transport.terminate().await
    }

    async fn await_response(
        &mut self,
        id: u64,
        timeout: Duration,
    ) -> HarnessResult<CallOutcome<McpResponse>> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::debug!("Request {} timed out after {:?}", id, timeout);
                return Ok(CallOutcome::Timeout { id });
            }

            let line = match self.transport.read_line(remaining).await {
                Ok(ReadOutcome::Line(line)) => line,
                Ok(ReadOutcome::Timeout) => {
                    tracing::debug!("Request {} timed out after {:?}", id, timeout);
                    return Ok(CallOutcome::Timeout { id });
                }
                Ok(ReadOutcome::Closed) => {
                    self.pending = None;
                    return Err(HarnessError::broken_pipe(format!(
                        "server closed its output while request {} was pending",
                        id
                    )));
                }
                Err(e) => {
                    self.pending = None;
                    return Err(e);
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let message = match InboundMessage::decode(&line) {
                Ok(message) => message,
                Err(e) => {
                    self.pending = None;
                    return Err(HarnessError::decode(&line, e.to_string()));
                }
            };

            match message {
                InboundMessage::Response(response) if response.id == id => {
                    self.pending = None;
                    return Ok(CallOutcome::Response(response));
                }
                InboundMessage::Response(response) => {
                    self.pending = None;
                    return Err(HarnessError::UnexpectedId {
                        expected: id,
                        got: response.id.to_string(),
                    });
                }
                InboundMessage::UnaddressedResponse { id: got } => {
                    self.pending = None;
                    return Err(HarnessError::UnexpectedId {
                        expected: id,
                        got: got.to_string(),
                    });
                }
                InboundMessage::ServerRequest { id: got, method } => {
                    self.pending = None;
                    return Err(HarnessError::UnexpectedId {
                        expected: id,
                        got: format!("{} (server request '{}')", got, method),
                    });
                }
                InboundMessage::Notification { method, params } => {
                    tracing::debug!("Server notification while awaiting {}: {}", id, method);
                    self.notification_count += 1;
                    if self.notifications.len() == MAX_BUFFERED_NOTIFICATIONS {
                        self.notifications.pop_front();
                    }
                    self.notifications.push_back(ServerNotification { method, params });
                }
            }
        }
    }
}
