//! In-memory transport for unit tests
//!
//! Lines are served from a script; a responder can append replies whenever
//! the client writes a line, which lets tests model a live server without a
//! child process.

use crate::error::{HarnessError, HarnessResult};
use crate::mcp::transport::{LineTransport, ReadOutcome};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;

type Responder = Box<dyn FnMut(&Value) -> Vec<String> + Send>;

pub(crate) struct ScriptedTransport {
    script: VecDeque<ReadOutcome>,
    responder: Option<Responder>,
    written: Vec<String>,
    reads: usize,
    terminations: usize,
    connected: bool,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            script: VecDeque::new(),
            responder: None,
            written: Vec::new(),
            reads: 0,
            terminations: 0,
            connected: true,
        }
    }

    pub(crate) fn with_responder(
        responder: impl FnMut(&Value) -> Vec<String> + Send + 'static,
    ) -> Self {
        let mut transport = Self::new();
        transport.responder = Some(Box::new(responder));
        transport
    }

    /// Answers every request with an empty result carrying the same id
    pub(crate) fn echo_ids() -> Self {
        Self::with_responder(|message| match message.get("id") {
            Some(id) => vec![json!({"jsonrpc": "2.0", "id": id, "result": {}}).to_string()],
            None => Vec::new(),
        })
    }

    /// A well-behaved research server: handshake, four tools, debug echo
    pub(crate) fn research_server() -> Self {
        Self::with_responder(|message| {
            let Some(id) = message.get("id") else {
                return Vec::new();
            };
            let result = match message["method"].as_str() {
                Some("initialize") => json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "scripted-research", "version": "0.0.1"}
                }),
                Some("tools/list") => {
                    let tools: Vec<Value> =
                        ["search_papers", "download_paper", "extract_metadata", "debug_test"]
                            .iter()
                            .map(|name| {
                                json!({
                                    "name": name,
                                    "description": format!("{} tool", name),
                                    "inputSchema": {"type": "object", "properties": {}}
                                })
                            })
                            .collect();
                    json!({ "tools": tools })
                }
                Some("tools/call") => {
                    let name = message["params"]["name"].as_str().unwrap_or_default();
                    let args = &message["params"]["arguments"];
                    match name {
                        "debug_test" => json!({
                            "content": [{
                                "type": "text",
                                "text": format!("Debug echo: {}", args["message"].as_str().unwrap_or("No message provided"))
                            }],
                            "isError": false
                        }),
                        _ => json!({
                            "content": [{"type": "text", "text": format!("Tool '{}' failed", name)}],
                            "isError": true
                        }),
                    }
                }
                _ => {
                    return vec![json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32601, "message": "Method not found"}
                    })
                    .to_string()]
                }
            };
            vec![json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()]
        })
    }

    pub(crate) fn push_line(&mut self, line: impl Into<String>) {
        self.script.push_back(ReadOutcome::Line(line.into()));
    }

    pub(crate) fn push_timeout(&mut self) {
        self.script.push_back(ReadOutcome::Timeout);
    }

    pub(crate) fn push_closed(&mut self) {
        self.script.push_back(ReadOutcome::Closed);
    }

    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
    }

    pub(crate) fn written(&self) -> &[String] {
        &self.written
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads
    }

    pub(crate) fn terminations(&self) -> usize {
        self.terminations
    }
}

impl LineTransport for ScriptedTransport {
    async fn write_line(&mut self, line: &str) -> HarnessResult<()> {
        if !self.connected {
            return Err(HarnessError::broken_pipe("scripted transport disconnected"));
        }
        self.written.push(line.to_string());

        if let Some(responder) = self.responder.as_mut() {
            let message: Value = serde_json::from_str(line).unwrap_or(Value::Null);
            for reply in responder(&message) {
                self.script.push_back(ReadOutcome::Line(reply));
            }
        }
        Ok(())
    }

    async fn read_line(&mut self, _timeout: Duration) -> HarnessResult<ReadOutcome> {
        self.reads += 1;
        Ok(self.script.pop_front().unwrap_or(ReadOutcome::Timeout))
    }

    async fn terminate(&mut self) -> HarnessResult<Option<i32>> {
        self.connected = false;
        self.terminations += 1;
        Ok(Some(0))
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
