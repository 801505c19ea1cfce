//! MCP Transport Layer
//!
//! Line-oriented byte exchange with a research MCP server running as a child
//! process. Each message is one newline-terminated UTF-8 line on the child's
//! stdin/stdout; stderr is drained in the background into `tracing`.
//!
//! # Architecture
//!
//! The transport is responsible only for framing and for the lifetime of the
//! child process. JSON-RPC encoding and correlation live in the protocol and
//! client layers, which talk to the transport through [`LineTransport`].

use crate::error::{HarnessError, HarnessResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Outcome of waiting for one line
///
/// A timeout is an ordinary outcome: the caller may read again (a partially
/// received line is kept) or give up and terminate the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete line, without its terminator
    Line(String),

    /// The deadline elapsed before a full line arrived
    Timeout,

    /// The server closed its stdout
    Closed,
}

/// Line transport abstraction
///
/// Implemented by [`StdioTransport`] for real servers and by in-memory
/// transports in tests.
#[allow(async_fn_in_trait)]
pub trait LineTransport: Send {
    /// Write `line` followed by a single `\n`, then flush
    async fn write_line(&mut self, line: &str) -> HarnessResult<()>;

    /// Wait up to `timeout` for the next complete line
    ///
    /// A line that is not valid UTF-8 is a [`HarnessError::ProtocolDecode`]
    /// carrying the lossily decoded text.
    async fn read_line(&mut self, timeout: Duration) -> HarnessResult<ReadOutcome>;

    /// Stop the server and release every stream; safe to call repeatedly
    async fn terminate(&mut self) -> HarnessResult<Option<i32>>;

    /// Whether the transport can still carry messages
    fn is_connected(&self) -> bool;
}

/// Grace periods for the shutdown escalation
///
/// 1. Close the server's stdin and wait `stdin_close_grace`
/// 2. Send SIGTERM (unix) and wait `sigterm_grace`
/// 3. Kill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub stdin_close_grace: Duration,
    pub sigterm_grace: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            stdin_close_grace: Duration::from_secs(2),
            sigterm_grace: Duration::from_secs(3),
        }
    }
}

impl ShutdownPolicy {
    /// Split a total grace budget between the two waiting phases
    pub fn from_total(grace: Duration) -> Self {
        Self {
            stdin_close_grace: grace / 2,
            sigterm_grace: grace - grace / 2,
        }
    }
}

/// How to start the server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Executable to run
    pub command: String,

    /// Command-line arguments
    pub args: Vec<String>,

    /// Extra environment variables (added to the inherited environment)
    pub env: BTreeMap<String, String>,

    /// Working directory of the child (inherited when `None`)
    pub working_dir: Option<PathBuf>,

    /// Shutdown escalation
    pub shutdown: ShutdownPolicy,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            shutdown: ShutdownPolicy::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    /// Command line for diagnostics
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

/// stdio transport for a local MCP server
///
/// Owns the child process and all three of its standard streams. The child is
/// spawned with `kill_on_drop`, and [`Drop`] starts a kill as well, so a
/// transport that is dropped without [`terminate`](LineTransport::terminate)
/// never leaks a running server.
///
/// # Example
///
/// ```ignore
/// let spec = LaunchSpec::new("rust-research-mcp").args(["--log-level", "error"]);
/// let mut transport = StdioTransport::start(&spec).await?;
/// transport.write_line(r#"{"jsonrpc":"2.0","id":1,"method":"tools/list"}"#).await?;
/// let outcome = transport.read_line(Duration::from_secs(5)).await?;
/// transport.terminate().await?;
/// ```
pub struct StdioTransport {
    /// Child process handle (taken by terminate)
    child: Option<Child>,

    /// stdin handle for sending messages (dropped to signal EOF)
    stdin: Option<ChildStdin>,

    /// stdout handle for receiving messages
    stdout: Option<BufReader<ChildStdout>>,

    /// Background task forwarding stderr lines into tracing
    stderr_task: Option<JoinHandle<()>>,

    /// Bytes of a line received before a read timed out
    partial: Vec<u8>,

    /// Server command (for diagnostics)
    command: String,

    shutdown: ShutdownPolicy,

    /// Set once terminate() has reaped the child
    exit_code: Option<Option<i32>>,
}

impl StdioTransport {
    /// Spawn the server described by `spec` with piped standard streams
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Spawn`] if the executable cannot be found or
    /// started.
    pub async fn start(spec: &LaunchSpec) -> HarnessResult<Self> {
        let command = spec.display();
        tracing::info!("Spawning MCP server: {}", command);
        tracing::debug!("Server environment overrides: {:?}", spec.env.keys());

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| HarnessError::Spawn {
            command: command.clone(),
            source,
        })?;

        let (stdin, stdout, stderr) = match (
            child.stdin.take(),
            child.stdout.take(),
            child.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(HarnessError::Spawn {
                    command,
                    source: std::io::Error::other("child standard streams were not piped"),
                });
            }
        };

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "paperprobe::server_stderr", "{}", line);
            }
        });

        tracing::debug!("MCP server started with pid {:?}", child.id());

        Ok(Self {
            child: Some(child),
            stdin: Some(stdin),
            stdout: Some(BufReader::new(stdout)),
            stderr_task: Some(stderr_task),
            partial: Vec::with_capacity(4096),
            command,
            shutdown: spec.shutdown,
            exit_code: None,
        })
    }

    /// Get the server command string (for diagnostics)
    pub fn command(&self) -> &str {
        &self.command
    }

    /// OS process id while the server is running
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Exit code recorded by terminate(); `None` until then
    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.exit_code
    }

    fn take_line(&mut self) -> HarnessResult<String> {
        let bytes = std::mem::take(&mut self.partial);
        let mut line = String::from_utf8(bytes).map_err(|e| {
            HarnessError::decode(&String::from_utf8_lossy(e.as_bytes()), "line is not valid UTF-8")
        })?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn reap(&mut self, mut child: Child) -> HarnessResult<Option<i32>> {
        let policy = self.shutdown;

        if let Ok(Ok(status)) = tokio::time::timeout(policy.stdin_close_grace, child.wait()).await
        {
            tracing::debug!("MCP server exited after stdin close: {}", status);
            return Ok(status.code());
        }

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            tracing::debug!("Sending SIGTERM to MCP server (pid {})", pid);
            // SAFETY: pid belongs to our own unreaped child, so it cannot have been recycled.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if let Ok(Ok(status)) = tokio::time::timeout(policy.sigterm_grace, child.wait()).await
            {
                return Ok(status.code());
            }
        }

        tracing::warn!("MCP server did not exit gracefully, killing: {}", self.command);
        let _ = child.start_kill();
        let status = child.wait().await?;
        Ok(status.code())
    }
}

impl LineTransport for StdioTransport {
    async fn write_line(&mut self, line: &str) -> HarnessResult<()> {
        debug_assert!(!line.contains('\n'), "a frame must be a single line");

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| HarnessError::broken_pipe("transport is terminated"))?;

        tracing::debug!("Sending to MCP server: {}", line);

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        let result = async {
            stdin.write_all(&frame).await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| {
            // The peer is gone; further writes cannot succeed either
            self.stdin = None;
            HarnessError::broken_pipe(format!("write to {} failed: {}", self.command, e))
        })
    }

    async fn read_line(&mut self, timeout: Duration) -> HarnessResult<ReadOutcome> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(ReadOutcome::Closed);
        };

        // read_until keeps already-received bytes in `partial` if the timeout
        // cancels it, so the next call resumes the same line
        match tokio::time::timeout(timeout, stdout.read_until(b'\n', &mut self.partial)).await {
            Err(_) => Ok(ReadOutcome::Timeout),
            Ok(Err(e)) => Err(HarnessError::broken_pipe(format!(
                "read from {} failed: {}",
                self.command, e
            ))),
            Ok(Ok(0)) => {
                self.stdout = None;
                Ok(ReadOutcome::Closed)
            }
            Ok(Ok(_)) => {
                let line = self.take_line()?;
                tracing::debug!("Received from MCP server: {}", line);
                Ok(ReadOutcome::Line(line))
            }
        }
    }

    async fn terminate(&mut self) -> HarnessResult<Option<i32>> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }

        // Closing stdin is the MCP stdio shutdown signal
        self.stdin = None;

        let result = match self.child.take() {
            Some(child) => {
                tracing::info!("Terminating MCP server: {}", self.command);
                self.reap(child).await
            }
            None => Ok(None),
        };

        self.stdout = None;
        self.partial.clear();
        if let Some(mut task) = self.stderr_task.take() {
            // A grandchild may still hold stderr open; do not wait for it forever
            if tokio::time::timeout(self.shutdown.sigterm_grace, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let code = result.as_ref().ok().copied().flatten();
        self.exit_code = Some(code);
        tracing::debug!("MCP server reaped with exit code {:?}", code);
        result
    }

    fn is_connected(&self) -> bool {
        self.exit_code.is_none() && self.stdin.is_some() && self.stdout.is_some()
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        if let Some(mut child) = self.child.take() {
            tracing::debug!("Dropping StdioTransport, killing MCP server");
            // We can't await in Drop; kill_on_drop lets tokio reap it
            let _ = child.start_kill();
            let _ = child.try_wait();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("sh")
            .args(["-c", script])
            .shutdown(ShutdownPolicy::from_total(Duration::from_millis(400)))
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let spec = LaunchSpec::new("/nonexistent/paperprobe-no-such-server");
        match StdioTransport::start(&spec).await {
            Err(HarnessError::Spawn { command, .. }) => {
                assert!(command.contains("paperprobe-no-such-server"))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("spawning a missing executable must fail"),
        }
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let mut transport = StdioTransport::start(&LaunchSpec::new("cat"))
            .await
            .expect("Failed to spawn cat");
        assert!(transport.is_connected());
        assert!(transport.pid().is_some());

        transport
            .write_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        let outcome = transport.read_line(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            outcome,
            ReadOutcome::Line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
        );

        transport.terminate().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_read_timeout_is_an_outcome() {
        let mut transport = StdioTransport::start(&sh("exec sleep 30")).await.unwrap();

        let started = Instant::now();
        let outcome = transport.read_line(Duration::from_millis(100)).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));

        // The transport is still usable after a timeout
        assert!(transport.is_connected());
        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_survives_timeout() {
        let mut transport =
            StdioTransport::start(&sh("printf 'abc'; sleep 1; printf 'def\\n'; exec sleep 30"))
                .await
                .unwrap();

        let first = transport.read_line(Duration::from_millis(200)).await.unwrap();
        assert_eq!(first, ReadOutcome::Timeout);

        let second = transport.read_line(Duration::from_secs(5)).await.unwrap();
        assert_eq!(second, ReadOutcome::Line("abcdef".to_string()));

        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_decode_error() {
        let mut transport = StdioTransport::start(&sh(
            "printf '{\"t\":\"\\377\\376\"}\\n'; echo next; exec sleep 30",
        ))
        .await
        .unwrap();

        match transport.read_line(Duration::from_secs(5)).await {
            Err(HarnessError::ProtocolDecode { line, reason }) => {
                assert!(line.starts_with(r#"{"t":""#), "{}", line);
                assert!(line.contains('\u{FFFD}'));
                assert!(reason.contains("UTF-8"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // The bad line is consumed, not replayed
        assert_eq!(
            transport.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Line("next".to_string())
        );
        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let mut transport = StdioTransport::start(&sh("echo last")).await.unwrap();

        assert_eq!(
            transport.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Line("last".to_string())
        );
        assert_eq!(
            transport.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Closed
        );
        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut transport = StdioTransport::start(&sh("exit 3")).await.unwrap();

        let first = transport.terminate().await.unwrap();
        assert_eq!(first, Some(3));

        let second = transport.terminate().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(transport.exit_code(), Some(Some(3)));
    }

    #[tokio::test]
    async fn test_write_after_terminate_is_broken_pipe() {
        let mut transport = StdioTransport::start(&LaunchSpec::new("cat")).await.unwrap();
        transport.terminate().await.unwrap();

        let err = transport.write_line("{}").await.unwrap_err();
        assert!(matches!(err, HarnessError::BrokenPipe { .. }));
        assert_eq!(
            transport.read_line(Duration::from_millis(50)).await.unwrap(),
            ReadOutcome::Closed
        );
    }

    #[tokio::test]
    async fn test_write_to_exited_server_is_broken_pipe() {
        let mut transport = StdioTransport::start(&sh("exit 0")).await.unwrap();
        // Wait for the child to go away so its stdin is closed
        assert_eq!(
            transport.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Closed
        );

        let mut saw_broken_pipe = false;
        for _ in 0..20 {
            if let Err(err) = transport.write_line(&"x".repeat(1024)).await {
                assert!(matches!(err, HarnessError::BrokenPipe { .. }));
                saw_broken_pipe = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(saw_broken_pipe);
        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("echo \"$PAPERPROBE_TEST_VAR\"; pwd")
            .env("PAPERPROBE_TEST_VAR", "from-harness")
            .working_dir(dir.path());
        let mut transport = StdioTransport::start(&spec).await.unwrap();

        assert_eq!(
            transport.read_line(Duration::from_secs(5)).await.unwrap(),
            ReadOutcome::Line("from-harness".to_string())
        );
        let ReadOutcome::Line(cwd) = transport.read_line(Duration::from_secs(5)).await.unwrap()
        else {
            panic!("expected the working directory");
        };
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(cwd).canonicalize().unwrap(), expected);

        transport.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // SIGTERM is ignored, so only the kill can stop it
        let mut transport = StdioTransport::start(&sh("trap '' TERM; exec sleep 30"))
            .await
            .unwrap();

        let started = Instant::now();
        let code = transport.terminate().await.unwrap();
        assert!(code.is_none(), "a killed process has no exit code");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stderr_does_not_block_server() {
        // 256 KiB on stderr would fill an undrained pipe and wedge the child
        let mut transport = StdioTransport::start(&sh(
            "head -c 262144 /dev/zero | tr '\\0' 'e' >&2; echo done",
        ))
        .await
        .unwrap();

        assert_eq!(
            transport.read_line(Duration::from_secs(10)).await.unwrap(),
            ReadOutcome::Line("done".to_string())
        );
        transport.terminate().await.unwrap();
    }

    #[test]
    fn test_launch_spec_display() {
        let spec = LaunchSpec::new("rust-research-mcp").args(["--log-level", "error"]);
        assert_eq!(spec.display(), "rust-research-mcp --log-level error");
        assert_eq!(LaunchSpec::new("srv").display(), "srv");
    }

    #[test]
    fn test_shutdown_policy_split() {
        let policy = ShutdownPolicy::from_total(Duration::from_secs(5));
        assert_eq!(
            policy.stdin_close_grace + policy.sigterm_grace,
            Duration::from_secs(5)
        );
    }
}
