//! Contract Verifier
//!
//! Drives a [`Session`] through the research-server contract and records one
//! [`CheckReport`] per check:
//!
//! 1. `handshake`: `initialize` succeeds and the session reaches Ready
//! 2. `tool_discovery`: the four required tools are listed with object schemas
//! 3. `debug_echo`: `debug_test` echoes its message
//! 4. `download_requires_source`: `download_paper` without a DOI is rejected
//!    and writes nothing
//! 5. `download_rejects_traversal`: a `../` filename is rejected before any write
//! 6. `doi_download`: a real DOI either yields exactly one non-empty artifact
//!    with a size indicator, or fails leaving no file at all (network)
//! 7. `search`: `search_papers` reports a count with per-result DOIs and
//!    sources (network)
//! 8. `extract_metadata`: answers as data, never as a transport failure (network)
//! 9. `zero_byte_scan`: no empty file anywhere under the download directory
//!
//! A check that times out leaves its request pending, so the remaining
//! session checks are skipped; the filesystem scan always runs.

pub mod artifacts;
pub mod tools;

use crate::config::{HarnessConfig, TimeoutConfig};
use crate::error::HarnessResult;
use crate::mcp::client::CallOutcome;
use crate::mcp::protocol::PROTOCOL_VERSION;
use crate::mcp::session::{Session, SessionState, ToolOutcome};
use crate::mcp::transport::LineTransport;
use anyhow::{Context, Result};
use artifacts::ArtifactSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tools::{ResearchTool, SearchSummary};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Checks in the order they run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Handshake,
    ToolDiscovery,
    DebugEcho,
    DownloadRequiresSource,
    DownloadRejectsTraversal,
    DoiDownload,
    Search,
    ExtractMetadata,
    ZeroByteScan,
}

impl Check {
    pub const ALL: [Check; 9] = [
        Check::Handshake,
        Check::ToolDiscovery,
        Check::DebugEcho,
        Check::DownloadRequiresSource,
        Check::DownloadRejectsTraversal,
        Check::DoiDownload,
        Check::Search,
        Check::ExtractMetadata,
        Check::ZeroByteScan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::ToolDiscovery => "tool_discovery",
            Self::DebugEcho => "debug_echo",
            Self::DownloadRequiresSource => "download_requires_source",
            Self::DownloadRejectsTraversal => "download_rejects_traversal",
            Self::DoiDownload => "doi_download",
            Self::Search => "search",
            Self::ExtractMetadata => "extract_metadata",
            Self::ZeroByteScan => "zero_byte_scan",
        }
    }

    /// Checks that reach external providers
    pub fn needs_network(&self) -> bool {
        matches!(self, Self::DoiDownload | Self::Search | Self::ExtractMetadata)
    }

    fn needs_session(&self) -> bool {
        !matches!(self, Self::Handshake | Self::ZeroByteScan)
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

impl CheckStatus {
    fn marker(&self) -> &'static str {
        match self {
            Self::Passed => "✅",
            Self::Failed => "❌",
            Self::Skipped => "⏭️ ",
        }
    }
}

/// Result of one check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckReport {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
    pub elapsed_ms: u64,
}

/// Result of a whole verification run
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// `name vVersion` from the handshake
    pub server: Option<String>,

    /// Providers named in search results
    pub providers: Vec<String>,

    pub checks: Vec<CheckReport>,

    /// Notifications the server sent during the run
    pub notifications: u64,

    /// Exit code of the server after shutdown
    pub exit_code: Option<i32>,
}

impl VerificationReport {
    pub fn check(&self, check: Check) -> Option<&CheckReport> {
        self.checks.iter().find(|report| report.name == check.name())
    }

    pub fn count(&self, status: CheckStatus) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    /// True when no check failed
    pub fn is_success(&self) -> bool {
        self.count(CheckStatus::Failed) == 0
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Verification run {}", self.run_id)?;
        if let Some(server) = &self.server {
            writeln!(f, "Server: {}", server)?;
        }
        for check in &self.checks {
            writeln!(
                f,
                "{} {:<28} {} ({} ms)",
                check.status.marker(),
                check.name,
                check.detail,
                check.elapsed_ms
            )?;
        }
        if !self.providers.is_empty() {
            writeln!(f, "Providers seen: {}", self.providers.join(", "))?;
        }
        if self.notifications > 0 {
            writeln!(f, "Server notifications: {}", self.notifications)?;
        }
        write!(
            f,
            "{} passed, {} failed, {} skipped",
            self.count(CheckStatus::Passed),
            self.count(CheckStatus::Failed),
            self.count(CheckStatus::Skipped)
        )
    }
}

/// What the verifier sends and how long it waits
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyOptions {
    /// Skip the checks that need external providers
    pub skip_network: bool,
    pub timeouts: TimeoutConfig,
    pub debug_message: String,
    pub sample_doi: String,
    pub search_query: String,
    pub search_limit: u32,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            skip_network: false,
            timeouts: TimeoutConfig::default(),
            debug_message: "Hello from test".to_string(),
            sample_doi: "10.1038/nature12373".to_string(),
            search_query: "machine learning".to_string(),
            search_limit: 5,
        }
    }
}

impl VerifyOptions {
    pub fn from_config(config: &HarnessConfig, skip_network: bool) -> Self {
        Self {
            skip_network,
            timeouts: config.timeouts.clone(),
            ..Self::default()
        }
    }
}

enum Verdict {
    Passed(String),
    Failed(String),
    Skipped(String),

    /// Failed, and the request is still pending
    TimedOut(String),
}

#[derive(Default)]
struct RunState {
    /// Set once a request is left pending
    blocked: Option<String>,
    providers: BTreeSet<String>,
}

/// Runs the contract checks against one session and its download directory
pub struct ContractVerifier {
    options: VerifyOptions,
    download_dir: PathBuf,
}

impl ContractVerifier {
    pub fn new(options: VerifyOptions, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            options,
            download_dir: download_dir.into(),
        }
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Run every check; the session is left for the caller to shut down
    pub async fn run<T: LineTransport>(&self, session: &mut Session<T>) -> VerificationReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!("🔬 Starting contract verification run {}", run_id);

        let mut state = RunState::default();
        let mut checks = Vec::with_capacity(Check::ALL.len());

        for check in Check::ALL {
            let started = Instant::now();
            let verdict = match self.skip_reason(check, session, &state) {
                Some(reason) => Verdict::Skipped(reason),
                None => self.run_check(check, session, &mut state).await,
            };
            for note in session.take_notifications() {
                debug!("📨 {} notification during {}: {:?}", note.method, check, note.params);
            }

            let (status, detail) = match verdict {
                Verdict::Passed(detail) => (CheckStatus::Passed, detail),
                Verdict::Failed(detail) => (CheckStatus::Failed, detail),
                Verdict::Skipped(detail) => (CheckStatus::Skipped, detail),
                Verdict::TimedOut(detail) => {
                    state.blocked = Some(format!("{} left a request pending", check));
                    (CheckStatus::Failed, detail)
                }
            };

            match status {
                CheckStatus::Passed => info!("✅ {}: {}", check, detail),
                CheckStatus::Failed => warn!("❌ {}: {}", check, detail),
                CheckStatus::Skipped => info!("⏭️  {}: {}", check, detail),
            }
            checks.push(CheckReport {
                name: check.name(),
                status,
                detail,
                elapsed_ms: started.elapsed().as_millis() as u64,
            });
        }

        let server = session
            .server_info()
            .map(|info| format!("{} v{}", info.server_info.name, info.server_info.version));

        VerificationReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            server,
            providers: state.providers.into_iter().collect(),
            checks,
            notifications: session.notification_count(),
            exit_code: None,
        }
    }

    fn skip_reason<T: LineTransport>(
        &self,
        check: Check,
        session: &Session<T>,
        state: &RunState,
    ) -> Option<String> {
        if check.needs_network() && self.options.skip_network {
            return Some("network checks disabled".to_string());
        }
        if !check.needs_session() {
            return None;
        }
        if let Some(reason) = &state.blocked {
            return Some(reason.clone());
        }
        match session.state() {
            SessionState::Ready => None,
            SessionState::Terminated => Some(match session.termination_cause() {
                Some(cause) => format!("session terminated ({})", cause),
                None => "session terminated".to_string(),
            }),
            other => Some(format!("session not ready ({:?})", other)),
        }
    }

    async fn run_check<T: LineTransport>(
        &self,
        check: Check,
        session: &mut Session<T>,
        state: &mut RunState,
    ) -> Verdict {
        let result = match check {
            Check::Handshake => self.check_handshake(session).await,
            Check::ToolDiscovery => self.check_tool_discovery(session).await,
            Check::DebugEcho => self.check_debug_echo(session).await,
            Check::DownloadRequiresSource => self.check_download_requires_source(session).await,
            Check::DownloadRejectsTraversal => self.check_download_traversal(session).await,
            Check::DoiDownload => self.check_doi_download(session).await,
            Check::Search => self.check_search(session, state).await,
            Check::ExtractMetadata => self.check_extract_metadata(session).await,
            Check::ZeroByteScan => self.check_zero_byte_scan(),
        };
        result.unwrap_or_else(|e| Verdict::Failed(e.to_string()))
    }

    async fn check_handshake<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        if session.state() == SessionState::Terminated {
            let cause = session
                .termination_cause()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown cause".to_string());
            return Ok(Verdict::Failed(format!("server never started: {}", cause)));
        }

        let timeout = self.options.timeouts.initialize();
        let info = match session.initialize(timeout).await? {
            CallOutcome::Response(info) => info,
            CallOutcome::Timeout { .. } => {
                return Ok(Verdict::Failed(format!(
                    "no initialize response within {:?}",
                    timeout
                )))
            }
        };

        let mut detail = format!(
            "{} v{} (protocol {})",
            info.server_info.name, info.server_info.version, info.protocol_version
        );
        if info.protocol_version != PROTOCOL_VERSION {
            detail.push_str(&format!(", requested {}", PROTOCOL_VERSION));
        }
        Ok(Verdict::Passed(detail))
    }

    async fn check_tool_discovery<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let timeout = self.options.timeouts.request();
        let tools = match session.list_tools(timeout).await? {
            CallOutcome::Response(tools) => tools,
            CallOutcome::Timeout { .. } => return Ok(timed_out("tools/list", timeout)),
        };

        let mut problems = Vec::new();
        for required in ResearchTool::REQUIRED {
            match tools.iter().find(|tool| tool.name == required.name()) {
                None => problems.push(format!("missing {}", required)),
                Some(tool) if !tool.has_object_schema() => {
                    problems.push(format!("{} has no object input schema", required))
                }
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(Verdict::Passed(format!(
                "{} tools listed, all required tools present",
                tools.len()
            )))
        } else {
            Ok(Verdict::Failed(problems.join("; ")))
        }
    }

    async fn check_debug_echo<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let message = &self.options.debug_message;
        let outcome = match self
            .call(session, ResearchTool::DebugTest, tools::debug_args(message), None)
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };

        let expected = format!("Debug echo: {}", message);
        if outcome.is_error {
            Ok(Verdict::Failed(format!("tool error: {}", first_line(&outcome.text))))
        } else if outcome.text.contains(&expected) {
            Ok(Verdict::Passed(format!("echoed '{}'", message)))
        } else {
            Ok(Verdict::Failed(format!(
                "expected '{}', got '{}'",
                expected,
                first_line(&outcome.text)
            )))
        }
    }

    async fn check_download_requires_source<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let before = ArtifactSnapshot::capture(&self.download_dir)?;
        let outcome = match self
            .call(session, ResearchTool::DownloadPaper, Value::Object(Default::default()), None)
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };
        let written = ArtifactSnapshot::capture(&self.download_dir)?.changed_since(&before);

        if !outcome.is_error {
            return Ok(Verdict::Failed(
                "download without doi or url was accepted".to_string(),
            ));
        }
        if !written.is_empty() {
            return Ok(Verdict::Failed(format!(
                "rejected call still wrote {}",
                describe_files(&written)
            )));
        }
        Ok(Verdict::Passed(format!(
            "rejected ({}): {}",
            failure_kind(&outcome),
            first_line(&outcome.text)
        )))
    }

    async fn check_download_traversal<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let escaped_name = format!("paperprobe-traversal-{}.pdf", Uuid::new_v4());
        let filename = format!("../{}", escaped_name);
        let escape_target = self
            .download_dir
            .parent()
            .map(|parent| parent.join(&escaped_name));
        let escaped_before = escape_target.as_deref().is_some_and(Path::exists);
        let before = ArtifactSnapshot::capture(&self.download_dir)?;

        let args = tools::download_args("10.1038/test", Some(filename.as_str()));
        let outcome = match self
            .call(session, ResearchTool::DownloadPaper, args, None)
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };

        let written = ArtifactSnapshot::capture(&self.download_dir)?.changed_since(&before);
        let escaped_after = escape_target.as_deref().is_some_and(Path::exists);

        if !escaped_before && escaped_after {
            return Ok(Verdict::Failed(format!(
                "file written outside the download directory: {}",
                escape_target
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            )));
        }
        if !outcome.is_error {
            return Ok(Verdict::Failed(format!(
                "traversal filename '{}' was accepted",
                filename
            )));
        }
        if !written.is_empty() {
            return Ok(Verdict::Failed(format!(
                "rejected call still wrote {}",
                describe_files(&written)
            )));
        }
        Ok(Verdict::Passed(format!(
            "rejected ({}): {}",
            failure_kind(&outcome),
            first_line(&outcome.text)
        )))
    }

    async fn check_doi_download<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let before = ArtifactSnapshot::capture(&self.download_dir)?;
        let args = tools::download_args(&self.options.sample_doi, None);
        let timeout = self.options.timeouts.download();
        let outcome = match self
            .call(session, ResearchTool::DownloadPaper, args, Some(timeout))
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };

        let written = ArtifactSnapshot::capture(&self.download_dir)?.changed_since(&before);
        let empty: Vec<_> = written.iter().filter(|(_, size)| *size == 0).collect();
        if !empty.is_empty() {
            return Ok(Verdict::Failed(format!(
                "zero-byte artifact left behind: {}",
                empty
                    .iter()
                    .map(|(path, _)| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        if outcome.is_error {
            if outcome.text.trim().is_empty() {
                return Ok(Verdict::Failed(
                    "download failed without an explanation".to_string(),
                ));
            }
            if !written.is_empty() {
                return Ok(Verdict::Failed(format!(
                    "failed download left {}",
                    describe_files(&written)
                )));
            }
            return Ok(Verdict::Passed(format!(
                "unavailable, no artifact left: {}",
                first_line(&outcome.text)
            )));
        }

        let Some(indicator) = tools::parse_size_indicator(&outcome.text) else {
            return Ok(Verdict::Failed(format!(
                "success without a size indicator: {}",
                first_line(&outcome.text)
            )));
        };
        match written.as_slice() {
            [] => Ok(Verdict::Failed(
                "reported success but no artifact was written".to_string(),
            )),
            [_] => Ok(Verdict::Passed(format!(
                "downloaded {} (reported ~{} bytes) in {:?}",
                describe_files(&written),
                indicator.bytes(),
                outcome.elapsed
            ))),
            files => Ok(Verdict::Failed(format!(
                "one download wrote {} files: {}",
                files.len(),
                describe_files(files)
            ))),
        }
    }

    async fn check_search<T: LineTransport>(
        &self,
        session: &mut Session<T>,
        state: &mut RunState,
    ) -> HarnessResult<Verdict> {
        let args = tools::search_args(&self.options.search_query, Some(self.options.search_limit));
        let timeout = self.options.timeouts.search();
        let outcome = match self
            .call(session, ResearchTool::SearchPapers, args, Some(timeout))
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };

        if outcome.is_error {
            return Ok(Verdict::Failed(format!(
                "search failed: {}",
                first_line(&outcome.text)
            )));
        }
        let Some(summary) = tools::parse_search_summary(&outcome.text) else {
            return Ok(Verdict::Failed(format!(
                "no result count in: {}",
                first_line(&outcome.text)
            )));
        };
        if summary.count > 0 && summary.sources.is_empty() {
            return Ok(Verdict::Failed(format!(
                "{} results without source attribution",
                summary.count
            )));
        }
        if summary.count > 0 && summary.dois.is_empty() {
            return Ok(Verdict::Failed(format!(
                "{} results without identifiers",
                summary.count
            )));
        }

        state
            .providers
            .extend(summary.providers().into_iter().map(str::to_string));
        Ok(Verdict::Passed(describe_search(&summary)))
    }

    async fn check_extract_metadata<T: LineTransport>(
        &self,
        session: &mut Session<T>,
    ) -> HarnessResult<Verdict> {
        let args = tools::metadata_args(&self.options.sample_doi);
        let outcome = match self
            .call(session, ResearchTool::ExtractMetadata, args, None)
            .await?
        {
            Ok(outcome) => outcome,
            Err(verdict) => return Ok(verdict),
        };

        if outcome.text.trim().is_empty() {
            return Ok(Verdict::Failed("empty metadata result".to_string()));
        }
        if outcome.is_error {
            Ok(Verdict::Passed(format!(
                "failed gracefully: {}",
                first_line(&outcome.text)
            )))
        } else {
            Ok(Verdict::Passed(format!(
                "{} characters of metadata",
                outcome.text.chars().count()
            )))
        }
    }

    fn check_zero_byte_scan(&self) -> HarnessResult<Verdict> {
        let snapshot = ArtifactSnapshot::capture(&self.download_dir)?;
        let empty = snapshot.zero_byte_files();
        if empty.is_empty() {
            Ok(Verdict::Passed(format!(
                "{} artifacts, none empty",
                snapshot.len()
            )))
        } else {
            Ok(Verdict::Failed(format!(
                "zero-byte files: {}",
                empty
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    /// Call a tool; a timeout comes back as the check's verdict
    async fn call<T: LineTransport>(
        &self,
        session: &mut Session<T>,
        tool: ResearchTool,
        args: Value,
        timeout: Option<Duration>,
    ) -> HarnessResult<std::result::Result<ToolOutcome, Verdict>> {
        let timeout = timeout.unwrap_or_else(|| self.options.timeouts.request());
        match session.call_tool(tool.name(), args, timeout).await? {
            CallOutcome::Response(outcome) => Ok(Ok(outcome)),
            CallOutcome::Timeout { .. } => Ok(Err(timed_out(tool.name(), timeout))),
        }
    }
}

/// Launch the configured server in a fresh download directory and verify it
pub async fn verify_server(config: &HarnessConfig, options: VerifyOptions) -> Result<VerificationReport> {
    let download_dir = tempfile::Builder::new()
        .prefix("paperprobe-verify-")
        .tempdir()
        .context("Failed to create download directory")?;

    let spec = config.launch_spec(download_dir.path());
    info!("🚀 Launching research server: {}", spec.display());
    info!("📁 Download directory: {}", download_dir.path().display());

    let mut session = Session::new(spec);
    if let Err(e) = session.start().await {
        warn!("⚠️  {}", e);
    }

    let verifier = ContractVerifier::new(options, download_dir.path());
    let mut report = verifier.run(&mut session).await;

    info!("🧹 Shutting down research server...");
    report.exit_code = session
        .shutdown()
        .await
        .context("Failed to shut down research server")?;
    Ok(report)
}

fn timed_out(what: &str, timeout: Duration) -> Verdict {
    Verdict::TimedOut(format!("{} did not answer within {:?}", what, timeout))
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

fn failure_kind(outcome: &ToolOutcome) -> &'static str {
    if outcome.is_validation_failure() {
        "validation"
    } else {
        "execution"
    }
}

fn describe_files(files: &[(PathBuf, u64)]) -> String {
    files
        .iter()
        .map(|(path, size)| format!("{} ({} bytes)", path.display(), size))
        .collect::<Vec<_>>()
        .join(", ")
}

fn describe_search(summary: &SearchSummary) -> String {
    if summary.count == 0 {
        return "0 results".to_string();
    }
    let providers: Vec<_> = summary.providers().into_iter().collect();
    format!(
        "{} results, {} with DOI, providers: {}",
        summary.count,
        summary.dois.len(),
        providers.join(", ")
    )
}
