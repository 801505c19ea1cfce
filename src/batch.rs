//! Batch Download Runs
//!
//! Downloads a list of papers, each through a fresh server in its own
//! download directory, and tallies what happened to every paper. Sessions
//! that die of a harness failure are retried with backoff; a paper that is
//! simply unavailable is an answer and is not retried.

use crate::config::HarnessConfig;
use crate::contract::artifacts::ArtifactSnapshot;
use crate::contract::tools::{self, ResearchTool};
use crate::error::{HarnessError, HarnessResult};
use crate::mcp::client::CallOutcome;
use crate::mcp::retry::{retry_with_backoff, RetryConfig};
use crate::mcp::session::{Session, TerminationCause, ToolOutcome};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One paper to download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaperRequest {
    pub doi: String,

    #[serde(default)]
    pub title: String,

    /// Requested filename, passed through to the server
    #[serde(default)]
    pub filename: Option<String>,
}

/// A papers file: `[[papers]]` tables with `doi`, `title`, `filename`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PaperList {
    #[serde(default)]
    pub papers: Vec<PaperRequest>,
}

impl PaperList {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read papers file from {:?}", path))?;
        let list: PaperList = toml::from_str(&content)
            .with_context(|| format!("Failed to parse papers file from {:?}", path))?;
        list.validate()?;
        Ok(list)
    }

    pub fn validate(&self) -> Result<()> {
        if self.papers.is_empty() {
            anyhow::bail!("Papers file lists no papers");
        }
        for (index, paper) in self.papers.iter().enumerate() {
            if paper.doi.trim().is_empty() {
                anyhow::bail!("Paper #{} has an empty DOI", index + 1);
            }
        }
        Ok(())
    }
}

/// What happened to one paper
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaperResult {
    /// A non-empty artifact was written
    Downloaded { bytes: u64, path: PathBuf },

    /// The server answered with a tool failure and wrote nothing
    Unavailable { reason: String },

    /// Spawn, handshake, protocol failure or timeout
    HarnessFailure { reason: String },

    /// The server reported success but no artifact appeared
    MissingArtifact { reason: String },

    /// A zero-byte file was left behind
    ZeroByteDefect { path: PathBuf },

    /// The server reported a failure but still left a file behind
    PartialArtifact { path: PathBuf },
}

impl PaperResult {
    /// Whether the server violated its contract
    pub fn is_defect(&self) -> bool {
        matches!(
            self,
            Self::ZeroByteDefect { .. } | Self::MissingArtifact { .. } | Self::PartialArtifact { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperReport {
    pub doi: String,
    pub title: String,
    #[serde(flatten)]
    pub result: PaperResult,
    pub attempts: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub papers: Vec<PaperReport>,
}

impl BatchSummary {
    pub fn downloaded(&self) -> usize {
        self.count(|r| matches!(r, PaperResult::Downloaded { .. }))
    }

    pub fn unavailable(&self) -> usize {
        self.count(|r| matches!(r, PaperResult::Unavailable { .. }))
    }

    pub fn harness_failures(&self) -> usize {
        self.count(|r| matches!(r, PaperResult::HarnessFailure { .. }))
    }

    pub fn defects(&self) -> usize {
        self.count(PaperResult::is_defect)
    }

    /// Downloaded papers as a percentage of all papers
    pub fn success_rate(&self) -> f64 {
        if self.papers.is_empty() {
            return 0.0;
        }
        self.downloaded() as f64 * 100.0 / self.papers.len() as f64
    }

    /// No harness failures and no contract defects
    pub fn is_clean(&self) -> bool {
        self.harness_failures() == 0 && self.defects() == 0
    }

    fn count(&self, predicate: impl Fn(&PaperResult) -> bool) -> usize {
        self.papers.iter().filter(|p| predicate(&p.result)).count()
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch run {}", self.run_id)?;
        for paper in &self.papers {
            let line = match &paper.result {
                PaperResult::Downloaded { bytes, path } => {
                    format!("✅ {} bytes -> {}", bytes, path.display())
                }
                PaperResult::Unavailable { reason } => format!("⚠️  unavailable: {}", reason),
                PaperResult::HarnessFailure { reason } => format!("💥 harness failure: {}", reason),
                PaperResult::MissingArtifact { reason } => format!("❌ {}", reason),
                PaperResult::ZeroByteDefect { path } => {
                    format!("❌ zero-byte file: {}", path.display())
                }
                PaperResult::PartialArtifact { path } => {
                    format!("❌ partial artifact left: {}", path.display())
                }
            };
            writeln!(f, "{:<32} {}", paper.doi, line)?;
        }
        write!(
            f,
            "{} papers: {} downloaded, {} unavailable, {} harness failures, {} defects ({:.1}% success)",
            self.papers.len(),
            self.downloaded(),
            self.unavailable(),
            self.harness_failures(),
            self.defects(),
            self.success_rate()
        )
    }
}

/// Options for a batch run
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Keep downloaded artifacts here; otherwise they go away with the
    /// per-paper temporary directory
    pub output_dir: Option<PathBuf>,
}

/// Download every paper, one fresh session per paper
pub async fn run_batch(
    config: &HarnessConfig,
    list: &PaperList,
    options: &BatchOptions,
) -> Result<BatchSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let retry = config.batch.retry.to_retry_config();

    if let Some(dir) = &options.output_dir {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create output directory {:?}", dir))?;
    }

    info!(
        "📚 Batch run {}: {} papers via {}",
        run_id,
        list.papers.len(),
        config.server.command
    );

    let output_dir = options.output_dir.as_deref();
    let mut papers = Vec::with_capacity(list.papers.len());
    for (index, paper) in list.papers.iter().enumerate() {
        info!(
            "📄 [{}/{}] {} {}",
            index + 1,
            list.papers.len(),
            paper.doi,
            paper.title
        );
        let started = Instant::now();
        let mut attempts = 0;

        let result = retry_with_backoff(&retry, RetryConfig::should_retry_error, || {
            attempts += 1;
            download_one(config, paper, output_dir)
        })
        .await
        .unwrap_or_else(|e| PaperResult::HarnessFailure {
            reason: e.to_string(),
        });

        match &result {
            PaperResult::Downloaded { bytes, .. } => info!("✅ {} downloaded ({} bytes)", paper.doi, bytes),
            PaperResult::Unavailable { reason } => info!("⚠️  {} unavailable: {}", paper.doi, reason),
            other => warn!("❌ {}: {:?}", paper.doi, other),
        }

        papers.push(PaperReport {
            doi: paper.doi.clone(),
            title: paper.title.clone(),
            result,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    Ok(BatchSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        papers,
    })
}

/// One attempt: fresh directory, fresh server, one download
async fn download_one(
    config: &HarnessConfig,
    paper: &PaperRequest,
    output_dir: Option<&Path>,
) -> HarnessResult<PaperResult> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("paperprobe-batch-");
    let download_dir = match output_dir {
        Some(parent) => builder.tempdir_in(parent)?,
        None => builder.tempdir()?,
    };

    let mut session = Session::launch(config.launch_spec(download_dir.path())).await?;
    let outcome = attempt_download(&mut session, config, paper).await;
    let notifications = session.notification_count();
    if notifications > 0 {
        debug!("📨 {} notifications while downloading {}", notifications, paper.doi);
    }
    if let Err(e) = session.shutdown().await {
        warn!("Error while shutting down research server: {}", e);
    }

    let outcome = match outcome? {
        CallOutcome::Response(outcome) => outcome,
        CallOutcome::Timeout { .. } => {
            return Ok(PaperResult::HarnessFailure {
                reason: format!(
                    "no response within {:?}",
                    config.timeouts.download()
                ),
            })
        }
    };
    let written: Vec<_> = ArtifactSnapshot::capture(download_dir.path())?
        .files()
        .map(|(path, size)| (path.to_path_buf(), size))
        .collect();
    let result = classify_download(&outcome, &written);

    match (&result, output_dir) {
        (PaperResult::Downloaded { path, bytes }, Some(output_dir)) => {
            let file_name = path.file_name().unwrap_or_default();
            let kept = output_dir.join(file_name);
            fs::rename(path, &kept)?;
            Ok(PaperResult::Downloaded {
                bytes: *bytes,
                path: kept,
            })
        }
        _ => Ok(result),
    }
}

async fn attempt_download(
    session: &mut Session,
    config: &HarnessConfig,
    paper: &PaperRequest,
) -> HarnessResult<CallOutcome<ToolOutcome>> {
    if session.initialize(config.timeouts.initialize()).await?.is_timeout() {
        return Err(HarnessError::SessionTerminated {
            cause: TerminationCause::InitializeTimedOut,
        });
    }
    let args = tools::download_args(&paper.doi, paper.filename.as_deref());
    session
        .call_tool(ResearchTool::DownloadPaper.name(), args, config.timeouts.download())
        .await
}

/// Classify a download from the tool outcome and the files it left behind
pub fn classify_download(outcome: &ToolOutcome, written: &[(PathBuf, u64)]) -> PaperResult {
    if let Some((path, _)) = written.iter().find(|(_, size)| *size == 0) {
        return PaperResult::ZeroByteDefect { path: path.clone() };
    }

    if outcome.is_error {
        if let Some((path, _)) = written.iter().max_by_key(|(_, size)| *size) {
            return PaperResult::PartialArtifact { path: path.clone() };
        }
        let reason = outcome
            .text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("tool reported an error")
            .to_string();
        return PaperResult::Unavailable { reason };
    }

    match written.iter().max_by_key(|(_, size)| *size) {
        Some((path, bytes)) => PaperResult::Downloaded {
            bytes: *bytes,
            path: path.clone(),
        },
        None => PaperResult::MissingArtifact {
            reason: "reported success but wrote no file".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::ContentBlock;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn outcome(text: &str, is_error: bool) -> ToolOutcome {
        ToolOutcome {
            tool: "download_paper".to_string(),
            is_error,
            failure: None,
            text: text.to_string(),
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            elapsed: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_load_papers_file() {
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            r#"
[[papers]]
doi = "10.1038/nature12373"
title = "Nanometre-scale thermometry in a living cell"

[[papers]]
doi = "10.1126/science.1259855"
filename = "science.pdf"
"#,
        )
        .unwrap();

        let list = PaperList::load_from_path(file.path()).unwrap();
        assert_eq!(list.papers.len(), 2);
        assert_eq!(list.papers[0].filename, None);
        assert_eq!(list.papers[1].title, "");
        assert_eq!(list.papers[1].filename.as_deref(), Some("science.pdf"));
    }

    #[test]
    fn test_empty_papers_file_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "").unwrap();
        assert!(PaperList::load_from_path(file.path()).is_err());

        let list = PaperList {
            papers: vec![PaperRequest {
                doi: " ".to_string(),
                title: String::new(),
                filename: None,
            }],
        };
        assert!(list.validate().is_err());
    }

    #[test]
    fn test_classify_download() {
        let written = vec![(PathBuf::from("/d/a.pdf"), 2048)];
        assert_eq!(
            classify_download(&outcome("✅ Download successful!", false), &written),
            PaperResult::Downloaded {
                bytes: 2048,
                path: PathBuf::from("/d/a.pdf")
            }
        );

        assert_eq!(
            classify_download(&outcome("\n⚠️ Paper not available\n\nDOI: x", true), &[]),
            PaperResult::Unavailable {
                reason: "⚠️ Paper not available".to_string()
            }
        );

        let empty = vec![(PathBuf::from("/d/empty.pdf"), 0)];
        assert_eq!(
            classify_download(&outcome("⚠️ failed", true), &empty),
            PaperResult::ZeroByteDefect {
                path: PathBuf::from("/d/empty.pdf")
            }
        );

        assert!(matches!(
            classify_download(&outcome("✅ Download successful!", false), &[]),
            PaperResult::MissingArtifact { .. }
        ));

        let partial = vec![(PathBuf::from("/d/partial.pdf"), 100)];
        let result = classify_download(&outcome("❌ Download failed", true), &partial);
        assert_eq!(
            result,
            PaperResult::PartialArtifact {
                path: PathBuf::from("/d/partial.pdf")
            }
        );
        assert!(result.is_defect());
    }

    #[test]
    fn test_summary_counts() {
        let report = |result| PaperReport {
            doi: "10.1/x".to_string(),
            title: String::new(),
            result,
            attempts: 1,
            elapsed_ms: 1,
        };
        let summary = BatchSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            papers: vec![
                report(PaperResult::Downloaded {
                    bytes: 10,
                    path: PathBuf::from("a.pdf"),
                }),
                report(PaperResult::Unavailable {
                    reason: "gone".to_string(),
                }),
                report(PaperResult::HarnessFailure {
                    reason: "broken pipe".to_string(),
                }),
                report(PaperResult::ZeroByteDefect {
                    path: PathBuf::from("b.pdf"),
                }),
                report(PaperResult::PartialArtifact {
                    path: PathBuf::from("c.pdf"),
                }),
            ],
        };

        assert_eq!(summary.downloaded(), 1);
        assert_eq!(summary.unavailable(), 1);
        assert_eq!(summary.harness_failures(), 1);
        assert_eq!(summary.defects(), 2);
        assert_eq!(summary.success_rate(), 20.0);
        assert!(!summary.is_clean());
        assert!(summary.to_string().contains("5 papers: 1 downloaded"));
        assert!(summary.to_string().contains("partial artifact left: c.pdf"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["papers"][0]["status"], "downloaded");
        assert_eq!(json["papers"][0]["bytes"], 10);
        assert_eq!(json["papers"][3]["status"], "zero_byte_defect");
        assert_eq!(json["papers"][4]["status"], "partial_artifact");
    }
}
