// paperprobe - Main Entry Point
//
// Command-line front end for the protocol driving harness:
// - verify: run the contract checks against a research server
// - tools: handshake and list the server's tools
// - call: invoke one tool
// - batch: download a list of papers, one fresh server per paper
//
// Logs go to stderr; reports go to stdout.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paperprobe::batch::{run_batch, BatchOptions, PaperList};
use paperprobe::config::HarnessConfig;
use paperprobe::contract::tools::ResearchTool;
use paperprobe::contract::{verify_server, VerifyOptions};
use paperprobe::mcp::{CallOutcome, Session};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

/// paperprobe: drive and verify research-paper MCP servers
#[derive(Parser, Debug)]
#[command(name = "paperprobe")]
#[command(version)]
#[command(about = "Protocol driving harness for research-paper MCP servers", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: ~/.config/paperprobe/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Server executable, overriding the configuration
    #[arg(long, global = true)]
    server: Option<String>,

    /// Extra server argument (repeatable)
    #[arg(long = "server-arg", global = true, allow_hyphen_values = true)]
    server_args: Vec<String>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the contract checks against the server
    Verify {
        /// Skip checks that need external providers
        #[arg(long)]
        skip_network: bool,

        /// DOI used by the download and metadata checks
        #[arg(long)]
        doi: Option<String>,
    },
    /// Handshake and list the server's tools
    Tools,
    /// Invoke one tool and print its result
    Call {
        /// Tool name (e.g. debug_test, search_papers)
        tool: String,

        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Where the server should put downloads (default: a temporary directory)
        #[arg(long)]
        download_dir: Option<PathBuf>,
    },
    /// Download every paper listed in a TOML file
    Batch {
        /// Papers file with [[papers]] entries
        papers: PathBuf,

        /// Keep downloaded artifacts in this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => HarnessConfig::load_from_path(path)?,
        None => HarnessConfig::load()?,
    };
    if let Some(server) = &args.server {
        config.server.command = server.clone();
    }
    config.server.args.extend(args.server_args.iter().cloned());

    init_tracing(&config, args.verbose)?;
    info!("🔬 paperprobe v{} starting...", env!("CARGO_PKG_VERSION"));

    match args.command {
        Commands::Verify { skip_network, doi } => {
            let mut options = VerifyOptions::from_config(&config, skip_network);
            if let Some(doi) = doi {
                options.sample_doi = doi;
            }
            verify(&config, options, args.json).await
        }
        Commands::Tools => list_tools(&config, args.json).await,
        Commands::Call {
            tool,
            args: tool_args,
            download_dir,
        } => call_tool(&config, &tool, &tool_args, download_dir.as_deref()).await,
        Commands::Batch { papers, output_dir } => {
            batch(&config, &papers, output_dir, args.json).await
        }
    }
}

fn init_tracing(config: &HarnessConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        config.log_level()?
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_env_filter(filter);

    match config.logging.format.to_lowercase().as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.compact().init(),
    }
    Ok(())
}

async fn verify(config: &HarnessConfig, options: VerifyOptions, json: bool) -> Result<()> {
    let report = verify_server(config, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }

    if !report.is_success() {
        anyhow::bail!(
            "{} of {} checks failed",
            report.count(paperprobe::contract::CheckStatus::Failed),
            report.checks.len()
        );
    }
    Ok(())
}

/// Launch a server downloading into `download_dir` and complete the handshake
async fn open_session(config: &HarnessConfig, download_dir: &Path) -> Result<Session> {
    let spec = config.launch_spec(download_dir);
    info!("🚀 Launching research server: {}", spec.display());

    let mut session = Session::launch(spec)
        .await
        .context("Failed to start research server")?;
    match session
        .initialize(config.timeouts.initialize())
        .await
        .context("Failed to initialize MCP session")?
    {
        CallOutcome::Response(info) => {
            info!(
                "✅ Connected to {} v{}",
                info.server_info.name, info.server_info.version
            );
            Ok(session)
        }
        CallOutcome::Timeout { .. } => anyhow::bail!(
            "Server did not answer initialize within {:?}",
            config.timeouts.initialize()
        ),
    }
}

async fn list_tools(config: &HarnessConfig, json: bool) -> Result<()> {
    let download_dir = tempfile::tempdir().context("Failed to create download directory")?;
    let mut session = open_session(config, download_dir.path()).await?;

    let outcome = session.list_tools(config.timeouts.request()).await;
    session.shutdown().await?;

    let tools = match outcome.context("Failed to list tools")? {
        CallOutcome::Response(tools) => tools,
        CallOutcome::Timeout { .. } => anyhow::bail!("tools/list timed out"),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    println!("{} tools:", tools.len());
    for tool in &tools {
        let marker = if ResearchTool::from_name(&tool.name).is_some() {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<24} {}",
            marker,
            tool.name,
            tool.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn timeout_for(config: &HarnessConfig, tool: &str) -> Duration {
    match ResearchTool::from_name(tool) {
        Some(ResearchTool::DownloadPaper) => config.timeouts.download(),
        Some(ResearchTool::SearchPapers) => config.timeouts.search(),
        _ => config.timeouts.request(),
    }
}

async fn call_tool(
    config: &HarnessConfig,
    tool: &str,
    raw_args: &str,
    download_dir: Option<&Path>,
) -> Result<()> {
    let arguments: Value =
        serde_json::from_str(raw_args).context("Tool arguments must be valid JSON")?;
    if !arguments.is_object() {
        anyhow::bail!("Tool arguments must be a JSON object");
    }

    let temp_dir;
    let download_dir = match download_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
            dir
        }
        None => {
            temp_dir = tempfile::tempdir().context("Failed to create download directory")?;
            temp_dir.path()
        }
    };

    let mut session = open_session(config, download_dir).await?;
    let timeout = timeout_for(config, tool);
    let outcome = session.call_tool(tool, arguments, timeout).await;
    session.shutdown().await?;

    match outcome.with_context(|| format!("Failed to call {}", tool))? {
        CallOutcome::Response(outcome) => {
            println!("{}", outcome.text);
            if outcome.is_error {
                anyhow::bail!("Tool {} reported an error", tool);
            }
            Ok(())
        }
        CallOutcome::Timeout { .. } => {
            anyhow::bail!("Tool {} did not answer within {:?}", tool, timeout)
        }
    }
}

async fn batch(
    config: &HarnessConfig,
    papers: &Path,
    output_dir: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let list = PaperList::load_from_path(papers)?;
    let summary = run_batch(config, &list, &BatchOptions { output_dir }).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }

    if !summary.is_clean() {
        anyhow::bail!(
            "{} harness failures, {} contract defects",
            summary.harness_failures(),
            summary.defects()
        );
    }
    Ok(())
}
