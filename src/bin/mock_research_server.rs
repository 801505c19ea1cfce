//! Offline research server for end-to-end tests
//!
//! Speaks MCP over stdio with a small built-in catalog, so the harness can be
//! exercised without network access. Downloads are written to the directory
//! named by `RSH_DOWNLOAD_DIRECTORY`. Switches make it misbehave on purpose.

use clap::Parser;
use paperprobe::mcp::protocol::{McpError, McpNotification, McpResponse, PROTOCOL_VERSION};
use paperprobe::contract::tools::filename_escapes_directory;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "mock-research-server")]
#[command(about = "Deterministic offline research MCP server", long_about = None)]
struct Args {
    /// Server log level
    #[arg(long, default_value = "error")]
    log_level: String,

    /// Accepted for command-line compatibility; not read
    #[arg(long)]
    config: Option<PathBuf>,

    /// Leave an empty file behind when a download fails
    #[arg(long)]
    leave_zero_byte: bool,

    /// Write a non-JSON line before answering tools/list
    #[arg(long)]
    garbage_line: bool,

    /// Answer tools/call with the wrong id
    #[arg(long)]
    wrong_id: bool,

    /// Never answer calls to this tool
    #[arg(long)]
    stall_tool: Option<String>,
}

struct Paper {
    doi: &'static str,
    title: &'static str,
    year: u32,
    source: &'static str,
    pages: usize,
}

static CATALOG: [Paper; 3] = [
    Paper {
        doi: "10.1038/nature12373",
        title: "Nanometre-scale thermometry in a living cell",
        year: 2013,
        source: "CrossRef",
        pages: 8,
    },
    Paper {
        doi: "10.48550/arXiv.1706.03762",
        title: "Attention Is All You Need",
        year: 2017,
        source: "arXiv",
        pages: 12,
    },
    Paper {
        doi: "10.1126/science.1259855",
        title: "Deep learning for machine learning research",
        year: 2015,
        source: "Semantic Scholar",
        pages: 4,
    },
];

struct Server {
    args: Args,
    download_dir: PathBuf,
}

enum Reply {
    Result(Value),
    Error(McpError),
    Silent,
}

impl Server {
    fn handle(&self, method: &str, params: &Value) -> Reply {
        match method {
            "initialize" => Reply::Result(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}, "logging": {}},
                "serverInfo": {"name": "mock-research-server", "version": env!("CARGO_PKG_VERSION")}
            })),
            "tools/list" => Reply::Result(json!({"tools": tool_descriptors()})),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                if self.args.stall_tool.as_deref() == Some(name) {
                    tracing::info!("Stalling on {}", name);
                    return Reply::Silent;
                }
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                self.call_tool(name, &arguments)
            }
            other => Reply::Error(McpError::method_not_found(other)),
        }
    }

    fn call_tool(&self, name: &str, args: &Value) -> Reply {
        match name {
            "debug_test" => {
                let message = args["message"].as_str().unwrap_or("No message provided");
                text(format!("Debug echo: {}", message), false)
            }
            "search_papers" => match args["query"].as_str() {
                Some(query) => {
                    let limit = args["limit"].as_u64().unwrap_or(10) as usize;
                    text(search(query, limit), false)
                }
                None => Reply::Error(McpError::invalid_params(
                    "Missing required 'query' parameter",
                )),
            },
            "download_paper" => self.download(args),
            "extract_metadata" => match args["input"].as_str() {
                Some(input) => match find(input) {
                    Some(paper) => text(
                        serde_json::to_string_pretty(&json!({
                            "doi": paper.doi,
                            "title": paper.title,
                            "year": paper.year,
                            "page_count": paper.pages,
                        }))
                        .unwrap_or_default(),
                        false,
                    ),
                    None => Reply::Error(McpError::internal_error(format!(
                        "Metadata extraction failed: no metadata found for '{}'",
                        input
                    ))),
                },
                None => Reply::Error(McpError::invalid_params(
                    "Invalid metadata input: missing field `input`",
                )),
            },
            other => Reply::Error(McpError::invalid_params(format!("Unknown tool: {}", other))),
        }
    }

    fn download(&self, args: &Value) -> Reply {
        // A URL is looked up by its trailing DOI-like path
        let doi = match (args["doi"].as_str(), args["url"].as_str()) {
            (Some(doi), _) => doi,
            (None, Some(url)) => url
                .split_once("doi.org/")
                .map(|(_, doi)| doi)
                .unwrap_or(url),
            (None, None) => {
                return Reply::Error(McpError::invalid_params(
                    "Missing required parameter: must provide either 'doi' or 'url'",
                ))
            }
        };
        let filename = match args["filename"].as_str() {
            Some(name) if filename_escapes_directory(name) => {
                return text(
                    "Invalid filename: contains unsafe characters or path traversal attempts"
                        .to_string(),
                    true,
                )
            }
            Some(name) => name.to_string(),
            None => format!("{}.pdf", doi.replace(['/', '\\', ':'], "_")),
        };
        let path = self.download_dir.join(filename);

        let Some(paper) = find(doi) else {
            if self.args.leave_zero_byte {
                if let Err(e) = std::fs::write(&path, b"") {
                    tracing::error!("Failed to create {}: {}", path.display(), e);
                }
            }
            return text(
                format!(
                    "⚠️ Paper not available from any provider\n\nDOI: {}\n\n\
                     The paper could not be found in the offline catalog.",
                    doi
                ),
                true,
            );
        };

        match write_pdf(&path, paper) {
            Ok(size) => text(
                format!(
                    "✅ Download successful!\n\n📄 File: {}\n📦 Size: {} KB\n✓ Status: Complete",
                    path.display(),
                    size / 1024
                ),
                false,
            ),
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                text(format!("⚠️ Download failed\n\nDOI: {}\nError: {}", doi, e), true)
            }
        }
    }
}

fn text(text: String, is_error: bool) -> Reply {
    Reply::Result(json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error
    }))
}

fn find(doi: &str) -> Option<&'static Paper> {
    CATALOG.iter().find(|paper| paper.doi.eq_ignore_ascii_case(doi.trim()))
}

fn search(query: &str, limit: usize) -> String {
    let needle = query.to_lowercase();
    let hits: Vec<&Paper> = CATALOG
        .iter()
        .filter(|p| {
            p.doi.eq_ignore_ascii_case(query)
                || p.title.to_lowercase().contains(&needle)
                || needle.split_whitespace().any(|word| p.title.to_lowercase().contains(word))
        })
        .take(limit)
        .collect();

    let listing = hits
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "{}. {} (Relevance: 90%)\n  📖 DOI: {}\n  🔍 Source: {}\n  📅 Year: {}",
                i + 1,
                p.title,
                p.doi,
                p.source,
                p.year
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    format!("📚 Found {} papers for '{}'\n\n{}", hits.len(), query, listing)
}

/// Deterministic PDF-looking payload, `pages` KB long
fn write_pdf(path: &Path, paper: &Paper) -> std::io::Result<u64> {
    let mut body = format!("%PDF-1.4\n% {}\n% {}\n", paper.title, paper.doi).into_bytes();
    body.resize(paper.pages * 1024, b'.');
    std::fs::write(path, &body)?;
    Ok(body.len() as u64)
}

fn tool_descriptors() -> Value {
    json!([
        {
            "name": "debug_test",
            "description": "Echoes back what it receives",
            "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}, "required": ["message"]}
        },
        {
            "name": "search_papers",
            "description": "Search for academic papers using DOI, title, or author name",
            "inputSchema": {"type": "object", "properties": {"query": {"type": "string"}, "limit": {"type": "integer", "default": 10}}, "required": ["query"]}
        },
        {
            "name": "download_paper",
            "description": "Download a paper PDF by DOI",
            "inputSchema": {"type": "object", "properties": {"doi": {"type": "string"}, "url": {"type": "string"}, "filename": {"type": "string"}}}
        },
        {
            "name": "extract_metadata",
            "description": "Extract bibliographic metadata from a PDF file or DOI",
            "inputSchema": {"type": "object", "properties": {"input": {"type": "string"}}, "required": ["input"]}
        }
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let download_dir = std::env::var_os("RSH_DOWNLOAD_DIRECTORY")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("downloads"));
    std::fs::create_dir_all(&download_dir)?;
    tracing::info!("Download directory: {}", download_dir.display());

    let server = Server { args, download_dir };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                let reply = McpResponse::err(0, McpError::parse_error(e.to_string()));
                write_message(&mut stdout, &serde_json::to_string(&reply)?).await?;
                continue;
            }
        };

        let method = message["method"].as_str().unwrap_or_default().to_string();
        let Some(id) = message.get("id").and_then(Value::as_u64) else {
            tracing::debug!("Notification: {}", method);
            continue;
        };

        if method == "tools/list" && server.args.garbage_line {
            write_message(&mut stdout, "Loading provider registry...").await?;
        }
        if method == "tools/call" && message["params"]["name"] == "search_papers" {
            let note = McpNotification::new(
                "notifications/message",
                Some(json!({"level": "info", "data": "searching offline catalog"})),
            );
            write_message(&mut stdout, &serde_json::to_string(&note)?).await?;
        }

        let reply_id = if method == "tools/call" && server.args.wrong_id {
            id + 100
        } else {
            id
        };
        let reply = match server.handle(&method, &message["params"]) {
            Reply::Result(result) => McpResponse::ok(reply_id, result),
            Reply::Error(error) => McpResponse::err(reply_id, error),
            Reply::Silent => continue,
        };
        write_message(&mut stdout, &serde_json::to_string(&reply)?).await?;
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn write_message(stdout: &mut tokio::io::Stdout, line: &str) -> std::io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
