//! lendscope-cli: terminal client for the Lendscope HTTP API
//!
//! # Subcommands
//! - `chat <message> [--session <id>]`        one chat turn
//! - `upload <file> [--session <id>]`         upload an offer document
//! - `upload-chat <session> <message>`        reply on an upload session
//! - `sessions [-n <limit>] [--kind <kind>]`  list your sessions
//! - `session <id>`                           show one conversation
//! - `status`                                 show server health
//!
//! Authenticated calls send `--token` (or `LENDSCOPE_TOKEN`) as a bearer token.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";
const DEFAULT_LIMIT: usize = 10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "lendscope-cli", version, about = "Terminal client for the Lendscope lending assistant")]
struct Cli {
    /// Lendscope HTTP server URL
    #[arg(long, env = "LENDSCOPE_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token for authenticated calls
    #[arg(long, env = "LENDSCOPE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send one chat message
    Chat {
        message: String,

        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Upload an offer document (pdf, docx, png, jpg, txt, csv)
    Upload {
        file: String,

        #[arg(short, long)]
        session: Option<String>,
    },

    /// Reply on an upload session, e.g. to correct terms or give consent
    UploadChat { session: String, message: String },

    /// List your sessions, most recent first
    Sessions {
        #[arg(short = 'n', long, default_value_t = DEFAULT_LIMIT)]
        limit: usize,

        /// Only `chat` or `upload` sessions
        #[arg(long)]
        kind: Option<String>,
    },

    /// Show one session's conversation
    Session { id: String },

    /// Show server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ChatReply {
    pub session_id: String,
    pub response: String,
    pub intent: String,
    #[serde(default)]
    pub match_kind: Option<String>,
    #[serde(default)]
    pub offers: Vec<String>,
    pub took_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub kind: String,
    pub title: String,
    pub last_interaction_at: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionList {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
pub struct Turn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SessionDetail {
    pub session_id: String,
    pub title: String,
    pub messages: Vec<Turn>,
}

// ============================================================================
// Formatting
// ============================================================================

pub fn format_chat(reply: &ChatReply) -> String {
    let mut out = format!("{}\n", reply.response);
    let mut meta = vec![format!("session {}", reply.session_id), format!("intent {}", reply.intent)];
    if let Some(kind) = &reply.match_kind {
        meta.push(format!("{} match, {} offer(s)", kind, reply.offers.len()));
    }
    if let Some(ms) = reply.took_ms {
        meta.push(format!("{} ms", ms));
    }
    out.push_str(&format!("\n[{}]", meta.join(" | ")));
    out
}

pub fn format_sessions(list: &SessionList) -> String {
    if list.sessions.is_empty() {
        return "No sessions.".to_string();
    }
    list.sessions
        .iter()
        .map(|s| {
            let when: String = s.last_interaction_at.chars().take(16).collect();
            format!("{:<36}  {:<6}  {}  {}", s.session_id, s.kind, when, s.title)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_session(detail: &SessionDetail) -> String {
    let mut out = format!("{} ({})\n", detail.title, detail.session_id);
    for turn in &detail.messages {
        out.push_str(&format!("\n{}: {}\n", turn.role, turn.content));
    }
    out
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

struct Api {
    client: Client,
    server: String,
    token: Option<String>,
}

impl Api {
    fn new(server: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(120)).build()?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn authed(&self, req: RequestBuilder) -> anyhow::Result<RequestBuilder> {
        match &self.token {
            Some(token) => Ok(req.bearer_auth(token)),
            None => bail!("no token given; pass --token or set LENDSCOPE_TOKEN"),
        }
    }

    fn send(&self, req: RequestBuilder) -> anyhow::Result<Value> {
        let resp = req.send().with_context(|| format!("connection failed to {}", self.server))?;
        let status = resp.status();
        let body: Value = resp.json().unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no details");
            bail!("server returned {}: {}", status, msg);
        }
        Ok(body)
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let api = Api::new(&cli.server, cli.token)?;

    match cli.command {
        Commands::Chat { message, session } => {
            let body = serde_json::json!({"message": message, "session_id": session});
            let value = api.send(api.authed(api.client.post(api.url("/chat")).json(&body))?)?;
            if cli.json {
                return print_json(&value);
            }
            let reply: ChatReply = serde_json::from_value(value).context("unexpected chat response")?;
            println!("{}", format_chat(&reply));
        }
        Commands::Upload { file, session } => {
            let bytes = std::fs::read(&file).with_context(|| format!("cannot read {}", file))?;
            let filename = Path::new(&file)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(&file)
                .to_string();
            let mut req = api.client.post(api.url("/upload")).header("x-filename", filename).body(bytes);
            if let Some(sid) = session {
                req = req.header("x-session-id", sid);
            }
            let value = api.send(api.authed(req)?)?;
            if cli.json {
                return print_json(&value);
            }
            println!("{}", value["message"].as_str().unwrap_or(""));
            println!(
                "\n[{} | session {}]",
                value["outcome"].as_str().unwrap_or("?"),
                value["session_id"].as_str().unwrap_or("?")
            );
        }
        Commands::UploadChat { session, message } => {
            let body = serde_json::json!({"session_id": session, "message": message});
            let value = api.send(api.authed(api.client.post(api.url("/upload_chat")).json(&body))?)?;
            if cli.json {
                return print_json(&value);
            }
            println!("{}", value["message"].as_str().unwrap_or(""));
            println!(
                "\n[stored {} | indexed {}]",
                value["stored"].as_bool().unwrap_or(false),
                value["indexed"].as_bool().unwrap_or(false)
            );
        }
        Commands::Sessions { limit, kind } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(kind) = kind {
                query.push(("kind", kind));
            }
            let value = api.send(api.authed(api.client.get(api.url("/sessions")).query(&query))?)?;
            if cli.json {
                return print_json(&value);
            }
            let list: SessionList = serde_json::from_value(value).context("unexpected sessions response")?;
            println!("{}", format_sessions(&list));
        }
        Commands::Session { id } => {
            let req = api.client.get(api.url("/session")).query(&[("session_id", id)]);
            let value = api.send(api.authed(req)?)?;
            if cli.json {
                return print_json(&value);
            }
            let detail: SessionDetail = serde_json::from_value(value).context("unexpected session response")?;
            println!("{}", format_session(&detail));
        }
        Commands::Status => {
            let value = api.send(api.client.get(api.url("/health")))?;
            if cli.json {
                return print_json(&value);
            }
            println!("Lendscope server: {}", value["status"].as_str().unwrap_or("unknown"));
            println!("Version:          {}", value["version"].as_str().unwrap_or("?"));
            println!("Storage:          {}", value["storage"].as_str().unwrap_or("?"));
            println!("PostgreSQL:       {}", value["postgresql"].as_str().unwrap_or("-"));
            println!("pgvector:         {}", value["pgvector"].as_str().unwrap_or("-"));
            println!("Embeddings:       {}", value["embeddings"].as_str().unwrap_or("?"));
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("lendscope-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_reply_parses_server_shape() {
        let value = serde_json::json!({
            "session_id": "s1",
            "response": "Bay Capital lends in CA.",
            "intent": "filtered_lender",
            "confidence": "high",
            "reason": "criteria given",
            "filters": [],
            "match_kind": "structured",
            "offers": ["d1"],
            "took_ms": 812
        });
        let reply: ChatReply = serde_json::from_value(value).unwrap();
        let out = format_chat(&reply);
        assert!(out.starts_with("Bay Capital lends in CA."));
        assert!(out.contains("structured match, 1 offer(s)"));
        assert!(out.contains("812 ms"));
    }

    #[test]
    fn test_chat_without_retrieval_omits_match() {
        let value = serde_json::json!({
            "session_id": "s1",
            "response": "Hello",
            "intent": "general_lending",
            "offers": []
        });
        let reply: ChatReply = serde_json::from_value(value).unwrap();
        assert!(!format_chat(&reply).contains("match"));
    }

    #[test]
    fn test_format_sessions() {
        let list: SessionList = serde_json::from_value(serde_json::json!({
            "count": 1,
            "sessions": [{
                "session_id": "abc",
                "kind": "chat",
                "title": "Bridge Loans",
                "document_id": null,
                "created_at": "2026-02-23T10:00:00Z",
                "last_interaction_at": "2026-02-23T10:05:00.123Z"
            }]
        }))
        .unwrap();
        let out = format_sessions(&list);
        assert!(out.contains("Bridge Loans"));
        assert!(out.contains("2026-02-23T10:05"));
        assert!(!out.contains(".123"));

        assert_eq!(format_sessions(&SessionList { sessions: vec![] }), "No sessions.");
    }

    #[test]
    fn test_format_session_lists_turns_in_order() {
        let detail: SessionDetail = serde_json::from_value(serde_json::json!({
            "session_id": "abc",
            "title": "LTV",
            "messages": [
                {"role": "user", "content": "what is ltv?"},
                {"role": "assistant", "content": "Loan over value."}
            ]
        }))
        .unwrap();
        let out = format_session(&detail);
        let user = out.find("user: what is ltv?").unwrap();
        let assistant = out.find("assistant: Loan over value.").unwrap();
        assert!(user < assistant);
    }
}
