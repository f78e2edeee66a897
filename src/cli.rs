// CLI module - command-line argument parsing and handlers
//
// `start` runs the proxy; the other subcommands read the captured requests
// back out of the database:
// - list: newest requests, optionally filtered or exported as JSON files
// - inspect: one request's columns, or the raw HTTP messages
// - cleanup: delete requests older than a date
// - export: one chat request as JSON, tagged as a good or bad case
// - config: show the effective configuration or its file path

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::{Config, StartConfig, VERSION};
use crate::storage::{ListFilter, Persistence, RequestLookup, StoredRequest};

/// MoonPalace - debugging proxy for the Moonshot AI API
#[derive(Parser)]
#[command(name = "moonpalace")]
#[command(version = VERSION)]
#[command(about = "Debugging proxy for the Moonshot AI API", long_about = None)]
pub struct Cli {
    /// Upstream API base URL (overrides config and MOONPALACE_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the proxy server
    Start(StartArgs),

    /// List captured requests, newest first
    List(ListArgs),

    /// Inspect the specific content of a captured request
    Inspect(InspectArgs),

    /// Delete captured requests made before a point in time
    Cleanup {
        /// `YYYY-mm-dd` or `YYYY-mm-dd HH:MM:SS`; defaults to seven days ago
        #[arg(long)]
        before: Option<String>,
    },

    /// Export one chat request as JSON
    Export(ExportArgs),

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Port to listen on (127.0.0.1)
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// API key sent upstream instead of the client's
    #[arg(long, short = 'k')]
    pub key: Option<String>,

    /// Abort streamed completions that start repeating themselves
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub detect_repeat: Option<bool>,

    /// Repeatness below this value counts as repeating
    #[arg(long)]
    pub repeat_threshold: Option<f64>,

    /// Characters to see before repeat detection kicks in
    #[arg(long)]
    pub repeat_min_length: Option<u32>,

    /// Stream every chat completion upstream
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub force_stream: Option<bool>,

    /// Automatically create and reuse context caches
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub auto_cache: Option<bool>,

    /// Minimum conversation size in bytes before caching
    #[arg(long)]
    pub cache_min_bytes: Option<usize>,

    /// Cache time to live in seconds
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Forget caches unused for this many seconds
    #[arg(long)]
    pub cache_cleanup: Option<u64>,
}

impl StartArgs {
    /// Flags win over everything loaded before; zero means "keep the default"
    pub fn apply(&self, start: &mut StartConfig) {
        fn set<T: Copy + Default + PartialEq>(target: &mut T, value: Option<T>) {
            if let Some(v) = value.filter(|v| *v != T::default()) {
                *target = v;
            }
        }

        set(&mut start.port, self.port);
        if let Some(key) = self.key.as_ref().filter(|k| !k.is_empty()) {
            start.key = Some(key.clone());
        }
        if let Some(enabled) = self.detect_repeat {
            start.detect_repeat.enabled = enabled;
        }
        set(&mut start.detect_repeat.threshold, self.repeat_threshold);
        set(&mut start.detect_repeat.min_length, self.repeat_min_length);
        if let Some(enabled) = self.force_stream {
            start.force_stream = enabled;
        }
        if let Some(enabled) = self.auto_cache {
            start.auto_cache.enabled = enabled;
        }
        set(&mut start.auto_cache.min_bytes, self.cache_min_bytes);
        set(&mut start.auto_cache.ttl, self.cache_ttl);
        set(&mut start.auto_cache.cleanup, self.cache_cleanup);
    }
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Number of results; unlimited when exporting and not given
    #[arg(short = 'n')]
    pub n: Option<u64>,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Only chat completion requests
    #[arg(long)]
    pub chatonly: bool,

    /// SQL condition over the request columns, e.g. "response_status_code >= 400"
    #[arg(long)]
    pub predicate: Vec<String>,

    /// Write each request as a JSON file into this directory
    #[arg(long)]
    pub export: Option<PathBuf>,
}

/// One of `--id`, `--chatcmpl`, `--requestid`
#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct LookupArgs {
    /// Row id
    #[arg(long)]
    pub id: Option<i64>,

    /// Completion id
    #[arg(long)]
    pub chatcmpl: Option<String>,

    /// Request id returned by the upstream
    #[arg(long)]
    pub requestid: Option<String>,
}

impl LookupArgs {
    pub fn lookup(&self) -> RequestLookup {
        match (&self.id, &self.chatcmpl, &self.requestid) {
            (Some(id), _, _) => RequestLookup::Id(*id),
            (_, Some(chatcmpl), _) => RequestLookup::CompletionId(chatcmpl.clone()),
            (_, _, Some(request_id)) => RequestLookup::RequestId(request_id.clone()),
            _ => RequestLookup::Id(0),
        }
    }
}

pub const INSPECT_COLUMNS: [&str; 6] = [
    "metadata",
    "request_header",
    "request_body",
    "response_header",
    "response_body",
    "error",
];

#[derive(Args, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub lookup: LookupArgs,

    /// Columns to print: metadata, request_header, request_body,
    /// response_header, response_body, error
    #[arg(long, value_delimiter = ',', default_value = "metadata",
          conflicts_with_all = ["print_request", "print_response"])]
    pub print: Vec<String>,

    /// Print the request as an HTTP message
    #[arg(long, conflicts_with = "print_response")]
    pub print_request: bool,

    /// Print the response as an HTTP message
    #[arg(long)]
    pub print_response: bool,

    /// Merge an event-stream response into one completion
    #[arg(long)]
    pub merge_event_stream: bool,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    #[command(flatten)]
    pub lookup: LookupArgs,

    /// stdout, stderr or a file path
    #[arg(long, short = 'o', default_value = "stdout")]
    pub output: String,

    /// Write into this directory under a generated file name
    #[arg(long)]
    pub directory: Option<PathBuf>,

    /// Mark as a good case
    #[arg(long, conflicts_with = "bad")]
    pub good: bool,

    /// Mark as a bad case
    #[arg(long)]
    pub bad: bool,

    /// Tags describing the case
    #[arg(long)]
    pub tag: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub fn handle_config(config: &Config, show: bool, path: bool) {
    if path {
        println!("{}", Config::config_path().display());
    } else if show {
        println!("# Effective configuration (flags > env > file > defaults)");
        println!();
        print!("{}", config.to_toml());
        println!();
        let source = Config::config_path();
        if source.exists() {
            println!("# Source: {}", source.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    } else {
        println!("Usage: moonpalace config [--show|--path]");
        println!();
        println!("Options:");
        println!("  --show    Display effective configuration");
        println!("  --path    Show config file path");
    }
}

pub fn handle_list(store: &dyn Persistence, args: &ListArgs, endpoint: &str) -> Result<()> {
    let limit = match (args.n, &args.export) {
        (Some(0), _) | (None, Some(_)) => None,
        (Some(n), _) => Some(n),
        (None, None) => Some(10),
    };
    let filter = ListFilter {
        limit,
        chat_only: args.chatonly,
        predicates: args.predicate.clone(),
    };
    let requests = store.list_requests(&filter)?;

    if let Some(dir) = &args.export {
        for request in &requests {
            let path = dir.join(export_filename(request));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_export(file, request, endpoint)?;
            println!("export to {} successfully", path.display());
        }
        return Ok(());
    }

    let mut out = io::stdout().lock();
    if args.verbose {
        writeln!(
            out,
            "{:<6} {:<48} {:<6} {:<22} {:<32} {:<32} {:<24} {:>8} {:<20} {}",
            "id", "url", "method", "status", "chatcmpl", "request_id", "user_id",
            "timing", "content_type", "requested_at"
        )?;
        for r in &requests {
            writeln!(
                out,
                "{:<6} {:<48} {:<6} {:<22} {:<32} {:<32} {:<24} {:>8} {:<20} {}",
                r.id,
                r.url(endpoint),
                r.request_method,
                r.status(),
                r.chat_cmpl().unwrap_or_default(),
                r.moonshot_request_id.as_deref().unwrap_or_default(),
                r.moonshot_uid.as_deref().unwrap_or_default(),
                r.moonshot_server_timing.unwrap_or_default(),
                r.response_content_type.as_deref().unwrap_or_default(),
                r.created_at
            )?;
        }
    } else {
        writeln!(
            out,
            "{:<6} {:<22} {:<32} {:<32} {}",
            "id", "status", "chatcmpl", "request_id", "requested_at"
        )?;
        for r in &requests {
            writeln!(
                out,
                "{:<6} {:<22} {:<32} {:<32} {}",
                r.id,
                r.status(),
                r.chat_cmpl().unwrap_or_default(),
                r.moonshot_request_id.as_deref().unwrap_or_default(),
                r.created_at
            )?;
        }
    }
    Ok(())
}

fn find(store: &dyn Persistence, lookup: &LookupArgs) -> Result<StoredRequest> {
    let lookup = lookup.lookup();
    match store.get_request(&lookup)? {
        Some(request) => Ok(request),
        None => bail!("no request found for {:?}", lookup),
    }
}

/// Which columns `inspect --print` shows for this request
///
/// `response_body` turns into `error` for non-200 responses; `error` is only
/// shown when the request actually failed.
pub fn inspect_columns(request: &StoredRequest, wanted: &[String]) -> Vec<&'static str> {
    let mut columns = Vec::new();
    for column in INSPECT_COLUMNS {
        if !wanted.iter().any(|w| w.trim() == column) {
            continue;
        }
        let column = match column {
            "error" if !request.has_error() => continue,
            "response_body" if request.response_status_code != Some(200) => "error",
            other => other,
        };
        if !columns.contains(&column) {
            columns.push(column);
        }
    }
    columns
}

pub fn handle_inspect(store: &dyn Persistence, args: &InspectArgs, endpoint: &str) -> Result<()> {
    let request = find(store, &args.lookup)?;
    let mut out = io::stdout().lock();

    if args.print_request {
        request.print_request(&mut out, endpoint)?;
        return Ok(());
    }
    if args.print_response {
        request.print_response(&mut out, args.merge_event_stream)?;
        return Ok(());
    }

    let inspection = request.inspection();
    for column in inspect_columns(&request, &args.print) {
        writeln!(out, "── {} ──", column)?;
        writeln!(out, "{}", inspection.get(column).map(String::as_str).unwrap_or_default())?;
    }
    Ok(())
}

/// Accept `YYYY-mm-dd` or `YYYY-mm-dd HH:MM:SS`
pub fn parse_before(before: &str) -> Result<String> {
    let date_only = chrono::NaiveDate::parse_from_str(before, "%Y-%m-%d").is_ok();
    let date_time = chrono::NaiveDateTime::parse_from_str(before, "%Y-%m-%d %H:%M:%S").is_ok();
    if !date_only && !date_time {
        bail!(
            "the date(time) format is either YYYY-mm-dd or YYYY-mm-dd HH:MM:SS, got {}",
            before
        );
    }
    Ok(before.to_string())
}

pub fn handle_cleanup(store: &dyn Persistence, before: Option<&str>) -> Result<()> {
    let before = match before {
        Some(before) => parse_before(before)?,
        None => (chrono::Local::now() - chrono::Duration::days(7))
            .format("%Y-%m-%d")
            .to_string(),
    };
    let deleted = store.cleanup(&before)?;
    println!("cleanup {}", deleted);
    Ok(())
}

/// File name for an exported request, derived from its most specific id
pub fn export_filename(request: &StoredRequest) -> String {
    let ident = request.ident();
    if let Some(chatcmpl) = ident.strip_prefix("chatcmpl=") {
        return format!("{}.json", chatcmpl);
    }
    if let Some(request_id) = ident.strip_prefix("requestid=") {
        return format!("requestid-{}.json", request_id);
    }

    let mut name = request.request_method.to_lowercase();
    name.push('-');
    let path = request.request_path.strip_prefix("/v1/").unwrap_or(&request.request_path);
    name.push_str(&path.replace('/', "."));
    if let Some(uid) = request.moonshot_uid.as_deref().filter(|u| !u.is_empty()) {
        name.push('-');
        name.push_str(uid);
    }
    name.push('-');
    name.extend(request.created_at.chars().filter(char::is_ascii_digit));
    name.push_str(".json");
    name
}

fn write_export<W: Write>(mut w: W, request: &StoredRequest, endpoint: &str) -> Result<()> {
    let exported = request.to_export(endpoint);
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut w, formatter);
    serde::Serialize::serialize(&exported, &mut ser).context("Failed to encode request")?;
    writeln!(w)?;
    Ok(())
}

pub fn handle_export(store: &dyn Persistence, args: &ExportArgs, endpoint: &str) -> Result<()> {
    let mut request = find(store, &args.lookup)?;
    if !request.is_chat() {
        bail!("target request({}) is not a chat", request.ident());
    }
    if args.good {
        request.category = Some("goodcase".to_string());
    } else if args.bad {
        request.category = Some("badcase".to_string());
    }
    request.tags = args.tag.clone();

    if let Some(dir) = &args.directory {
        let path = dir.join(export_filename(&request));
        return export_to_file(&path, &request, endpoint);
    }
    match args.output.as_str() {
        "stdout" => write_export(io::stdout().lock(), &request, endpoint),
        "stderr" => write_export(io::stderr().lock(), &request, endpoint),
        path => export_to_file(Path::new(path), &request, endpoint),
    }
}

fn export_to_file(path: &Path, request: &StoredRequest, endpoint: &str) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write_export(file, request, endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(path: &str, status: Option<i64>) -> StoredRequest {
        StoredRequest {
            id: 3,
            request_method: "POST".into(),
            request_path: path.into(),
            response_status_code: status,
            created_at: "2024-07-01 12:30:45".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_start_flags_override_config() {
        let cli = Cli::parse_from([
            "moonpalace",
            "start",
            "--port",
            "9000",
            "--detect-repeat=false",
            "--force-stream",
            "--cache-ttl",
            "0",
        ]);
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        let mut start = StartConfig::default();
        args.apply(&mut start);
        assert_eq!(start.port, 9000);
        assert!(!start.detect_repeat.enabled);
        assert!(start.force_stream);
        assert_eq!(start.auto_cache.ttl, 60);
    }

    #[test]
    fn test_lookup_requires_exactly_one_id() {
        assert!(Cli::try_parse_from(["moonpalace", "inspect"]).is_err());
        assert!(
            Cli::try_parse_from(["moonpalace", "inspect", "--id", "1", "--chatcmpl", "x"]).is_err()
        );
        let cli = Cli::try_parse_from(["moonpalace", "export", "--chatcmpl", "cmpl-1"]).unwrap();
        let Commands::Export(args) = cli.command else {
            panic!("expected export");
        };
        assert_eq!(args.lookup.lookup(), RequestLookup::CompletionId("cmpl-1".into()));
    }

    #[test]
    fn test_inspect_columns() {
        let wanted: Vec<String> = vec!["metadata".into(), "response_body".into(), "error".into()];
        let ok = row("/v1/chat/completions", Some(200));
        assert_eq!(inspect_columns(&ok, &wanted), vec!["metadata", "response_body"]);

        let failed = row("/v1/chat/completions", Some(429));
        assert_eq!(inspect_columns(&failed, &wanted), vec!["metadata", "error"]);
    }

    #[test]
    fn test_parse_before() {
        assert!(parse_before("2024-07-01").is_ok());
        assert!(parse_before("2024-07-01 08:00:00").is_ok());
        assert!(parse_before("07/01/2024").is_err());
    }

    #[test]
    fn test_export_filename() {
        let mut chat = row("/v1/chat/completions", Some(200));
        chat.moonshot_id = Some("cmpl-9".into());
        assert_eq!(export_filename(&chat), "cmpl-9.json");

        let mut by_request_id = row("/v1/files", Some(200));
        by_request_id.moonshot_request_id = Some("req-5".into());
        assert_eq!(export_filename(&by_request_id), "requestid-req-5.json");

        let mut plain = row("/v1/files/abc/content", None);
        plain.request_method = "GET".into();
        plain.moonshot_uid = Some("u1".into());
        assert_eq!(export_filename(&plain), "get-files.abc.content-u1-20240701123045.json");
    }
}
