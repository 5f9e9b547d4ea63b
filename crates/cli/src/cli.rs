//! Command-line arguments.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "dagrun",
    about = "Run warehouse load pipelines as dependency graphs",
    version
)]
pub struct Cli {
    /// Log verbosity; overrides DAGRUN_LOG / RUST_LOG.
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a pipeline definition and print its execution order.
    Validate {
        /// Path to the pipeline JSON file.
        path: PathBuf,
    },
    /// Print the tasks of a pipeline grouped into parallel levels.
    Plan {
        /// Path to the pipeline JSON file.
        path: PathBuf,
    },
    /// Execute a pipeline once against the in-memory recording warehouse.
    Run(RunArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline JSON file.
    pub path: PathBuf,

    /// Logical timestamp of the run (RFC 3339 or YYYY-MM-DD).  Defaults to now.
    #[arg(long, value_parser = parse_logical_date)]
    pub logical_date: Option<DateTime<Utc>>,

    /// Extra template parameter, KEY=VALUE.  Repeatable.
    #[arg(long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    /// Maximum number of tasks running at once.
    #[arg(long, env = "DAGRUN_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// How run events are reported.
    #[arg(long, value_enum, default_value_t = EventFormat::Log)]
    pub events: EventFormat,

    /// Print the final report as JSON instead of a table.
    #[arg(long)]
    pub json: bool,

    /// Fail the next statement containing this text with a transient
    /// error.  Repeat to fail it several times.
    #[arg(long, value_name = "SQL")]
    pub fail_on: Vec<String>,

    /// Fail every statement containing this text with a fatal error.
    #[arg(long, value_name = "SQL")]
    pub fail_always: Vec<String>,

    /// Answer a scalar query, QUERY=VALUE (e.g. a quality probe).
    #[arg(long, value_parser = parse_scalar)]
    pub scalar: Vec<(String, i64)>,

    /// Read object-store credentials from AWS_ACCESS_KEY_ID /
    /// AWS_SECRET_ACCESS_KEY instead of using placeholders.
    #[arg(long)]
    pub env_credentials: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum EventFormat {
    /// Through the logger, on stderr.
    Log,
    /// One JSON object per line on stdout.
    Json,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in `{s}`"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

// The query itself may contain `=`, so split on the last one.
fn parse_scalar(s: &str) -> Result<(String, i64), String> {
    let (query, value) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected QUERY=VALUE, got `{s}`"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|e| format!("bad scalar value in `{s}`: {e}"))?;
    Ok((query.trim().to_owned(), value))
}

fn parse_logical_date(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("expected RFC 3339 timestamp or YYYY-MM-DD, got `{s}`"))
}
