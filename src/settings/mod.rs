use crate::config::{ConfigError, ProbeKind, TargetTemplate, parse_proxy_url, parse_target_url};
use crate::events::DEFAULT_PROGRESS_CAPACITY;
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "proxyprobe")]
#[command(about = "Concurrent HTTP latency and throughput prober with proxy support", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    command: Command,

    /// Log filter, e.g. `info` or `proxyprobe=debug` (overrides RUST_LOG)
    #[arg(long, global = true, value_name = "FILTER")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a batch of probes and print a report
    Run(RunArgs),
    /// Show the public IP requests leave from
    Egress(EgressArgs),
    /// Answer relay requests: one JSON object per stdin line
    Relay,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Target URL (repeatable; probes rotate through them)
    #[arg(short, long, value_name = "URL")]
    target: Vec<String>,

    /// Forward proxy, scheme://[user:pass@]host:port
    #[arg(short, long, value_name = "URL")]
    proxy: Option<String>,

    /// Number of probes
    #[arg(short = 'n', long, default_value_t = 10)]
    count: usize,

    /// Probes running at once
    #[arg(short, long, default_value_t = 5)]
    concurrency: usize,

    /// Per-request timeout in seconds (default 10 latency, 15 throughput)
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Probe mode: latency|throughput
    #[arg(short, long, default_value = "latency")]
    mode: String,

    /// Print the final report as JSON
    #[arg(long)]
    json: bool,

    /// Hide per-probe lines
    #[arg(short, long)]
    quiet: bool,

    /// Progress samples buffered for display before old ones are dropped
    #[arg(long, default_value_t = DEFAULT_PROGRESS_CAPACITY)]
    queue_capacity: usize,
}

#[derive(Args, Debug)]
struct EgressArgs {
    /// Forward proxy, scheme://[user:pass@]host:port
    #[arg(short, long, value_name = "URL")]
    proxy: Option<String>,

    /// Per-service timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BatchSettings {
    pub template: TargetTemplate,
    pub count: usize,
    pub concurrency: usize,
    pub output: OutputFormat,
    pub quiet: bool,
    pub progress_capacity: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EgressSettings {
    pub proxy: Option<Url>,
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Run(BatchSettings),
    Egress(EgressSettings),
    Relay,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppSettings {
    pub log_filter: Option<String>,
    pub action: Action,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown mode `{value}` (expected latency or throughput)")]
    InvalidMode { value: String },
    #[error("timeout must be a positive number of seconds (got {value})")]
    InvalidTimeout { value: f64 },
}

pub fn load_from_cli() -> Result<AppSettings, SettingsError> {
    let args = CliArgs::parse();
    from_args(args)
}

pub fn from_args(args: CliArgs) -> Result<AppSettings, SettingsError> {
    let action = match args.command {
        Command::Run(run) => Action::Run(batch_settings(run)?),
        Command::Egress(egress) => Action::Egress(EgressSettings {
            proxy: parse_optional_proxy(egress.proxy.as_deref())?,
            timeout: egress.timeout.map(parse_timeout).transpose()?,
        }),
        Command::Relay => Action::Relay,
    };
    Ok(AppSettings {
        log_filter: args.log_level,
        action,
    })
}

fn batch_settings(args: RunArgs) -> Result<BatchSettings, SettingsError> {
    if args.count == 0 {
        return Err(ConfigError::InvalidCount { value: args.count }.into());
    }
    if args.concurrency == 0 {
        return Err(ConfigError::InvalidConcurrency {
            value: args.concurrency,
        }
        .into());
    }

    let kind = parse_mode(&args.mode)?;
    let urls = if args.target.is_empty() {
        vec![parse_target_url(kind.default_url())?]
    } else {
        args.target
            .iter()
            .map(|target| parse_target_url(target))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut template =
        TargetTemplate::new(urls, kind)?.with_proxy(parse_optional_proxy(args.proxy.as_deref())?);
    if let Some(secs) = args.timeout {
        template = template.with_timeout(parse_timeout(secs)?)?;
    }

    Ok(BatchSettings {
        template,
        count: args.count,
        concurrency: args.concurrency,
        output: if args.json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        },
        quiet: args.quiet,
        progress_capacity: args.queue_capacity.max(1),
    })
}

fn parse_mode(value: &str) -> Result<ProbeKind, SettingsError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "latency" => Ok(ProbeKind::Latency),
        "throughput" | "speed" => Ok(ProbeKind::Throughput),
        _ => Err(SettingsError::InvalidMode {
            value: value.to_string(),
        }),
    }
}

fn parse_timeout(secs: f64) -> Result<Duration, SettingsError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(SettingsError::InvalidTimeout { value: secs });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_optional_proxy(value: Option<&str>) -> Result<Option<Url>, ConfigError> {
    match value.map(str::trim) {
        Some(proxy) if !proxy.is_empty() => parse_proxy_url(proxy).map(Some),
        _ => Ok(None),
    }
}
