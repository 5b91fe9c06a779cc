use proxyprobe::egress::{self, IP_SERVICES};
use proxyprobe::events::{EventQueue, EventSink};
use proxyprobe::probe::ProbeEvent;
use proxyprobe::probe_engine::{Prober, curl_prober};
use proxyprobe::relay::{self, RelayError};
use proxyprobe::report::{self, JsonReport};
use proxyprobe::runtime::BatchRunner;
use proxyprobe::settings::{Action, BatchSettings, EgressSettings, OutputFormat, load_from_cli};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

fn main() -> io::Result<()> {
    let settings = load_from_cli().map_err(|err| invalid_input(err.to_string()))?;
    init_tracing(settings.log_filter.as_deref());

    match settings.action {
        Action::Run(batch) => run_batch(batch),
        Action::Egress(egress) => show_egress(egress),
        Action::Relay => serve_relay(),
    }
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(filter) => EnvFilter::try_new(filter).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn run_batch(settings: BatchSettings) -> io::Result<()> {
    let queue = Arc::new(EventQueue::new(settings.progress_capacity));
    let sink: Arc<dyn EventSink> = queue.clone();
    let runner = BatchRunner::new(Arc::new(curl_prober), sink);
    runner
        .start(settings.count, settings.concurrency, settings.template.clone())
        .map_err(|err| invalid_input(err.to_string()))?;

    let verbose = settings.output == OutputFormat::Text && !settings.quiet;
    let mut results = Vec::with_capacity(settings.count);
    let mut stdout = io::stdout().lock();
    loop {
        let Some(event) = queue.recv_timeout(POLL_INTERVAL) else {
            if runner.status().is_terminal() && queue.is_empty() {
                break;
            }
            continue;
        };
        match event {
            ProbeEvent::Progress(sample) if verbose => {
                writeln!(stdout, "{}", report::progress_line(&sample))?;
            }
            ProbeEvent::Result(result) => {
                if verbose {
                    writeln!(stdout, "{}", report::result_line(&result))?;
                }
                results.push(result);
            }
            ProbeEvent::Status { status, .. } if status.is_terminal() => break,
            _ => {}
        }
    }

    if queue.dropped_progress() > 0 {
        tracing::debug!(
            dropped = queue.dropped_progress(),
            "progress samples skipped while printing"
        );
    }

    let state = runner.state();
    let stats = runner.stats();
    match settings.output {
        OutputFormat::Json => {
            let encoded = serde_json::to_string_pretty(&JsonReport {
                batch: &state,
                stats: &stats,
                results: &results,
            })
            .map_err(io::Error::other)?;
            writeln!(stdout, "{encoded}")?;
        }
        OutputFormat::Text => {
            write!(stdout, "{}", report::render_text(&state, &stats))?;
        }
    }
    stdout.flush()
}

fn show_egress(settings: EgressSettings) -> io::Result<()> {
    let mut prober = Prober::new().map_err(io::Error::other)?;
    let info = egress::lookup(
        &mut prober,
        &IP_SERVICES,
        settings.proxy.as_ref(),
        settings.timeout,
    )
    .map_err(io::Error::other)?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", info.render())?;
    if info.is_mainland_china() {
        writeln!(
            stdout,
            "\nwarning: egress IP is in mainland China; proxy services may be unreachable"
        )?;
    }
    stdout.flush()
}

fn serve_relay() -> io::Result<()> {
    let mut prober = Prober::new().map_err(io::Error::other)?;
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let encoded = match relay::handle_line(&mut prober, &line) {
            Ok(encoded) => encoded,
            Err(err @ RelayError::Malformed(_)) => {
                tracing::warn!(error = %err, "rejecting relay request");
                serde_json::to_string(&relay::malformed_response(&err)).map_err(io::Error::other)?
            }
            Err(err) => return Err(io::Error::other(err)),
        };
        writeln!(stdout, "{encoded}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn invalid_input(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message)
}
