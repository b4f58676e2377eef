use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use gpuoa::capture::{payloads, read_capture};
use gpuoa::metrics::pretty_print_value;
use gpuoa::{Config, HwContext, Request, Session};

/// Replay a recorded OA capture and print every closed aggregation window.
#[derive(Debug, Parser)]
#[command(name = "gpuoa-replay", about)]
struct Command {
    /// Path to the JSON session configuration.
    #[arg(short, long)]
    config: PathBuf,
    /// Capture of length-prefixed transport payloads. Stream ids are the
    /// ones a fresh session allocates: 1 for OA, then tracepoints.
    #[arg(long)]
    capture: Option<PathBuf>,
    /// Metric set to sample with, overriding the configuration.
    #[arg(short, long)]
    metric_set: Option<String>,
    /// Extra tracepoints to correlate processes with.
    #[arg(long)]
    tracepoint: Vec<String>,
    /// Only print these counters.
    #[arg(long)]
    counter: Vec<String>,
    #[arg(long)]
    aggregation_period_ms: Option<u64>,
    /// Human readable values instead of raw numbers.
    #[arg(short, long)]
    pretty: bool,
    /// List the metric catalog and exit.
    #[arg(long)]
    list_metrics: bool,
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Serialize)]
struct WindowReport {
    context: Option<String>,
    hw_id: Option<u32>,
    start_ns: u64,
    end_ns: u64,
    usage: Option<f64>,
    counters: BTreeMap<String, serde_json::Value>,
}

fn list_metrics(config: &Config) {
    for set in &config.metric_sets {
        println!("{} ({}) {}", set.symbol_name, set.name, set.hw_config_guid);
        for counter in &set.counters {
            println!("    {:<32} {:?} {}", counter.symbol_name, counter.units, counter.desc);
        }
    }
}

fn print_window(session: &Session, context: Option<&HwContext>, counters: &[String], pretty: bool) {
    let (Some(window), Some(metric_set)) = (session.last_closed(context), session.metric_set()) else {
        return;
    };

    let mut values = BTreeMap::new();
    for counter in &metric_set.counters {
        if !counters.is_empty() && !counters.contains(&counter.symbol_name) {
            continue;
        }
        let value = session.read_counter_value(window, counter);
        let value = if pretty {
            serde_json::Value::from(pretty_print_value(counter.units, value))
        } else {
            serde_json::Value::from(value)
        };
        values.insert(counter.symbol_name.clone(), value);
    }

    let report = WindowReport {
        context: context.map(|c| c.name.clone()),
        hw_id: context.map(|c| c.hw_id),
        start_ns: window.timestamp_start,
        end_ns: window.timestamp_end,
        usage: context.map(|c| c.usage),
        counters: values,
    };
    match serde_json::to_string(&report) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::warn!("failed to encode window: {}", e),
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let filter = EnvFilter::try_new(&opts.log_level)
        .with_context(|| format!("invalid log level: {}", opts.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let mut config = Config::load(&opts.config)
        .with_context(|| format!("loading config from {}", opts.config.display()))?;

    if opts.list_metrics {
        list_metrics(&config);
        return Ok(());
    }

    if let Some(symbol) = &opts.metric_set {
        config.metric_set = Some(symbol.clone());
    }
    if let Some(period_ms) = opts.aggregation_period_ms {
        config.aggregation_period_ns = period_ms * 1_000_000;
    }
    config.tracepoints.extend(opts.tracepoint.iter().cloned());
    config.validate()?;
    if config.metric_set.is_none() {
        bail!("no metric set selected (use --metric-set or set metric_set in the config)");
    }

    let Some(capture) = &opts.capture else {
        bail!("--capture is required (use --help for usage)");
    };
    let data = read_capture(capture)?;

    let sink = |request: Request| tracing::debug!(?request, "request not sent during replay");
    let mut session = Session::new(&config, Box::new(sink))?;

    let counters = opts.counter.clone();
    let pretty = opts.pretty;
    session.set_on_window_closed(move |session, context| print_window(session, context, &counters, pretty));

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
        .context("setting Ctrl-C handler")?;

    tracing::info!(capture = %capture.display(), bytes = data.len(), "replaying capture");
    session.start_sampling();
    for payload in payloads(&data) {
        if stop.load(Ordering::SeqCst) {
            tracing::info!("interrupted, stopping replay");
            break;
        }
        match payload {
            Ok(payload) => session.handle_data(payload),
            Err(e) => {
                tracing::warn!("{}", e);
                break;
            }
        }
    }
    session.stop_sampling();

    let stats = serde_json::to_string(session.stats()).context("encoding stats")?;
    eprintln!("{}", stats);
    tracing::info!(
        contexts = session.contexts().len(),
        busyness = session.busyness(),
        "replay done"
    );
    Ok(())
}
