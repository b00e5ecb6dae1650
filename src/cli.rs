use crate::engine::{HttpEndpoint, TestEngine};
use crate::model::{MeasurementSettings, Phase, RawSettings, Report, RunConfig, RunState, TestEvent};
use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "netdiag-speed",
    version,
    about = "Throughput, latency and bufferbloat test against a speed endpoint"
)]
pub struct Cli {
    /// Base URL of the speed endpoint (serves ping, download and upload)
    #[arg(long, default_value = "http://localhost:3000/api/speed/")]
    pub base_url: String,

    /// Print JSON report and exit
    #[arg(long, conflicts_with = "text")]
    pub json: bool,

    /// Print progress and a text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Latency probe timeout in milliseconds
    #[arg(long, default_value_t = 1_200)]
    pub probe_timeout_ms: u64,

    /// JSON file with measurement settings
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Number of idle latency probes (4-30)
    #[arg(long)]
    pub ping_samples: Option<u32>,

    /// Duration of each transfer phase (3s-20s)
    #[arg(long)]
    pub phase_duration: Option<humantime::Duration>,

    /// Parallel download workers (1-8)
    #[arg(long)]
    pub download_concurrency: Option<u32>,

    /// Parallel upload workers (1-6)
    #[arg(long)]
    pub upload_concurrency: Option<u32>,

    /// MiB requested per download (1-32)
    #[arg(long)]
    pub download_mb: Option<u32>,

    /// MiB sent per upload (1-8)
    #[arg(long)]
    pub upload_mb: Option<u32>,

    /// Export the report as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,

    /// Export the report as CSV
    #[arg(long)]
    pub export_csv: Option<PathBuf>,

    /// Print the summary of a previously exported JSON report instead of running
    #[arg(long)]
    pub show: Option<PathBuf>,
}

/// Generate a random identifier for this run.
fn gen_run_id() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    u64::from_le_bytes(b).to_string()
}

fn load_settings_file(path: &Path) -> Result<RawSettings> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&data).with_context(|| format!("parse settings {}", path.display()))
}

/// Settings file first, command-line flags on top, then clamped.
pub fn resolve_settings(args: &Cli) -> Result<MeasurementSettings> {
    let from_file = match args.settings.as_deref() {
        Some(p) => load_settings_file(p)?,
        None => RawSettings::default(),
    };
    let from_flags = RawSettings {
        ping_samples: args.ping_samples.map(f64::from),
        phase_duration_ms: args
            .phase_duration
            .map(|d| Duration::from(d).as_millis() as f64),
        download_concurrency: args.download_concurrency.map(f64::from),
        upload_concurrency: args.upload_concurrency.map(f64::from),
        download_payload_mb: args.download_mb.map(f64::from),
        upload_payload_mb: args.upload_mb.map(f64::from),
    };
    Ok(MeasurementSettings::from_raw(&from_file.overlay(from_flags)))
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<RunConfig> {
    Ok(RunConfig {
        base_url: args.base_url.clone(),
        run_id: gen_run_id(),
        user_agent: format!("netdiag-speed/{}", env!("CARGO_PKG_VERSION")),
        probe_timeout_ms: args.probe_timeout_ms,
        settings: resolve_settings(args)?,
    })
}

pub async fn run(args: Cli) -> Result<()> {
    if let Some(path) = args.show.as_deref() {
        let report = crate::storage::load_json(path)?;
        return output(&args, &report);
    }

    let cfg = build_config(&args)?;
    let endpoint = HttpEndpoint::new(&cfg)?;
    info!(base_url = %endpoint.base_url, run_id = %cfg.run_id, "starting speed test");

    let (evt_tx, mut evt_rx) = mpsc::channel::<TestEvent>(2048);
    let mut engine = TestEngine::new(cfg, endpoint, evt_tx);
    let handle = tokio::spawn(async move { engine.run().await });

    let quiet = args.json;
    let events = async {
        while let Some(ev) = evt_rx.recv().await {
            if !quiet {
                print_event(&ev);
            }
        }
    };

    tokio::select! {
        _ = events => {}
        signal = tokio::signal::ctrl_c() => {
            handle.abort();
            signal.context("listen for ctrl-c")?;
            bail!("speed test aborted by user");
        }
    }

    let report = handle.await.context("test engine task failed")?;
    output(&args, &report)
}

fn output(args: &Cli, report: &Report) -> Result<()> {
    handle_exports(args, report)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(report);
    }

    if report.state == RunState::Error {
        bail!(
            "speed test failed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_event(ev: &TestEvent) {
    match ev {
        TestEvent::StateChanged { state } if state.is_terminal() => {
            eprintln!("== finished: {state:?} ==")
        }
        TestEvent::StateChanged { state } => eprintln!("== {state:?} =="),
        TestEvent::ThroughputTick { phase, mbps, .. } => eprintln!("{phase:?}: {mbps:.2} Mbps"),
        TestEvent::LatencySample {
            phase: Phase::IdleLatency,
            rtt_ms,
            ..
        } => match rtt_ms {
            Some(ms) => eprintln!("Idle latency: {ms:.1} ms"),
            None => eprintln!("Idle latency: lost"),
        },
        TestEvent::LatencySample { .. } => {}
        TestEvent::Info { message } => eprintln!("{message}"),
    }
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    v.map(|v| format!("{v:.precision$}"))
        .unwrap_or_else(|| "-".to_string())
}

fn print_summary(report: &Report) {
    let m = &report.metrics;
    println!("Download: {} Mbps", fmt_opt(m.download_mbps, 2));
    println!("Upload:   {} Mbps", fmt_opt(m.upload_mbps, 2));
    println!(
        "Idle latency: med {} ms (loss {}%, jitter {} ms)",
        fmt_opt(m.idle_latency_median_ms, 1),
        fmt_opt(m.idle_loss_percent, 1),
        fmt_opt(m.idle_jitter_ms, 1)
    );
    println!(
        "Loaded latency (download): med {} ms (loss {}%, jitter {} ms)",
        fmt_opt(m.loaded_download_median_ms, 1),
        fmt_opt(m.loaded_download_loss_percent, 1),
        fmt_opt(m.loaded_download_jitter_ms, 1)
    );
    println!(
        "Loaded latency (upload): med {} ms (loss {}%, jitter {} ms)",
        fmt_opt(m.loaded_upload_median_ms, 1),
        fmt_opt(m.loaded_upload_loss_percent, 1),
        fmt_opt(m.loaded_upload_jitter_ms, 1)
    );
    println!("Bufferbloat: +{} ms", fmt_opt(m.bufferbloat_ms, 1));
    if let Some(spread) = m.loaded_download_spread.as_ref() {
        println!(
            "Loaded spread (download): min {:.1} p90 {:.1} max {:.1} ms",
            spread.min_ms, spread.p90_ms, spread.max_ms
        );
    }
}

/// Handle export operations (JSON and CSV) for both text and JSON modes.
fn handle_exports(args: &Cli, report: &Report) -> Result<()> {
    if let Some(p) = args.export_json.as_deref() {
        crate::storage::export_json(p, report)?;
    }
    if let Some(p) = args.export_csv.as_deref() {
        crate::storage::export_csv(p, report)?;
    }
    Ok(())
}
