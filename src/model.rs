use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const PING_SAMPLES: RangeInclusive<u32> = 4..=30;
pub const PHASE_DURATION_MS: RangeInclusive<u32> = 3_000..=20_000;
pub const DOWNLOAD_CONCURRENCY: RangeInclusive<u32> = 1..=8;
pub const UPLOAD_CONCURRENCY: RangeInclusive<u32> = 1..=6;
pub const DOWNLOAD_PAYLOAD_MB: RangeInclusive<u32> = 1..=32;
pub const UPLOAD_PAYLOAD_MB: RangeInclusive<u32> = 1..=8;

/// Knobs for a single run. Always within range once constructed through
/// [`MeasurementSettings::from_raw`] or [`MeasurementSettings::clamped`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementSettings {
    pub ping_samples: u32,
    pub phase_duration_ms: u32,
    pub download_concurrency: u32,
    pub upload_concurrency: u32,
    pub download_payload_mb: u32,
    pub upload_payload_mb: u32,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            ping_samples: 10,
            phase_duration_ms: 8_000,
            download_concurrency: 4,
            upload_concurrency: 3,
            download_payload_mb: 16,
            upload_payload_mb: 2,
        }
    }
}

/// Unvalidated settings as they arrive from a JSON file or the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    pub ping_samples: Option<f64>,
    pub phase_duration_ms: Option<f64>,
    pub download_concurrency: Option<f64>,
    pub upload_concurrency: Option<f64>,
    pub download_payload_mb: Option<f64>,
    pub upload_payload_mb: Option<f64>,
}

impl RawSettings {
    /// Field-wise merge; values present in `other` win.
    pub fn overlay(self, other: RawSettings) -> RawSettings {
        RawSettings {
            ping_samples: other.ping_samples.or(self.ping_samples),
            phase_duration_ms: other.phase_duration_ms.or(self.phase_duration_ms),
            download_concurrency: other.download_concurrency.or(self.download_concurrency),
            upload_concurrency: other.upload_concurrency.or(self.upload_concurrency),
            download_payload_mb: other.download_payload_mb.or(self.download_payload_mb),
            upload_payload_mb: other.upload_payload_mb.or(self.upload_payload_mb),
        }
    }
}

fn clamp_field(raw: Option<f64>, range: &RangeInclusive<u32>, default: u32) -> u32 {
    match raw {
        Some(v) if v.is_finite() => {
            let v = v.round().clamp(*range.start() as f64, *range.end() as f64);
            v as u32
        }
        _ => default,
    }
}

impl MeasurementSettings {
    /// Missing or non-finite fields take their default, everything else is
    /// rounded and clamped into range.
    pub fn from_raw(raw: &RawSettings) -> Self {
        let d = Self::default();
        Self {
            ping_samples: clamp_field(raw.ping_samples, &PING_SAMPLES, d.ping_samples),
            phase_duration_ms: clamp_field(
                raw.phase_duration_ms,
                &PHASE_DURATION_MS,
                d.phase_duration_ms,
            ),
            download_concurrency: clamp_field(
                raw.download_concurrency,
                &DOWNLOAD_CONCURRENCY,
                d.download_concurrency,
            ),
            upload_concurrency: clamp_field(
                raw.upload_concurrency,
                &UPLOAD_CONCURRENCY,
                d.upload_concurrency,
            ),
            download_payload_mb: clamp_field(
                raw.download_payload_mb,
                &DOWNLOAD_PAYLOAD_MB,
                d.download_payload_mb,
            ),
            upload_payload_mb: clamp_field(
                raw.upload_payload_mb,
                &UPLOAD_PAYLOAD_MB,
                d.upload_payload_mb,
            ),
        }
    }

    pub fn clamped(self) -> Self {
        fn c(v: u32, r: &RangeInclusive<u32>) -> u32 {
            v.clamp(*r.start(), *r.end())
        }
        Self {
            ping_samples: c(self.ping_samples, &PING_SAMPLES),
            phase_duration_ms: c(self.phase_duration_ms, &PHASE_DURATION_MS),
            download_concurrency: c(self.download_concurrency, &DOWNLOAD_CONCURRENCY),
            upload_concurrency: c(self.upload_concurrency, &UPLOAD_CONCURRENCY),
            download_payload_mb: c(self.download_payload_mb, &DOWNLOAD_PAYLOAD_MB),
            upload_payload_mb: c(self.upload_payload_mb, &UPLOAD_PAYLOAD_MB),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub base_url: String,
    pub run_id: String,
    pub user_agent: String,
    pub probe_timeout_ms: u64,
    pub settings: MeasurementSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    IdleLatency,
    Download,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Ping,
    Download,
    Upload,
    Done,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Error)
    }

    /// Legal edges of the run state machine.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (_, Idle) => true,
            (Idle, Ping) | (Ping, Download) | (Download, Upload) | (Upload, Done) => true,
            (Ping | Download | Upload, Error) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TestEvent {
    StateChanged {
        state: RunState,
    },
    LatencySample {
        phase: Phase,
        rtt_ms: Option<f64>,
        ok: bool,
    },
    ThroughputTick {
        phase: Phase,
        bytes_total: u64,
        mbps: f64,
    },
    Info {
        message: String,
    },
}

/// One timestamped observation. `at_ms` is measured from run start on the
/// monotonic clock; `value` is milliseconds or Mbps depending on the series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at_ms: f64,
    pub value: f64,
}

pub fn values(samples: &[Sample]) -> Vec<f64> {
    samples.iter().map(|s| s.value).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdleResult {
    pub latencies: Vec<Sample>,
    pub lost: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl TransferStats {
    pub fn merge(&mut self, other: TransferStats) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub throughput_mbps: f64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    pub series: Vec<Sample>,
    pub loaded_latencies: Vec<Sample>,
    pub loaded_loss: u64,
    #[serde(default)]
    pub transfers: TransferStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySpread {
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p90_ms: f64,
    pub max_ms: f64,
    pub stddev_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub idle_latency_median_ms: Option<f64>,
    pub idle_jitter_ms: Option<f64>,
    pub idle_loss_percent: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub loaded_download_median_ms: Option<f64>,
    pub loaded_upload_median_ms: Option<f64>,
    pub loaded_download_jitter_ms: Option<f64>,
    pub loaded_upload_jitter_ms: Option<f64>,
    pub loaded_download_loss_percent: Option<f64>,
    pub loaded_upload_loss_percent: Option<f64>,
    pub bufferbloat_ms: Option<f64>,
    #[serde(default)]
    pub idle_spread: Option<LatencySpread>,
    #[serde(default)]
    pub loaded_download_spread: Option<LatencySpread>,
    #[serde(default)]
    pub loaded_upload_spread: Option<LatencySpread>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub version: Option<String>,
    pub run_id: String,
    pub base_url: String,
    pub state: RunState,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: String,
    pub completed_at: String,
    pub settings: MeasurementSettings,
    pub idle: Option<IdleResult>,
    pub download: Option<PhaseResult>,
    pub upload: Option<PhaseResult>,
    pub metrics: Metrics,
}
