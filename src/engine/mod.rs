mod endpoint;
pub mod latency;
pub mod sampler;
pub mod throughput;

pub use endpoint::{EndpointError, HttpEndpoint, SpeedEndpoint};

use crate::model::{
    IdleResult, MeasurementSettings, PhaseResult, Report, RunConfig, RunState, TestEvent,
};
use crate::stats;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use throughput::PhaseFailure;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

pub(crate) fn ms_since(origin: Instant, at: Instant) -> f64 {
    at.saturating_duration_since(origin).as_secs_f64() * 1000.0
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// Everything gathered so far in the current run.
#[derive(Default)]
struct RunProgress {
    idle: Option<IdleResult>,
    download: Option<PhaseResult>,
    upload: Option<PhaseResult>,
}

/// Drives one run through `idle → ping → download → upload → done`,
/// falling into `error` if a phase cannot complete.
pub struct TestEngine<E: SpeedEndpoint> {
    cfg: RunConfig,
    endpoint: Arc<E>,
    state: RunState,
    event_tx: mpsc::Sender<TestEvent>,
}

impl<E: SpeedEndpoint> TestEngine<E> {
    pub fn new(cfg: RunConfig, endpoint: E, event_tx: mpsc::Sender<TestEvent>) -> Self {
        Self {
            cfg,
            endpoint: Arc::new(endpoint),
            state: RunState::Idle,
            event_tx,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    async fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.event_tx
            .send(TestEvent::StateChanged { state: next })
            .await
            .ok();
    }

    /// Runs all phases and always returns a report. A failed run carries the
    /// error message and whatever phases completed before the failure.
    pub async fn run(&mut self) -> Report {
        self.transition(RunState::Idle).await;

        let settings = self.cfg.settings.clamped();
        self.event_tx
            .send(TestEvent::Info {
                message: format!("Measuring against {}", self.cfg.base_url),
            })
            .await
            .ok();
        let started_at = now_rfc3339();
        let origin = Instant::now();
        let mut progress = RunProgress::default();

        let error = match self.run_phases(&settings, origin, &mut progress).await {
            Ok(()) => {
                self.transition(RunState::Done).await;
                None
            }
            Err(e) => {
                let message = format!("{e:#}");
                warn!(error = %message, "speed test aborted");
                self.transition(RunState::Error).await;
                Some(message)
            }
        };

        let metrics = stats::summarize(
            progress.idle.as_ref(),
            progress.download.as_ref(),
            progress.upload.as_ref(),
        );

        Report {
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            run_id: self.cfg.run_id.clone(),
            base_url: self.cfg.base_url.clone(),
            state: self.state,
            error,
            started_at,
            completed_at: now_rfc3339(),
            settings,
            idle: progress.idle,
            download: progress.download,
            upload: progress.upload,
            metrics,
        }
    }

    async fn run_phases(
        &mut self,
        settings: &MeasurementSettings,
        origin: Instant,
        progress: &mut RunProgress,
    ) -> Result<()> {
        let probe_timeout = Duration::from_millis(self.cfg.probe_timeout_ms);

        self.transition(RunState::Ping).await;
        let idle = latency::run_idle_probes(
            self.endpoint.as_ref(),
            settings.ping_samples,
            probe_timeout,
            origin,
            &self.event_tx,
        )
        .await;
        info!(ok = idle.latencies.len(), lost = idle.lost, "idle latency measured");
        progress.idle = Some(idle);

        self.transition(RunState::Download).await;
        let download = throughput::run_download_with_loaded_latency(
            &self.endpoint,
            settings,
            probe_timeout,
            origin,
            &self.event_tx,
        )
        .await;
        keep_phase(download, &mut progress.download).context("download phase failed")?;

        self.transition(RunState::Upload).await;
        let upload = throughput::run_upload_with_loaded_latency(
            &self.endpoint,
            settings,
            probe_timeout,
            origin,
            &self.event_tx,
        )
        .await;
        keep_phase(upload, &mut progress.upload).context("upload phase failed")?;

        Ok(())
    }
}

/// Stores the phase result, or the partial one of a failed phase, in `slot`.
fn keep_phase(
    outcome: Result<PhaseResult, PhaseFailure>,
    slot: &mut Option<PhaseResult>,
) -> Result<()> {
    match outcome {
        Ok(result) => {
            *slot = Some(result);
            Ok(())
        }
        Err(PhaseFailure { error, partial }) => {
            *slot = Some(partial);
            Err(error)
        }
    }
}
