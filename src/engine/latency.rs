use crate::engine::endpoint::SpeedEndpoint;
use crate::engine::ms_since;
use crate::model::{IdleResult, Phase, Sample, TestEvent};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

/// Pause after every idle probe.
pub const IDLE_PROBE_SPACING: Duration = Duration::from_millis(120);
/// Pause after every probe issued while a transfer phase is running.
pub const LOADED_PROBE_SPACING: Duration = Duration::from_millis(220);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("probe lost")]
pub struct Lost;

/// One round trip against the liveness endpoint. Anything other than a
/// complete, successful response within `timeout` is `Lost`.
pub async fn probe<E: SpeedEndpoint + ?Sized>(endpoint: &E, timeout: Duration) -> Result<f64, Lost> {
    let start = Instant::now();
    match tokio::time::timeout(timeout, endpoint.ping()).await {
        Ok(Ok(())) => Ok(start.elapsed().as_secs_f64() * 1000.0),
        Ok(Err(e)) => {
            debug!(error = %e, "latency probe failed");
            Err(Lost)
        }
        Err(_) => {
            debug!(timeout_ms = timeout.as_millis() as u64, "latency probe timed out");
            Err(Lost)
        }
    }
}

#[derive(Debug, Default)]
struct ProbeLog {
    samples: Vec<Sample>,
    lost: u64,
}

impl ProbeLog {
    async fn record(
        &mut self,
        outcome: Result<f64, Lost>,
        phase: Phase,
        origin: Instant,
        event_tx: &mpsc::Sender<TestEvent>,
    ) {
        let rtt_ms = match outcome {
            Ok(ms) => {
                self.samples.push(Sample {
                    at_ms: ms_since(origin, Instant::now()),
                    value: ms,
                });
                Some(ms)
            }
            Err(Lost) => {
                self.lost += 1;
                None
            }
        };
        event_tx
            .send(TestEvent::LatencySample {
                phase,
                rtt_ms,
                ok: rtt_ms.is_some(),
            })
            .await
            .ok();
    }
}

/// Sequential probes with no concurrent load.
pub async fn run_idle_probes<E: SpeedEndpoint + ?Sized>(
    endpoint: &E,
    samples: u32,
    timeout: Duration,
    origin: Instant,
    event_tx: &mpsc::Sender<TestEvent>,
) -> IdleResult {
    let mut log = ProbeLog::default();
    for _ in 0..samples {
        let outcome = probe(endpoint, timeout).await;
        log.record(outcome, Phase::IdleLatency, origin, event_tx).await;
        tokio::time::sleep(IDLE_PROBE_SPACING).await;
    }
    IdleResult {
        latencies: log.samples,
        lost: log.lost,
    }
}

/// Probes back to back until `deadline`, returning the successful
/// latencies and the number of lost probes.
pub async fn run_loaded_probes<E: SpeedEndpoint>(
    endpoint: Arc<E>,
    phase: Phase,
    deadline: Instant,
    timeout: Duration,
    origin: Instant,
    event_tx: mpsc::Sender<TestEvent>,
) -> (Vec<Sample>, u64) {
    let mut log = ProbeLog::default();
    while Instant::now() < deadline {
        let outcome = probe(endpoint.as_ref(), timeout).await;
        log.record(outcome, phase, origin, &event_tx).await;
        tokio::time::sleep(LOADED_PROBE_SPACING).await;
    }
    (log.samples, log.lost)
}
