use crate::engine::endpoint::{EndpointError, SpeedEndpoint};
use crate::engine::latency::run_loaded_probes;
use crate::engine::sampler::Sampler;
use crate::model::{MeasurementSettings, Phase, PhaseResult, TestEvent, TransferStats};
use anyhow::{Context, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::future::Future;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

pub const MIB: usize = 1024 * 1024;

/// Lower bound on a single transfer's timeout, even near the deadline.
pub const MIN_TRANSFER_TIMEOUT: Duration = Duration::from_millis(1_500);
/// Pause after a failed transfer so an endpoint answering 429 instantly is
/// not hammered in a tight loop.
pub const FAILED_TRANSFER_BACKOFF: Duration = Duration::from_millis(100);
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

const PAYLOAD_SEED: u64 = 0x6d2b_79f5;

/// Byte total shared by every worker of a phase.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` and returns the new total.
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (bytes as f64) * 8.0 / secs / 1_000_000.0
}

/// Deterministic, incompressible upload body of `mb` MiB.
pub fn upload_payload(mb: u32) -> Bytes {
    let mut buf = vec![0u8; mb as usize * MIB];
    StdRng::seed_from_u64(PAYLOAD_SEED).fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// What a worker hands to each transfer attempt.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub counter: ByteCounter,
    pub deadline: Instant,
    pub worker: usize,
}

/// Runs `concurrency` workers, each repeating `transfer_once` until
/// `deadline`. Returns once every worker has observed the deadline.
pub async fn run_workers<F, Fut>(
    concurrency: usize,
    deadline: Instant,
    counter: &ByteCounter,
    transfer_once: F,
) -> Result<TransferStats>
where
    F: Fn(TransferContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EndpointError>> + Send + 'static,
{
    let transfer_once = Arc::new(transfer_once);
    let mut handles = Vec::with_capacity(concurrency);

    for worker in 0..concurrency {
        let transfer_once = transfer_once.clone();
        let ctx = TransferContext {
            counter: counter.clone(),
            deadline,
            worker,
        };

        handles.push(tokio::spawn(async move {
            let mut stats = TransferStats::default();
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let budget = deadline
                    .saturating_duration_since(now)
                    .max(MIN_TRANSFER_TIMEOUT);

                match tokio::time::timeout(budget, (*transfer_once)(ctx.clone())).await {
                    Ok(Ok(())) => stats.completed += 1,
                    Ok(Err(e)) => {
                        stats.failed += 1;
                        debug!(worker = ctx.worker, error = %e, "transfer discarded");
                        let resume = (Instant::now() + FAILED_TRANSFER_BACKOFF).min(deadline);
                        tokio::time::sleep_until(resume).await;
                    }
                    Err(_) => {
                        stats.timed_out += 1;
                        debug!(
                            worker = ctx.worker,
                            budget_ms = budget.as_millis() as u64,
                            "transfer timed out"
                        );
                    }
                }
            }
            stats
        }));
    }

    let mut total = TransferStats::default();
    let mut crashed = None;
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(stats) => total.merge(stats),
            Err(e) => {
                crashed.get_or_insert(e);
            }
        }
    }
    if let Some(e) = crashed {
        return Err(anyhow::Error::new(e).context("transfer worker crashed"));
    }
    Ok(total)
}

/// A transfer phase that could not complete, with what it measured first.
#[derive(Debug)]
pub struct PhaseFailure {
    pub error: anyhow::Error,
    pub partial: PhaseResult,
}

#[allow(clippy::too_many_arguments)]
async fn run_phase<E, F, Fut>(
    phase: Phase,
    endpoint: &Arc<E>,
    concurrency: u32,
    duration: Duration,
    probe_timeout: Duration,
    origin: Instant,
    event_tx: &mpsc::Sender<TestEvent>,
    transfer_once: F,
) -> Result<PhaseResult, PhaseFailure>
where
    E: SpeedEndpoint,
    F: Fn(TransferContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EndpointError>> + Send + 'static,
{
    let counter = ByteCounter::new();
    let deadline = Instant::now() + duration;

    let mut sampler = Sampler::start(
        phase,
        SAMPLE_INTERVAL,
        counter.clone(),
        origin,
        Some(deadline),
        event_tx.clone(),
    );
    let prober = tokio::spawn(run_loaded_probes(
        endpoint.clone(),
        phase,
        deadline,
        probe_timeout,
        origin,
        event_tx.clone(),
    ));
    let workers = run_workers(concurrency as usize, deadline, &counter, transfer_once);

    let (transfers, loaded) = tokio::join!(workers, prober);
    let series = match &transfers {
        Ok(_) => sampler.finish().await,
        Err(_) => sampler.stop().await,
    };

    let mut failure = None;
    let transfers = transfers.unwrap_or_else(|e| {
        failure.get_or_insert(e);
        TransferStats::default()
    });
    let (loaded_latencies, loaded_loss) = loaded
        .context("loaded latency task ended unexpectedly")
        .unwrap_or_else(|e| {
            failure.get_or_insert(e);
            (Vec::new(), 0)
        });
    let series = series.unwrap_or_else(|e| {
        failure.get_or_insert(e);
        Vec::new()
    });

    let total_bytes = counter.get();
    let throughput_mbps = mbps(total_bytes, duration);
    info!(
        ?phase,
        total_bytes,
        throughput_mbps,
        completed = transfers.completed,
        failed = transfers.failed,
        timed_out = transfers.timed_out,
        aborted = failure.is_some(),
        "transfer phase finished"
    );

    let result = PhaseResult {
        throughput_mbps,
        total_bytes,
        duration_ms: duration.as_millis() as u64,
        series,
        loaded_latencies,
        loaded_loss,
        transfers,
    };
    match failure {
        Some(error) => Err(PhaseFailure {
            error,
            partial: result,
        }),
        None => Ok(result),
    }
}

pub async fn run_download_with_loaded_latency<E: SpeedEndpoint>(
    endpoint: &Arc<E>,
    settings: &MeasurementSettings,
    probe_timeout: Duration,
    origin: Instant,
    event_tx: &mpsc::Sender<TestEvent>,
) -> Result<PhaseResult, PhaseFailure> {
    let ep = endpoint.clone();
    let mb = settings.download_payload_mb;

    run_phase(
        Phase::Download,
        endpoint,
        settings.download_concurrency,
        Duration::from_millis(settings.phase_duration_ms as u64),
        probe_timeout,
        origin,
        event_tx,
        move |ctx: TransferContext| {
            let ep = ep.clone();
            async move {
                ep.download(mb, &ctx.counter, ctx.deadline).await?;
                Ok::<(), EndpointError>(())
            }
        },
    )
    .await
}

pub async fn run_upload_with_loaded_latency<E: SpeedEndpoint>(
    endpoint: &Arc<E>,
    settings: &MeasurementSettings,
    probe_timeout: Duration,
    origin: Instant,
    event_tx: &mpsc::Sender<TestEvent>,
) -> Result<PhaseResult, PhaseFailure> {
    let ep = endpoint.clone();
    let payload = upload_payload(settings.upload_payload_mb);

    run_phase(
        Phase::Upload,
        endpoint,
        settings.upload_concurrency,
        Duration::from_millis(settings.phase_duration_ms as u64),
        probe_timeout,
        origin,
        event_tx,
        move |ctx: TransferContext| {
            let ep = ep.clone();
            let payload = payload.clone();
            async move {
                // Only a completed post is credited.
                let received = ep.upload(payload).await?;
                ctx.counter.add(received);
                Ok::<(), EndpointError>(())
            }
        },
    )
    .await
}
