use crate::engine::ms_since;
use crate::engine::throughput::{mbps, ByteCounter};
use crate::model::{Phase, Sample, TestEvent};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Periodic throughput sampler over a shared [`ByteCounter`].
///
/// Each tick emits the rate over the bytes added since the previous tick
/// (the first tick measures from `start`, not from zero). With `stop_at`
/// set, the sampler ends by itself after the last tick that fits in the
/// window, so a window of `D` with interval `I` yields `floor(D / I)` samples.
pub struct Sampler {
    shutdown: CancellationToken,
    task: Option<JoinHandle<Vec<Sample>>>,
    series: Vec<Sample>,
}

impl Sampler {
    pub fn start(
        phase: Phase,
        interval: Duration,
        counter: ByteCounter,
        origin: Instant,
        stop_at: Option<Instant>,
        event_tx: mpsc::Sender<TestEvent>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let cancelled = shutdown.clone();

        let task = tokio::spawn(async move {
            let mut series = Vec::new();
            let mut last_t = Instant::now();
            let mut last_bytes = counter.get();

            let first = last_t + interval;
            if stop_at.is_some_and(|s| first > s) {
                return series;
            }
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                let scheduled = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    t = ticker.tick() => t,
                };

                let now = Instant::now();
                let bytes_total = counter.get();
                let rate = mbps(
                    bytes_total.saturating_sub(last_bytes),
                    now.saturating_duration_since(last_t),
                );
                series.push(Sample {
                    at_ms: ms_since(origin, now),
                    value: rate,
                });
                event_tx
                    .send(TestEvent::ThroughputTick {
                        phase,
                        bytes_total,
                        mbps: rate,
                    })
                    .await
                    .ok();
                last_t = now;
                last_bytes = bytes_total;

                if stop_at.is_some_and(|s| scheduled + interval > s) {
                    break;
                }
            }
            series
        });

        Self {
            shutdown,
            task: Some(task),
            series: Vec::new(),
        }
    }

    /// Waits for the sampler to run out its window and returns the series.
    pub async fn finish(&mut self) -> Result<Vec<Sample>> {
        if let Some(task) = self.task.take() {
            self.series = task.await.context("throughput sampler task failed")?;
        }
        Ok(self.series.clone())
    }

    /// Stops sampling now. Safe to call repeatedly or after [`Sampler::finish`].
    pub async fn stop(&mut self) -> Result<Vec<Sample>> {
        self.shutdown.cancel();
        self.finish().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> mpsc::Sender<TestEvent> {
        mpsc::channel(1).0
    }

    #[tokio::test(start_paused = true)]
    async fn rates_follow_counter_steps() {
        let counter = ByteCounter::new();
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Download,
            Duration::from_millis(1_000),
            counter.clone(),
            origin,
            Some(origin + Duration::from_millis(3_500)),
            sink(),
        );

        tokio::time::sleep_until(origin + Duration::from_millis(500)).await;
        counter.add(125_000);
        tokio::time::sleep_until(origin + Duration::from_millis(1_500)).await;
        counter.add(250_000);
        tokio::time::sleep_until(origin + Duration::from_millis(2_500)).await;
        counter.add(62_500);

        let series = sampler.finish().await.unwrap();
        assert_eq!(series.len(), 3);
        let expected = [1.0, 2.0, 0.5];
        for (i, (s, want)) in series.iter().zip(expected).enumerate() {
            assert!((s.value - want).abs() < 1e-9, "sample {i}: {} != {want}", s.value);
            assert!((s.at_ms - (i as f64 + 1.0) * 1_000.0).abs() < 1e-6);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_ignores_bytes_before_start() {
        let counter = ByteCounter::new();
        counter.add(10_000_000);
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Upload,
            Duration::from_millis(1_000),
            counter.clone(),
            origin,
            Some(origin + Duration::from_millis(1_000)),
            sink(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        counter.add(125_000);

        let series = sampler.finish().await.unwrap();
        assert_eq!(series.len(), 1);
        assert!((series[0].value - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn window_shorter_than_interval_yields_nothing() {
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Download,
            Duration::from_millis(1_000),
            ByteCounter::new(),
            origin,
            Some(origin + Duration::from_millis(900)),
            sink(),
        );
        assert!(sampler.finish().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let counter = ByteCounter::new();
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Download,
            Duration::from_millis(1_000),
            counter.clone(),
            origin,
            Some(origin + Duration::from_millis(2_000)),
            sink(),
        );
        counter.add(250_000);
        let finished = sampler.finish().await.unwrap();
        assert_eq!(finished.len(), 2);

        let stopped = sampler.stop().await.unwrap();
        let again = sampler.stop().await.unwrap();
        assert_eq!(finished, stopped);
        assert_eq!(stopped, again);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_deadline_ends_sampling() {
        let counter = ByteCounter::new();
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Download,
            Duration::from_millis(250),
            counter.clone(),
            origin,
            None,
            sink(),
        );
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let series = sampler.stop().await.unwrap();
        assert_eq!(series.len(), 4);
        assert!(series.iter().all(|s| s.value == 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_are_reported_as_events() {
        let counter = ByteCounter::new();
        let (tx, mut rx) = mpsc::channel(8);
        let origin = Instant::now();
        let mut sampler = Sampler::start(
            Phase::Upload,
            Duration::from_millis(1_000),
            counter.clone(),
            origin,
            Some(origin + Duration::from_millis(2_000)),
            tx,
        );
        counter.add(1_000);
        sampler.finish().await.unwrap();

        let mut ticks = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let TestEvent::ThroughputTick { bytes_total, .. } = ev {
                ticks.push(bytes_total);
            }
        }
        assert_eq!(ticks, vec![1_000, 1_000]);
    }
}
