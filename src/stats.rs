use crate::model::{values, IdleResult, LatencySpread, Metrics, PhaseResult};
use hdrhistogram::Histogram;

#[derive(Debug, Default, Clone)]
pub struct OnlineStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / (self.n as f64);
        let delta2 = x - self.mean;
        self.m2 += delta * delta2;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n > 0).then_some(self.mean)
    }

    pub fn stddev(&self) -> Option<f64> {
        if self.n < 2 {
            None
        } else {
            Some((self.m2 / ((self.n - 1) as f64)).sqrt())
        }
    }
}

/// Lower median: element `n/2` of the sorted input.
pub fn median(xs: &[f64]) -> Option<f64> {
    if xs.is_empty() {
        return None;
    }
    let mut sorted = xs.to_vec();
    sorted.sort_by(f64::total_cmp);
    Some(sorted[sorted.len() / 2])
}

/// Median absolute difference between consecutive samples.
pub fn jitter(xs: &[f64]) -> Option<f64> {
    if xs.len() < 2 {
        return None;
    }
    let deltas: Vec<f64> = xs.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    median(&deltas)
}

pub fn loss_percent(lost: u64, ok: u64) -> Option<f64> {
    let total = lost + ok;
    if total == 0 {
        return None;
    }
    Some((lost as f64) / (total as f64) * 100.0)
}

/// Worst loaded median minus idle median, floored at zero. A missing loaded
/// median counts as 0 so a single failed phase does not hide the other one.
/// A worst loaded median of exactly 0 carries no signal and yields `None`.
pub fn bufferbloat_ms(
    idle_median: Option<f64>,
    loaded_download_median: Option<f64>,
    loaded_upload_median: Option<f64>,
) -> Option<f64> {
    let idle = idle_median?;
    if loaded_download_median.is_none() && loaded_upload_median.is_none() {
        return None;
    }
    let worst = loaded_download_median
        .unwrap_or(0.0)
        .max(loaded_upload_median.unwrap_or(0.0));
    if worst == 0.0 {
        return None;
    }
    Some((worst - idle).max(0.0))
}

pub fn latency_spread(samples_ms: &[f64]) -> Option<LatencySpread> {
    if samples_ms.is_empty() {
        return None;
    }

    // HDRHistogram wants integer values; store microseconds to preserve precision.
    let mut h = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).ok()?;
    let mut online = OnlineStats::default();
    for &ms in samples_ms {
        let us = (ms * 1000.0).round().clamp(1.0, 60_000_000.0) as u64;
        let _ = h.record(us);
        online.push(ms);
    }

    Some(LatencySpread {
        min_ms: samples_ms.iter().copied().fold(f64::INFINITY, f64::min),
        mean_ms: online.mean()?,
        p90_ms: (h.value_at_quantile(0.90) as f64) / 1000.0,
        max_ms: samples_ms.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        stddev_ms: online.stddev(),
    })
}

pub fn summarize(
    idle: Option<&IdleResult>,
    download: Option<&PhaseResult>,
    upload: Option<&PhaseResult>,
) -> Metrics {
    let idle_ms = idle.map(|i| values(&i.latencies)).unwrap_or_default();
    let dl_ms = download
        .map(|p| values(&p.loaded_latencies))
        .unwrap_or_default();
    let ul_ms = upload
        .map(|p| values(&p.loaded_latencies))
        .unwrap_or_default();

    let idle_latency_median_ms = median(&idle_ms);
    let loaded_download_median_ms = median(&dl_ms);
    let loaded_upload_median_ms = median(&ul_ms);

    Metrics {
        idle_latency_median_ms,
        idle_jitter_ms: jitter(&idle_ms),
        idle_loss_percent: idle.and_then(|i| loss_percent(i.lost, i.latencies.len() as u64)),
        download_mbps: download.map(|p| p.throughput_mbps),
        upload_mbps: upload.map(|p| p.throughput_mbps),
        loaded_download_median_ms,
        loaded_upload_median_ms,
        loaded_download_jitter_ms: jitter(&dl_ms),
        loaded_upload_jitter_ms: jitter(&ul_ms),
        loaded_download_loss_percent: download
            .and_then(|p| loss_percent(p.loaded_loss, p.loaded_latencies.len() as u64)),
        loaded_upload_loss_percent: upload
            .and_then(|p| loss_percent(p.loaded_loss, p.loaded_latencies.len() as u64)),
        bufferbloat_ms: bufferbloat_ms(
            idle_latency_median_ms,
            loaded_download_median_ms,
            loaded_upload_median_ms,
        ),
        idle_spread: latency_spread(&idle_ms),
        loaded_download_spread: latency_spread(&dl_ms),
        loaded_upload_spread: latency_spread(&ul_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Sample, TransferStats};
    use proptest::prelude::*;

    fn samples(xs: &[f64]) -> Vec<Sample> {
        xs.iter()
            .enumerate()
            .map(|(i, &value)| Sample {
                at_ms: i as f64 * 100.0,
                value,
            })
            .collect()
    }

    fn phase(loaded: &[f64], lost: u64, mbps: f64) -> PhaseResult {
        PhaseResult {
            throughput_mbps: mbps,
            total_bytes: 0,
            duration_ms: 3_000,
            series: Vec::new(),
            loaded_latencies: samples(loaded),
            loaded_loss: lost,
            transfers: TransferStats::default(),
        }
    }

    #[test]
    fn median_picks_lower_middle() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[7.0]), Some(7.0));
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        // even count: floor(n/2) of the sorted sequence
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(3.0));
    }

    #[test]
    fn jitter_of_short_sequences() {
        assert_eq!(jitter(&[]), None);
        assert_eq!(jitter(&[10.0]), None);
        assert_eq!(jitter(&[10.0, 14.0]), Some(4.0));
        // deltas 5, 1, 8 -> sorted 1, 5, 8 -> 5
        assert_eq!(jitter(&[10.0, 15.0, 14.0, 22.0]), Some(5.0));
    }

    #[test]
    fn loss_percent_edges() {
        assert_eq!(loss_percent(0, 0), None);
        assert_eq!(loss_percent(0, 10), Some(0.0));
        assert_eq!(loss_percent(4, 0), Some(100.0));
        assert_eq!(loss_percent(1, 3), Some(25.0));
    }

    #[test]
    fn bufferbloat_needs_idle_and_a_loaded_median() {
        assert_eq!(bufferbloat_ms(None, Some(50.0), Some(60.0)), None);
        assert_eq!(bufferbloat_ms(Some(20.0), None, None), None);
        assert_eq!(bufferbloat_ms(Some(20.0), Some(50.0), None), Some(30.0));
        assert_eq!(bufferbloat_ms(Some(20.0), Some(50.0), Some(80.0)), Some(60.0));
        assert_eq!(bufferbloat_ms(Some(20.0), Some(10.0), Some(15.0)), Some(0.0));
    }

    #[test]
    fn bufferbloat_without_loaded_signal_is_none() {
        assert_eq!(bufferbloat_ms(Some(5.0), Some(0.0), None), None);
        assert_eq!(bufferbloat_ms(Some(5.0), Some(0.0), Some(0.0)), None);
        assert_eq!(bufferbloat_ms(Some(0.0), Some(0.0), Some(3.0)), Some(3.0));
    }

    #[test]
    fn spread_of_known_values() {
        assert!(latency_spread(&[]).is_none());
        let s = latency_spread(&[10.0, 20.0, 30.0, 40.0]).unwrap();
        assert_eq!(s.min_ms, 10.0);
        assert_eq!(s.max_ms, 40.0);
        assert!((s.mean_ms - 25.0).abs() < 1e-9);
        assert!((s.p90_ms - 40.0).abs() < 0.1);
        assert!(s.stddev_ms.unwrap() > 0.0);

        let single = latency_spread(&[5.0]).unwrap();
        assert_eq!(single.stddev_ms, None);
    }

    #[test]
    fn summarize_full_run() {
        let idle = IdleResult {
            latencies: samples(&[10.0, 12.0, 11.0, 13.0]),
            lost: 0,
        };
        let dl = phase(&[40.0, 42.0, 44.0], 1, 95.5);
        let ul = phase(&[30.0, 31.0], 0, 20.0);

        let m = summarize(Some(&idle), Some(&dl), Some(&ul));
        assert_eq!(m.idle_latency_median_ms, Some(12.0));
        assert_eq!(m.idle_loss_percent, Some(0.0));
        assert_eq!(m.download_mbps, Some(95.5));
        assert_eq!(m.upload_mbps, Some(20.0));
        assert_eq!(m.loaded_download_median_ms, Some(42.0));
        assert_eq!(m.loaded_upload_median_ms, Some(31.0));
        assert_eq!(m.loaded_download_loss_percent, Some(25.0));
        assert_eq!(m.bufferbloat_ms, Some(30.0));
        assert!(m.idle_spread.is_some());
    }

    #[test]
    fn summarize_without_any_phase() {
        let m = summarize(None, None, None);
        assert_eq!(m, Metrics::default());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn median_within_bounds(xs in proptest::collection::vec(-1e6f64..1e6, 1..64)) {
            let m = median(&xs).unwrap();
            let lo = xs.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(m >= lo && m <= hi);
        }

        #[test]
        fn jitter_is_non_negative(xs in proptest::collection::vec(0.0f64..5_000.0, 0..64)) {
            match jitter(&xs) {
                Some(j) => prop_assert!(j >= 0.0),
                None => prop_assert!(xs.len() < 2),
            }
        }

        #[test]
        fn loss_percent_in_range(lost in 0u64..10_000, ok in 0u64..10_000) {
            match loss_percent(lost, ok) {
                Some(p) => prop_assert!((0.0..=100.0).contains(&p)),
                None => prop_assert_eq!(lost + ok, 0),
            }
        }

        #[test]
        fn bufferbloat_never_negative(
            idle in 0.0f64..1_000.0,
            dl in proptest::option::of(0.0f64..1_000.0),
            ul in proptest::option::of(0.0f64..1_000.0),
        ) {
            if let Some(b) = bufferbloat_ms(Some(idle), dl, ul) {
                prop_assert!(b >= 0.0);
            }
        }
    }
}
