use crate::model::{CycleStats, DisplacementStats};
use anyhow::Result;
use hdrhistogram::Histogram;
use std::time::Duration;

/// Compute (mean, median, 25th percentile, 75th percentile) from samples.
/// Non-finite samples are ignored; a single sample is its own statistics.
pub fn compute_metrics(samples: &[f64]) -> Option<(f64, f64, f64, f64)> {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let median = sorted[n / 2];
    let p25 = sorted[n / 4];
    let p75 = sorted[3 * n / 4];
    Some((mean, median, p25, p75))
}

pub fn displacement_stats(samples: &[f64]) -> DisplacementStats {
    match compute_metrics(samples) {
        Some((mean, median, p25, p75)) => DisplacementStats {
            mean: Some(mean),
            median: Some(median),
            p25: Some(p25),
            p75: Some(p75),
        },
        None => DisplacementStats::default(),
    }
}

/// Frame cycle times (committed frame to re-arm), microsecond resolution.
pub struct CycleTimer {
    hist: Histogram<u64>,
}

impl CycleTimer {
    pub fn new() -> Result<Self> {
        // 1 µs .. 10 min, 3 significant figures.
        let hist = Histogram::new_with_bounds(1, 600_000_000, 3)?;
        Ok(Self { hist })
    }

    pub fn record(&mut self, cycle: Duration) {
        let micros = u64::try_from(cycle.as_micros()).unwrap_or(u64::MAX).max(1);
        self.hist.saturating_record(micros);
    }

    pub fn stats(&self) -> CycleStats {
        let frames = self.hist.len();
        if frames == 0 {
            return CycleStats::default();
        }
        let ms = |us: u64| us as f64 / 1000.0;
        CycleStats {
            frames,
            p50_ms: Some(ms(self.hist.value_at_quantile(0.5))),
            p95_ms: Some(ms(self.hist.value_at_quantile(0.95))),
            max_ms: Some(ms(self.hist.max())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_need_one_finite_sample() {
        assert!(compute_metrics(&[]).is_none());
        assert!(compute_metrics(&[f64::NAN]).is_none());
        assert_eq!(compute_metrics(&[1.0, f64::NAN]), Some((1.0, 1.0, 1.0, 1.0)));
    }

    #[test]
    fn single_subset_still_has_displacement_stats() {
        let stats = displacement_stats(&[1.5]);
        assert_eq!(stats.mean, Some(1.5));
        assert_eq!(stats.median, Some(1.5));
        assert_eq!(stats.p25, Some(1.5));
        assert_eq!(stats.p75, Some(1.5));
    }

    #[test]
    fn metrics_pick_sorted_ranks() {
        let (mean, median, p25, p75) = compute_metrics(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_eq!(mean, 2.5);
        assert_eq!(median, 3.0);
        assert_eq!(p25, 2.0);
        assert_eq!(p75, 4.0);
    }

    #[test]
    fn cycle_timer_reports_percentiles_in_ms() {
        let mut timer = CycleTimer::new().unwrap();
        assert_eq!(timer.stats().frames, 0);
        for ms in 1..=100 {
            timer.record(Duration::from_millis(ms));
        }
        let stats = timer.stats();
        assert_eq!(stats.frames, 100);
        let p50 = stats.p50_ms.unwrap();
        assert!((49.9..=50.1).contains(&p50), "{p50}");
        assert!((99.9..=100.1).contains(&stats.max_ms.unwrap()));
    }
}
