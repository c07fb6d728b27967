//! Text summary builder for headless output.

use crate::model::{DisplacementStats, RunSummary};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn fmt_opt(v: Option<f64>, precision: usize) -> String {
    v.map_or_else(|| "-".into(), |v| format!("{v:.precision$}"))
}

fn stats_line(label: &str, s: &DisplacementStats) -> String {
    format!(
        "{label}: avg {} med {} p25 {} p75 {}",
        fmt_opt(s.mean, 4),
        fmt_opt(s.median, 4),
        fmt_opt(s.p25, 4),
        fmt_opt(s.p75, 4)
    )
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = vec![format!("Session: {}", summary.session_id)];
    if !summary.started_utc.is_empty() {
        lines.push(format!(
            "Started: {}  Finished: {}",
            summary.started_utc, summary.finished_utc
        ));
    }
    lines.push(format!(
        "Frames: {} correlated, {} failed, {} not persisted ({})",
        summary.frames_correlated,
        summary.frames_failed,
        summary.frames_unpersisted,
        if summary.success { "ok" } else { "FAILED" }
    ));
    lines.push(format!("Subsets: {}", summary.subsets));
    lines.push(stats_line("Displacement x", &summary.displacement_x));
    lines.push(stats_line("Displacement y", &summary.displacement_y));
    lines.push(stats_line("Displacement z", &summary.displacement_z));
    if summary.cycle.frames > 0 {
        lines.push(format!(
            "Cycle time: p50 {} ms p95 {} ms max {} ms",
            fmt_opt(summary.cycle.p50_ms, 1),
            fmt_opt(summary.cycle.p95_ms, 1),
            fmt_opt(summary.cycle.max_ms, 1)
        ));
    }
    match summary.script_completed {
        Some(true) => lines.push(format!("Script: completed ({} samples)", summary.samples)),
        Some(false) => lines.push(format!("Script: interrupted ({} samples)", summary.samples)),
        None => {}
    }
    if let Some(reason) = summary.capture_end.as_deref() {
        lines.push(format!("Capture: {reason}"));
    }
    lines.push(format!("Output: {}", summary.output_dir.display()));
    if let Some(csv) = summary.series_csv.as_deref() {
        lines.push(format!("Series: {}", csv.display()));
    }
    TextSummary { lines }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CycleStats;
    use std::path::PathBuf;

    fn summary() -> RunSummary {
        RunSummary {
            session_id: "s1".into(),
            started_utc: String::new(),
            finished_utc: String::new(),
            frames_correlated: 10,
            frames_failed: 1,
            frames_unpersisted: 0,
            success: false,
            subsets: 6,
            displacement_x: DisplacementStats {
                mean: Some(1.0),
                median: Some(1.0),
                p25: Some(0.5),
                p75: Some(1.5),
            },
            displacement_y: DisplacementStats::default(),
            displacement_z: DisplacementStats::default(),
            cycle: CycleStats::default(),
            script_completed: Some(true),
            samples: 12,
            capture_end: None,
            output_dir: PathBuf::from("/tmp/s1"),
            series_csv: None,
        }
    }

    #[test]
    fn summary_flags_failed_frames_and_missing_stats() {
        let lines = build_text_summary(&summary()).lines;
        assert_eq!(lines[1], "Frames: 10 correlated, 1 failed, 0 not persisted (FAILED)");
        assert_eq!(
            lines[3],
            "Displacement x: avg 1.0000 med 1.0000 p25 0.5000 p75 1.5000"
        );
        assert_eq!(lines[4], "Displacement y: avg - med - p25 - p75 -");
        assert!(lines.contains(&"Script: completed (12 samples)".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Cycle time")));
    }
}
