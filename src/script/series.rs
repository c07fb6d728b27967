use crate::model::{Axis, SessionEvent, SubsetRecord};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

pub const SERIES_CSV: &str = "script_output.csv";
pub const SERIES_JSON: &str = "script_output.json";

/// Displacement samples taken by the script, one series per subset. The x
/// value is the sample counter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleSeries {
    pub axis: Axis,
    pub ticks: Vec<u64>,
    pub values: Vec<Vec<f64>>,
}

impl SampleSeries {
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            ..Default::default()
        }
    }

    pub fn push(&mut self, subsets: &[SubsetRecord]) {
        let tick = self.ticks.len() as u64;
        self.ticks.push(tick);
        if self.values.len() < subsets.len() {
            self.values.resize_with(subsets.len(), Vec::new);
        }
        for (series, subset) in self.values.iter_mut().zip(subsets) {
            series.push(subset.displacement(self.axis));
        }
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    /// (tick, value) points for each subset.
    pub fn points(&self) -> Vec<Vec<(f64, f64)>> {
        self.values
            .iter()
            .map(|series| {
                self.ticks
                    .iter()
                    .zip(series)
                    .map(|(&t, &v)| (t as f64, v))
                    .collect()
            })
            .collect()
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("sample");
        for i in 0..self.values.len() {
            let _ = write!(out, ",subset_{i}");
        }
        out.push('\n');
        for (row, tick) in self.ticks.iter().enumerate() {
            let _ = write!(out, "{tick}");
            for series in &self.values {
                match series.get(row) {
                    Some(v) => {
                        let _ = write!(out, ",{v:.6}");
                    }
                    None => out.push(','),
                }
            }
            out.push('\n');
        }
        out
    }
}

/// Receives the accumulated series on `DRAW`.
pub trait Plotter {
    fn draw(&mut self, series: &SampleSeries) -> Result<()>;
}

/// Writes the series next to the session outputs and pushes it to the UI.
pub struct SeriesPlotter {
    dir: PathBuf,
    events: mpsc::UnboundedSender<SessionEvent>,
    written: Option<PathBuf>,
}

impl SeriesPlotter {
    pub fn new(dir: &Path, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            events,
            written: None,
        }
    }

    /// CSV path of the last draw, if any.
    pub fn written(&self) -> Option<&Path> {
        self.written.as_deref()
    }
}

impl Plotter for SeriesPlotter {
    fn draw(&mut self, series: &SampleSeries) -> Result<()> {
        let csv = self.dir.join(SERIES_CSV);
        std::fs::write(&csv, series.to_csv()).with_context(|| format!("write {}", csv.display()))?;
        let json = self.dir.join(SERIES_JSON);
        std::fs::write(&json, serde_json::to_string_pretty(series)?)
            .with_context(|| format!("write {}", json.display()))?;
        tracing::info!(samples = series.len(), path = %csv.display(), "series drawn");
        let _ = self.events.send(SessionEvent::SeriesDrawn {
            axis: series.axis,
            series: series.points(),
        });
        self.written = Some(csv);
        Ok(())
    }
}
