use crate::model::{Axis, RunSummary, SessionConfig, SessionState, SubsetRecord};
use ratatui::{
    style::Color,
    style::Style,
    text::{Line, Span},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptStatus {
    pub pc: usize,
    pub len: usize,
    pub iterator_count: u32,
    pub loaded: bool,
}

pub struct UiState {
    pub tab: usize,
    pub session: SessionState,
    pub info: String,
    pub axis: Axis,

    // Fixed for the lifetime of the session
    pub session_id: String,
    pub output_dir: String,
    pub capture_label: String,
    pub actuator_label: String,
    pub script_label: Option<String>,
    pub persist_frames: bool,

    pub live_sequence: u64,
    pub frame_size: (u32, u32),
    pub mean_intensity: f64,

    pub subsets: Vec<SubsetRecord>,
    pub subset_scroll: usize,

    pub frames_correlated: u64,
    pub frames_failed: u64,
    pub frames_unpersisted: u64,
    pub last_cycle_ms: f64,
    pub cycle_series: Vec<u64>,
    // (frame index, mean displacement along `axis`)
    pub mean_points: Vec<(f64, f64)>,

    pub script: Option<ScriptStatus>,
    pub calibration: Option<(usize, usize)>,
    pub continuous_jog: bool,
    pub drawn: Option<(Axis, Vec<Vec<(f64, f64)>>)>,
    pub messages: Vec<String>,
    pub telemetry: Vec<String>,
    pub last_summary: Option<RunSummary>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            session: SessionState::LiveView,
            info: String::new(),
            axis: Axis::default(),
            session_id: String::new(),
            output_dir: String::new(),
            capture_label: String::new(),
            actuator_label: String::new(),
            script_label: None,
            persist_frames: true,
            live_sequence: 0,
            frame_size: (0, 0),
            mean_intensity: 0.0,
            subsets: Vec::new(),
            subset_scroll: 0,
            frames_correlated: 0,
            frames_failed: 0,
            frames_unpersisted: 0,
            last_cycle_ms: 0.0,
            cycle_series: Vec::new(),
            mean_points: Vec::new(),
            script: None,
            calibration: None,
            continuous_jog: false,
            drawn: None,
            messages: Vec::new(),
            telemetry: Vec::new(),
            last_summary: None,
        }
    }
}

impl UiState {
    pub fn for_session(config: &SessionConfig, output_dir: &std::path::Path) -> Self {
        use crate::model::{ActuatorSpec, CaptureSpec};
        let capture_label = match &config.capture {
            CaptureSpec::Synthetic => format!("synthetic {}x{}", config.width, config.height),
            CaptureSpec::Directory(dir) => format!("replay {}", dir.display()),
            CaptureSpec::SideBySide(dir) => format!("side-by-side {}", dir.display()),
        };
        let actuator_label = match &config.actuator {
            ActuatorSpec::DryRun => "dry run".to_string(),
            ActuatorSpec::Sim => "simulated stage".to_string(),
            ActuatorSpec::Device(path) => path.display().to_string(),
        };
        Self {
            axis: config.sample_axis,
            session_id: config.session_id.clone(),
            output_dir: output_dir.display().to_string(),
            capture_label,
            actuator_label,
            script_label: config
                .script
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
            persist_frames: config.persist_frames,
            ..Default::default()
        }
    }

    pub fn push_series(series: &mut Vec<u64>, v: u64) {
        const MAX: usize = 120;
        series.push(v);
        if series.len() > MAX {
            let _ = series.drain(0..(series.len() - MAX));
        }
    }

    pub fn push_point(points: &mut Vec<(f64, f64)>, x: f64, y: f64) {
        const MAX: usize = 1200;
        points.push((x, y));
        if points.len() > MAX {
            let _ = points.drain(0..(points.len() - MAX));
        }
    }

    pub fn push_log(log: &mut Vec<String>, line: String) {
        const MAX: usize = 200;
        log.push(line);
        if log.len() > MAX {
            let _ = log.drain(0..(log.len() - MAX));
        }
    }

    /// Displacement of every tracked subset along the sampled axis.
    pub fn axis_values(&self) -> Vec<f64> {
        self.subsets.iter().map(|s| s.displacement(self.axis)).collect()
    }

    /// Clear per-arm traces when a new reference is taken.
    pub fn reset_traces(&mut self) {
        self.mean_points.clear();
        self.cycle_series.clear();
        self.subsets.clear();
        self.subset_scroll = 0;
        self.last_cycle_ms = 0.0;
    }
}

pub fn state_color(state: SessionState) -> Color {
    match state {
        SessionState::LiveView => Color::Cyan,
        SessionState::Calibrating | SessionState::Initializing => Color::Yellow,
        SessionState::Running => Color::Green,
        SessionState::Shutdown => Color::Gray,
    }
}

pub fn push_wrapped_status_kv(
    out: &mut Vec<Line<'static>>,
    label: &str,
    value: &str,
    status_area_width: u16,
) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    // Account for borders (2 chars on each side)
    let usable_width = status_area_width.saturating_sub(4).max(1);
    let label_text = format!("{label}:");
    let label_width = label_text.chars().count() as u16;

    let value_chars: Vec<char> = value.chars().collect();
    let mut remaining = value_chars.as_slice();
    let mut first = true;

    while !remaining.is_empty() {
        let line_width = if first {
            usable_width.saturating_sub(label_width + 1).max(1)
        } else {
            usable_width.saturating_sub(2).max(1)
        };

        let chars_to_take = (remaining.len() as u16).min(line_width) as usize;
        let (line_chars, rest) = remaining.split_at(chars_to_take);
        let line_text: String = line_chars.iter().collect();

        if first {
            out.push(Line::from(vec![
                Span::styled(label_text.clone(), Style::default().fg(Color::Gray)),
                Span::raw(" "),
                Span::raw(line_text),
            ]));
            first = false;
        } else {
            out.push(Line::from(vec![Span::raw("  "), Span::raw(line_text)]));
        }

        remaining = rest;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_buffers_keep_the_newest_entries() {
        let mut series = Vec::new();
        for v in 0..130 {
            UiState::push_series(&mut series, v);
        }
        assert_eq!(series.len(), 120);
        assert_eq!(series[0], 10);

        let mut log = Vec::new();
        for i in 0..205 {
            UiState::push_log(&mut log, i.to_string());
        }
        assert_eq!(log.len(), 200);
        assert_eq!(log.last().map(String::as_str), Some("204"));
    }

    #[test]
    fn long_status_values_wrap_under_the_label() {
        let mut out = Vec::new();
        push_wrapped_status_kv(&mut out, "Output", &"x".repeat(30), 20);
        assert!(out.len() > 1);
        push_wrapped_status_kv(&mut out, "Empty", "   ", 20);
        let before = out.len();
        push_wrapped_status_kv(&mut out, "Empty", "", 20);
        assert_eq!(out.len(), before);
    }
}
