use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: String,
    pub capture: CaptureSpec,
    pub actuator: ActuatorSpec,
    pub width: u32,
    pub height: u32,
    #[serde(with = "humantime_serde")]
    pub frame_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    pub subset_size: u32,
    pub subset_step: u32,
    pub search_radius: u32,
    pub disparity_range: u32,
    pub roi_margin: u32,
    pub max_residual: f64,
    pub incremental: bool,
    pub sample_axis: Axis,
    pub persist_frames: bool,
    pub write_solutions: bool,
    pub calibration_frames: usize,
    #[serde(default)]
    pub camera_system: Option<PathBuf>,
    #[serde(default)]
    pub script: Option<PathBuf>,
    pub headless: bool,
    pub auto_arm: bool,
    pub auto_run_script: bool,
    pub stop_after_script: bool,
    #[serde(default)]
    pub max_frames: Option<u64>,
    pub seed: u64,
}

/// Where frame pairs come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureSpec {
    /// Rendered speckle pair coupled to the simulated stage.
    Synthetic,
    /// Replays `Img_<n>_0.*` / `Img_<n>_1.*` pairs from a directory.
    Directory(PathBuf),
    /// Splits each side-by-side image in a directory into left/right halves.
    SideBySide(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorSpec {
    /// Commands are logged, nothing is sent.
    DryRun,
    Sim,
    Device(PathBuf),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum Axis {
    X,
    Y,
    #[default]
    Z,
}

impl Axis {
    pub fn label(self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }
}

/// One tracked correlation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetRecord {
    pub index: usize,
    pub x: f64,
    pub y: f64,
    pub size: u32,
    pub displacement_x: f64,
    pub displacement_y: f64,
    pub displacement_z: f64,
}

impl SubsetRecord {
    pub fn new(index: usize, x: f64, y: f64, size: u32) -> Self {
        Self {
            index,
            x,
            y,
            size,
            displacement_x: 0.0,
            displacement_y: 0.0,
            displacement_z: 0.0,
        }
    }

    pub fn displacement(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.displacement_x,
            Axis::Y => self.displacement_y,
            Axis::Z => self.displacement_z,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    LiveView,
    Calibrating,
    Initializing,
    Running,
    Shutdown,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::LiveView => "live view",
            SessionState::Calibrating => "calibrating",
            SessionState::Initializing => "initializing",
            SessionState::Running => "running",
            SessionState::Shutdown => "shutdown",
        }
    }
}

/// Operator requests delivered to the session thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Arm,
    Disarm,
    Quit,
    Calibrate,
    NextCalibrationFrame,
    RunScript,
    JogForward,
    JogBackward,
    ToggleContinuousJog,
    Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged {
        state: SessionState,
    },
    LiveFrame {
        sequence: u64,
        width: u32,
        height: u32,
        mean_intensity: f64,
    },
    SubsetLayout {
        subsets: Vec<SubsetRecord>,
    },
    FrameCorrelated {
        index: u64,
        failed: bool,
        persisted: bool,
        cycle_ms: f64,
        subsets: Vec<SubsetRecord>,
    },
    ScriptProgress {
        pc: usize,
        len: usize,
        iterator_count: u32,
        loaded: bool,
    },
    SeriesDrawn {
        axis: Axis,
        // One (sample tick, value) series per subset.
        series: Vec<Vec<(f64, f64)>>,
    },
    CalibrationProgress {
        captured: usize,
        required: usize,
    },
    Telemetry(String),
    Info(InfoEvent),
    RunCompleted {
        summary: Box<RunSummary>,
    },
}

/// Structured info events emitted by the session and consumed by UI/CLI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InfoEvent {
    Message(String),
    ActuatorCommand(String),
    DeviceError(String),
    FrameWriteFailed { index: u64, error: String },
    CaptureEnded { reason: String },
    SnapshotSaved { path: PathBuf },
    CalibrationSaved { path: PathBuf, rms: f64 },
}

impl InfoEvent {
    /// Render a human-readable message for UI/CLI layers.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::Message(msg) => msg.clone(),
            InfoEvent::ActuatorCommand(cmd) => format!("Actuator <- {cmd}"),
            InfoEvent::DeviceError(err) => format!("Device error: {err}"),
            InfoEvent::FrameWriteFailed { index, error } => {
                format!("Frame {index} was not persisted: {error}")
            }
            InfoEvent::CaptureEnded { reason } => format!("Capture ended: {reason}"),
            InfoEvent::SnapshotSaved { path } => format!("Snapshot saved: {}", path.display()),
            InfoEvent::CalibrationSaved { path, rms } => {
                format!("Calibration complete (RMS {rms:.4}), saved {}", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisplacementStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub p25: Option<f64>,
    pub p75: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CycleStats {
    pub frames: u64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub session_id: String,
    #[serde(default)]
    pub started_utc: String,
    #[serde(default)]
    pub finished_utc: String,
    pub frames_correlated: u64,
    pub frames_failed: u64,
    pub frames_unpersisted: u64,
    pub success: bool,
    pub subsets: usize,
    pub displacement_x: DisplacementStats,
    pub displacement_y: DisplacementStats,
    pub displacement_z: DisplacementStats,
    pub cycle: CycleStats,
    #[serde(default)]
    pub script_completed: Option<bool>,
    #[serde(default)]
    pub samples: usize,
    #[serde(default)]
    pub capture_end: Option<String>,
    pub output_dir: PathBuf,
    #[serde(default)]
    pub series_csv: Option<PathBuf>,
}
