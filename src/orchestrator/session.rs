//! Session state machine.
//!
//! Runs on a dedicated blocking thread. Each pass drains operator commands
//! and then ticks the current state:
//!
//! - `LiveView` pulls the newest frame pair straight from the camera.
//! - `Calibrating` shows live frames and polls the calibration worker.
//! - `Initializing` is transient: reference capture, subset layout, pipeline
//!   start.
//! - `Running` waits for write-complete, correlates, ticks the script and
//!   re-arms persistence.

use super::calibration::CalibrationRun;
use crate::devices::calibration::{CameraSystem, Calibrator};
use crate::devices::capture::{CaptureError, CaptureSource, FramePair};
use crate::devices::dic::Correlator;
use crate::devices::serial::{Actuator, TelemetryLines, STEP_BACKWARD, STEP_FORWARD};
use crate::engine::acquisition::StopReason;
use crate::engine::correlation::CorrelationStep;
use crate::engine::exchange::CommittedFrame;
use crate::engine::persistence::{pair_paths, write_jpeg_pair, FrameSink};
use crate::engine::semaphore::WaitError;
use crate::engine::Pipeline;
use crate::metrics::{displacement_stats, CycleTimer};
use crate::model::{
    InfoEvent, OperatorCommand, RunSummary, SessionConfig, SessionEvent, SessionState,
    SubsetRecord,
};
use crate::script::{self, Command, Plotter, ScriptIo, ScriptRun, SeriesPlotter, Step};
use crate::storage::{self, SessionPaths};
use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::{error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Builds a fresh correlator for every arm; the argument is where per-frame
/// solutions go, if anywhere.
pub type CorrelatorFactory = Box<dyn FnMut(Option<&Path>) -> Box<dyn Correlator> + Send>;

/// Explicit context handed to the session instead of globals.
#[derive(Clone)]
pub struct SessionContext {
    pub config: SessionConfig,
    pub paths: SessionPaths,
    pub events: UnboundedSender<SessionEvent>,
}

pub struct Collaborators {
    pub capture: Box<dyn CaptureSource>,
    pub actuator: Box<dyn Actuator>,
    pub sink: Box<dyn FrameSink>,
    pub calibrator: Box<dyn Calibrator>,
    pub correlators: CorrelatorFactory,
}

#[derive(Default)]
struct Totals {
    frames_correlated: u64,
    frames_failed: u64,
    frames_unpersisted: u64,
}

pub struct Session {
    ctx: SessionContext,
    state: SessionState,
    capture: Option<Box<dyn CaptureSource>>,
    sink: Option<Box<dyn FrameSink>>,
    actuator: Box<dyn Actuator>,
    calibrator: Option<Box<dyn Calibrator>>,
    correlators: CorrelatorFactory,
    telemetry: TelemetryLines,
    pipeline: Option<Pipeline>,
    step: Option<CorrelationStep>,
    subsets: Vec<SubsetRecord>,
    program: Option<Vec<Command>>,
    script: Option<ScriptRun>,
    script_completed: Option<bool>,
    samples: usize,
    plotter: SeriesPlotter,
    calibration: Option<CalibrationRun>,
    camera_system: Option<CameraSystem>,
    live: Option<Arc<FramePair>>,
    live_sequence: u64,
    live_ended: bool,
    snapshots: u64,
    continuous_jog: bool,
    capture_end: Option<String>,
    totals: Totals,
    cycle: CycleTimer,
    started_utc: String,
}

fn now_utc() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

impl Session {
    /// Load the script and any precomputed camera system. Errors here are
    /// configuration problems and abort before any hardware is driven.
    pub fn new(ctx: SessionContext, parts: Collaborators) -> Result<Self> {
        let program = match ctx.config.script.as_deref() {
            Some(path) => Some(script::load_script(path).context("load actuator script")?),
            None => None,
        };
        let camera_system = match ctx.config.camera_system.as_deref() {
            Some(path) => Some(CameraSystem::load(path)?),
            None => None,
        };
        let plotter = SeriesPlotter::new(&ctx.paths.root, ctx.events.clone());
        Ok(Self {
            state: SessionState::LiveView,
            capture: Some(parts.capture),
            sink: Some(parts.sink),
            actuator: parts.actuator,
            calibrator: Some(parts.calibrator),
            correlators: parts.correlators,
            telemetry: TelemetryLines::default(),
            pipeline: None,
            step: None,
            subsets: Vec::new(),
            program,
            script: None,
            script_completed: None,
            samples: 0,
            plotter,
            calibration: None,
            camera_system,
            live: None,
            live_sequence: 0,
            live_ended: false,
            snapshots: 0,
            continuous_jog: false,
            capture_end: None,
            totals: Totals::default(),
            cycle: CycleTimer::new()?,
            started_utc: now_utc(),
            ctx,
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    fn info(&self, info: InfoEvent) {
        self.emit(SessionEvent::Info(info));
    }

    fn message(&self, msg: impl Into<String>) {
        self.info(InfoEvent::Message(msg.into()));
    }

    fn enter(&mut self, state: SessionState) {
        if self.state != state {
            info!(from = self.state.label(), to = state.label(), "session state");
        }
        self.state = state;
        self.emit(SessionEvent::StateChanged { state });
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn run(mut self, mut commands: UnboundedReceiver<OperatorCommand>) -> Result<RunSummary> {
        self.enter(SessionState::LiveView);
        if self.ctx.config.auto_arm {
            self.arm()?;
        }
        loop {
            loop {
                match commands.try_recv() {
                    Ok(cmd) => self.handle(cmd)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.shutdown()?;
                        break;
                    }
                }
            }
            match self.state {
                SessionState::LiveView => self.tick_live()?,
                SessionState::Calibrating => self.tick_calibration()?,
                SessionState::Running => self.tick_running()?,
                SessionState::Initializing => {}
                SessionState::Shutdown => break,
            }
        }
        self.finish()
    }

    pub fn handle(&mut self, cmd: OperatorCommand) -> Result<()> {
        debug!(?cmd, state = self.state.label(), "operator command");
        match cmd {
            OperatorCommand::Arm => match self.state {
                SessionState::LiveView => self.arm()?,
                _ => self.message(format!("Cannot arm while {}", self.state.label())),
            },
            OperatorCommand::Disarm => {
                if self.state == SessionState::Running {
                    self.disarm()?;
                    self.enter(SessionState::LiveView);
                }
            }
            OperatorCommand::Quit => self.shutdown()?,
            OperatorCommand::Calibrate => match self.state {
                SessionState::LiveView if self.calibrator.is_none() => {
                    self.message("Calibration is unavailable for the rest of this session");
                }
                SessionState::LiveView => {
                    self.calibration = Some(CalibrationRun::new(
                        &self.ctx.paths.cal_files,
                        self.ctx.config.calibration_frames,
                    ));
                    self.enter(SessionState::Calibrating);
                    self.report_calibration_progress();
                    self.message("Calibration: press n to capture each target position");
                }
                _ => self.message(format!("Cannot calibrate while {}", self.state.label())),
            },
            OperatorCommand::NextCalibrationFrame => self.capture_calibration_frame()?,
            // The interpreter only ticks alongside correlation.
            OperatorCommand::RunScript => match self.state {
                SessionState::Running => self.start_script(),
                _ => self.message(format!(
                    "Arm first: scripts run while correlating, not while {}",
                    self.state.label()
                )),
            },
            OperatorCommand::JogForward => self.send_actuator(STEP_FORWARD),
            OperatorCommand::JogBackward => self.send_actuator(STEP_BACKWARD),
            OperatorCommand::ToggleContinuousJog => {
                self.continuous_jog = !self.continuous_jog;
                self.message(format!(
                    "Continuous jog {}",
                    if self.continuous_jog { "on" } else { "off" }
                ));
            }
            OperatorCommand::Snapshot => self.snapshot(),
        }
        Ok(())
    }

    fn send_actuator(&mut self, command: &str) {
        match self.actuator.write(command) {
            Ok(()) => self.info(InfoEvent::ActuatorCommand(command.to_string())),
            Err(e) => {
                warn!(command, error = %e, "actuator write failed");
                self.info(InfoEvent::DeviceError(format!(
                    "{} write failed: {e}",
                    self.actuator.describe()
                )));
            }
        }
    }

    /// Work shared by every state that sees frames.
    fn housekeeping(&mut self) {
        if self.continuous_jog {
            self.send_actuator(STEP_FORWARD);
        }
        for line in self.telemetry.drain(self.actuator.as_mut()) {
            self.emit(SessionEvent::Telemetry(line));
        }
    }

    fn pull_live_frame(&mut self) -> Result<()> {
        let Some(capture) = self.capture.as_mut() else {
            return Ok(());
        };
        if self.live_ended {
            std::thread::sleep(self.ctx.config.tick_interval);
            return Ok(());
        }
        match capture.next_frame_pair() {
            Ok(pair) => {
                let (width, height) = pair.dimensions();
                self.live_sequence += 1;
                self.emit(SessionEvent::LiveFrame {
                    sequence: self.live_sequence,
                    width,
                    height,
                    mean_intensity: pair.mean_intensity(),
                });
                self.live = Some(Arc::new(pair));
            }
            Err(e) => self.capture_stopped(&e),
        }
        Ok(())
    }

    fn capture_stopped(&mut self, e: &CaptureError) {
        let reason = match e {
            CaptureError::EndOfStream => StopReason::EndOfStream,
            other => StopReason::Failed(other.to_string()),
        };
        warn!(reason = %reason.describe(), "live capture stopped");
        self.live_ended = true;
        self.capture_end = Some(reason.describe());
        self.info(InfoEvent::CaptureEnded {
            reason: reason.describe(),
        });
    }

    fn tick_live(&mut self) -> Result<()> {
        self.pull_live_frame()?;
        self.housekeeping();
        if self.live_ended && self.ctx.config.headless {
            self.enter(SessionState::Shutdown);
        }
        Ok(())
    }

    fn report_calibration_progress(&self) {
        if let Some(run) = &self.calibration {
            self.emit(SessionEvent::CalibrationProgress {
                captured: run.captured(),
                required: run.required(),
            });
        }
    }

    fn capture_calibration_frame(&mut self) -> Result<()> {
        if self.state != SessionState::Calibrating {
            self.message("Press c to start calibration first");
            return Ok(());
        }
        let Some(pair) = self.live.clone() else {
            self.message("No live frame to capture yet");
            return Ok(());
        };
        let Some(run) = self.calibration.as_mut() else {
            return Ok(());
        };
        if !run.is_collecting() {
            return Ok(());
        }
        let complete = match run.capture(&pair) {
            Ok(_) => !run.is_collecting(),
            Err(e) => {
                self.info(InfoEvent::DeviceError(format!("{e:#}")));
                return Ok(());
            }
        };
        self.report_calibration_progress();
        if complete {
            let started = match (self.calibrator.take(), self.calibration.as_mut()) {
                (Some(calibrator), Some(run)) => run.start(calibrator),
                _ => Err(anyhow!("calibrator is not available")),
            };
            match started {
                Ok(()) => self.message("Calibrating…"),
                Err(e) => self.abandon_calibration(&e),
            }
        }
        Ok(())
    }

    /// The calibrator did not come back from its worker, so calibration
    /// stays disabled; the session itself carries on in live view.
    fn abandon_calibration(&mut self, e: &anyhow::Error) {
        warn!(error = %format!("{e:#}"), "calibration abandoned");
        self.calibration = None;
        self.info(InfoEvent::DeviceError(format!(
            "Calibration abandoned: {e:#}; calibration is disabled for this session"
        )));
        self.enter(SessionState::LiveView);
    }

    fn tick_calibration(&mut self) -> Result<()> {
        let solving = self.calibration.as_ref().is_some_and(|r| r.is_solving());
        if !solving {
            self.pull_live_frame()?;
        } else {
            std::thread::sleep(self.ctx.config.tick_interval);
        }
        self.housekeeping();

        let Some(done) = self.calibration.as_mut().and_then(|r| r.poll()) else {
            return Ok(());
        };
        let (calibrator, result) = match done {
            Ok(solved) => solved,
            Err(e) => {
                self.abandon_calibration(&e);
                return Ok(());
            }
        };
        self.calibrator = Some(calibrator);
        self.calibration = None;
        match result {
            Ok(system) => {
                for line in system.report() {
                    self.message(line);
                }
                let path = self.ctx.paths.camera_system();
                match system.save(&path) {
                    Ok(()) => self.info(InfoEvent::CalibrationSaved {
                        path,
                        rms: system.rms,
                    }),
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "camera system not saved");
                        self.info(InfoEvent::DeviceError(format!(
                            "Camera system kept for this session but not saved: {e:#}"
                        )));
                    }
                }
                self.camera_system = Some(system);
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "calibration failed");
                self.message(format!("Calibration failed: {e:#}"));
            }
        }
        self.enter(SessionState::LiveView);
        Ok(())
    }

    fn start_script(&mut self) {
        let Some(program) = self.program.clone() else {
            self.message("No script loaded (use --script)");
            return;
        };
        if self.script.as_ref().is_some_and(|s| s.is_loaded()) {
            self.message("Script already running");
            return;
        }
        self.script = Some(ScriptRun::new(program, self.ctx.config.sample_axis));
        self.script_completed = Some(false);
        self.message("Script started");
    }

    fn snapshot(&mut self) {
        let pair = match (&self.pipeline, &self.live) {
            (Some(p), _) => p.latest().1,
            (None, Some(live)) => live.clone(),
            (None, None) => {
                self.message("No frame to snapshot yet");
                return;
            }
        };
        let paths = pair_paths(&self.ctx.paths.test_files, "Img", self.snapshots);
        match write_jpeg_pair(&paths, &pair) {
            Ok(()) => {
                self.snapshots += 1;
                let [left, _] = paths;
                self.info(InfoEvent::SnapshotSaved { path: left });
            }
            Err(e) => self.info(InfoEvent::DeviceError(format!("{e:#}"))),
        }
    }

    /// LiveView -> Initializing -> Running.
    fn arm(&mut self) -> Result<()> {
        self.enter(SessionState::Initializing);
        let Some(mut capture) = self.capture.take() else {
            return Err(anyhow!("camera is not available"));
        };
        let reference = match capture.next_frame_pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.capture = Some(capture);
                self.capture_stopped(&e);
                let next = if self.ctx.config.headless {
                    SessionState::Shutdown
                } else {
                    SessionState::LiveView
                };
                self.enter(next);
                return Ok(());
            }
        };

        let solutions = self
            .ctx
            .config
            .write_solutions
            .then(|| self.ctx.paths.solutions.clone());
        let correlator = (self.correlators)(solutions.as_deref());
        let mut step = CorrelationStep::new(correlator, self.ctx.config.incremental);
        let geometry = self.camera_system.as_ref().map(CameraSystem::stereo_geometry);
        self.subsets = step
            .initialize(&reference, geometry)
            .context("initialize correlation")?;
        info!(subsets = self.subsets.len(), calibrated = geometry.is_some(), "reference captured");
        self.emit(SessionEvent::SubsetLayout {
            subsets: self.subsets.clone(),
        });
        self.step = Some(step);

        let sink = self
            .sink
            .take()
            .ok_or_else(|| anyhow!("frame sink is not available"))?;
        self.pipeline = Some(Pipeline::start(
            capture,
            sink,
            reference,
            self.ctx.events.clone(),
        )?);
        if self.ctx.config.auto_run_script && self.program.is_some() && self.script.is_none() {
            self.start_script();
        }
        self.enter(SessionState::Running);
        Ok(())
    }

    /// Stop the workers and take the camera back.
    fn disarm(&mut self) -> Result<()> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        let exit = pipeline.shutdown()?;
        self.capture = Some(exit.source);
        self.sink = Some(exit.sink);
        self.step = None;
        if exit.reason != StopReason::Stopped {
            self.live_ended = true;
            self.capture_end = Some(exit.reason.describe());
            self.info(InfoEvent::CaptureEnded {
                reason: exit.reason.describe(),
            });
        }
        if self.script.as_ref().is_some_and(|s| s.is_loaded()) {
            self.message("Script interrupted");
            self.script = None;
        }
        info!(published = exit.published, "disarmed");
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.state == SessionState::Shutdown {
            return Ok(());
        }
        self.disarm()?;
        if let Some(run) = self.calibration.as_ref() {
            if run.is_solving() {
                warn!("leaving calibration worker running at shutdown");
            }
        }
        self.enter(SessionState::Shutdown);
        Ok(())
    }

    fn tick_running(&mut self) -> Result<()> {
        let next = match &self.pipeline {
            Some(pipeline) => pipeline.next_frame(self.ctx.config.tick_interval),
            None => return Err(anyhow!("running without a pipeline")),
        };
        match next {
            Ok(frame) => self.process_frame(frame),
            Err(WaitError::TimedOut(_)) => {
                self.housekeeping();
                Ok(())
            }
            Err(WaitError::Cancelled(_)) => {
                self.disarm()?;
                // Interactive sessions keep the actuator and UI after the
                // camera is gone.
                if self.ctx.config.headless {
                    self.enter(SessionState::Shutdown);
                } else {
                    self.enter(SessionState::LiveView);
                }
                Ok(())
            }
        }
    }

    fn process_frame(&mut self, frame: CommittedFrame) -> Result<()> {
        let Some(step) = self.step.as_mut() else {
            return Err(anyhow!("correlation step missing while running"));
        };
        let outcome = step.run(&frame, &mut self.subsets);
        self.totals.frames_correlated += 1;
        if outcome.failed {
            self.totals.frames_failed += 1;
        }
        if frame.paths.is_none() && self.ctx.config.persist_frames {
            self.totals.frames_unpersisted += 1;
        }
        let cycle = frame.pair.captured_at.elapsed();
        self.emit(SessionEvent::FrameCorrelated {
            index: frame.index,
            failed: outcome.failed,
            persisted: frame.paths.is_some(),
            cycle_ms: cycle.as_secs_f64() * 1000.0,
            subsets: self.subsets.clone(),
        });

        let script_ended = self.tick_script();
        self.housekeeping();
        if let Some(pipeline) = &self.pipeline {
            pipeline.release();
        }
        self.cycle.record(frame.pair.captured_at.elapsed());

        let frame_limit = self
            .ctx
            .config
            .max_frames
            .is_some_and(|max| self.totals.frames_correlated >= max);
        if frame_limit {
            info!(frames = self.totals.frames_correlated, "frame limit reached");
            self.shutdown()?;
        } else if script_ended && self.ctx.config.stop_after_script {
            self.shutdown()?;
        }
        Ok(())
    }

    /// Returns `true` on the tick the script finishes.
    fn tick_script(&mut self) -> bool {
        let Some(script) = self.script.as_mut() else {
            return false;
        };
        let mut io = ScriptIo {
            actuator: self.actuator.as_mut(),
            plotter: &mut self.plotter,
            subsets: &self.subsets,
        };
        let result = script.tick(Instant::now(), &mut io);
        let progress = SessionEvent::ScriptProgress {
            pc: script.pc(),
            len: script.len(),
            iterator_count: script.iterator_count(),
            loaded: script.is_loaded(),
        };
        self.samples = script.series().len();
        self.emit(progress);
        match result {
            Ok(report) => {
                if let Some(sent) = report.sent {
                    self.info(InfoEvent::ActuatorCommand(sent));
                }
                if report.step == Step::Ended {
                    self.script_completed = Some(true);
                    self.message("Script finished");
                    return true;
                }
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "script step failed");
                self.info(InfoEvent::DeviceError(format!("{e:#}")));
            }
        }
        false
    }

    fn finish(mut self) -> Result<RunSummary> {
        self.disarm()?;
        let mut series_csv = self.plotter.written().map(Path::to_path_buf);
        if let Some(script) = self.script.as_ref() {
            // Keep whatever was sampled even without a DRAW.
            if !script.series().is_empty() && series_csv.is_none() {
                match self.plotter.draw(script.series()) {
                    Ok(()) => series_csv = self.plotter.written().map(Path::to_path_buf),
                    Err(e) => warn!(error = %format!("{e:#}"), "series export failed"),
                }
            }
        }

        let axis = |f: fn(&SubsetRecord) -> f64| -> Vec<f64> { self.subsets.iter().map(f).collect() };
        let summary = RunSummary {
            session_id: self.ctx.config.session_id.clone(),
            started_utc: self.started_utc.clone(),
            finished_utc: now_utc(),
            frames_correlated: self.totals.frames_correlated,
            frames_failed: self.totals.frames_failed,
            frames_unpersisted: self.totals.frames_unpersisted,
            success: self.totals.frames_failed == 0,
            subsets: self.subsets.len(),
            displacement_x: displacement_stats(&axis(|s| s.displacement_x)),
            displacement_y: displacement_stats(&axis(|s| s.displacement_y)),
            displacement_z: displacement_stats(&axis(|s| s.displacement_z)),
            cycle: self.cycle.stats(),
            script_completed: self.script_completed,
            samples: self.samples,
            capture_end: self.capture_end.clone(),
            output_dir: self.ctx.paths.root.clone(),
            series_csv,
        };
        storage::export_json(&self.ctx.paths.summary(), &summary)
            .context("write run summary")?;
        info!(
            frames = summary.frames_correlated,
            failed = summary.frames_failed,
            "session finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::calibration::PrecomputedCalibrator;
    use crate::devices::dic::{BlockMatchConfig, BlockMatchCorrelator};
    use crate::devices::serial::SimActuator;
    use crate::devices::synthetic::{SimStage, SpeckleCapture, SpeckleParams};
    use crate::engine::persistence::{DiscardFrames, JpegFrameSink};
    use crate::model::{ActuatorSpec, Axis, CaptureSpec};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config(name: &str) -> SessionConfig {
        SessionConfig {
            session_id: name.into(),
            capture: CaptureSpec::Synthetic,
            actuator: ActuatorSpec::Sim,
            width: 160,
            height: 120,
            frame_interval: Duration::ZERO,
            tick_interval: Duration::from_millis(20),
            subset_size: 21,
            subset_step: 40,
            search_radius: 6,
            disparity_range: 24,
            roi_margin: 16,
            max_residual: 0.5,
            incremental: true,
            sample_axis: Axis::X,
            persist_frames: true,
            write_solutions: false,
            calibration_frames: 2,
            camera_system: None,
            script: None,
            headless: true,
            auto_arm: true,
            auto_run_script: true,
            stop_after_script: true,
            max_frames: Some(40),
            seed: 42,
        }
    }

    fn session(
        cfg: SessionConfig,
        root: &Path,
        persist: bool,
    ) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let paths = SessionPaths::new(root, &cfg.session_id);
        paths.create().unwrap();
        let stage = SimStage::default();
        let capture = SpeckleCapture::new(
            SpeckleParams::new(cfg.width, cfg.height, cfg.seed),
            stage.clone(),
            cfg.frame_interval,
        );
        let sink: Box<dyn FrameSink> = if persist {
            Box::new(JpegFrameSink::new(paths.frames.clone()))
        } else {
            Box::new(DiscardFrames)
        };
        let bm = BlockMatchConfig {
            subset_size: cfg.subset_size,
            step: cfg.subset_step,
            search_radius: cfg.search_radius,
            disparity_range: cfg.disparity_range,
            roi_margin: cfg.roi_margin,
            max_residual: cfg.max_residual,
            output_dir: None,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = SessionContext {
            config: cfg,
            paths,
            events: tx,
        };
        let parts = Collaborators {
            capture: Box::new(capture),
            actuator: Box::new(SimActuator::new(stage)),
            sink,
            calibrator: Box::new(PrecomputedCalibrator::new(None)),
            correlators: Box::new(move |dir: Option<&Path>| -> Box<dyn Correlator> {
                let mut bm = bm.clone();
                bm.output_dir = dir.map(Path::to_path_buf);
                Box::new(BlockMatchCorrelator::new(bm))
            }),
        };
        (Session::new(ctx, parts).unwrap(), rx)
    }

    /// Camera that delivers `frames` pairs and then fails with an I/O error.
    struct FailingCapture {
        inner: SpeckleCapture,
        frames: usize,
    }

    impl CaptureSource for FailingCapture {
        fn next_frame_pair(&mut self) -> Result<FramePair, CaptureError> {
            if self.frames == 0 {
                return Err(CaptureError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "camera unplugged",
                )));
            }
            self.frames -= 1;
            self.inner.next_frame_pair()
        }

        fn describe(&self) -> String {
            "failing camera".into()
        }
    }

    fn failing_capture(cfg: &SessionConfig, frames: usize) -> Box<dyn CaptureSource> {
        Box::new(FailingCapture {
            inner: SpeckleCapture::new(
                SpeckleParams::new(cfg.width, cfg.height, cfg.seed),
                SimStage::default(),
                Duration::from_millis(2),
            ),
            frames,
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn headless_run_stops_at_frame_limit_and_writes_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("limit");
        cfg.max_frames = Some(5);
        let (session, mut rx) = session(cfg, root, true);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let summary = session.run(cmd_rx).unwrap();

        assert_eq!(summary.frames_correlated, 5);
        assert_eq!(summary.frames_failed, 0);
        assert!(summary.success);
        assert!(summary.subsets > 0);
        assert!(root.join("limit/summary.json").exists());
        assert!(root.join("limit/frames/Img_0000_0.jpeg").exists());

        let events = drain(&mut rx);
        let states: Vec<SessionState> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged { state } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                SessionState::LiveView,
                SessionState::Initializing,
                SessionState::Running,
                SessionState::Shutdown
            ]
        );
        let indices: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::FrameCorrelated { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn headless_capture_failure_shuts_down_after_correlating_committed_frames() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("unplugged");
        cfg.max_frames = None;
        let capture = failing_capture(&cfg, 6);
        let (mut session, mut rx) = session(cfg, root, false);
        session.capture = Some(capture);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let summary = session.run(cmd_rx).unwrap();

        let end = summary.capture_end.clone().unwrap();
        assert!(end.contains("camera unplugged"), "{end}");
        assert!(summary.frames_correlated >= 1);

        let events = drain(&mut rx);
        let correlated = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::FrameCorrelated { .. }))
            .count() as u64;
        assert_eq!(correlated, summary.frames_correlated);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Info(InfoEvent::CaptureEnded { reason }) if reason.contains("camera unplugged")
        )));
        assert!(matches!(
            events.iter().rev().find_map(|e| match e {
                SessionEvent::StateChanged { state } => Some(*state),
                _ => None,
            }),
            Some(SessionState::Shutdown)
        ));
    }

    #[test]
    fn interactive_capture_failure_returns_to_live_view() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("unplugged-ui");
        cfg.headless = false;
        cfg.auto_arm = false;
        cfg.max_frames = None;
        let capture = failing_capture(&cfg, 4);
        let (mut session, _rx) = session(cfg, root, false);
        session.capture = Some(capture);

        session.handle(OperatorCommand::Arm).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() == SessionState::Running {
            assert!(Instant::now() < deadline, "capture failure never surfaced");
            session.tick_running().unwrap();
        }
        assert_eq!(session.state(), SessionState::LiveView);
        assert!(session.totals.frames_correlated >= 1);
        assert!(session
            .capture_end
            .as_deref()
            .is_some_and(|e| e.contains("camera unplugged")));
        // The camera is back but ended; live view idles instead of failing.
        session.tick_live().unwrap();
        assert_eq!(session.state(), SessionState::LiveView);
    }

    #[test]
    fn scripted_moves_show_up_as_displacement() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let script = root.join("ramp.txt");
        // Five forward steps of 0.12 mm at 10 px/mm: 6 px in total.
        std::fs::write(&script, "S01\nF05\nW01\nEND\n").unwrap();
        let mut cfg = config("script");
        cfg.script = Some(script);
        cfg.frame_interval = Duration::from_millis(10);
        cfg.incremental = false;
        cfg.max_frames = Some(1000);
        let (session, mut rx) = session(cfg, root, false);
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let summary = session.run(cmd_rx).unwrap();

        assert_eq!(summary.script_completed, Some(true));
        assert!(summary.samples > 0);
        assert!(summary.series_csv.is_some());
        let mean_x = summary.displacement_x.mean.unwrap();
        assert!((mean_x - 6.0).abs() < 0.2, "mean x displacement {mean_x}");

        let sent: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Info(InfoEvent::ActuatorCommand(c)) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec!["F0.12"; 5]);
    }

    #[test]
    fn operator_commands_drive_state_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("operator");
        cfg.headless = false;
        cfg.auto_arm = false;
        cfg.max_frames = None;
        let (mut session, mut rx) = session(cfg, root, false);

        session.tick_live().unwrap();
        session.handle(OperatorCommand::Snapshot).unwrap();
        assert!(root.join("operator/test_files/Img_0000_0.jpeg").exists());

        session.handle(OperatorCommand::Arm).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        session.tick_running().unwrap();
        session.handle(OperatorCommand::Disarm).unwrap();
        assert_eq!(session.state(), SessionState::LiveView);
        // The camera is back for live view.
        session.tick_live().unwrap();

        session.handle(OperatorCommand::JogForward).unwrap();
        session.tick_live().unwrap();
        session.handle(OperatorCommand::Quit).unwrap();
        assert_eq!(session.state(), SessionState::Shutdown);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Info(InfoEvent::SnapshotSaved { .. })
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::Telemetry(line) if line.starts_with("OK F0.12"))));
    }

    #[test]
    fn calibration_collects_frames_and_returns_to_live_view() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("calibrate");
        cfg.headless = false;
        cfg.auto_arm = false;
        let (mut session, mut rx) = session(cfg, root, false);

        session.handle(OperatorCommand::Calibrate).unwrap();
        assert_eq!(session.state(), SessionState::Calibrating);
        for _ in 0..2 {
            session.tick_calibration().unwrap();
            session.handle(OperatorCommand::NextCalibrationFrame).unwrap();
        }
        assert!(root.join("calibrate/cal_files/Cal_0001_0.jpeg").exists());

        let deadline = Instant::now() + Duration::from_secs(2);
        while session.state() == SessionState::Calibrating {
            assert!(Instant::now() < deadline, "calibration never finished");
            session.tick_calibration().unwrap();
        }
        assert_eq!(session.state(), SessionState::LiveView);
        // No precomputed geometry was supplied, so the solver reports failure.
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SessionEvent::Info(InfoEvent::Message(m)) if m.starts_with("Calibration failed")
        )));
    }

    fn collect_calibration_frames(session: &mut Session) {
        session.handle(OperatorCommand::Calibrate).unwrap();
        assert_eq!(session.state(), SessionState::Calibrating);
        for _ in 0..2 {
            session.tick_calibration().unwrap();
            session.handle(OperatorCommand::NextCalibrationFrame).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while session.state() == SessionState::Calibrating {
            assert!(Instant::now() < deadline, "calibration never finished");
            session.tick_calibration().unwrap();
        }
    }

    fn device_errors(events: &[SessionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Info(InfoEvent::DeviceError(m)) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unwritable_camera_system_keeps_the_session_alive() {
        use crate::devices::calibration::CameraIntrinsics;
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let cam = CameraIntrinsics {
            fx: 1000.0,
            fy: 1000.0,
            cx: 80.0,
            cy: 60.0,
            p1: 0.0,
            p2: 0.0,
        };
        let source = root.join("precomputed.json");
        CameraSystem {
            rms: 0.3,
            cameras: [cam, cam],
            rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            translation: [-50.0, 0.0, 0.0],
        }
        .save(&source)
        .unwrap();
        let mut cfg = config("savefail");
        cfg.headless = false;
        cfg.auto_arm = false;
        let (mut session, mut rx) = session(cfg, root, false);
        session.calibrator = Some(Box::new(PrecomputedCalibrator::new(Some(source))));
        // A directory where cal.json should go makes the write fail.
        std::fs::create_dir_all(root.join("savefail/cal.json")).unwrap();

        collect_calibration_frames(&mut session);
        assert_eq!(session.state(), SessionState::LiveView);
        assert!(session.camera_system.is_some());
        let errors = device_errors(&drain(&mut rx));
        assert!(errors.iter().any(|m| m.contains("not saved")), "{errors:?}");

        // Arming still works with the unsaved geometry.
        session.handle(OperatorCommand::Arm).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        session.handle(OperatorCommand::Quit).unwrap();
    }

    struct PanickingCalibrator;

    impl Calibrator for PanickingCalibrator {
        fn calibrate(&mut self, _: &Path, _: &[[PathBuf; 2]]) -> Result<CameraSystem> {
            panic!("solver crashed");
        }
    }

    #[test]
    fn calibration_worker_panic_disables_calibration() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let mut cfg = config("panic");
        cfg.headless = false;
        cfg.auto_arm = false;
        let (mut session, mut rx) = session(cfg, root, false);
        session.calibrator = Some(Box::new(PanickingCalibrator));

        collect_calibration_frames(&mut session);
        assert_eq!(session.state(), SessionState::LiveView);
        let errors = device_errors(&drain(&mut rx));
        assert!(errors.iter().any(|m| m.contains("panicked")), "{errors:?}");

        session.handle(OperatorCommand::Calibrate).unwrap();
        assert_eq!(session.state(), SessionState::LiveView);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SessionEvent::Info(InfoEvent::Message(m)) if m.contains("unavailable")
        )));
        session.tick_live().unwrap();
    }

    #[test]
    fn run_script_outside_running_asks_to_arm_first() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let script = root.join("hold.txt");
        std::fs::write(&script, "W01\nEND\n").unwrap();
        let mut cfg = config("early");
        cfg.headless = false;
        cfg.auto_arm = false;
        cfg.auto_run_script = false;
        cfg.script = Some(script);
        let (mut session, mut rx) = session(cfg, root, false);

        session.handle(OperatorCommand::RunScript).unwrap();
        assert!(session.script.is_none());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            SessionEvent::Info(InfoEvent::Message(m)) if m.starts_with("Arm first")
        )));

        session.handle(OperatorCommand::Arm).unwrap();
        session.handle(OperatorCommand::RunScript).unwrap();
        assert!(session.script.as_ref().is_some_and(|s| s.is_loaded()));
        session.handle(OperatorCommand::Quit).unwrap();
    }

    #[test]
    fn malformed_script_aborts_setup() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let script = root.join("bad.txt");
        std::fs::write(&script, "S01\nZ99\n").unwrap();
        let mut cfg = config("badscript");
        cfg.script = Some(script);
        let paths = SessionPaths::new(root, "badscript");
        let (tx, _rx) = mpsc::unbounded_channel();
        let stage = SimStage::default();
        let parts = Collaborators {
            capture: Box::new(SpeckleCapture::new(
                SpeckleParams::new(64, 48, 1),
                stage.clone(),
                Duration::ZERO,
            )),
            actuator: Box::new(SimActuator::new(stage)),
            sink: Box::new(DiscardFrames),
            calibrator: Box::new(PrecomputedCalibrator::new(None)),
            correlators: Box::new(|_: Option<&Path>| -> Box<dyn Correlator> {
                Box::new(BlockMatchCorrelator::new(BlockMatchConfig::default()))
            }),
        };
        let err = Session::new(
            SessionContext {
                config: cfg,
                paths,
                events: tx,
            },
            parts,
        )
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("unknown opcode"));
    }
}
