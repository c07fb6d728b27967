use crate::model::{ActuatorSpec, Axis, CaptureSpec, SessionConfig, SessionEvent};
use crate::orchestrator::{self, SessionContext};
use crate::storage::SessionPaths;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing_subscriber::EnvFilter;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

fn parse_capture(s: &str) -> Result<CaptureSpec, String> {
    if s == "synthetic" {
        return Ok(CaptureSpec::Synthetic);
    }
    match s.split_once(':') {
        Some(("dir", path)) if !path.is_empty() => Ok(CaptureSpec::Directory(path.into())),
        Some(("split", path)) if !path.is_empty() => Ok(CaptureSpec::SideBySide(path.into())),
        _ => Err(format!(
            "unknown capture source `{s}` (expected synthetic, dir:<path> or split:<path>)"
        )),
    }
}

fn parse_actuator(s: &str) -> Result<ActuatorSpec, String> {
    match s {
        "" => Err("actuator must not be empty".into()),
        "dry-run" => Ok(ActuatorSpec::DryRun),
        "sim" => Ok(ActuatorSpec::Sim),
        path => Ok(ActuatorSpec::Device(path.into())),
    }
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "dic-rig",
    version,
    about = "Stereo DIC rig: live view, calibration, correlation and scripted actuation"
)]
pub struct Cli {
    /// Print the JSON run summary and exit (no TUI)
    #[arg(long)]
    pub json: bool,

    /// Print progress and a text summary (no TUI)
    #[arg(long)]
    pub text: bool,

    /// Run silently: suppress all output except errors
    #[arg(long)]
    pub silent: bool,

    /// Frame source: synthetic, dir:<path> or split:<path>
    #[arg(long, default_value = "synthetic", value_parser = parse_capture)]
    pub capture: CaptureSpec,

    /// Actuator: dry-run, sim, or a serial device path (e.g. /dev/ttyACM0)
    #[arg(long, default_value = "dry-run", value_parser = parse_actuator)]
    pub actuator: ActuatorSpec,

    /// Synthetic frame width in pixels
    #[arg(long, default_value_t = 640)]
    pub width: u32,

    /// Synthetic frame height in pixels
    #[arg(long, default_value_t = 480)]
    pub height: u32,

    /// Minimum time between captured frame pairs
    #[arg(long, default_value = "100ms")]
    pub frame_interval: humantime::Duration,

    /// Session loop period while idle in live view
    #[arg(long, default_value = "20ms")]
    pub tick_interval: humantime::Duration,

    /// Subset edge length in pixels (odd)
    #[arg(long, default_value_t = 21)]
    pub subset_size: u32,

    /// Spacing between subset centres in pixels
    #[arg(long, default_value_t = 40)]
    pub subset_step: u32,

    /// Temporal search radius in pixels
    #[arg(long, default_value_t = 6)]
    pub search_radius: u32,

    /// Stereo disparity search range in pixels
    #[arg(long, default_value_t = 24)]
    pub disparity_range: u32,

    /// Border kept clear of subsets
    #[arg(long, default_value_t = 16)]
    pub roi_margin: u32,

    /// Largest accepted normalised match residual
    #[arg(long, default_value_t = 0.5)]
    pub max_residual: f64,

    /// Use --incremental true or --incremental false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub incremental: bool,

    /// Displacement component sampled by scripts
    #[arg(long, value_enum, default_value_t = Axis::Z)]
    pub axis: Axis,

    /// Do not write committed frame pairs to disk
    #[arg(long)]
    pub no_persist: bool,

    /// Use --write-solutions true or --write-solutions false to override
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub write_solutions: bool,

    /// Target frame pairs collected before calibrating
    #[arg(long, default_value_t = 16)]
    pub calibration_frames: usize,

    /// Precomputed camera system JSON
    #[arg(long)]
    pub camera_system: Option<PathBuf>,

    /// Actuator command script
    #[arg(long)]
    pub script: Option<PathBuf>,

    /// Root directory for session output
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Session directory name (defaults to the UTC start time)
    #[arg(long)]
    pub session_id: Option<String>,

    /// Arm as soon as the session starts
    #[arg(long)]
    pub auto_arm: bool,

    /// Start the loaded script right after arming
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub auto_run_script: bool,

    /// End the session once the script reaches END
    #[arg(long)]
    pub stop_after_script: bool,

    /// End the session after this many correlated frames
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Seed for the synthetic speckle pattern
    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// Export the run summary as JSON
    #[arg(long)]
    pub export_json: Option<PathBuf>,
}

impl Cli {
    fn is_headless(&self) -> bool {
        self.silent || self.json || self.text || !cfg!(feature = "tui")
    }
}

pub async fn run(args: Cli) -> Result<()> {
    if args.silent && !args.json {
        return Err(anyhow::anyhow!(
            "--silent can only be used with --json. Use --silent --json together."
        ));
    }

    // Without the `tui` feature every run is headless.
    #[cfg(feature = "tui")]
    if !args.is_headless() {
        return crate::tui::run(args).await;
    }

    run_headless(args).await
}

fn gen_session_id() -> String {
    let fmt = time::macros::format_description!("[year][month][day]-[hour][minute][second]");
    time::OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| "session".into())
}

/// Build a `SessionConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> SessionConfig {
    let headless = args.is_headless();
    SessionConfig {
        session_id: args.session_id.clone().unwrap_or_else(gen_session_id),
        capture: args.capture.clone(),
        actuator: args.actuator.clone(),
        width: args.width,
        height: args.height,
        frame_interval: Duration::from(args.frame_interval),
        tick_interval: Duration::from(args.tick_interval),
        subset_size: args.subset_size,
        subset_step: args.subset_step,
        search_radius: args.search_radius,
        disparity_range: args.disparity_range,
        roi_margin: args.roi_margin,
        max_residual: args.max_residual,
        incremental: args.incremental,
        sample_axis: args.axis,
        persist_frames: !args.no_persist,
        write_solutions: args.write_solutions,
        calibration_frames: args.calibration_frames,
        camera_system: args.camera_system.clone(),
        script: args.script.clone(),
        headless,
        // Nobody can press `a` without a TUI.
        auto_arm: args.auto_arm || headless,
        auto_run_script: args.auto_run_script,
        stop_after_script: args.stop_after_script,
        max_frames: args.max_frames,
        seed: args.seed,
    }
}

/// Create the session output tree and the event channel presentation layers read.
pub(crate) fn prepare_session(
    args: &Cli,
) -> Result<(SessionContext, UnboundedReceiver<SessionEvent>)> {
    let config = build_config(args);
    let root = args
        .output_dir
        .clone()
        .unwrap_or_else(crate::storage::default_output_root);
    let paths = SessionPaths::new(&root, &config.session_id);
    paths.create()?;
    let (events, event_rx) = mpsc::unbounded_channel::<SessionEvent>();
    Ok((
        SessionContext {
            config,
            paths,
            events,
        },
        event_rx,
    ))
}

pub(crate) enum LogTarget {
    Stderr,
    File(PathBuf),
}

/// Install the global tracing subscriber. `RUST_LOG` overrides `default_level`.
pub(crate) fn init_tracing(target: LogTarget, default_level: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime());
    match target {
        LogTarget::Stderr => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
        LogTarget::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let _ = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
    }
    Ok(())
}

/// One progress line for text mode, or `None` for events not worth printing.
fn describe_event(ev: &SessionEvent) -> Option<String> {
    match ev {
        SessionEvent::StateChanged { state } => Some(format!("== {} ==", state.label())),
        SessionEvent::SubsetLayout { subsets } => {
            Some(format!("Tracking {} subsets", subsets.len()))
        }
        SessionEvent::FrameCorrelated {
            index,
            failed,
            persisted,
            cycle_ms,
            subsets,
        } => {
            let mean = |f: fn(&crate::model::SubsetRecord) -> f64| {
                let values: Vec<f64> = subsets.iter().map(f).collect();
                crate::metrics::compute_metrics(&values).map_or(0.0, |(m, _, _, _)| m)
            };
            Some(format!(
                "Frame {index}: {}{} u {:.3} v {:.3} w {:.3} ({cycle_ms:.1} ms)",
                if *failed { "FAILED" } else { "ok" },
                if *persisted { "" } else { ", not saved" },
                mean(|s| s.displacement_x),
                mean(|s| s.displacement_y),
                mean(|s| s.displacement_z),
            ))
        }
        SessionEvent::CalibrationProgress { captured, required } => {
            Some(format!("Calibration frames: {captured}/{required}"))
        }
        SessionEvent::SeriesDrawn { axis, series } => Some(format!(
            "Plotted {} {}-displacement series",
            series.len(),
            axis.label()
        )),
        SessionEvent::Telemetry(line) => Some(format!("Actuator -> {line}")),
        SessionEvent::Info(info) => Some(info.to_message()),
        SessionEvent::LiveFrame { .. }
        | SessionEvent::ScriptProgress { .. }
        | SessionEvent::RunCompleted { .. } => None,
    }
}

/// Run without a TUI: auto-arm, stream progress, print the summary.
async fn run_headless(args: Cli) -> Result<()> {
    let (ctx, mut evt_rx) = prepare_session(&args)?;
    init_tracing(
        LogTarget::Stderr,
        if args.silent || args.json { "warn" } else { "info" },
    )?;

    let (out_tx, out_handle) = spawn_output_writer();
    // Dropping the command sender would read as "operator gone" and quit early.
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(orchestrator::run_controller(ctx, cmd_rx));

    while let Some(ev) = evt_rx.recv().await {
        if args.text {
            if let Some(line) = describe_event(&ev) {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
    }
    drop(cmd_tx);

    let summary = handle
        .await
        .context("session controller task failed")?
        .context("session failed")?;
    let processed = orchestrator::process_run_completion(&args, &summary);

    if args.json && !args.silent {
        let out = serde_json::to_string_pretty(&processed.summary)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else if args.text {
        for line in crate::text_summary::build_text_summary(&processed.summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    if !args.silent {
        for msg in processed.export_messages {
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
    }

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}
