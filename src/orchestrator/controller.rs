//! Session lifecycle controller.
//!
//! Opens the rig, runs the session on a blocking thread and forwards operator
//! commands to it. Ctrl-C is translated into a quit request.

use super::session::{Collaborators, Session, SessionContext};
use crate::devices::{self, calibration::PrecomputedCalibrator};
use crate::engine::persistence::{DiscardFrames, FrameSink, JpegFrameSink};
use crate::model::{InfoEvent, OperatorCommand, RunSummary, SessionEvent};
use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Duration;

/// Open the configured hardware and the reference collaborators.
pub(crate) fn open_collaborators(ctx: &SessionContext) -> Result<Collaborators> {
    let cfg = &ctx.config;
    let rig = devices::open_rig(cfg)?;
    let sink: Box<dyn FrameSink> = if cfg.persist_frames {
        Box::new(JpegFrameSink::new(ctx.paths.frames.clone()))
    } else {
        Box::new(DiscardFrames)
    };
    let correlator_cfg = cfg.clone();
    Ok(Collaborators {
        capture: rig.capture,
        actuator: rig.actuator,
        sink,
        calibrator: Box::new(PrecomputedCalibrator::new(cfg.camera_system.clone())),
        correlators: Box::new(move |dir: Option<&std::path::Path>| {
            devices::block_matcher(&correlator_cfg, dir)
        }),
    })
}

/// Run one session to completion, relaying commands from presentation layers.
pub(crate) async fn run_controller(
    ctx: SessionContext,
    mut cmd_rx: UnboundedReceiver<OperatorCommand>,
) -> Result<RunSummary> {
    let event_tx = ctx.events.clone();
    let parts = open_collaborators(&ctx)?;
    let session = Session::new(ctx, parts)?;

    let (session_tx, session_rx) = mpsc::unbounded_channel::<OperatorCommand>();
    let mut handle = tokio::task::spawn_blocking(move || session.run(session_rx));

    let mut ui_open = true;
    let mut ctrl_c_armed = true;
    // Shutdown watchdog: if joining the workers takes too long, say so.
    let mut quit_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    let request_quit = |deadline: &mut Option<tokio::time::Instant>| {
        let _ = session_tx.send(OperatorCommand::Quit);
        if deadline.is_none() {
            let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(
                "Shutting down…".into(),
            )));
            *deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
        }
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if ui_open => {
                match cmd {
                    Some(OperatorCommand::Quit) => request_quit(&mut quit_deadline),
                    Some(cmd) => {
                        let _ = session_tx.send(cmd);
                    }
                    None => {
                        ui_open = false;
                        request_quit(&mut quit_deadline);
                    }
                }
            }
            signal = async {
                if ctrl_c_armed {
                    return tokio::signal::ctrl_c().await;
                }
                futures::future::pending().await
            } => {
                ctrl_c_armed = false;
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "ctrl-c handler unavailable");
                } else {
                    request_quit(&mut quit_deadline);
                }
            }
            done = &mut handle => {
                return done.context("session task failed")?;
            }
            _ = watchdog.tick() => {
                if let Some(deadline) = quit_deadline {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = event_tx.send(SessionEvent::Info(InfoEvent::Message(
                            "Still shutting down…".into(),
                        )));
                        quit_deadline = None;
                    }
                }
            }
        }
    }
}
