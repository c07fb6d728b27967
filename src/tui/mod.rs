mod charts;
mod help;
mod state;

use crate::cli::{self, Cli, LogTarget};
use crate::model::{OperatorCommand, SessionEvent, SessionState};
use crate::orchestrator;
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Dataset, GraphType, Paragraph, Sparkline, Tabs},
    Terminal,
};
use state::{push_wrapped_status_kv, state_color, ScriptStatus, UiState};
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let (ctx, event_rx) = cli::prepare_session(&args)?;
    // The terminal belongs to the UI; diagnostics go to the session log.
    cli::init_tracing(LogTarget::File(ctx.paths.log()), "info")?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<OperatorCommand>();
    let state = UiState::for_session(&ctx.config, &ctx.paths.root);
    let done_tx = ctx.events.clone();

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_handle = std::thread::spawn(move || run_threaded(state, event_rx, cmd_tx));

    let res = orchestrator::run_controller(ctx, cmd_rx).await;
    let mut exit_messages = Vec::new();
    match &res {
        Ok(summary) => {
            let processed = orchestrator::process_run_completion(&args, summary);
            let _ = done_tx.send(SessionEvent::RunCompleted {
                summary: Box::new(processed.summary),
            });
            exit_messages = processed.export_messages;
        }
        Err(e) => {
            let _ = done_tx.send(SessionEvent::Info(crate::model::InfoEvent::Message(
                format!("Session failed: {e:#} (press q to exit)"),
            )));
        }
    }
    drop(done_tx);

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    // The alternate screen is gone; leave the paths where the operator can see them.
    for msg in exit_messages {
        eprintln!("{msg}");
    }
    res.map(|_| ())
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<SessionEvent>,
    cmd_tx: UnboundedSender<OperatorCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();

    let res = loop {
        // Drain events without blocking to keep UI responsive.
        while let Ok(ev) = event_rx.try_recv() {
            apply_event(&mut state, ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal.draw(|f| draw(f.area(), f, &state)).ok();
            last_tick = Instant::now();
        }

        // Poll input with a short timeout to avoid blocking the render loop.
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                let command = match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q'))
                    | (_, KeyCode::Esc)
                    | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(OperatorCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('a')) => Some(OperatorCommand::Arm),
                    (_, KeyCode::Char('d')) => Some(OperatorCommand::Disarm),
                    (_, KeyCode::Char('c')) => Some(OperatorCommand::Calibrate),
                    (_, KeyCode::Char('n')) => Some(OperatorCommand::NextCalibrationFrame),
                    (_, KeyCode::Char('r')) => Some(OperatorCommand::RunScript),
                    (_, KeyCode::Char('f')) => Some(OperatorCommand::JogForward),
                    (_, KeyCode::Char('b')) => Some(OperatorCommand::JogBackward),
                    (_, KeyCode::Char('j')) => {
                        state.continuous_jog = !state.continuous_jog;
                        Some(OperatorCommand::ToggleContinuousJog)
                    }
                    (_, KeyCode::Char('s')) => Some(OperatorCommand::Snapshot),
                    (_, KeyCode::Char('?')) => {
                        state.tab = 2;
                        None
                    }
                    (_, KeyCode::Tab) => {
                        state.tab = (state.tab + 1) % 3;
                        None
                    }
                    (_, KeyCode::Up) => {
                        state.subset_scroll = state.subset_scroll.saturating_sub(1);
                        None
                    }
                    (_, KeyCode::Down) => {
                        if state.subset_scroll + 1 < state.subsets.len() {
                            state.subset_scroll += 1;
                        }
                        None
                    }
                    _ => None,
                };
                if let Some(command) = command {
                    if state.session == SessionState::Shutdown {
                        state.info = "Session has ended; press q to exit".into();
                    } else {
                        let _ = cmd_tx.send(command);
                    }
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

fn apply_event(state: &mut UiState, ev: SessionEvent) {
    match ev {
        SessionEvent::StateChanged { state: next } => {
            if next == SessionState::Initializing {
                state.reset_traces();
            }
            if next != SessionState::Calibrating {
                state.calibration = None;
            }
            state.session = next;
            state.info = format!("State: {}", next.label());
        }
        SessionEvent::LiveFrame {
            sequence,
            width,
            height,
            mean_intensity,
        } => {
            state.live_sequence = sequence;
            state.frame_size = (width, height);
            state.mean_intensity = mean_intensity;
        }
        SessionEvent::SubsetLayout { subsets } => {
            state.info = format!("Tracking {} subsets", subsets.len());
            state.subsets = subsets;
            state.subset_scroll = 0;
        }
        SessionEvent::FrameCorrelated {
            index,
            failed,
            persisted,
            cycle_ms,
            subsets,
        } => {
            state.frames_correlated += 1;
            if failed {
                state.frames_failed += 1;
            }
            if !persisted && state.persist_frames {
                state.frames_unpersisted += 1;
            }
            state.last_cycle_ms = cycle_ms;
            UiState::push_series(
                &mut state.cycle_series,
                cycle_ms.round().clamp(0.0, 60_000.0) as u64,
            );
            state.subsets = subsets;
            if let Some((mean, _, _, _)) = crate::metrics::compute_metrics(&state.axis_values()) {
                UiState::push_point(&mut state.mean_points, index as f64, mean);
            }
        }
        SessionEvent::ScriptProgress {
            pc,
            len,
            iterator_count,
            loaded,
        } => {
            state.script = Some(ScriptStatus {
                pc,
                len,
                iterator_count,
                loaded,
            });
        }
        SessionEvent::SeriesDrawn { axis, series } => {
            state.info = format!("Plotted {} series (tab to view)", series.len());
            state.drawn = Some((axis, series));
        }
        SessionEvent::CalibrationProgress { captured, required } => {
            state.calibration = Some((captured, required));
        }
        SessionEvent::Telemetry(line) => UiState::push_log(&mut state.telemetry, line),
        SessionEvent::Info(info) => {
            let msg = info.to_message();
            UiState::push_log(&mut state.messages, msg.clone());
            state.info = msg;
        }
        SessionEvent::RunCompleted { summary } => {
            state.info = format!(
                "Session complete: {} frames, {} failed (press q to exit)",
                summary.frames_correlated, summary.frames_failed
            );
            state.last_summary = Some(*summary);
        }
    }
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![
        Line::from("Dashboard"),
        Line::from("Series"),
        Line::from("Help"),
    ])
    .select(state.tab)
    .block(Block::default().borders(Borders::ALL).title(Line::from(vec![
        Span::raw("dic-rig "),
        Span::styled(
            state.session.label(),
            Style::default().fg(state_color(state.session)),
        ),
    ])))
    .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        1 => charts::draw_series(chunks[1], f, state),
        _ => help::draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    // Small terminal: status and messages only.
    if area.height < 24 {
        return draw_dashboard_compact(area, f, state);
    }

    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(14), // Displacement chart + status
                Constraint::Min(0),     // Subset table + activity
                Constraint::Length(3),  // Info line
            ]
            .as_ref(),
        )
        .split(area);

    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
        .split(main[0]);
    draw_displacement_chart(top[0], f, state);
    draw_status(top[1], f, state);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)].as_ref())
        .split(main[1]);
    draw_subset_table(middle[0], f, state);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(5), Constraint::Min(0)].as_ref())
        .split(middle[1]);
    let cycle = Sparkline::default()
        .block(Block::default().borders(Borders::ALL).title(format!(
            "Cycle time (last {:.1} ms)",
            state.last_cycle_ms
        )))
        .data(&state.cycle_series)
        .style(Style::default().fg(Color::Cyan));
    f.render_widget(cycle, right[0]);
    draw_activity(right[1], f, state);

    draw_info(main[2], f, state);
}

fn draw_dashboard_compact(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)].as_ref())
        .split(area);
    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
        .split(rows[0]);
    draw_status(cols[0], f, state);
    draw_activity(cols[1], f, state);
    draw_info(rows[1], f, state);
}

fn draw_displacement_chart(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let title = Line::from(vec![
        Span::raw("Mean "),
        Span::styled(state.axis.label(), Style::default().fg(Color::Green)),
        Span::raw(" displacement"),
    ]);
    if state.mean_points.is_empty() {
        let waiting = match state.session {
            SessionState::Running => "Waiting for the first correlated frame...",
            _ => "Press a to arm and start correlating.",
        };
        let empty =
            Paragraph::new(waiting).block(Block::default().borders(Borders::ALL).title(title));
        f.render_widget(empty, area);
        return;
    }

    let ds = Dataset::default()
        .graph_type(GraphType::Line)
        .marker(symbols::Marker::Braille)
        .style(Style::default().fg(Color::Green))
        .data(&state.mean_points);
    charts::render_chart_with_metrics_inside(
        f,
        charts::ChartRenderParams {
            area,
            datasets: vec![ds],
            x_axis: Axis::default()
                .title("frame")
                .bounds(charts::x_bounds(state.mean_points.iter())),
            y_axis: Axis::default()
                .title("px")
                .bounds(charts::y_bounds(state.mean_points.iter())),
            title,
            metrics: crate::metrics::compute_metrics(&state.axis_values()),
            color: Color::Green,
        },
    );
}

fn draw_status(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let mut lines: Vec<Line<'static>> = vec![Line::from(vec![
        Span::styled("State: ", Style::default().fg(Color::Gray)),
        Span::styled(
            state.session.label(),
            Style::default()
                .fg(state_color(state.session))
                .add_modifier(Modifier::BOLD),
        ),
    ])];
    push_wrapped_status_kv(&mut lines, "Session", &state.session_id, area.width);
    push_wrapped_status_kv(&mut lines, "Capture", &state.capture_label, area.width);
    push_wrapped_status_kv(&mut lines, "Actuator", &state.actuator_label, area.width);
    if state.live_sequence > 0 {
        push_wrapped_status_kv(
            &mut lines,
            "Live",
            &format!(
                "#{} {}x{} mean {:.1}",
                state.live_sequence, state.frame_size.0, state.frame_size.1, state.mean_intensity
            ),
            area.width,
        );
    }
    push_wrapped_status_kv(
        &mut lines,
        "Frames",
        &format!(
            "{} correlated, {} failed, {} not saved",
            state.frames_correlated, state.frames_failed, state.frames_unpersisted
        ),
        area.width,
    );
    let script = match (&state.script_label, state.script) {
        (None, _) => "none".to_string(),
        (Some(name), None) => format!("{name} (ready, press r)"),
        (Some(name), Some(s)) if !s.loaded => format!("{name} (finished)"),
        (Some(name), Some(s)) => format!(
            "{name} line {}/{} repeat {}",
            (s.pc + 1).min(s.len),
            s.len,
            s.iterator_count
        ),
    };
    push_wrapped_status_kv(&mut lines, "Script", &script, area.width);
    if let Some((captured, required)) = state.calibration {
        push_wrapped_status_kv(
            &mut lines,
            "Calibration",
            &format!("{captured}/{required} target pairs"),
            area.width,
        );
    }
    if state.continuous_jog {
        lines.push(Line::from(Span::styled(
            "Continuous jog ON",
            Style::default().fg(Color::Yellow),
        )));
    }
    if let Some(summary) = state.last_summary.as_ref() {
        push_wrapped_status_kv(
            &mut lines,
            "Summary",
            &format!(
                "{} ({} samples)",
                if summary.success { "ok" } else { "failures" },
                summary.samples
            ),
            area.width,
        );
    }
    push_wrapped_status_kv(&mut lines, "Output", &state.output_dir, area.width);

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(p, area);
}

fn draw_subset_table(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let header = Line::from(Span::styled(
        format!(
            "{:>4} {:>8} {:>8} {:>9} {:>9} {:>9}",
            "#", "x", "y", "u", "v", "w"
        ),
        Style::default().fg(Color::Gray).add_modifier(Modifier::BOLD),
    ));
    let mut lines = vec![header];
    let visible = area.height.saturating_sub(3) as usize;
    for s in state.subsets.iter().skip(state.subset_scroll).take(visible) {
        lines.push(Line::from(format!(
            "{:>4} {:>8.1} {:>8.1} {:>9.4} {:>9.4} {:>9.4}",
            s.index, s.x, s.y, s.displacement_x, s.displacement_y, s.displacement_z
        )));
    }
    if state.subsets.is_empty() {
        lines.push(Line::from("No subsets until the rig is armed."));
    }
    let title = format!("Subsets ({})", state.subsets.len());
    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(p, area);
}

fn draw_activity(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let visible = area.height.saturating_sub(2) as usize;
    let mut entries: Vec<Line> = state
        .messages
        .iter()
        .map(|m| Line::from(m.as_str()))
        .chain(state.telemetry.iter().map(|t| {
            Line::from(vec![
                Span::styled("< ", Style::default().fg(Color::Magenta)),
                Span::raw(t.as_str()),
            ])
        }))
        .collect();
    let skip = entries.len().saturating_sub(visible);
    let entries = entries.split_off(skip);
    let p = Paragraph::new(entries).block(Block::default().borders(Borders::ALL).title("Activity"));
    f.render_widget(p, area);
}

fn draw_info(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let keys = Line::from(vec![
        Span::styled("a", Style::default().fg(Color::Magenta)),
        Span::raw(" arm  "),
        Span::styled("d", Style::default().fg(Color::Magenta)),
        Span::raw(" disarm  "),
        Span::styled("c", Style::default().fg(Color::Magenta)),
        Span::raw(" calibrate  "),
        Span::styled("r", Style::default().fg(Color::Magenta)),
        Span::raw(" script  "),
        Span::styled("?", Style::default().fg(Color::Magenta)),
        Span::raw(" help  "),
        Span::styled("q", Style::default().fg(Color::Magenta)),
        Span::raw(" quit  "),
        Span::raw(state.info.clone()),
    ]);
    let p = Paragraph::new(keys).block(Block::default().borders(Borders::ALL));
    f.render_widget(p, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InfoEvent, SubsetRecord};

    fn correlated(index: u64, dz: f64, failed: bool) -> SessionEvent {
        let mut s = SubsetRecord::new(0, 10.0, 10.0, 21);
        s.displacement_z = dz;
        SessionEvent::FrameCorrelated {
            index,
            failed,
            persisted: !failed,
            cycle_ms: 12.4,
            subsets: vec![s],
        }
    }

    #[test]
    fn correlated_frames_feed_counters_and_chart() {
        let mut state = UiState::default();
        apply_event(
            &mut state,
            SessionEvent::StateChanged {
                state: SessionState::Running,
            },
        );
        apply_event(&mut state, correlated(1, 0.5, false));
        apply_event(&mut state, correlated(2, 1.5, true));

        assert_eq!(state.session, SessionState::Running);
        assert_eq!(state.frames_correlated, 2);
        assert_eq!(state.frames_failed, 1);
        assert_eq!(state.frames_unpersisted, 1);
        assert_eq!(state.mean_points, vec![(1.0, 0.5), (2.0, 1.5)]);
        assert_eq!(state.cycle_series, vec![12, 12]);
    }

    #[test]
    fn rearming_clears_traces_but_keeps_the_log() {
        let mut state = UiState::default();
        apply_event(&mut state, correlated(1, 0.5, false));
        apply_event(
            &mut state,
            SessionEvent::Info(InfoEvent::Message("Script finished".into())),
        );
        apply_event(
            &mut state,
            SessionEvent::StateChanged {
                state: SessionState::Initializing,
            },
        );
        assert!(state.mean_points.is_empty());
        assert!(state.subsets.is_empty());
        assert_eq!(state.messages, vec!["Script finished".to_string()]);
        assert_eq!(state.info, "State: initializing");
    }

    #[test]
    fn calibration_progress_is_dropped_after_leaving_calibration() {
        let mut state = UiState::default();
        apply_event(
            &mut state,
            SessionEvent::CalibrationProgress {
                captured: 3,
                required: 16,
            },
        );
        assert_eq!(state.calibration, Some((3, 16)));
        apply_event(
            &mut state,
            SessionEvent::StateChanged {
                state: SessionState::LiveView,
            },
        );
        assert_eq!(state.calibration, None);
    }
}
