use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key_line(key: &'static str, action: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(action),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let p = Paragraph::new(vec![
        Line::from("Session:"),
        key_line("a", "Arm: take the reference pair and start correlating"),
        key_line("d", "Disarm: stop the pipeline and return to live view"),
        key_line("q / Esc", "Quit (Ctrl-C works too)"),
        Line::from(""),
        Line::from("Calibration:"),
        key_line("c", "Start calibration (live view only)"),
        key_line("n", "Capture the next calibration target pair"),
        Line::from(""),
        Line::from("Actuator:"),
        key_line("r", "Run the loaded script (while armed)"),
        key_line("f / b", "Jog one step forward / backward"),
        key_line("j", "Toggle continuous forward jog"),
        Line::from(""),
        Line::from("View:"),
        key_line("s", "Save the live frame pair as a test image"),
        key_line("↑/↓", "Scroll the subset table"),
        key_line("tab", "Switch tabs"),
        key_line("?", "Show this help"),
        Line::from(""),
        Line::from(vec![
            Span::raw("Logs are written to "),
            Span::styled("session.log", Style::default().fg(Color::Cyan)),
            Span::raw(" in the session directory (RUST_LOG sets the level)."),
        ]),
    ])
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
