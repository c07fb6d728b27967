use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::Color,
    style::Style,
    symbols,
    text::{Line, Span},
    widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph},
    Frame,
};

use super::state::UiState;

pub const SERIES_COLORS: [Color; 8] = [
    Color::Green,
    Color::Cyan,
    Color::Magenta,
    Color::Yellow,
    Color::Blue,
    Color::LightRed,
    Color::LightGreen,
    Color::LightCyan,
];

pub struct ChartRenderParams<'a> {
    pub area: Rect,
    pub datasets: Vec<Dataset<'a>>,
    pub x_axis: Axis<'a>,
    pub y_axis: Axis<'a>,
    pub title: Line<'a>,
    pub metrics: Option<(f64, f64, f64, f64)>,
    pub color: Color,
}

/// avg / med / p25 / p75 footer shown under a chart.
fn render_metrics_text<'a>(metrics: (f64, f64, f64, f64), color: Color) -> Line<'a> {
    let (mean_val, median_val, p25_val, p75_val) = metrics;
    let mut spans = Vec::new();
    for (label, v) in [
        ("avg", mean_val),
        ("med", median_val),
        ("p25", p25_val),
        ("p75", p75_val),
    ] {
        if !spans.is_empty() {
            spans.push(Span::raw(" "));
        }
        spans.push(Span::styled(label, Style::default().fg(Color::Gray)));
        spans.push(Span::styled(format!(" {v:.3}"), Style::default().fg(color)));
    }
    Line::from(spans)
}

/// Render a line chart with its metrics footer inside one bordered box.
pub fn render_chart_with_metrics_inside(f: &mut Frame, params: ChartRenderParams) {
    let area = params.area;
    // Get inner area (accounting for borders)
    let inner = if area.width > 2 && area.height > 2 {
        Rect {
            x: area.x + 1,
            y: area.y + 1,
            width: area.width.saturating_sub(2),
            height: area.height.saturating_sub(2),
        }
    } else {
        area
    };

    let chart_metrics = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(4), Constraint::Length(1)].as_ref())
        .split(inner);

    let chart = Chart::new(params.datasets)
        .x_axis(params.x_axis)
        .y_axis(params.y_axis);
    f.render_widget(chart, chart_metrics[0]);

    if let Some(metrics) = params.metrics {
        f.render_widget(
            Paragraph::new(render_metrics_text(metrics, params.color)).alignment(Alignment::Center),
            chart_metrics[1],
        );
    }

    let block = Block::default().borders(Borders::ALL).title(params.title);
    f.render_widget(block, area);
}

/// Symmetric-ish y bounds with a little headroom; flat traces still get height.
pub fn y_bounds<'a>(points: impl Iterator<Item = &'a (f64, f64)>) -> [f64; 2] {
    let (lo, hi) = points.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (_, y)| {
        (lo.min(*y), hi.max(*y))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return [-1.0, 1.0];
    }
    let pad = ((hi - lo) * 0.1).max(0.05);
    [lo - pad, hi + pad]
}

pub fn x_bounds<'a>(points: impl Iterator<Item = &'a (f64, f64)>) -> [f64; 2] {
    let (lo, hi) = points.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), (x, _)| {
        (lo.min(*x), hi.max(*x))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return [0.0, 1.0];
    }
    [lo, hi.max(lo + 1.0)]
}

/// Sample series handed over by the last `DRAW`, one trace per subset.
pub fn draw_series(area: Rect, f: &mut Frame, state: &UiState) {
    let Some((axis, series)) = state.drawn.as_ref() else {
        let empty = Paragraph::new("No series plotted yet. Scripts plot their samples on DRAW.")
            .block(Block::default().borders(Borders::ALL).title("Series"));
        f.render_widget(empty, area);
        return;
    };

    let datasets: Vec<Dataset> = series
        .iter()
        .enumerate()
        .filter(|(_, points)| !points.is_empty())
        .map(|(idx, points)| {
            Dataset::default()
                .name(format!("#{idx}"))
                .graph_type(GraphType::Line)
                .marker(symbols::Marker::Braille)
                .style(Style::default().fg(SERIES_COLORS[idx % SERIES_COLORS.len()]))
                .data(points)
        })
        .collect();

    let all = || series.iter().flatten();
    let finals: Vec<f64> = series
        .iter()
        .filter_map(|points| points.last().map(|(_, y)| *y))
        .collect();
    let title = Line::from(vec![
        Span::raw("Sampled "),
        Span::styled(axis.label(), Style::default().fg(Color::Yellow)),
        Span::raw(format!(
            " displacement ({} subsets, {} samples)",
            series.len(),
            series.first().map_or(0, Vec::len)
        )),
    ]);
    render_chart_with_metrics_inside(
        f,
        ChartRenderParams {
            area,
            datasets,
            x_axis: Axis::default().title("sample").bounds(x_bounds(all())),
            y_axis: Axis::default().title("px").bounds(y_bounds(all())),
            title,
            metrics: crate::metrics::compute_metrics(&finals),
            color: Color::Yellow,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_pad_flat_and_empty_traces() {
        let flat = [(0.0, 2.0), (1.0, 2.0)];
        let [lo, hi] = y_bounds(flat.iter());
        assert!(lo < 2.0 && hi > 2.0);
        assert_eq!(y_bounds([].iter()), [-1.0, 1.0]);
        assert_eq!(x_bounds(flat.iter()), [0.0, 1.0]);
        assert_eq!(x_bounds([(3.0, 0.0)].iter()), [3.0, 4.0]);
    }
}
