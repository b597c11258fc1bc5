//! SVG report rendering
//!
//! Hand-written SVG so reports open in any browser without a plotting stack.

use std::fs;
use std::path::Path;

/// Pixels per figure unit (`--figure_width 20` renders 2000px wide)
pub const PIXELS_PER_UNIT: f64 = 100.0;

const MARGIN: f64 = 20.0;
const TITLE_HEIGHT: f64 = 40.0;
const PANEL_TITLE_HEIGHT: f64 = 28.0;
const CELL_LABEL_HEIGHT: f64 = 18.0;

const HISTORY_WIDTH: f64 = 800.0;
const HISTORY_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 80.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_PRIMARY: &str = "#3498db";
const COLOR_SECONDARY: &str = "#2ecc71";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

/// One phase worth of one-vs-rest matrices
#[derive(Debug, Clone)]
pub struct ConfusionPanel {
    pub title: String,
    /// `[[tn, fp], [fn, tp]]` per class
    pub matrices: Vec<[[usize; 2]; 2]>,
}

/// A data series for the history chart
#[derive(Debug, Clone)]
pub struct DataSeries {
    pub name: String,
    pub points: Vec<(f64, f64)>,
    pub color: String,
}

impl DataSeries {
    pub fn primary(name: &str, points: Vec<(f64, f64)>) -> Self {
        Self { name: name.to_string(), points, color: COLOR_PRIMARY.to_string() }
    }

    pub fn secondary(name: &str, points: Vec<(f64, f64)>) -> Self {
        Self { name: name.to_string(), points, color: COLOR_SECONDARY.to_string() }
    }
}

/// Render the multi-label confusion report.
///
/// Panels are stacked vertically, one per phase; inside a panel each class
/// gets a 2x2 heat-mapped grid with its counts.
pub fn render_confusion_report(
    title: &str,
    panels: &[ConfusionPanel],
    class_names: &[String],
    figure_width: u32,
    figure_height: u32,
) -> String {
    let width = figure_width.max(1) as f64 * PIXELS_PER_UNIT;
    let height = figure_height.max(1) as f64 * PIXELS_PER_UNIT;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        width, height, width, height
    ));
    svg.push_str(&format!(r#"<rect width="{}" height="{}" fill="white"/>"#, width, height));
    svg.push_str(&format!(
        r#"<text x="{}" y="28" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        width / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    ));

    if panels.is_empty() {
        svg.push_str("</svg>");
        return svg;
    }

    let panel_height = (height - TITLE_HEIGHT - MARGIN) / panels.len() as f64;
    let num_classes = class_names.len().max(1);
    let cell_width = (width - 2.0 * MARGIN) / num_classes as f64;

    for (p, panel) in panels.iter().enumerate() {
        let top = TITLE_HEIGHT + p as f64 * panel_height;
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="15" font-weight="bold" fill="{}">{}</text>"#,
            MARGIN,
            top + 18.0,
            COLOR_TEXT,
            escape_xml(&panel.title)
        ));

        let grid_top = top + PANEL_TITLE_HEIGHT + CELL_LABEL_HEIGHT;
        let available = panel_height - PANEL_TITLE_HEIGHT - CELL_LABEL_HEIGHT - MARGIN;
        let side = (cell_width * 0.85).min(available).max(8.0);
        let quad = side / 2.0;

        for (c, matrix) in panel.matrices.iter().enumerate() {
            let left = MARGIN + c as f64 * cell_width + (cell_width - side) / 2.0;
            let name = class_names.get(c).map(String::as_str).unwrap_or("?");

            svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
                left + quad,
                grid_top - 5.0,
                COLOR_TEXT,
                escape_xml(name)
            ));

            let max = matrix.iter().flatten().copied().max().unwrap_or(0).max(1) as f64;
            for (r, row) in matrix.iter().enumerate() {
                for (k, &count) in row.iter().enumerate() {
                    let x = left + k as f64 * quad;
                    let y = grid_top + r as f64 * quad;
                    let intensity = count as f64 / max;
                    svg.push_str(&format!(
                        r#"<rect x="{}" y="{}" width="{}" height="{}" fill="{}" stroke="{}" stroke-width="1"/>"#,
                        x,
                        y,
                        quad,
                        quad,
                        heat_color(intensity),
                        COLOR_AXIS
                    ));
                    let text_color = if intensity > 0.6 { "white" } else { COLOR_TEXT };
                    svg.push_str(&format!(
                        r#"<text x="{}" y="{}" text-anchor="middle" dominant-baseline="middle" font-family="Arial, sans-serif" font-size="{}" fill="{}">{}</text>"#,
                        x + quad / 2.0,
                        y + quad / 2.0,
                        (quad / 3.0).clamp(6.0, 16.0),
                        text_color,
                        count
                    ));
                }
            }
        }
    }

    svg.push_str("</svg>");
    svg
}

/// Render and write the confusion report
pub fn save_confusion_report(
    title: &str,
    panels: &[ConfusionPanel],
    class_names: &[String],
    figure_width: u32,
    figure_height: u32,
    output_path: &Path,
) -> std::io::Result<()> {
    let svg = render_confusion_report(title, panels, class_names, figure_width, figure_height);
    fs::write(output_path, svg)
}

/// Generate a per-epoch line chart with values in `[0, 1]`
pub fn generate_history_chart(
    title: &str,
    y_label: &str,
    series: &[DataSeries],
    output_path: &Path,
) -> std::io::Result<()> {
    let plot_width = HISTORY_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = HISTORY_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;

    let x_max = series
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.0))
        .fold(1.0f64, f64::max);
    let x_min = series
        .iter()
        .flat_map(|s| s.points.iter().map(|p| p.0))
        .fold(x_max, f64::min);
    let x_span = if x_max > x_min { x_max - x_min } else { 1.0 };

    let to_x = |x: f64| MARGIN_LEFT + (x - x_min) / x_span * plot_width;
    let to_y = |y: f64| MARGIN_TOP + plot_height - y.clamp(0.0, 1.0) * plot_height;

    let mut svg = String::new();
    svg.push_str(&format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {} {}" width="{}" height="{}">"#,
        HISTORY_WIDTH, HISTORY_HEIGHT, HISTORY_WIDTH, HISTORY_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<rect width="{}" height="{}" fill="white"/>"#,
        HISTORY_WIDTH, HISTORY_HEIGHT
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="Arial, sans-serif" font-size="18" font-weight="bold" fill="{}">{}</text>"#,
        HISTORY_WIDTH / 2.0,
        COLOR_TEXT,
        escape_xml(title)
    ));

    for i in 0..=5 {
        let value = i as f64 / 5.0;
        let y = to_y(value);
        svg.push_str(&format!(
            r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT,
            y,
            MARGIN_LEFT + plot_width,
            y,
            COLOR_GRID
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="Arial, sans-serif" font-size="12" fill="{}">{:.1}</text>"#,
            MARGIN_LEFT - 10.0,
            y + 4.0,
            COLOR_TEXT,
            value
        ));
    }

    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        MARGIN_LEFT + plot_width,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<line x1="{}" y1="{}" x2="{}" y2="{}" stroke="{}" stroke-width="2"/>"#,
        MARGIN_LEFT,
        MARGIN_TOP,
        MARGIN_LEFT,
        MARGIN_TOP + plot_height,
        COLOR_AXIS
    ));
    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}">Epoch</text>"#,
        MARGIN_LEFT + plot_width / 2.0,
        HISTORY_HEIGHT - 20.0,
        COLOR_TEXT
    ));
    svg.push_str(&format!(
        r#"<text x="20" y="{}" text-anchor="middle" font-family="Arial, sans-serif" font-size="14" fill="{}" transform="rotate(-90 20 {})">{}</text>"#,
        HISTORY_HEIGHT / 2.0,
        COLOR_TEXT,
        HISTORY_HEIGHT / 2.0,
        escape_xml(y_label)
    ));

    for s in series.iter().filter(|s| !s.points.is_empty()) {
        let path: Vec<String> = s
            .points
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                format!("{} {} {}", if i == 0 { "M" } else { "L" }, to_x(x), to_y(y))
            })
            .collect();
        svg.push_str(&format!(
            r#"<path d="{}" fill="none" stroke="{}" stroke-width="3"/>"#,
            path.join(" "),
            s.color
        ));
        for &(x, y) in &s.points {
            svg.push_str(&format!(
                r#"<circle cx="{}" cy="{}" r="4" fill="{}" stroke="white" stroke-width="2"/>"#,
                to_x(x),
                to_y(y),
                s.color
            ));
        }
    }

    let mut legend_y = MARGIN_TOP + 10.0;
    for s in series {
        svg.push_str(&format!(
            r#"<rect x="{}" y="{}" width="15" height="15" fill="{}"/>"#,
            HISTORY_WIDTH - MARGIN_RIGHT - 100.0,
            legend_y,
            s.color
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="Arial, sans-serif" font-size="12" fill="{}">{}</text>"#,
            HISTORY_WIDTH - MARGIN_RIGHT - 80.0,
            legend_y + 12.0,
            COLOR_TEXT,
            escape_xml(&s.name)
        ));
        legend_y += 25.0;
    }

    svg.push_str("</svg>");
    fs::write(output_path, svg)
}

/// White to blue ramp
fn heat_color(intensity: f64) -> String {
    let t = intensity.clamp(0.0, 1.0);
    let r = (255.0 - t * (255.0 - 31.0)).round() as u8;
    let g = (255.0 - t * (255.0 - 78.0)).round() as u8;
    let b = (255.0 - t * (255.0 - 121.0)).round() as u8;
    format!("#{:02x}{:02x}{:02x}", r, g, b)
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn panel(title: &str) -> ConfusionPanel {
        ConfusionPanel {
            title: title.to_string(),
            matrices: vec![[[3, 1], [0, 6]], [[6, 0], [1, 3]]],
        }
    }

    #[test]
    fn test_report_uses_figure_size() {
        let classes = vec!["cat".to_string(), "dog".to_string()];
        let svg = render_confusion_report("run", &[panel("test")], &classes, 20, 8);

        assert!(svg.starts_with("<svg"));
        assert!(svg.contains(r#"width="2000""#));
        assert!(svg.contains(r#"height="800""#));
        assert!(svg.ends_with("</svg>"));
    }

    #[test]
    fn test_report_contains_every_panel_and_class() {
        let classes = vec!["cat".to_string(), "dog".to_string()];
        let panels = vec![panel("train"), panel("test"), panel("valid")];
        let svg = render_confusion_report("run", &panels, &classes, 10, 6);

        for name in ["train", "test", "valid", "cat", "dog"] {
            assert!(svg.contains(name), "missing {}", name);
        }
        // 3 panels x 2 classes x 4 quadrants
        assert_eq!(svg.matches("<rect").count(), 1 + 3 * 2 * 4);
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a<b>&\"c\""), "a&lt;b&gt;&amp;&quot;c&quot;");
    }

    #[test]
    fn test_heat_color_endpoints() {
        assert_eq!(heat_color(0.0), "#ffffff");
        assert_eq!(heat_color(1.0), "#1f4e79");
    }

    #[test]
    fn test_history_chart_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.svg");
        let series = vec![
            DataSeries::primary("train", vec![(1.0, 0.5), (2.0, 0.7)]),
            DataSeries::secondary("test", vec![(1.0, 0.4), (2.0, 0.6)]),
        ];
        generate_history_chart("accuracy", "Accuracy", &series, &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("<path"));
        assert!(content.contains("train"));
    }
}
