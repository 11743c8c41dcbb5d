//! Loss-curve plot: a self-contained HTML page with an inline SVG chart

use super::{MetricRecord, MetricsRecorder, Split, EVAL_LOSS, TRAIN_LOSS};
use crate::error::HarnessResult;
use log::info;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const WIDTH: f64 = 800.0;
const HEIGHT: f64 = 420.0;
const MARGIN: f64 = 50.0;

/// `output_dir/plots/<model>_loss.html`
pub fn plot_path(output_dir: &Path, model_slug: &str) -> PathBuf {
    output_dir.join("plots").join(format!("{model_slug}_loss.html"))
}

fn series(records: &[MetricRecord], split: Split, name: &str) -> Vec<(f64, f64)> {
    records
        .iter()
        .filter(|r| r.split == split && r.name == name && r.value.is_finite())
        .map(|r| (r.step as f64, r.value))
        .collect()
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Render train and eval loss curves
pub fn render_html(records: &[MetricRecord], title: &str) -> String {
    let lines = [
        ("train loss", "#1f77b4", series(records, Split::Train, TRAIN_LOSS)),
        ("eval loss", "#d62728", series(records, Split::Eval, EVAL_LOSS)),
    ];
    let points = lines.iter().flat_map(|(_, _, s)| s.iter());
    let (mut x_max, mut y_min, mut y_max) = (1.0f64, f64::INFINITY, f64::NEG_INFINITY);
    for &(x, y) in points {
        x_max = x_max.max(x);
        y_min = y_min.min(y);
        y_max = y_max.max(y);
    }
    if !y_min.is_finite() {
        (y_min, y_max) = (0.0, 1.0);
    }
    if (y_max - y_min).abs() < 1e-12 {
        y_max = y_min + 1.0;
    }
    let sx = |x: f64| MARGIN + x / x_max * (WIDTH - 2.0 * MARGIN);
    let sy = |y: f64| HEIGHT - MARGIN - (y - y_min) / (y_max - y_min) * (HEIGHT - 2.0 * MARGIN);

    let mut svg = String::new();
    let _ = write!(
        svg,
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{WIDTH}" height="{HEIGHT}" font-family="sans-serif" font-size="12">"#
    );
    let _ = write!(
        svg,
        r##"<rect width="100%" height="100%" fill="#fff"/><line x1="{m}" y1="{b}" x2="{r}" y2="{b}" stroke="#333"/><line x1="{m}" y1="{m}" x2="{m}" y2="{b}" stroke="#333"/>"##,
        m = MARGIN,
        b = HEIGHT - MARGIN,
        r = WIDTH - MARGIN,
    );
    let _ = write!(
        svg,
        r#"<text x="{}" y="{}" text-anchor="middle">step (max {x_max})</text><text x="8" y="{}">{y_max:.3}</text><text x="8" y="{}">{y_min:.3}</text>"#,
        WIDTH / 2.0,
        HEIGHT - 12.0,
        MARGIN,
        HEIGHT - MARGIN,
    );
    for (i, (label, color, pts)) in lines.iter().enumerate() {
        if pts.is_empty() {
            continue;
        }
        let coords: Vec<String> = pts
            .iter()
            .map(|&(x, y)| format!("{:.1},{:.1}", sx(x), sy(y)))
            .collect();
        let _ = write!(
            svg,
            r#"<polyline fill="none" stroke="{color}" stroke-width="2" points="{}"/>"#,
            coords.join(" ")
        );
        for &(x, y) in pts {
            let _ = write!(
                svg,
                r#"<circle cx="{:.1}" cy="{:.1}" r="2.5" fill="{color}"><title>step {x}: {y:.4}</title></circle>"#,
                sx(x),
                sy(y)
            );
        }
        let ly = MARGIN + 16.0 * i as f64;
        let _ = write!(
            svg,
            r#"<text x="{}" y="{ly}" fill="{color}">{label}</text>"#,
            WIDTH - MARGIN - 80.0
        );
    }
    svg.push_str("</svg>");

    let title = escape(title);
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title></head>\n<body><h2>{title}</h2>\n{svg}\n</body></html>\n"
    )
}

pub fn write_plot(path: &Path, records: &[MetricRecord], title: &str) -> HarnessResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, render_html(records, title))?;
    info!("Wrote loss plot {}", path.display());
    Ok(())
}

/// Rebuild a plot from an existing `metrics.log`
pub fn plot_from_log(log: &Path, out: &Path, title: &str) -> HarnessResult<usize> {
    let records = MetricsRecorder::read_log(log)?;
    write_plot(out, &records, title)?;
    Ok(records.len())
}
