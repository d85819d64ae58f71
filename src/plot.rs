//! Training curve rendering.
//!
//! `.svg` targets get a vector chart with title, axes and legend. Every other
//! extension is rasterised with `image` and encoded in the format the extension
//! names.

use std::{
    fmt::{self, Write as _},
    fs,
    path::Path,
};

use image::{Rgb, RgbImage};

use crate::{
    error::{Error, Result},
    training::TrainingHistory,
};

const WIDTH: u32 = 800;
const HEIGHT: u32 = 500;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 40.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 70.0;

const BACKGROUND: [u8; 3] = [255, 255, 255];
const PANEL: [u8; 3] = [235, 235, 235];
const GRID: [u8; 3] = [255, 255, 255];
const TEXT: &str = "#4d4d4d";

struct Series<'a> {
    name: &'static str,
    color: [u8; 3],
    values: &'a [f64],
}

fn series(history: &TrainingHistory) -> [Series<'_>; 4] {
    [
        Series {
            name: "train_loss",
            color: [226, 74, 51],
            values: &history.loss,
        },
        Series {
            name: "val_loss",
            color: [52, 138, 189],
            values: &history.val_loss,
        },
        Series {
            name: "train_acc",
            color: [152, 142, 213],
            values: &history.accuracy,
        },
        Series {
            name: "val_acc",
            color: [119, 119, 119],
            values: &history.val_accuracy,
        },
    ]
}

/// Maps epochs and values into pixel space.
struct Frame {
    epochs: usize,
    y_max: f64,
}

impl Frame {
    fn new(history: &TrainingHistory) -> Self {
        let y_max = series(history)
            .iter()
            .flat_map(|series| series.values.iter().copied())
            .filter(|value| value.is_finite())
            .fold(1.0, f64::max);

        Self {
            epochs: history.epochs(),
            y_max,
        }
    }

    fn plot_width(&self) -> f64 {
        WIDTH as f64 - MARGIN_LEFT - MARGIN_RIGHT
    }

    fn plot_height(&self) -> f64 {
        HEIGHT as f64 - MARGIN_TOP - MARGIN_BOTTOM
    }

    fn x(&self, epoch: usize) -> f64 {
        let span = self.epochs.saturating_sub(1).max(1) as f64;
        MARGIN_LEFT + epoch as f64 / span * self.plot_width()
    }

    fn y(&self, value: f64) -> f64 {
        let value = if value.is_finite() { value.clamp(0.0, self.y_max) } else { 0.0 };
        MARGIN_TOP + self.plot_height() - value / self.y_max * self.plot_height()
    }
}

/// Draws loss and accuracy per epoch to `path`.
pub fn render(history: &TrainingHistory, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let is_svg = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("svg"));

    if is_svg {
        fs::write(path, render_svg(history)?)?;
        Ok(())
    } else {
        render_raster(history)
            .save(path)
            .map_err(|err| Error::Plot(format!("{}: {err}", path.display())))
    }
}

fn hex(color: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", color[0], color[1], color[2])
}

pub fn render_svg(history: &TrainingHistory) -> Result<String> {
    let mut svg = String::new();
    write_svg(&mut svg, history).map_err(|err| Error::Plot(err.to_string()))?;
    Ok(svg)
}

/// A `<text>` element in the chart's font; `attributes` is appended verbatim.
fn text(
    svg: &mut String,
    (x, y): (f64, f64),
    size: u32,
    attributes: &str,
    content: impl fmt::Display,
) -> fmt::Result {
    write!(
        svg,
        r#"<text x="{x}" y="{y}" font-family="sans-serif" font-size="{size}" fill="{TEXT}""#
    )?;
    write!(svg, r#"{attributes}>{content}</text>"#)
}

fn write_svg(svg: &mut String, history: &TrainingHistory) -> fmt::Result {
    let frame = Frame::new(history);

    write!(svg, r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {WIDTH} {HEIGHT}" "#)?;
    write!(svg, r#"width="{WIDTH}" height="{HEIGHT}">"#)?;
    write!(svg, r#"<rect width="{WIDTH}" height="{HEIGHT}" fill="{}"/>"#, hex(BACKGROUND))?;
    write!(
        svg,
        r#"<rect x="{MARGIN_LEFT}" y="{MARGIN_TOP}" width="{}" height="{}" fill="{}"/>"#,
        frame.plot_width(),
        frame.plot_height(),
        hex(PANEL)
    )?;

    for tick in 0..=5 {
        let value = frame.y_max * tick as f64 / 5.0;
        let y = frame.y(value);
        write!(
            svg,
            r#"<line x1="{MARGIN_LEFT}" y1="{y}" x2="{}" y2="{y}" stroke="{}" stroke-width="1"/>"#,
            MARGIN_LEFT + frame.plot_width(),
            hex(GRID)
        )?;
        text(
            svg,
            (MARGIN_LEFT - 8.0, y + 4.0),
            12,
            r#" text-anchor="end""#,
            format_args!("{value:.2}"),
        )?;
    }

    let axis_y = MARGIN_TOP + frame.plot_height() + 18.0;
    for epoch in 0..frame.epochs {
        text(svg, (frame.x(epoch), axis_y), 12, r#" text-anchor="middle""#, epoch)?;
    }

    text(
        svg,
        (WIDTH as f64 / 2.0, 35.0),
        18,
        r#" text-anchor="middle""#,
        "Training Loss and Accuracy on Dataset",
    )?;
    text(
        svg,
        (MARGIN_LEFT + frame.plot_width() / 2.0, HEIGHT as f64 - 20.0),
        14,
        r#" text-anchor="middle""#,
        "Epoch #",
    )?;
    let middle = HEIGHT as f64 / 2.0;
    text(
        svg,
        (20.0, middle),
        14,
        &format!(r#" text-anchor="middle" transform="rotate(-90 20 {middle})""#),
        "Loss | Accuracy",
    )?;

    for series in series(history) {
        let points: Vec<(f64, f64)> = series
            .values
            .iter()
            .enumerate()
            .map(|(epoch, &value)| (frame.x(epoch), frame.y(value)))
            .collect();
        let color = hex(series.color);

        let polyline: Vec<String> = points
            .iter()
            .map(|(x, y)| format!("{x:.2},{y:.2}"))
            .collect();
        write!(
            svg,
            r#"<polyline points="{}" fill="none" stroke="{color}" stroke-width="2"/>"#,
            polyline.join(" ")
        )?;
        for (cx, cy) in &points {
            write!(svg, r#"<circle cx="{cx:.2}" cy="{cy:.2}" r="3" fill="{color}"/>"#)?;
        }
    }

    // legend in the lower left corner
    let mut legend_y = MARGIN_TOP + frame.plot_height() - 4.0 * 20.0 - 10.0;
    for series in series(history) {
        write!(
            svg,
            r#"<rect x="{}" y="{legend_y}" width="14" height="3" fill="{}"/>"#,
            MARGIN_LEFT + 12.0,
            hex(series.color)
        )?;
        text(svg, (MARGIN_LEFT + 32.0, legend_y + 5.0), 12, "", series.name)?;
        legend_y += 20.0;
    }

    svg.push_str("</svg>");
    Ok(())
}

fn put(image: &mut RgbImage, x: i64, y: i64, color: [u8; 3]) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, Rgb(color));
    }
}

fn fill_rect(image: &mut RgbImage, x0: f64, y0: f64, x1: f64, y1: f64, color: [u8; 3]) {
    for y in y0.round() as i64..=y1.round() as i64 {
        for x in x0.round() as i64..=x1.round() as i64 {
            put(image, x, y, color);
        }
    }
}

/// Bresenham line, thickened by drawing the neighbouring rows and columns.
fn draw_line(image: &mut RgbImage, from: (f64, f64), to: (f64, f64), color: [u8; 3]) {
    let (mut x0, mut y0) = (from.0.round() as i64, from.1.round() as i64);
    let (x1, y1) = (to.0.round() as i64, to.1.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut error = dx + dy;

    loop {
        for (ox, oy) in [(0, 0), (1, 0), (0, 1)] {
            put(image, x0 + ox, y0 + oy, color);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let doubled = 2 * error;
        if doubled >= dy {
            error += dy;
            x0 += sx;
        }
        if doubled <= dx {
            error += dx;
            y0 += sy;
        }
    }
}

pub fn render_raster(history: &TrainingHistory) -> RgbImage {
    let frame = Frame::new(history);
    let mut image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb(BACKGROUND));

    fill_rect(
        &mut image,
        MARGIN_LEFT,
        MARGIN_TOP,
        MARGIN_LEFT + frame.plot_width(),
        MARGIN_TOP + frame.plot_height(),
        PANEL,
    );

    for tick in 0..=5 {
        let y = frame.y(frame.y_max * tick as f64 / 5.0);
        draw_line(&mut image, (MARGIN_LEFT, y), (MARGIN_LEFT + frame.plot_width(), y), GRID);
    }
    for epoch in 0..frame.epochs {
        let x = frame.x(epoch);
        draw_line(&mut image, (x, MARGIN_TOP), (x, MARGIN_TOP + frame.plot_height()), GRID);
    }

    for series in series(history) {
        let points: Vec<(f64, f64)> = series
            .values
            .iter()
            .enumerate()
            .map(|(epoch, &value)| (frame.x(epoch), frame.y(value)))
            .collect();

        for pair in points.windows(2) {
            draw_line(&mut image, pair[0], pair[1], series.color);
        }
        for &(x, y) in &points {
            fill_rect(&mut image, x - 3.0, y - 3.0, x + 3.0, y + 3.0, series.color);
        }
    }

    let mut legend_y = MARGIN_TOP + frame.plot_height() - 4.0 * 16.0 - 8.0;
    for series in series(history) {
        fill_rect(
            &mut image,
            MARGIN_LEFT + 12.0,
            legend_y,
            MARGIN_LEFT + 36.0,
            legend_y + 4.0,
            series.color,
        );
        legend_y += 16.0;
    }

    image
}
