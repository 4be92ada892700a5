//! PNG figures drawn with plotters primitives: cell scatter plots, trajectory trees and
//! stacked proportion bars. Figures carry no text.

use anyhow::{format_err, Error};
use ndarray::{Array2, ArrayView2};
use plotters::prelude::*;
use crate::session::Session;
use scflow_types::{Column, Factor};
use std::path::Path;

const SIZE: (u32, u32) = (800, 800);
const MARGIN: i32 = 40;
const POINT_RADIUS: i32 = 3;
const MISSING: RGBColor = RGBColor(200, 200, 200);

/// Categorical palette; levels beyond its length wrap around.
pub const PALETTE: [RGBColor; 12] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
    RGBColor(188, 189, 34),
    RGBColor(23, 190, 207),
    RGBColor(174, 199, 232),
    RGBColor(255, 187, 120),
];

fn draw_err(e: impl std::fmt::Display) -> Error {
    format_err!("plotting failed: {}", e)
}

/// One palette colour per cell by factor level; missing values are grey.
pub fn category_colors(f: &Factor) -> Vec<RGBColor> {
    f.codes
        .iter()
        .map(|c| c.map_or(MISSING, |c| PALETTE[c as usize % PALETTE.len()]))
        .collect()
}

/// Blue to red gradient over the range of `values`; NaN is grey.
pub fn gradient_colors(values: &[f64]) -> Vec<RGBColor> {
    let finite = values.iter().copied().filter(|v| v.is_finite());
    let (lo, hi) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let range = hi - lo;
    values
        .iter()
        .map(|&v| {
            if !v.is_finite() {
                return MISSING;
            }
            let t = if range > 0.0 { (v - lo) / range } else { 0.5 };
            RGBColor((255.0 * t) as u8, 40, (255.0 * (1.0 - t)) as u8)
        })
        .collect()
}

/// Maps data coordinates onto the pixel canvas, y pointing up.
struct Frame {
    x_min: f64,
    x_span: f64,
    y_min: f64,
    y_span: f64,
}

impl Frame {
    fn fit(points: &ArrayView2<f64>) -> Frame {
        let bounds = |col: usize| {
            let (lo, hi) = points
                .column(col)
                .iter()
                .filter(|v| v.is_finite())
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
            if lo.is_finite() {
                (lo, (hi - lo).max(1e-12))
            } else {
                (0.0, 1.0)
            }
        };
        let (x_min, x_span) = bounds(0);
        let (y_min, y_span) = bounds(1);
        Frame {
            x_min,
            x_span,
            y_min,
            y_span,
        }
    }

    fn to_px(&self, x: f64, y: f64) -> (i32, i32) {
        let w = f64::from(SIZE.0) - 2.0 * f64::from(MARGIN);
        let h = f64::from(SIZE.1) - 2.0 * f64::from(MARGIN);
        let px = MARGIN + ((x - self.x_min) / self.x_span * w) as i32;
        let py = MARGIN + ((1.0 - (y - self.y_min) / self.y_span) * h) as i32;
        (px, py)
    }
}

fn draw_points<DB: DrawingBackend>(
    root: &DrawingArea<DB, plotters::coord::Shift>,
    frame: &Frame,
    coords: &Array2<f64>,
    colors: &[RGBColor],
) -> Result<(), Error> {
    for (row, color) in coords.rows().into_iter().zip(colors) {
        let p = frame.to_px(row[0], row[1]);
        root.draw(&Circle::new(p, POINT_RADIUS, color.filled())).map_err(draw_err)?;
    }
    Ok(())
}

/// Scatter the first two columns of `coords`, one colour per row.
pub fn scatter(path: impl AsRef<Path>, coords: &Array2<f64>, colors: &[RGBColor]) -> Result<(), Error> {
    if coords.ncols() < 2 || colors.len() != coords.nrows() {
        return Err(format_err!(
            "scatter needs 2-D coordinates and one colour per point, got {:?} and {} colours",
            coords.dim(),
            colors.len()
        ));
    }
    let root = BitMapBackend::new(path.as_ref(), SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let frame = Frame::fit(&coords.view());
    draw_points(&root, &frame, coords, colors)?;
    root.present().map_err(draw_err)?;
    Ok(())
}

/// Scatter a session embedding coloured by a metadata column: categorical columns use the
/// palette, numeric ones the gradient.
pub fn plot_embedding(session: &Session, embedding: &str, column: &str, path: impl AsRef<Path>) -> Result<(), Error> {
    let coords = session.embedding(embedding)?;
    let colors = match session.metadata.get(column) {
        Some(Column::Categorical(f)) => category_colors(f),
        Some(Column::Numeric(v)) => gradient_colors(&v.iter().map(|x| x.unwrap_or(f64::NAN)).collect::<Vec<_>>()),
        None => return Err(format_err!("metadata column '{}' not found", column)),
    };
    scatter(path, coords, &colors)
}

/// Cells coloured by state, with the tree drawn through its node centres.
pub fn trajectory_plot(
    path: impl AsRef<Path>,
    coords: &Array2<f64>,
    colors: &[RGBColor],
    centers: &Array2<f64>,
    edges: &[(usize, usize)],
) -> Result<(), Error> {
    let root = BitMapBackend::new(path.as_ref(), SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let all = ndarray::concatenate(ndarray::Axis(0), &[coords.view(), centers.view()])?;
    let frame = Frame::fit(&all.view());
    draw_points(&root, &frame, coords, colors)?;
    for &(a, b) in edges {
        let pa = frame.to_px(centers[[a, 0]], centers[[a, 1]]);
        let pb = frame.to_px(centers[[b, 0]], centers[[b, 1]]);
        root.draw(&PathElement::new(vec![pa, pb], BLACK.stroke_width(2)))
            .map_err(draw_err)?;
    }
    root.present().map_err(draw_err)?;
    Ok(())
}

/// One bar per row; each row's segments are stacked bottom-up in palette order.
pub fn stacked_bar(path: impl AsRef<Path>, rows: &[Vec<f64>]) -> Result<(), Error> {
    let root = BitMapBackend::new(path.as_ref(), SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(draw_err)?;
    let n = rows.len().max(1) as i32;
    let width = (SIZE.0 as i32 - 2 * MARGIN) / n;
    let height = f64::from(SIZE.1) - 2.0 * f64::from(MARGIN);
    let bottom = SIZE.1 as i32 - MARGIN;
    for (i, row) in rows.iter().enumerate() {
        let x0 = MARGIN + i as i32 * width;
        let mut base = 0.0;
        for (j, &p) in row.iter().enumerate() {
            let y0 = bottom - (base * height) as i32;
            let y1 = bottom - ((base + p) * height) as i32;
            root.draw(&Rectangle::new(
                [(x0 + 2, y1), (x0 + width - 2, y0)],
                PALETTE[j % PALETTE.len()].filled(),
            ))
            .map_err(draw_err)?;
            base += p;
        }
    }
    root.present().map_err(draw_err)?;
    Ok(())
}
