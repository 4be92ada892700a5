//! Statistics functions

use anyhow::Error;
use ndarray::prelude::*;
use ndarray_linalg::LeastSquaresSvd;
use ndarray_stats::interpolate::Linear;
use ndarray_stats::Quantile1dExt;
use noisy_float::prelude::{n64, N64};
use scan_rs::stats::median_mut;
use scflow_types::Factor;

/// Median of `xs`, or NaN when empty. NaN entries are ignored.
pub fn median(xs: &[f64]) -> f64 {
    let mut arr = xs.iter().filter(|v| !v.is_nan()).map(|&v| n64(v)).collect::<Array1<N64>>();
    median_mut(&mut arr).map_or(f64::NAN, N64::raw)
}

/// Linearly interpolated quantile `q` in [0, 1], or NaN when empty.
pub fn quantile(xs: &[f64], q: f64) -> f64 {
    let mut arr = xs.iter().filter(|v| !v.is_nan()).map(|&v| n64(v)).collect::<Array1<N64>>();
    arr.quantile_mut(n64(q), &Linear).map_or(f64::NAN, N64::raw)
}

/// Mean and sample variance (n - 1 denominator) of each row.
pub fn mean_var_rows(x: &ArrayView2<f64>) -> (Array1<f64>, Array1<f64>) {
    let n = x.ncols() as f64;
    let mean = x.mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(x.nrows()));
    let mut var = Array1::zeros(x.nrows());
    for (i, row) in x.axis_iter(Axis(0)).enumerate() {
        let ss = row.iter().map(|v| (v - mean[i]).powi(2)).sum::<f64>();
        var[i] = if n > 1.0 { ss / (n - 1.0) } else { 0.0 };
    }
    (mean, var)
}

/// Center every row of `x` and optionally divide by its standard deviation, clipping
/// the result to `[-clip, clip]`. Rows with zero variance become zero.
pub fn scale_rows(x: &mut Array2<f64>, unit_variance: bool, clip: Option<f64>) {
    let (mean, var) = mean_var_rows(&x.view());
    for (i, mut row) in x.axis_iter_mut(Axis(0)).enumerate() {
        let sd = var[i].sqrt();
        row.mapv_inplace(|v| {
            let mut z = v - mean[i];
            if unit_variance {
                z = if sd > 0.0 { z / sd } else { 0.0 };
            }
            match clip {
                Some(c) => z.clamp(-c, c),
                None => z,
            }
        });
    }
}

/// Indicator design for a factor: one column per level after the first.
/// Missing values are treated as the first level.
pub fn one_hot(f: &Factor) -> Array2<f64> {
    let k = f.levels.len().saturating_sub(1);
    let mut x = Array2::zeros((f.len(), k));
    for (i, c) in f.codes.iter().enumerate() {
        if let Some(c) = *c {
            if c > 0 {
                x[[i, c as usize - 1]] = 1.0;
            }
        }
    }
    x
}

/// Residuals of regressing every row of `y` (features x cells) on `design`
/// (cells x covariates). An intercept column is added.
pub fn regress_out_rows(y: &ArrayView2<f64>, design: &ArrayView2<f64>) -> Result<Array2<f64>, Error> {
    let n = design.nrows();
    let mut x = Array2::ones((n, design.ncols() + 1));
    x.slice_mut(s![.., 1..]).assign(design);
    let fit = x.least_squares(&y.t().to_owned())?;
    let fitted = x.dot(&fit.solution);
    Ok(y - &fitted.t())
}

/// Scale each row to unit Euclidean length; zero rows are left alone.
pub fn l2_normalize_rows(x: &mut Array2<f64>) {
    for mut row in x.axis_iter_mut(Axis(0)) {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
}

/// Squared Euclidean distance between two rows.
pub fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum()
}
