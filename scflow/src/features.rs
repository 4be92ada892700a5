//! Variable feature selection

use crate::normalization::{residual_variance, Normalization, SCT_THETA};
use crate::stats::median;
use ndarray::{Array, Array1};
use ndarray_stats::interpolate::Linear;
use ndarray_stats::Quantile1dExt;
use noisy_float::types::{n64, N64};
use scflow_types::CountMatrix;
use std::cmp::Ordering;

const DISPERSION_BINS: usize = 20;

fn binned_median(binned: &Array1<f64>, values: &Array1<f64>, bin_edges: &[N64]) -> (Vec<f64>, Vec<usize>) {
    let max_index = bin_edges.len() - 1;
    let mut bin_indices = Vec::with_capacity(values.len());
    let mut binned_values = vec![Vec::new(); max_index];
    for (i, &v) in binned.iter().enumerate() {
        let idx = match bin_edges[1..max_index].binary_search(&n64(v)) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        bin_indices.push(idx);
        binned_values[idx].push(values[i]);
    }
    let medians = binned_values.iter().map(|b| median(b)).collect();
    (medians, bin_indices)
}

/// Mean and variance of size-factor normalized counts per gene.
fn normalized_mean_var(counts: &CountMatrix) -> (Array1<f64>, Array1<f64>) {
    let totals = counts
        .outer_iterator()
        .map(|col| col.data().iter().map(|&v| f64::from(v)).sum::<f64>())
        .collect::<Vec<_>>();
    let target = median(&totals).max(1.0);
    let cells = counts.cols() as f64;
    let mut sum = Array1::<f64>::zeros(counts.rows());
    let mut sum_sq = Array1::<f64>::zeros(counts.rows());
    for (c, col) in counts.outer_iterator().enumerate() {
        let scale = if totals[c] > 0.0 { target / totals[c] } else { 0.0 };
        for (g, &v) in col.iter() {
            let x = f64::from(v) * scale;
            sum[g] += x;
            sum_sq[g] += x * x;
        }
    }
    let mean = &sum / cells;
    let var = (&sum_sq / cells) - &mean * &mean;
    (mean, var)
}

/// Dispersion `(var - mean) / mean^2` of normalized counts, standardized within
/// bins of mean expression by the bin median and median absolute deviation.
/// Genes with no counts get NaN.
pub fn normalized_dispersion(counts: &CountMatrix) -> Array1<f64> {
    let (mean, var) = normalized_mean_var(counts);
    let dispersion = Array1::from_shape_fn(mean.len(), |g| {
        if mean[g] > 0.0 {
            (var[g] - mean[g]) / (mean[g] * mean[g])
        } else {
            f64::NAN
        }
    });
    let expressed = (0..mean.len()).filter(|&g| mean[g] > 0.0).collect::<Vec<_>>();
    if expressed.is_empty() {
        return dispersion;
    }
    let sub_mean = expressed.iter().map(|&g| mean[g]).collect::<Array1<f64>>();
    let sub_disp = expressed.iter().map(|&g| dispersion[g]).collect::<Array1<f64>>();

    let qs = Array::linspace(0.0, 1.0, DISPERSION_BINS + 1).mapv(n64);
    let mut quantiles = sub_mean
        .mapv(n64)
        .quantiles_mut(&qs, &Linear)
        .map(|xs| xs.to_vec())
        .unwrap_or_default();
    quantiles.dedup();
    if quantiles.len() <= 1 {
        return dispersion;
    }
    let (medians, bins) = binned_median(&sub_mean, &sub_disp, &quantiles);
    let deviations = Array1::from_shape_fn(sub_disp.len(), |i| (sub_disp[i] - medians[bins[i]]).abs());
    let (mads, bins) = binned_median(&sub_mean, &deviations, &quantiles);

    let mut out = Array1::from_elem(mean.len(), f64::NAN);
    for (i, &g) in expressed.iter().enumerate() {
        let mad = mads[bins[i]];
        let centered = sub_disp[i] - medians[bins[i]];
        out[g] = if mad > 0.0 { centered / mad } else { centered };
    }
    out
}

/// Order genes by decreasing score, NaNs last, and keep the first `n`.
pub fn top_n(scores: &Array1<f64>, n: usize) -> Vec<usize> {
    let mut order = (0..scores.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| {
        let (da, db) = (scores[a], scores[b]);
        match (da.is_nan(), db.is_nan()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => db.partial_cmp(&da).unwrap_or(Ordering::Equal),
        }
    });
    order.truncate(n);
    order
}

/// Per-gene variability score appropriate to `method`.
pub fn variability(counts: &CountMatrix, method: Normalization) -> Array1<f64> {
    match method {
        Normalization::Sct => {
            let mut rv = residual_variance(counts, SCT_THETA);
            let detected = counts.outer_iterator().fold(vec![false; counts.rows()], |mut d, col| {
                for (g, &v) in col.iter() {
                    d[g] |= v > 0;
                }
                d
            });
            for (g, d) in detected.into_iter().enumerate() {
                if !d {
                    rv[g] = f64::NAN;
                }
            }
            rv
        }
        _ => normalized_dispersion(counts),
    }
}

/// Indices of the `n` most variable genes, most variable first.
pub fn select_variable_features(counts: &CountMatrix, method: Normalization, n: usize) -> Vec<usize> {
    let scores = variability(counts, method);
    top_n(&scores, n)
        .into_iter()
        .filter(|&g| !scores[g].is_nan())
        .collect()
}
