use crate::session::{NormalizedData, ScaledData, Session};
use crate::stats::{median, one_hot, regress_out_rows, scale_rows};
use anyhow::{bail, format_err, Error};
use log::info;
use ndarray::prelude::*;
use scflow_types::{Column, CountMatrix};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::f64;
use std::str::FromStr;

/// Dispersion of the negative binomial used for Pearson residuals.
pub const SCT_THETA: f64 = 100.0;
/// Scaled values are clipped to this magnitude for the log and sqrt methods.
pub const SCALE_CLIP: f64 = 10.0;

/// Normalization scheme for a gene x cell UMI count matrix
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Regression-based variance stabilization: Pearson residuals of a negative binomial
    /// with a per-cell log library size offset, overdispersion `SCT_THETA`, and residuals
    /// clipped to `sqrt(n_cells)`. The normalized layer holds `ln(1 + x)` of counts scaled to
    /// the median library size.
    #[default]
    Sct,
    /// Barcode UMI totals are scaled to 10,000 and `x -> ln(1 + x)` is applied
    LogNormalize,
    /// Barcode UMI totals are scaled to the median and `x -> sqrt(x)` is applied
    Sqrt,
}

impl FromStr for Normalization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sct" | "sctransform" => Ok(Normalization::Sct),
            "lognormalize" | "log" => Ok(Normalization::LogNormalize),
            "sqrt" => Ok(Normalization::Sqrt),
            _ => bail!("Normalization not recognized: {}", s),
        }
    }
}

/// Fit the null model used by the residual transforms. Returns `(n, p)` where `n` holds the
/// total counts per cell and `p` the fraction of all counts from each gene.
pub fn fit_null_model(counts: &CountMatrix) -> (Array1<f64>, Array1<f64>) {
    let mut n = Array1::zeros(counts.cols());
    let mut p = Array1::zeros(counts.rows());
    for (c, col) in counts.outer_iterator().enumerate() {
        for (g, &v) in col.iter() {
            n[c] += f64::from(v);
            p[g] += f64::from(v);
        }
    }
    let total = n.sum().max(1.0);
    p.mapv_inplace(|x| x / total);
    (n, p)
}

/// Scale every cell to `target` total counts and apply `f`. Zeros stay zero, so `f(0)` must be 0.
/// When `target` is None, the median cell total is used.
pub fn library_size_normalize(counts: &CountMatrix, target: Option<f64>, f: impl Fn(f64) -> f64) -> CsMat<f64> {
    let totals = counts
        .outer_iterator()
        .map(|col| col.data().iter().map(|&v| f64::from(v)).sum::<f64>())
        .collect::<Vec<_>>();
    let target = target.unwrap_or_else(|| median(&totals).max(1.0));
    let mut tri = TriMat::with_capacity(counts.shape(), counts.nnz());
    for (c, col) in counts.outer_iterator().enumerate() {
        let scale = if totals[c] > 0.0 { target / totals[c] } else { 0.0 };
        for (g, &v) in col.iter() {
            tri.add_triplet(g, c, f(f64::from(v) * scale));
        }
    }
    tri.to_csc()
}

/// `ln(1 + x)` of counts scaled to 10,000 per cell.
pub fn log_normalize(counts: &CountMatrix) -> CsMat<f64> {
    library_size_normalize(counts, Some(10_000.0), f64::ln_1p)
}

/// `sqrt(x)` of counts scaled to the median total per cell.
pub fn sqrt_normalize(counts: &CountMatrix) -> CsMat<f64> {
    library_size_normalize(counts, None, f64::sqrt)
}

/// Negative binomial Pearson residuals for the selected genes, genes x cells.
pub fn pearson_residuals(counts: &CountMatrix, genes: &[usize], theta: f64) -> Array2<f64> {
    let (n, p) = fit_null_model(counts);
    let clip = (counts.cols() as f64).sqrt();
    let mut row_of = vec![None; counts.rows()];
    for (i, &g) in genes.iter().enumerate() {
        row_of[g] = Some(i);
    }
    let mut dense = Array2::<f64>::zeros((genes.len(), counts.cols()));
    for (c, col) in counts.outer_iterator().enumerate() {
        for (g, &v) in col.iter() {
            if let Some(i) = row_of[g] {
                dense[[i, c]] = f64::from(v);
            }
        }
    }
    for (i, &g) in genes.iter().enumerate() {
        for c in 0..counts.cols() {
            let mu = n[c] * p[g];
            let x = dense[[i, c]];
            dense[[i, c]] = if mu > 0.0 {
                ((x - mu) / (mu + mu * mu / theta).sqrt()).clamp(-clip, clip)
            } else {
                0.0
            };
        }
    }
    dense
}

/// Variance of the clipped Pearson residuals of every gene, computed without densifying.
pub fn residual_variance(counts: &CountMatrix, theta: f64) -> Array1<f64> {
    let (n, p) = fit_null_model(counts);
    let cells = counts.cols() as f64;
    let clip = cells.sqrt();
    let resid = |x: f64, mu: f64| ((x - mu) / (mu + mu * mu / theta).sqrt()).clamp(-clip, clip);

    // start every gene as if all its counts were zero, then patch in the non-zeros
    let mut sum = Array1::<f64>::zeros(counts.rows());
    let mut sum_sq = Array1::<f64>::zeros(counts.rows());
    for g in 0..counts.rows() {
        if p[g] == 0.0 {
            continue;
        }
        for &nc in &n {
            let r = resid(0.0, nc * p[g]);
            sum[g] += r;
            sum_sq[g] += r * r;
        }
    }
    for (c, col) in counts.outer_iterator().enumerate() {
        for (g, &v) in col.iter() {
            let mu = n[c] * p[g];
            let r0 = resid(0.0, mu);
            let r = resid(f64::from(v), mu);
            sum[g] += r - r0;
            sum_sq[g] += r * r - r0 * r0;
        }
    }
    let mean = &sum / cells;
    ((&sum_sq / cells) - &mean * &mean) * (cells / (cells - 1.0).max(1.0))
}

/// Compute the normalized layer of `session`.
pub fn normalize(session: &Session, method: Normalization) -> Session {
    let values = match method {
        Normalization::Sct => library_size_normalize(&session.counts.matrix, None, f64::ln_1p),
        Normalization::LogNormalize => log_normalize(&session.counts.matrix),
        Normalization::Sqrt => sqrt_normalize(&session.counts.matrix),
    };
    let mut s = session.clone();
    s.data = Some(NormalizedData { method, values });
    s
}

/// Dense rows of a sparse genes x cells layer.
pub(crate) fn dense_rows(m: &CsMat<f64>, rows: &[usize]) -> Array2<f64> {
    let mut row_of = vec![None; m.rows()];
    for (i, &g) in rows.iter().enumerate() {
        row_of[g] = Some(i);
    }
    let mut dense = Array2::zeros((rows.len(), m.cols()));
    for (c, col) in m.outer_iterator().enumerate() {
        for (g, &v) in col.iter() {
            if let Some(i) = row_of[g] {
                dense[[i, c]] = v;
            }
        }
    }
    dense
}

/// Build the scaled layer over `features` (names), regressing out `regress` covariates.
/// Requires the normalized layer.
pub fn scale_data(session: &Session, features: &[String], regress: &[String]) -> Result<Session, Error> {
    let data = session
        .data
        .as_ref()
        .ok_or_else(|| format_err!("scaling requires normalized data"))?;
    let lookup = session.counts.feature_lookup();
    let rows = features
        .iter()
        .map(|f| lookup.get(f.as_str()).copied().ok_or_else(|| format_err!("feature '{}' not in counts", f)))
        .collect::<Result<Vec<_>, Error>>()?;

    let mut values = match data.method {
        Normalization::Sct => pearson_residuals(&session.counts.matrix, &rows, SCT_THETA),
        _ => dense_rows(&data.values, &rows),
    };
    if !regress.is_empty() {
        let design = covariate_design(session, regress)?;
        values = regress_out_rows(&values.view(), &design.view())?;
    }
    match data.method {
        Normalization::Sct => scale_rows(&mut values, false, None),
        _ => scale_rows(&mut values, true, Some(SCALE_CLIP)),
    }

    let mut s = session.clone();
    s.scale = Some(ScaledData {
        features: features.to_vec(),
        values,
        regressed: regress.to_vec(),
    });
    Ok(s)
}

/// Design matrix (cells x k) for the named metadata columns: numeric columns enter as-is with
/// missing values set to the column mean, categorical columns as indicators.
pub fn covariate_design(session: &Session, covariates: &[String]) -> Result<Array2<f64>, Error> {
    let n = session.num_cells();
    let mut blocks = Vec::new();
    for name in covariates {
        let col = session
            .metadata
            .get(name)
            .ok_or_else(|| format_err!("cannot regress out '{}': metadata column not found", name))?;
        let block = match col {
            Column::Numeric(v) => {
                let present = v.iter().flatten().copied().collect::<Vec<_>>();
                let fill = if present.is_empty() {
                    0.0
                } else {
                    present.iter().sum::<f64>() / present.len() as f64
                };
                Array2::from_shape_fn((n, 1), |(i, _)| v[i].unwrap_or(fill))
            }
            Column::Categorical(f) => one_hot(f),
        };
        blocks.push(block);
    }
    let views = blocks.iter().map(|b| b.view()).collect::<Vec<_>>();
    Ok(ndarray::concatenate(Axis(1), &views)?)
}

/// Regress the named covariates out of the scaled layer, then re-scale it.
pub fn regress_out(session: &Session, covariates: &[String]) -> Result<Session, Error> {
    let scale = session
        .scale
        .as_ref()
        .ok_or_else(|| format_err!("regress_out requires a scaled layer; run reduce_dim first"))?;
    if covariates.is_empty() {
        return Ok(session.clone());
    }
    let method = session.data.as_ref().map(|d| d.method).unwrap_or_default();
    info!("regressing out {:?} from {} features", covariates, scale.features.len());
    let design = covariate_design(session, covariates)?;
    let mut values = regress_out_rows(&scale.values.view(), &design.view())?;
    match method {
        Normalization::Sct => scale_rows(&mut values, false, None),
        _ => scale_rows(&mut values, true, Some(SCALE_CLIP)),
    }
    let mut regressed = scale.regressed.clone();
    regressed.extend(covariates.iter().cloned());
    let mut s = session.clone();
    s.scale = Some(ScaledData {
        features: scale.features.clone(),
        values,
        regressed,
    });
    Ok(s)
}

#[cfg(test)]
mod test_normalization {
    use super::*;
    use crate::session::test::toy_session;
    use approx::assert_abs_diff_eq;
    use scflow_types::Factor;

    #[test]
    fn test_parse() {
        assert_eq!("SCT".parse::<Normalization>().unwrap(), Normalization::Sct);
        assert_eq!("sqrt".parse::<Normalization>().unwrap(), Normalization::Sqrt);
        assert!("vst".parse::<Normalization>().is_err());
    }

    #[test]
    fn test_fit_null_model() {
        // cell totals: 3, 7, 4, 7 ; gene totals 4, 3, 14 of 21
        let s = toy_session();
        let (n, p) = fit_null_model(&s.counts.matrix);
        assert_eq!(n, array![3.0, 7.0, 4.0, 7.0]);
        assert_abs_diff_eq!(p, array![4.0 / 21.0, 3.0 / 21.0, 14.0 / 21.0], epsilon = 1e-12);
    }

    #[test]
    fn test_library_size_normalize() {
        let s = toy_session();
        // median total of [3, 7, 4, 7] is 5.5
        let sq = sqrt_normalize(&s.counts.matrix).to_dense();
        assert_abs_diff_eq!(sq[[0, 0]], (1.0f64 * 5.5 / 3.0).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(sq[[2, 3]], 5.5f64.sqrt(), epsilon = 1e-12);
        assert_eq!(sq[[0, 1]], 0.0);

        let ln = log_normalize(&s.counts.matrix).to_dense();
        assert_abs_diff_eq!(ln[[1, 1]], (2.0f64 / 7.0 * 1e4).ln_1p(), epsilon = 1e-12);
    }

    #[test]
    fn test_residual_variance_matches_dense() {
        let s = toy_session();
        let m = &s.counts.matrix;
        let rv = residual_variance(m, SCT_THETA);
        let dense = pearson_residuals(m, &[0, 1, 2], SCT_THETA);
        for g in 0..3 {
            let row = dense.row(g);
            let mean = row.mean().unwrap();
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 3.0;
            assert_abs_diff_eq!(rv[g], var, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_pearson_residuals_clipped() {
        let s = toy_session();
        let r = pearson_residuals(&s.counts.matrix, &[0, 1, 2], SCT_THETA);
        let clip = 2.0;
        assert!(r.iter().all(|v| v.abs() <= clip + 1e-12));
    }

    #[test]
    fn test_scale_and_regress() {
        let s = normalize(&toy_session(), Normalization::LogNormalize);
        let s = s
            .with_column(
                "batch",
                Column::Categorical(Factor::from_values(vec![Some("a"), Some("a"), Some("b"), Some("b")])),
            )
            .unwrap();
        let features = vec!["A".to_string(), "B".to_string()];
        let scaled = scale_data(&s, &features, &[]).unwrap();
        let values = &scaled.scale.as_ref().unwrap().values;
        for row in values.rows() {
            assert_abs_diff_eq!(row.sum(), 0.0, epsilon = 1e-9);
        }

        let regressed = regress_out(&scaled, &["batch".to_string()]).unwrap();
        let layer = regressed.scale.unwrap();
        assert_eq!(layer.regressed, vec!["batch"]);
        // within-batch means are equal after regression
        for row in layer.values.rows() {
            assert_abs_diff_eq!(row[0] + row[1], row[2] + row[3], epsilon = 1e-9);
        }
        assert!(regress_out(&s, &["batch".to_string()]).is_err());
        assert!(scale_data(&s, &features, &["nope".to_string()]).is_err());
    }
}
