//! Cell and gene quality-control filtering.

use crate::error::AnalysisError;
use crate::mtx::load_10x_dir;
use crate::session::{Session, N_COUNT, N_FEATURE, PERCENT_MT};
use anyhow::{Context, Error};
use log::info;
use scflow_types::{Column, ExpressionMatrix};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Prefixes of mitochondrial gene symbols (human, mouse).
pub const MITO_PREFIXES: &[&str] = &["MT-", "mt-"];

/// QC thresholds. Cells are kept when `min_features < nFeature < max_features`
/// and `percent.mt < percent_mt`; genes are kept when seen in at least `min_cells` kept cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QcParams {
    /// project name recorded as `orig.ident`
    pub project: String,
    /// exclusive upper bound on mitochondrial percentage
    pub percent_mt: f64,
    /// exclusive upper bound on detected features
    pub max_features: usize,
    /// exclusive lower bound on detected features
    pub min_features: usize,
    /// inclusive lower bound on cells per gene
    pub min_cells: usize,
}

impl Default for QcParams {
    fn default() -> Self {
        QcParams {
            project: "10X-project".to_string(),
            percent_mt: 20.0,
            max_features: 5000,
            min_features: 200,
            min_cells: 3,
        }
    }
}

/// Per-cell QC metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct QcMetrics {
    /// total UMIs
    pub n_count: Vec<u64>,
    /// detected features
    pub n_feature: Vec<usize>,
    /// percentage of UMIs in mitochondrial genes
    pub percent_mt: Vec<f64>,
}

/// True for mitochondrial gene symbols.
pub fn is_mito(symbol: &str) -> bool {
    MITO_PREFIXES.iter().any(|p| symbol.starts_with(p))
}

/// Compute QC metrics on the unfiltered matrix.
pub fn qc_metrics(m: &ExpressionMatrix) -> QcMetrics {
    let mito = m.feature_names.iter().map(|f| is_mito(f)).collect::<Vec<_>>();
    let mut n_count = Vec::with_capacity(m.num_cells());
    let mut n_feature = Vec::with_capacity(m.num_cells());
    let mut percent_mt = Vec::with_capacity(m.num_cells());
    for col in m.matrix.outer_iterator() {
        let mut total = 0u64;
        let mut mt = 0u64;
        let mut detected = 0usize;
        for (g, &v) in col.iter() {
            if v == 0 {
                continue;
            }
            detected += 1;
            total += u64::from(v);
            if mito[g] {
                mt += u64::from(v);
            }
        }
        n_count.push(total);
        n_feature.push(detected);
        percent_mt.push(if total > 0 { 100.0 * mt as f64 / total as f64 } else { 0.0 });
    }
    QcMetrics {
        n_count,
        n_feature,
        percent_mt,
    }
}

/// The cell-level QC predicate.
pub fn passes_qc(params: &QcParams, n_feature: usize, percent_mt: f64) -> bool {
    params.min_features < n_feature && n_feature < params.max_features && percent_mt < params.percent_mt
}

/// Filter cells and genes, annotating QC metrics. Errors when no cell or no gene survives.
pub fn preprocess(counts: ExpressionMatrix, params: &QcParams) -> Result<Session, Error> {
    let metrics = qc_metrics(&counts);
    let (n_genes, n_cells) = (counts.num_features(), counts.num_cells());

    let cells = (0..n_cells)
        .filter(|&c| passes_qc(params, metrics.n_feature[c], metrics.percent_mt[c]))
        .collect::<Vec<_>>();
    if cells.is_empty() {
        return Err(AnalysisError::NoCellsPassQc {
            min_features: params.min_features,
            max_features: params.max_features,
            percent_mt: params.percent_mt,
        }
        .into());
    }
    let kept = counts.select_cells(&cells);
    let genes = kept
        .feature_cells()
        .into_iter()
        .enumerate()
        .filter_map(|(g, n)| (n >= params.min_cells.max(1)).then_some(g))
        .collect::<Vec<_>>();
    if genes.is_empty() {
        return Err(AnalysisError::NoGenesPassQc(params.min_cells).into());
    }
    let kept = kept.select_features(&genes);
    info!(
        "QC kept {} of {} cells and {} of {} genes",
        kept.num_cells(),
        n_cells,
        kept.num_features(),
        n_genes
    );

    let pick = |v: &dyn Fn(usize) -> f64| Column::Numeric(cells.iter().map(|&c| Some(v(c))).collect());
    let mut session = Session::new(kept, &params.project)?;
    session.metadata.insert(N_COUNT, pick(&|c| metrics.n_count[c] as f64))?;
    session.metadata.insert(N_FEATURE, pick(&|c| metrics.n_feature[c] as f64))?;
    session.metadata.insert(PERCENT_MT, pick(&|c| metrics.percent_mt[c]))?;
    Ok(session)
}

/// Load a 10X directory and run [`preprocess`].
pub fn load(dir: impl AsRef<Path>, params: &QcParams) -> Result<Session, Error> {
    let dir = dir.as_ref();
    let counts = load_10x_dir(dir, &params.project)?;
    preprocess(counts, params).with_context(|| format!("preprocessing {}", dir.display()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mtx::test::write_10x_dir;
    use ndarray::Array2;

    /// 50 genes x 10 cells; genes 48 and 49 are mitochondrial.
    fn toy_counts() -> Array2<u32> {
        Array2::from_shape_fn((50, 10), |(g, c)| {
            // cell c expresses roughly 4 * c genes
            let expressed = g < 4 * c + 2 || (g * 7 + c) % 11 == 0;
            let base = if expressed { ((g + c) % 4 + 1) as u32 } else { 0 };
            if g >= 48 {
                // cells 8 and 9 are mito heavy
                if c >= 8 {
                    40
                } else {
                    (c % 2) as u32
                }
            } else {
                base
            }
        })
    }

    fn toy_matrix() -> ExpressionMatrix {
        let mut genes = (0..48).map(|g| format!("G{g}")).collect::<Vec<_>>();
        genes.push("MT-CO1".into());
        genes.push("MT-ND1".into());
        let counts = toy_counts();
        ExpressionMatrix::from_dense("toy", genes, (0..10).map(|c| format!("c{c}")).collect(), counts.view())
            .unwrap()
    }

    #[test]
    fn test_preprocess_matches_predicate() {
        let m = toy_matrix();
        let params = QcParams {
            project: "toy".into(),
            percent_mt: 20.0,
            max_features: 40,
            min_features: 5,
            min_cells: 3,
        };
        let metrics = qc_metrics(&m);
        let expected = (0..10)
            .filter(|&c| passes_qc(&params, metrics.n_feature[c], metrics.percent_mt[c]))
            .count();
        let s = preprocess(m.clone(), &params).unwrap();
        assert_eq!(s.num_cells(), expected);
        assert!(s.num_cells() <= m.num_cells());
        s.validate().unwrap();

        // every kept cell satisfies the predicate on the input matrix
        let nf = s.metadata.numeric(N_FEATURE).unwrap();
        let mt = s.metadata.numeric(PERCENT_MT).unwrap();
        for c in 0..s.num_cells() {
            let (f, p) = (nf[c].unwrap() as usize, mt[c].unwrap());
            assert!(5 < f && f < 40 && p < 20.0);
        }
        // every kept gene is seen in at least 3 kept cells
        assert!(s.counts.feature_cells().iter().all(|&n| n >= 3));
        assert_eq!(s.metadata.factor("orig.ident").unwrap().levels, vec!["toy"]);
    }

    #[test]
    fn test_mito_percent() {
        let m = toy_matrix();
        let metrics = qc_metrics(&m);
        let c = 9;
        let total = metrics.n_count[c] as f64;
        assert!((metrics.percent_mt[c] - 100.0 * 80.0 / total).abs() < 1e-9);
        assert!(is_mito("mt-Nd1") && is_mito("MT-CO1") && !is_mito("MTOR"));
    }

    #[test]
    fn test_empty_cell_set_is_error() {
        let params = QcParams {
            min_features: 1000,
            ..QcParams::default()
        };
        let err = preprocess(toy_matrix(), &params).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::NoCellsPassQc { .. })
        ));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        let genes = ["A", "B", "C", "MT-X"];
        let counts = vec![vec![3, 2, 1, 4], vec![1, 1, 1, 0], vec![0, 0, 5, 0], vec![0, 1, 0, 0]];
        write_10x_dir(dir.path(), &genes, &counts, true);
        let params = QcParams {
            project: "d".into(),
            percent_mt: 30.0,
            max_features: 10,
            min_features: 1,
            min_cells: 2,
        };
        let s = load(dir.path(), &params).unwrap();
        // cell 3 has one feature; cell 1 is 20% mito and stays
        assert_eq!(s.counts.barcodes, vec!["CELL0-1", "CELL1-1", "CELL2-1"]);
        assert_eq!(s.counts.feature_names, vec!["A", "B"]);
        assert!(load(dir.path().join("missing"), &params).is_err());
    }
}
