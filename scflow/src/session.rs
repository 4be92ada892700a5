//! The analysis session: counts plus every layer, annotation and embedding derived
//! from them. Stages take a session and return a new one; nothing is shared mutably
//! between stages.

use crate::error::AnalysisError;
use crate::normalization::Normalization;
use anyhow::{bail, format_err, Error};
use ndarray::{Array2, Axis};
use scflow_types::{CellMetadata, Column, ExpressionMatrix, Factor};
use sprs::{CsMat, TriMat};
use std::collections::BTreeMap;

/// Sample of origin.
pub const ORIG_IDENT: &str = "orig.ident";
/// Total UMIs per cell.
pub const N_COUNT: &str = "nCount_RNA";
/// Detected features per cell.
pub const N_FEATURE: &str = "nFeature_RNA";
/// Percentage of UMIs from mitochondrial genes.
pub const PERCENT_MT: &str = "percent.mt";
/// Graph clusters from `reduce_dim`.
pub const CLUSTERS: &str = "seurat_clusters";

/// Normalized expression, genes x cells, same gene axis as the counts.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedData {
    /// how the values were produced
    pub method: Normalization,
    /// normalized values; zero counts stay zero
    pub values: CsMat<f64>,
}

/// Dense scaled (or residual, or batch-corrected) values over a subset of features.
#[derive(Clone, Debug, PartialEq)]
pub struct ScaledData {
    /// feature names, one per row of `values`
    pub features: Vec<String>,
    /// features x cells
    pub values: Array2<f64>,
    /// metadata columns regressed out of `values`
    pub regressed: Vec<String>,
}

/// An immutable-by-convention snapshot of one analysis.
#[derive(Clone, Debug)]
pub struct Session {
    /// raw counts, genes x cells
    pub counts: ExpressionMatrix,
    /// per-cell annotations, row-aligned with the counts
    pub metadata: CellMetadata,
    /// normalized layer
    pub data: Option<NormalizedData>,
    /// scaled layer over the variable features
    pub scale: Option<ScaledData>,
    /// named cells x k coordinates
    pub embeddings: BTreeMap<String, Array2<f64>>,
    /// metadata column used as the default grouping
    pub active_ident: Option<String>,
}

impl Session {
    /// Wrap a count matrix, recording `project` as the sample of origin.
    pub fn new(counts: ExpressionMatrix, project: &str) -> Result<Session, Error> {
        let metadata = CellMetadata::new(counts.barcodes.clone())
            .with_column(ORIG_IDENT, Column::Categorical(Factor::constant(project, counts.num_cells())))?;
        Ok(Session {
            counts,
            metadata,
            data: None,
            scale: None,
            embeddings: BTreeMap::new(),
            active_ident: Some(ORIG_IDENT.to_string()),
        })
    }

    /// Number of cells.
    pub fn num_cells(&self) -> usize {
        self.counts.num_cells()
    }

    /// Check that every layer agrees on the cell axis.
    pub fn validate(&self) -> Result<(), Error> {
        let n = self.num_cells();
        if self.metadata.num_cells() != n || self.metadata.barcodes != self.counts.barcodes {
            bail!("metadata rows are not aligned with the count matrix");
        }
        if let Some(d) = &self.data {
            if d.values.cols() != n || d.values.rows() != self.counts.num_features() {
                bail!("normalized layer shape {:?} does not match counts", d.values.shape());
            }
        }
        if let Some(s) = &self.scale {
            if s.values.ncols() != n || s.values.nrows() != s.features.len() {
                bail!("scaled layer shape {:?} does not match {} cells", s.values.dim(), n);
            }
        }
        for (name, e) in &self.embeddings {
            if e.nrows() != n {
                bail!("embedding '{}' has {} rows for {} cells", name, e.nrows(), n);
            }
        }
        Ok(())
    }

    /// Keep the given cells, in the given order, across every layer.
    pub fn subset_cells(&self, cells: &[usize]) -> Session {
        Session {
            counts: self.counts.select_cells(cells),
            metadata: self.metadata.select(cells),
            data: self.data.as_ref().map(|d| NormalizedData {
                method: d.method,
                values: select_sparse_cols(&d.values, cells),
            }),
            scale: self.scale.as_ref().map(|s| ScaledData {
                features: s.features.clone(),
                values: s.values.select(Axis(1), cells),
                regressed: s.regressed.clone(),
            }),
            embeddings: self
                .embeddings
                .iter()
                .map(|(k, v)| (k.clone(), v.select(Axis(0), cells)))
                .collect(),
            active_ident: self.active_ident.clone(),
        }
    }

    /// Cells whose categorical `column` takes one of `values`.
    pub fn cells_matching(&self, column: &str, values: &[String]) -> Result<Vec<usize>, Error> {
        let f = self.metadata.get(column).ok_or_else(|| format_err!("metadata column '{}' not found", column))?;
        let cells = (0..self.num_cells())
            .filter(|&i| f.display(i).is_some_and(|v| values.contains(&v)))
            .collect::<Vec<_>>();
        if cells.is_empty() {
            return Err(AnalysisError::EmptySubset {
                column: column.to_string(),
                values: values.to_vec(),
            }
            .into());
        }
        Ok(cells)
    }

    /// Subset to cells whose `column` takes one of `values`. Errors if none match.
    pub fn subset_by(&self, column: &str, values: &[String]) -> Result<Session, Error> {
        Ok(self.subset_cells(&self.cells_matching(column, values)?))
    }

    /// Return a copy with `column` added or replaced.
    pub fn with_column(&self, name: &str, column: Column) -> Result<Session, Error> {
        let mut s = self.clone();
        s.metadata.insert(name, column)?;
        Ok(s)
    }

    /// Return a copy with `name` as the active grouping.
    pub fn with_ident(mut self, name: &str) -> Result<Session, Error> {
        if !self.metadata.contains(name) {
            bail!("cannot set identity: metadata column '{}' not found", name);
        }
        self.active_ident = Some(name.to_string());
        Ok(self)
    }

    /// The active grouping as a factor.
    pub fn ident(&self) -> Result<Factor, Error> {
        let name = self.active_ident.as_deref().ok_or_else(|| format_err!("no active identity set"))?;
        Ok(self
            .metadata
            .get(name)
            .ok_or_else(|| format_err!("active identity '{}' not in metadata", name))?
            .to_factor())
    }

    /// Look up an embedding by name.
    pub fn embedding(&self, name: &str) -> Result<&Array2<f64>, Error> {
        self.embeddings
            .get(name)
            .ok_or_else(|| format_err!("no '{}' embedding; run the stage that computes it first", name))
    }

    /// Replace the metadata value of `column` using a label mapping, e.g. cluster to cell type.
    /// Unmapped labels are kept as they are.
    pub fn rename_levels(&self, column: &str, target: &str, mapping: &BTreeMap<String, String>) -> Result<Session, Error> {
        let f = self.metadata.get(column).ok_or_else(|| format_err!("metadata column '{}' not found", column))?;
        let renamed = (0..self.num_cells()).map(|i| f.display(i).map(|v| mapping.get(&v).cloned().unwrap_or(v)));
        self.with_column(target, Column::Categorical(Factor::from_values(renamed)))
    }
}

/// Select columns of a CSC matrix.
pub(crate) fn select_sparse_cols(m: &CsMat<f64>, cols: &[usize]) -> CsMat<f64> {
    let mut tri = TriMat::new((m.rows(), cols.len()));
    for (j, &c) in cols.iter().enumerate() {
        if let Some(col) = m.outer_view(c) {
            for (i, &v) in col.iter() {
                tri.add_triplet(i, j, v);
            }
        }
    }
    tri.to_csc()
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use ndarray::array;

    pub(crate) fn toy_session() -> Session {
        let counts = array![[1u32, 0, 3, 0], [0, 2, 1, 0], [2, 5, 0, 7]];
        let m = ExpressionMatrix::from_dense(
            "toy",
            vec!["A".into(), "B".into(), "MT-C".into()],
            (0..4).map(|i| format!("c{i}")).collect(),
            counts.view(),
        )
        .unwrap();
        Session::new(m, "toy").unwrap()
    }

    #[test]
    fn test_subset_keeps_layers_aligned() {
        let mut s = toy_session();
        s.embeddings
            .insert("umap".into(), array![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]);
        s.scale = Some(ScaledData {
            features: vec!["A".into()],
            values: array![[0.1, 0.2, 0.3, 0.4]],
            regressed: vec![],
        });
        let s = s
            .with_column(
                "grp",
                Column::Categorical(Factor::from_values(vec![Some("x"), Some("y"), Some("x"), None])),
            )
            .unwrap();
        let sub = s.subset_by("grp", &["x".to_string()]).unwrap();
        sub.validate().unwrap();
        assert_eq!(sub.counts.barcodes, vec!["c0", "c2"]);
        assert_eq!(sub.embedding("umap").unwrap(), &array![[0.0, 0.0], [2.0, 2.0]]);
        assert_eq!(sub.scale.unwrap().values, array![[0.1, 0.3]]);
    }

    #[test]
    fn test_empty_subset_is_error() {
        let s = toy_session();
        let err = s.subset_by(ORIG_IDENT, &["other".to_string()]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::EmptySubset { .. })
        ));
    }

    #[test]
    fn test_ident_and_rename() {
        let s = toy_session();
        assert_eq!(s.ident().unwrap().levels, vec!["toy"]);
        let mapping = BTreeMap::from([("toy".to_string(), "renamed".to_string())]);
        let s = s.rename_levels(ORIG_IDENT, "label", &mapping).unwrap().with_ident("label").unwrap();
        assert_eq!(s.ident().unwrap().get(0), Some("renamed"));
        assert!(s.with_ident("nope").is_err());
    }
}
