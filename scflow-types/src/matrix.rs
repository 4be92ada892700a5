use anyhow::{bail, Error};
use sprs::{CsMat, TriMat};
use sqz::AdaptiveMat;
use std::collections::HashMap;

/// Raw UMI counts, genes x cells, stored CSC so each outer vector is one cell.
pub type CountMatrix = CsMat<u32>;

/// A gene x cell count matrix together with its feature and barcode labels.
#[derive(Clone, Debug, PartialEq)]
pub struct ExpressionMatrix {
    pub name: String,
    pub barcodes: Vec<String>,
    pub feature_ids: Vec<String>,
    pub feature_names: Vec<String>,
    pub matrix: CountMatrix,
}

impl ExpressionMatrix {
    pub fn new(
        name: impl Into<String>,
        barcodes: Vec<String>,
        feature_ids: Vec<String>,
        feature_names: Vec<String>,
        matrix: CountMatrix,
    ) -> Result<ExpressionMatrix, Error> {
        let (rows, cols) = matrix.shape();
        if rows != feature_ids.len() || rows != feature_names.len() {
            bail!(
                "matrix has {} rows but {} feature ids and {} feature names",
                rows,
                feature_ids.len(),
                feature_names.len()
            );
        }
        if cols != barcodes.len() {
            bail!("matrix has {} columns but {} barcodes", cols, barcodes.len());
        }
        let matrix = if matrix.is_csc() { matrix } else { matrix.to_csc() };
        Ok(ExpressionMatrix {
            name: name.into(),
            barcodes,
            feature_ids,
            feature_names,
            matrix,
        })
    }

    /// Build from a dense genes x cells table of counts. Feature ids double as names.
    pub fn from_dense(
        name: impl Into<String>,
        features: Vec<String>,
        barcodes: Vec<String>,
        counts: ndarray::ArrayView2<u32>,
    ) -> Result<ExpressionMatrix, Error> {
        let mut tri = TriMat::new(counts.dim());
        for ((g, c), &v) in counts.indexed_iter() {
            if v > 0 {
                tri.add_triplet(g, c, v);
            }
        }
        ExpressionMatrix::new(name, barcodes, features.clone(), features, tri.to_csc())
    }

    pub fn num_features(&self) -> usize {
        self.matrix.rows()
    }

    pub fn num_cells(&self) -> usize {
        self.matrix.cols()
    }

    /// Row index of a gene symbol.
    pub fn feature_index(&self, name: &str) -> Option<usize> {
        self.feature_names.iter().position(|f| f == name)
    }

    /// Map from gene symbol to row. The first occurrence of a duplicated symbol wins.
    pub fn feature_lookup(&self) -> HashMap<&str, usize> {
        let mut map = HashMap::with_capacity(self.feature_names.len());
        for (i, f) in self.feature_names.iter().enumerate() {
            map.entry(f.as_str()).or_insert(i);
        }
        map
    }

    /// Total UMIs per cell.
    pub fn cell_totals(&self) -> Vec<u64> {
        self.matrix
            .outer_iterator()
            .map(|col| col.data().iter().map(|&v| u64::from(v)).sum())
            .collect()
    }

    /// Number of detected features per cell.
    pub fn cell_features(&self) -> Vec<usize> {
        self.matrix
            .outer_iterator()
            .map(|col| col.data().iter().filter(|&&v| v > 0).count())
            .collect()
    }

    /// Number of cells in which each feature is detected.
    pub fn feature_cells(&self) -> Vec<usize> {
        let mut n = vec![0usize; self.num_features()];
        for col in self.matrix.outer_iterator() {
            for (g, &v) in col.iter() {
                if v > 0 {
                    n[g] += 1;
                }
            }
        }
        n
    }

    /// Total UMIs per feature.
    pub fn feature_totals(&self) -> Vec<u64> {
        let mut n = vec![0u64; self.num_features()];
        for col in self.matrix.outer_iterator() {
            for (g, &v) in col.iter() {
                n[g] += u64::from(v);
            }
        }
        n
    }

    /// Keep the given cells, in the given order.
    pub fn select_cells(&self, cells: &[usize]) -> ExpressionMatrix {
        let mut tri = TriMat::new((self.num_features(), cells.len()));
        for (j, &c) in cells.iter().enumerate() {
            if let Some(col) = self.matrix.outer_view(c) {
                for (g, &v) in col.iter() {
                    tri.add_triplet(g, j, v);
                }
            }
        }
        ExpressionMatrix {
            name: self.name.clone(),
            barcodes: cells.iter().map(|&c| self.barcodes[c].clone()).collect(),
            feature_ids: self.feature_ids.clone(),
            feature_names: self.feature_names.clone(),
            matrix: tri.to_csc(),
        }
    }

    /// Keep the given features, in the given order.
    pub fn select_features(&self, features: &[usize]) -> ExpressionMatrix {
        let mut remap = vec![None; self.num_features()];
        for (new, &old) in features.iter().enumerate() {
            remap[old] = Some(new);
        }
        let mut tri = TriMat::new((features.len(), self.num_cells()));
        for (c, col) in self.matrix.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                if let Some(new) = remap[g] {
                    tri.add_triplet(new, c, v);
                }
            }
        }
        ExpressionMatrix {
            name: self.name.clone(),
            barcodes: self.barcodes.clone(),
            feature_ids: features.iter().map(|&f| self.feature_ids[f].clone()).collect(),
            feature_names: features.iter().map(|&f| self.feature_names[f].clone()).collect(),
            matrix: tri.to_csc(),
        }
    }

    /// Dense genes x cells copy of the counts.
    pub fn to_dense(&self) -> ndarray::Array2<f64> {
        let mut dense = ndarray::Array2::zeros(self.matrix.shape());
        for (c, col) in self.matrix.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                dense[[g, c]] = f64::from(v);
            }
        }
        dense
    }

    /// Compressed copy of the counts for the scan-rs engines.
    pub fn to_adaptive(&self) -> AdaptiveMat {
        AdaptiveMat::from_csmat(&self.matrix)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn toy() -> ExpressionMatrix {
        let counts = array![[1u32, 0, 3], [0, 0, 1], [2, 5, 0]];
        ExpressionMatrix::from_dense(
            "toy",
            vec!["A".into(), "B".into(), "C".into()],
            vec!["c1".into(), "c2".into(), "c3".into()],
            counts.view(),
        )
        .unwrap()
    }

    #[test]
    fn test_summaries() {
        let m = toy();
        assert_eq!(m.cell_totals(), vec![3, 5, 4]);
        assert_eq!(m.cell_features(), vec![2, 1, 2]);
        assert_eq!(m.feature_cells(), vec![2, 1, 2]);
        assert_eq!(m.feature_totals(), vec![4, 1, 7]);
    }

    #[test]
    fn test_select() {
        let m = toy();
        let c = m.select_cells(&[2, 0]);
        assert_eq!(c.barcodes, vec!["c3", "c1"]);
        assert_eq!(c.to_dense(), array![[3.0, 1.0], [1.0, 0.0], [0.0, 2.0]]);

        let f = m.select_features(&[2, 0]);
        assert_eq!(f.feature_names, vec!["C", "A"]);
        assert_eq!(f.to_dense(), array![[2.0, 5.0, 0.0], [1.0, 0.0, 3.0]]);
    }

    #[test]
    fn test_shape_mismatch() {
        let m = toy();
        let bad = ExpressionMatrix::new("x", vec!["c1".into()], m.feature_ids.clone(), m.feature_names.clone(), m.matrix);
        assert!(bad.is_err());
    }
}
