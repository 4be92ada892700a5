//! Linear and nonlinear embeddings of cells.
//!
//! Each method sits behind a small trait so the numerical engine can be swapped: the
//! defaults delegate to the scan-rs block Krylov SVD and to umap-rs.

use anyhow::Error;
use log::{info, warn};
use ndarray::{s, Array1, Array2, Axis};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::SVDDC;
use scan_rs::dim_red::bk_svd::BkSvd;
use scan_rs::dim_red::Pca;

/// UMAP embedding
pub mod umap;

/// Below this ratio of matrix size to requested rank a dense SVD is cheaper and exact.
const EXACT_SVD_RATIO: usize = 4;

/// Result of projecting cells onto principal components.
#[derive(Clone, Debug)]
pub struct Projection {
    /// cells x k coordinates
    pub embedding: Array2<f64>,
    /// features x k loadings
    pub loadings: Array2<f64>,
    /// singular values
    pub singular_values: Array1<f64>,
}

/// A linear dimensionality reduction of a features x cells matrix.
pub trait Reducer {
    /// Project the cells (columns) of the centered matrix `x` onto `k` components.
    fn reduce(&self, x: &Array2<f64>, k: usize) -> Result<Projection, Error>;
}

/// PCA through the scan-rs block Krylov SVD, with a dense fallback for small inputs.
#[derive(Clone, Debug, Default)]
pub struct BkSvdPca;

impl Reducer for BkSvdPca {
    fn reduce(&self, x: &Array2<f64>, k: usize) -> Result<Projection, Error> {
        let (m, n) = x.dim();
        let (mut u, sigma) = if m.min(n) <= EXACT_SVD_RATIO * k {
            let (u, sigma, _) = x.svddc(JobSvd::Some)?;
            let u = u.ok_or_else(|| anyhow::format_err!("svd returned no left singular vectors"))?;
            (u.slice(s![.., ..k]).to_owned(), sigma.slice(s![..k]).to_owned())
        } else {
            let (u, sigma, _) = BkSvd::new().run_pca(x, k)?;
            (u, sigma)
        };
        orient_components(&mut u);
        let embedding = x.t().dot(&u);
        Ok(Projection {
            embedding,
            loadings: u,
            singular_values: sigma,
        })
    }
}

/// Flip component signs so the largest-magnitude loading of each is positive.
fn orient_components(u: &mut Array2<f64>) {
    for mut col in u.axis_iter_mut(Axis(1)) {
        let pivot = col
            .iter()
            .copied()
            .fold(0.0f64, |best, v| if v.abs() > best.abs() { v } else { best });
        if pivot < 0.0 {
            col.mapv_inplace(|v| -v);
        }
    }
}

/// Number of components that can be computed from a features x cells matrix, reduced
/// from `requested` with a warning when the matrix is too small.
pub fn clamp_components(requested: usize, features: usize, cells: usize) -> usize {
    let max = features.min(cells).saturating_sub(1).max(1);
    if requested > max {
        warn!(
            "matrix shape [{}, {}] < requested PCs {}, reducing to {}",
            features, cells, requested, max
        );
        max
    } else {
        requested
    }
}

/// Run PCA on `x` (features x cells, centered) keeping up to `k` components.
pub fn run_pca(reducer: &impl Reducer, x: &Array2<f64>, k: usize) -> Result<Projection, Error> {
    let (features, cells) = x.dim();
    let k = clamp_components(k, features, cells);
    info!("running PCA with {} components on {} features x {} cells", k, features, cells);
    reducer.reduce(x, k)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stats::scale_rows;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_groups() -> Array2<f64> {
        // 3 features x 6 cells; cells 0..3 and 3..6 differ along feature 0
        let mut x = array![
            [5.0, 5.2, 4.8, -5.0, -5.1, -4.9],
            [0.1, -0.1, 0.0, 0.2, -0.2, 0.0],
            [1.0, 0.9, 1.1, 1.0, 1.1, 0.9]
        ];
        scale_rows(&mut x, false, None);
        x
    }

    #[test]
    fn test_first_component_separates_groups() {
        let x = two_groups();
        let p = run_pca(&BkSvdPca, &x, 2).unwrap();
        assert_eq!(p.embedding.dim(), (6, 2));
        assert_eq!(p.loadings.dim(), (3, 2));
        let pc1 = p.embedding.column(0);
        assert!(pc1.iter().take(3).all(|&v| v > 0.0) && pc1.iter().skip(3).all(|&v| v < 0.0));
        assert!(p.singular_values[0] >= p.singular_values[1]);
        // loadings are orthonormal
        assert_abs_diff_eq!(p.loadings.t().dot(&p.loadings), Array2::eye(2), epsilon = 1e-9);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_components(50, 3, 6), 2);
        assert_eq!(clamp_components(10, 100, 100), 10);
        assert_eq!(clamp_components(5, 1, 1), 1);
    }

    #[test]
    fn test_bk_svd_path_matches_exact() {
        // 40 x 30 with rank-2 structure, large enough to leave the dense path for k = 2
        let x = Array2::from_shape_fn((40, 30), |(i, j)| {
            ((i as f64) * 0.3).sin() * ((j as f64) * 0.2).cos() * 3.0 + ((i * j) as f64 * 0.01).cos()
        });
        let mut x = x;
        scale_rows(&mut x, false, None);
        let fast = BkSvdPca.reduce(&x, 2).unwrap();
        let (_, sigma, _) = x.svddc(JobSvd::None).unwrap();
        assert_abs_diff_eq!(fast.singular_values[0], sigma[0], epsilon = 1e-6 * sigma[0]);
    }
}
