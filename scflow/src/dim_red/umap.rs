use anyhow::{bail, Error};
use log::info;
use ndarray::Array2;
use umap_rs::dist::DistanceType;
use umap_rs::umap::Umap;

/// Default UMAP neighbourhood size.
pub const N_NEIGHBORS: usize = 30;
/// Default minimum distance between embedded points.
pub const MIN_DIST: f64 = 0.3;

/// A nonlinear 2-D embedding of cells for visualization.
pub trait Embedder {
    /// Embed the rows (cells) of `x` using the fixed `seed`.
    fn embed(&self, x: &Array2<f64>, seed: u64) -> Result<Array2<f64>, Error>;
}

/// UMAP through umap-rs.
#[derive(Clone, Debug)]
pub struct UmapEmbedder {
    /// neighbourhood size, reduced to `n_cells - 1` for small inputs
    pub n_neighbors: usize,
    /// minimum distance between embedded points
    pub min_dist: f64,
    /// output dimensions
    pub dims: usize,
}

impl Default for UmapEmbedder {
    fn default() -> Self {
        UmapEmbedder {
            n_neighbors: N_NEIGHBORS,
            min_dist: MIN_DIST,
            dims: 2,
        }
    }
}

impl Embedder for UmapEmbedder {
    fn embed(&self, x: &Array2<f64>, seed: u64) -> Result<Array2<f64>, Error> {
        let num_bcs = x.nrows();
        if num_bcs < 3 {
            bail!("UMAP needs at least 3 cells, got {}", num_bcs);
        }
        let spread = 1.0;
        let umap = Umap::new(
            Some(DistanceType::euclidean()),
            self.dims,
            self.min_dist,
            spread,
            self.n_neighbors.min(num_bcs - 1),
            None,
        );
        info!("running UMAP on {} cells", num_bcs);
        let mut state = umap.initialize_fit(&x.as_standard_layout().to_owned(), Some(seed), 1);
        state.optimize();
        Ok(state.embedding)
    }
}
