use crate::stats::sq_dist;
use ball_tree::{BallTree, Point};
use log::info;
use ndarray::parallel::prelude::{IntoParallelIterator, ParallelIterator};
use ndarray::{Array1, Array2, ArrayView2};

/// A row of a cells x dims matrix, owned so the tree can keep it.
#[derive(PartialEq)]
struct Coords(Array1<f64>);

impl Point for Coords {
    fn distance(&self, other: &Self) -> f64 {
        sq_dist(self.0.view(), other.0.view()).sqrt()
    }

    fn move_towards(&self, other: &Self, d: f64) -> Self {
        let gap = self.distance(other);
        if gap == 0.0 {
            return Coords(self.0.clone());
        }
        Coords(&self.0 + &((&other.0 - &self.0) * (d / gap)))
    }
}

/// Nearest neighbours of each query row among the reference rows.
#[derive(Clone, Debug, PartialEq)]
pub struct Neighbors {
    /// query x k reference row indices, nearest first
    pub indices: Array2<usize>,
    /// query x k Euclidean distances matching `indices`
    pub distances: Array2<f64>,
}

impl Neighbors {
    /// Neighbours per query row.
    pub fn k(&self) -> usize {
        self.indices.ncols()
    }
}

/// Find the `k` nearest rows of `reference` for every row of `query`, using Euclidean distance.
/// With `exclude_self`, `query` must be `reference` and row `i` is never its own neighbour.
/// `k` is reduced to the number of available reference rows.
pub fn nearest_neighbors(reference: &ArrayView2<f64>, query: &ArrayView2<f64>, k: usize, exclude_self: bool) -> Neighbors {
    let n_ref = reference.nrows();
    let k = k.min(if exclude_self { n_ref.saturating_sub(1) } else { n_ref });

    let points = reference.rows().into_iter().map(|r| Coords(r.to_owned())).collect::<Vec<_>>();
    let values = (0..n_ref).collect::<Vec<_>>();
    info!("constructing ball tree of {} points", n_ref);
    let ball_tree = BallTree::new(points, values);

    info!("querying {} points for {} neighbors", query.nrows(), k);
    let rows = (0..query.nrows())
        .into_par_iter()
        .map_init(
            || ball_tree.query(),
            |q, i| {
                let pt = Coords(query.row(i).to_owned());
                q.nn(&pt)
                    .filter(|&(_, _, &v)| !(exclude_self && v == i))
                    .take(k)
                    .map(|(_, d, &v)| (v, d))
                    .collect::<Vec<_>>()
            },
        )
        .collect::<Vec<_>>();

    let mut indices = Array2::zeros((rows.len(), k));
    let mut distances = Array2::zeros((rows.len(), k));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, (v, d)) in row.into_iter().enumerate() {
            indices[[i, j]] = v;
            distances[[i, j]] = d;
        }
    }
    Neighbors { indices, distances }
}

/// `k` nearest neighbours of each row of `x` among the other rows.
pub fn knn_graph(x: &ArrayView2<f64>, k: usize) -> Neighbors {
    nearest_neighbors(x, x, k, true)
}
