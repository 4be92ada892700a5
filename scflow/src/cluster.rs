//! Graph-based clustering: k-nearest neighbours, shared-nearest-neighbour weights,
//! then Louvain or Leiden community detection.

use anyhow::{bail, Error};
use leiden::leiden::Leiden;
use leiden::louvain::Louvain;
use leiden::{Clustering, Graph, Network, SimpleClustering};
use log::info;
use ndarray::Array2;
use scan_rs::nn::knn;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default neighbourhood size for the kNN graph.
pub const NUM_NEIGHBORS: usize = 20;
/// SNN edges with Jaccard overlap below this are dropped.
pub const PRUNE_SNN: f64 = 1.0 / 15.0;
/// Default clustering seed.
pub const RANDOM_SEED: usize = 0;
const MAX_ITERATIONS: usize = 10;
const LEIDEN_RANDOMNESS: f64 = 0.01;

/// Community detection algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommunityAlgorithm {
    /// Louvain modularity optimization
    #[default]
    Louvain,
    /// Leiden refinement of Louvain
    Leiden,
}

/// Assigns each cell (row) of an embedding to a cluster.
pub trait Clusterer {
    /// Cluster labels `0..k`, with 0 the largest cluster.
    fn cluster(&self, x: &Array2<f64>) -> Result<Vec<usize>, Error>;
}

/// Shared-nearest-neighbour graph clustering.
#[derive(Clone, Debug)]
pub struct SnnClusterer {
    /// neighbours per cell
    pub k: usize,
    /// modularity resolution
    pub resolution: f64,
    /// random seed for node visiting order
    pub seed: usize,
    /// Louvain or Leiden
    pub algorithm: CommunityAlgorithm,
}

impl Default for SnnClusterer {
    fn default() -> Self {
        SnnClusterer {
            k: NUM_NEIGHBORS,
            resolution: 0.1,
            seed: RANDOM_SEED,
            algorithm: CommunityAlgorithm::Louvain,
        }
    }
}

/// Jaccard-weighted shared-nearest-neighbour edges `(i, j, w)` with `i < j`.
pub fn snn_edges(neighbors: &Array2<u32>, prune: f64) -> Vec<(u32, u32, f64)> {
    let n = neighbors.nrows();
    let sets = (0..n)
        .map(|i| {
            let mut s = neighbors.row(i).iter().copied().collect::<HashSet<u32>>();
            s.insert(i as u32);
            s
        })
        .collect::<Vec<_>>();
    let mut seen = HashSet::new();
    let mut edges = Vec::new();
    for i in 0..n {
        for &j in neighbors.row(i) {
            let (a, b) = if (i as u32) < j { (i as u32, j) } else { (j, i as u32) };
            if a == b || !seen.insert((a, b)) {
                continue;
            }
            let shared = sets[a as usize].intersection(&sets[b as usize]).count() as f64;
            let union = (sets[a as usize].len() + sets[b as usize].len()) as f64 - shared;
            let w = shared / union;
            if w >= prune {
                edges.push((a, b, w));
            }
        }
    }
    edges
}

/// Build a weighted network whose node weights are weighted degrees.
pub fn build_network(n_nodes: usize, edges: &[(u32, u32, f64)]) -> Network {
    let mut graph = Graph::with_capacity(n_nodes, edges.len());
    let node_indices = (0..n_nodes).map(|_| graph.add_node(0.0)).collect::<Vec<_>>();
    let mut node_weights = vec![0.0f32; n_nodes];
    for &(i, j, w) in edges {
        graph.add_edge(i.into(), j.into(), w as f32);
        node_weights[i as usize] += w as f32;
        node_weights[j as usize] += w as f32;
    }
    for (&idx, &w) in node_indices.iter().zip(&node_weights) {
        if let Some(weight) = graph.node_weight_mut(idx) {
            *weight = w;
        }
    }
    Network::new_from_graph(graph)
}

/// Relabel clusters so that 0 is the largest, ties broken by first appearance.
pub fn relabel_by_size(labels: &[usize]) -> Vec<usize> {
    let k = labels.iter().max().map_or(0, |&m| m + 1);
    let mut sizes = vec![0usize; k];
    let mut first = vec![usize::MAX; k];
    for (i, &l) in labels.iter().enumerate() {
        sizes[l] += 1;
        first[l] = first[l].min(i);
    }
    let mut order = (0..k).filter(|&l| sizes[l] > 0).collect::<Vec<_>>();
    order.sort_by_key(|&l| (std::cmp::Reverse(sizes[l]), first[l]));
    let mut new_label = vec![0; k];
    for (new, &old) in order.iter().enumerate() {
        new_label[old] = new;
    }
    labels.iter().map(|&l| new_label[l]).collect()
}

impl Clusterer for SnnClusterer {
    fn cluster(&self, x: &Array2<f64>) -> Result<Vec<usize>, Error> {
        let n = x.nrows();
        if n < 2 {
            bail!("clustering needs at least 2 cells, got {}", n);
        }
        let k = self.k.clamp(1, n - 1);
        info!("computing k-nearest neighbors with k = {}", k);
        let standard = x.as_standard_layout();
        let neighbors = knn::<u32>(&standard.view(), k);
        let edges = snn_edges(&neighbors, PRUNE_SNN);
        let network = build_network(n, &edges);

        info!("running {:?} at resolution {}", self.algorithm, self.resolution);
        let mut clustering = SimpleClustering::init_different_clusters(n);
        match self.algorithm {
            CommunityAlgorithm::Louvain => {
                let mut louvain = Louvain::new(self.resolution, Some(self.seed));
                for _ in 0..MAX_ITERATIONS {
                    if !louvain.iterate(&network, &mut clustering) {
                        break;
                    }
                }
            }
            CommunityAlgorithm::Leiden => {
                let mut leiden = Leiden::new(self.resolution, LEIDEN_RANDOMNESS, Some(self.seed));
                for _ in 0..MAX_ITERATIONS {
                    if !leiden.iterate(&network, &mut clustering) {
                        break;
                    }
                }
            }
        }
        let labels = (0..n).map(|i| clustering.get(i)).collect::<Vec<_>>();
        let labels = relabel_by_size(&labels);
        info!("found {} clusters", labels.iter().max().map_or(0, |&m| m + 1));
        Ok(labels)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;

    fn blobs() -> Array2<f64> {
        // two tight, well separated groups of 12 cells in 2-D
        Array2::from_shape_fn((24, 2), |(i, d)| {
            let center = if i < 12 { 0.0 } else { 100.0 };
            let jitter = ((i * 7 + d * 3) % 5) as f64 * 0.1;
            center + jitter + d as f64 * 0.01 * i as f64
        })
    }

    #[test]
    fn test_relabel_by_size() {
        assert_eq!(relabel_by_size(&[3, 3, 1, 5, 5, 5]), vec![1, 1, 2, 0, 0, 0]);
        assert_eq!(relabel_by_size(&[2, 0]), vec![0, 1]);
    }

    #[test]
    fn test_snn_edges() {
        // 0 and 1 are mutual neighbours, 2 points at 1
        let nn = array![[1u32], [0], [1]];
        let edges = snn_edges(&nn, 0.0);
        // {0,1} vs {1,0}: 2/2 ; {1,2} vs {0,1}: 1/3
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&(0, 1, 1.0)));
        assert!(edges.iter().any(|&(a, b, w)| a == 1 && b == 2 && (w - 1.0 / 3.0).abs() < 1e-12));
        assert_eq!(snn_edges(&nn, 0.5).len(), 1);
    }

    #[test]
    fn test_two_blobs_two_clusters() {
        let x = blobs();
        for algorithm in [CommunityAlgorithm::Louvain, CommunityAlgorithm::Leiden] {
            let c = SnnClusterer {
                k: 5,
                resolution: 0.1,
                seed: 0,
                algorithm,
            };
            let labels = c.cluster(&x).unwrap();
            assert!(labels[..12].iter().all(|&l| l == labels[0]));
            assert!(labels[12..].iter().all(|&l| l == labels[12]));
            assert_ne!(labels[0], labels[12]);
        }
    }

    #[test]
    fn test_deterministic() {
        let x = blobs();
        let c = SnnClusterer::default();
        assert_eq!(c.cluster(&x).unwrap(), c.cluster(&x).unwrap());
    }
}
