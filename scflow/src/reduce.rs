//! Normalization, variable features, PCA, graph clustering and UMAP in one stage.

use crate::cluster::{CommunityAlgorithm, Clusterer, SnnClusterer, NUM_NEIGHBORS};
use crate::dim_red::umap::{Embedder, UmapEmbedder};
use crate::dim_red::{run_pca, BkSvdPca};
use crate::error::AnalysisError;
use crate::features::select_variable_features;
use crate::normalization::{normalize, scale_data, Normalization};
use crate::session::{Session, CLUSTERS};
use anyhow::{format_err, Error};
use log::info;
use ndarray::s;
use scflow_types::{Column, Factor};
use serde::{Deserialize, Serialize};

/// Largest accepted clustering resolution.
pub const MAX_RESOLUTION: f64 = 3.0;

/// Parameters of [`reduce_dim`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceParams {
    /// normalization method
    pub normalization: Normalization,
    /// number of variable features to scale and project
    pub n_variable_features: usize,
    /// principal components to compute
    pub n_pcs: usize,
    /// leading components used for the neighbour graph and UMAP
    pub ndims: usize,
    /// neighbours per cell in the kNN graph
    pub k: usize,
    /// community detection resolution, in [0, 3]
    pub resolution: f64,
    /// Louvain or Leiden
    pub algorithm: CommunityAlgorithm,
    /// seed shared by clustering and UMAP
    pub seed: u64,
    /// metadata columns to regress out of the scaled layer
    pub regress: Vec<String>,
    /// compute the UMAP embedding
    pub umap: bool,
}

impl Default for ReduceParams {
    fn default() -> Self {
        ReduceParams {
            normalization: Normalization::Sct,
            n_variable_features: 3000,
            n_pcs: 50,
            ndims: 15,
            k: NUM_NEIGHBORS,
            resolution: 0.1,
            algorithm: CommunityAlgorithm::Louvain,
            seed: 0,
            regress: Vec::new(),
            umap: true,
        }
    }
}

impl ReduceParams {
    /// Reject parameter combinations that can never succeed.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !(0.0..=MAX_RESOLUTION).contains(&self.resolution) {
            return Err(AnalysisError::InvalidResolution(self.resolution));
        }
        if self.ndims == 0 || self.ndims > self.n_pcs {
            return Err(AnalysisError::TooManyDimensions {
                requested: self.ndims,
                available: self.n_pcs,
            });
        }
        Ok(())
    }
}

/// Normalize, select variable features, scale (regressing out `params.regress`), then
/// run [`cluster_and_embed`].
pub fn reduce_dim(session: &Session, params: &ReduceParams) -> Result<Session, Error> {
    params.validate()?;
    let s = normalize(session, params.normalization);
    let genes = select_variable_features(&s.counts.matrix, params.normalization, params.n_variable_features);
    if genes.is_empty() {
        return Err(format_err!("no variable features: every gene is undetected"));
    }
    info!("selected {} variable features", genes.len());
    let features = genes
        .iter()
        .map(|&g| s.counts.feature_names[g].clone())
        .collect::<Vec<_>>();
    let s = scale_data(&s, &features, &params.regress)?;
    cluster_and_embed(&s, params)
}

/// PCA of the scaled layer, SNN clustering and UMAP over the leading `ndims` components.
/// Sets `pca`, `umap` and `seurat_clusters`, and makes the clusters the active identity.
pub fn cluster_and_embed(session: &Session, params: &ReduceParams) -> Result<Session, Error> {
    params.validate()?;
    let scale = session
        .scale
        .as_ref()
        .ok_or_else(|| format_err!("reduction requires a scaled layer"))?;
    let pca = run_pca(&BkSvdPca, &scale.values, params.n_pcs)?;
    let available = pca.embedding.ncols();
    if params.ndims > available {
        return Err(AnalysisError::TooManyDimensions {
            requested: params.ndims,
            available,
        }
        .into());
    }
    let leading = pca.embedding.slice(s![.., ..params.ndims]).to_owned();

    let clusterer = SnnClusterer {
        k: params.k,
        resolution: params.resolution,
        seed: params.seed as usize,
        algorithm: params.algorithm,
    };
    let labels = clusterer.cluster(&leading)?;
    let clusters = Factor::from_values_sorted(labels.iter().map(|l| Some(l.to_string())));

    let mut s = session.clone();
    s.embeddings.insert("pca".to_string(), pca.embedding);
    if params.umap {
        let umap = UmapEmbedder::default().embed(&leading, params.seed)?;
        s.embeddings.insert("umap".to_string(), umap);
    }
    s.metadata.insert(CLUSTERS, Column::Categorical(clusters))?;
    s.with_ident(CLUSTERS)
}
