//! Merging samples and anchor-based batch correction.
//!
//! Samples are integrated one at a time into a growing reference, largest first. For each
//! pair the shared features are standardized and projected by a joint SVD of the
//! cross-product matrix (canonical correlation vectors), mutual nearest neighbours in that
//! space become anchors, and the query is moved by a distance-weighted average of the anchor
//! difference vectors.

use crate::error::AnalysisError;
use crate::features::select_variable_features;
use crate::nn::nearest_neighbors;
use crate::normalization::{dense_rows, normalize, regress_out, Normalization, SCALE_CLIP};
use crate::reduce::{cluster_and_embed, reduce_dim, ReduceParams};
use crate::session::{ScaledData, Session, ORIG_IDENT};
use crate::stats::{l2_normalize_rows, scale_rows};
use anyhow::{bail, format_err, Error};
use itertools::Itertools;
use log::{info, warn};
use ndarray::{concatenate, s, Array2, Axis};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::SVDDC;
use scflow_types::{CellMetadata, Column, ExpressionMatrix, Factor};
use serde::{Deserialize, Serialize};
use sprs::TriMat;
use std::collections::{HashMap, HashSet};

/// Parameters of [`integrate_batches`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParams {
    /// shared features used to find anchors and carried in the integrated layer
    pub n_anchor_features: usize,
    /// neighbourhood size for mutual nearest neighbours
    pub k_anchor: usize,
    /// anchors consulted when correcting each query cell
    pub k_weight: usize,
    /// canonical correlation vectors kept
    pub dims: usize,
    /// fail instead of skipping integration when fewer than two samples are given
    pub require_integration: bool,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        IntegrationParams {
            n_anchor_features: 2000,
            k_anchor: 5,
            k_weight: 100,
            dims: 30,
            require_integration: false,
        }
    }
}

/// One sample's expression over the anchor features.
#[derive(Clone, Debug)]
pub struct Batch {
    /// sample name, used in error messages
    pub name: String,
    /// features x cells
    pub values: Array2<f64>,
}

/// Aligns a query batch onto a reference batch measured over the same features.
pub trait Integrator {
    /// Corrected query values, features x query cells.
    fn integrate(&self, reference: &Batch, query: &Batch) -> Result<Array2<f64>, Error>;
}

/// Mutual-nearest-neighbour anchors in canonical correlation space.
#[derive(Clone, Debug)]
pub struct AnchorIntegrator {
    /// neighbourhood size for anchor search
    pub k_anchor: usize,
    /// anchors consulted per query cell
    pub k_weight: usize,
    /// canonical correlation vectors kept
    pub dims: usize,
    /// bandwidth of the Gaussian anchor weights
    pub sd_weight: f64,
}

impl Default for AnchorIntegrator {
    fn default() -> Self {
        AnchorIntegrator::from(&IntegrationParams::default())
    }
}

impl From<&IntegrationParams> for AnchorIntegrator {
    fn from(p: &IntegrationParams) -> Self {
        AnchorIntegrator {
            k_anchor: p.k_anchor,
            k_weight: p.k_weight,
            dims: p.dims,
            sd_weight: 1.0,
        }
    }
}

/// Canonical correlation vectors of two feature-aligned matrices: the left and right
/// singular vectors of `X^T Y` after standardizing every feature, L2-normalized per cell.
pub fn joint_embedding(reference: &Array2<f64>, query: &Array2<f64>, dims: usize) -> Result<(Array2<f64>, Array2<f64>), Error> {
    let mut x = reference.clone();
    let mut y = query.clone();
    scale_rows(&mut x, true, None);
    scale_rows(&mut y, true, None);
    let z = x.t().dot(&y);
    let (u, sigma, vt) = z.svddc(JobSvd::Some)?;
    let u = u.ok_or_else(|| format_err!("svd returned no left singular vectors"))?;
    let vt = vt.ok_or_else(|| format_err!("svd returned no right singular vectors"))?;
    // components beyond the numerical rank are arbitrary
    let top = sigma.first().copied().unwrap_or(0.0);
    let rank = sigma.iter().take_while(|&&s| s > 1e-10 * top).count();
    let d = dims.min(rank).max(1);
    let mut a = u.slice(s![.., ..d]).to_owned();
    let mut b = vt.slice(s![..d, ..]).t().to_owned();
    l2_normalize_rows(&mut a);
    l2_normalize_rows(&mut b);
    Ok((a, b))
}

/// Pairs `(reference cell, query cell)` that are among each other's `k` nearest neighbours.
pub fn mutual_nearest_neighbors(reference: &Array2<f64>, query: &Array2<f64>, k: usize) -> Vec<(usize, usize)> {
    let q_to_r = nearest_neighbors(&reference.view(), &query.view(), k, false);
    let r_to_q = nearest_neighbors(&query.view(), &reference.view(), k, false);
    let mut anchors = Vec::new();
    for (q, row) in q_to_r.indices.rows().into_iter().enumerate() {
        for &r in row {
            if r_to_q.indices.row(r).iter().any(|&x| x == q) {
                anchors.push((r, q));
            }
        }
    }
    anchors
}

impl Integrator for AnchorIntegrator {
    fn integrate(&self, reference: &Batch, query: &Batch) -> Result<Array2<f64>, Error> {
        if reference.values.nrows() != query.values.nrows() {
            bail!(
                "batches '{}' and '{}' have different feature counts",
                reference.name,
                query.name
            );
        }
        let (ref_emb, query_emb) = joint_embedding(&reference.values, &query.values, self.dims)?;
        let anchors = mutual_nearest_neighbors(&ref_emb, &query_emb, self.k_anchor);
        if anchors.is_empty() {
            return Err(AnalysisError::NoAnchors(reference.name.clone(), query.name.clone()).into());
        }
        info!(
            "found {} anchors between '{}' and '{}'",
            anchors.len(),
            reference.name,
            query.name
        );

        // query minus reference at each anchor, features x anchors
        let mut vectors = Array2::zeros((query.values.nrows(), anchors.len()));
        for (a, &(r, q)) in anchors.iter().enumerate() {
            let diff = &query.values.column(q) - &reference.values.column(r);
            vectors.column_mut(a).assign(&diff);
        }

        let anchor_points = anchors
            .iter()
            .map(|&(_, q)| query_emb.row(q))
            .collect::<Vec<_>>();
        let anchor_points = ndarray::stack(Axis(0), &anchor_points)?;
        let nn = nearest_neighbors(&anchor_points.view(), &query_emb.view(), self.k_weight, false);
        let k = nn.k();
        let bandwidth = (2.0 / self.sd_weight).powi(2);

        let mut corrected = query.values.clone();
        for (cell, mut col) in corrected.axis_iter_mut(Axis(1)).enumerate() {
            let dists = nn.distances.row(cell);
            let far = dists[k - 1];
            let mut weights = dists
                .iter()
                .map(|&d| {
                    let w = if far > 0.0 { 1.0 - d / far } else { 1.0 };
                    1.0 - (-w / bandwidth).exp()
                })
                .collect::<Vec<_>>();
            let total = weights.iter().sum::<f64>();
            if total > 0.0 {
                weights.iter_mut().for_each(|w| *w /= total);
            } else {
                weights.iter_mut().for_each(|w| *w = 1.0 / k as f64);
            }
            for (j, &a) in nn.indices.row(cell).iter().enumerate() {
                col.scaled_add(-weights[j], &vectors.column(a));
            }
        }
        Ok(corrected)
    }
}

/// Concatenate samples into one session. Barcodes become `<sample>_<barcode>`, genes are
/// the union keyed by feature id (absent genes count zero), and `orig.ident` is the sample name.
/// Derived layers and embeddings are not carried over.
pub fn merge_samples(samples: &[(String, Session)]) -> Result<Session, Error> {
    if samples.is_empty() {
        return Err(AnalysisError::TooFewSamples(0).into());
    }
    let mut ids: Vec<String> = Vec::new();
    let mut names: Vec<String> = Vec::new();
    let mut row_of: HashMap<String, usize> = HashMap::new();
    for (_, s) in samples {
        for (id, name) in s.counts.feature_ids.iter().zip(&s.counts.feature_names) {
            if !row_of.contains_key(id) {
                row_of.insert(id.clone(), ids.len());
                ids.push(id.clone());
                names.push(name.clone());
            }
        }
    }

    let total_cells = samples.iter().map(|(_, s)| s.num_cells()).sum::<usize>();
    let mut tri = TriMat::new((ids.len(), total_cells));
    let mut barcodes = Vec::with_capacity(total_cells);
    let mut offset = 0;
    for (sample, s) in samples {
        let rows = s.counts.feature_ids.iter().map(|id| row_of[id]).collect::<Vec<_>>();
        for (c, col) in s.counts.matrix.outer_iterator().enumerate() {
            for (g, &v) in col.iter() {
                tri.add_triplet(rows[g], offset + c, v);
            }
        }
        barcodes.extend(s.counts.barcodes.iter().map(|b| format!("{sample}_{b}")));
        offset += s.num_cells();
    }
    let counts = ExpressionMatrix::new("merged", barcodes.clone(), ids, names, tri.to_csc())?;

    let parts = samples.iter().map(|(_, s)| &s.metadata).collect::<Vec<_>>();
    let mut metadata = CellMetadata::concat(&parts)?;
    metadata.barcodes = barcodes;
    let origin = samples
        .iter()
        .flat_map(|(name, s)| std::iter::repeat(Some(name.as_str())).take(s.num_cells()));
    metadata.insert(ORIG_IDENT, Column::Categorical(Factor::from_values(origin)))?;

    info!(
        "merged {} samples into {} genes x {} cells",
        samples.len(),
        counts.num_features(),
        counts.num_cells()
    );
    let mut merged = Session::new(counts, "merged")?;
    merged.metadata = metadata;
    merged.validate()?;
    Ok(merged)
}

/// Features present in every sample, ranked by how many samples call them variable and
/// then by their mean rank among those samples.
pub fn select_integration_features(samples: &[&Session], method: Normalization, n: usize) -> Vec<String> {
    let mut votes: HashMap<&str, (usize, usize)> = HashMap::new();
    for s in samples {
        for (rank, g) in select_variable_features(&s.counts.matrix, method, n).into_iter().enumerate() {
            let e = votes.entry(s.counts.feature_names[g].as_str()).or_insert((0, 0));
            e.0 += 1;
            e.1 += rank;
        }
    }
    let lookups = samples.iter().map(|s| s.counts.feature_lookup()).collect::<Vec<_>>();
    votes
        .into_iter()
        .filter(|(name, _)| lookups.iter().all(|l| l.contains_key(name)))
        .sorted_by(|a, b| {
            let mean_a = a.1 .1 as f64 / a.1 .0 as f64;
            let mean_b = b.1 .1 as f64 / b.1 .0 as f64;
            b.1 .0
                .cmp(&a.1 .0)
                .then(mean_a.total_cmp(&mean_b))
                .then(a.0.cmp(b.0))
        })
        .take(n)
        .map(|(name, _)| name.to_string())
        .collect()
}

/// Integrate samples with the default [`AnchorIntegrator`] and reduce the result.
pub fn integrate_batches(
    samples: &[(String, Session)],
    params: &IntegrationParams,
    reduce: &ReduceParams,
) -> Result<Session, Error> {
    integrate_batches_with(&AnchorIntegrator::from(params), samples, params, reduce)
}

/// Integrate samples with `integrator`, then run clustering and embedding on the corrected
/// layer. A single sample skips integration and is reduced directly.
pub fn integrate_batches_with(
    integrator: &impl Integrator,
    samples: &[(String, Session)],
    params: &IntegrationParams,
    reduce: &ReduceParams,
) -> Result<Session, Error> {
    match samples.len() {
        0 => return Err(AnalysisError::TooFewSamples(0).into()),
        n if n < 2 && params.require_integration => return Err(AnalysisError::TooFewSamples(n).into()),
        1 => {
            warn!("only one sample supplied; skipping integration");
            return reduce_dim(&samples[0].1, reduce);
        }
        _ => (),
    }
    reduce.validate()?;

    let normalized = samples
        .iter()
        .map(|(_, s)| normalize(s, reduce.normalization))
        .collect::<Vec<_>>();
    let features = select_integration_features(
        &normalized.iter().collect::<Vec<_>>(),
        reduce.normalization,
        params.n_anchor_features,
    );
    if features.is_empty() {
        bail!("no variable features are shared by all samples");
    }
    info!("integrating {} samples over {} features", samples.len(), features.len());

    let batches = samples
        .iter()
        .zip(&normalized)
        .map(|((name, _), s)| {
            let lookup = s.counts.feature_lookup();
            let rows = features.iter().map(|f| lookup[f.as_str()]).collect::<Vec<_>>();
            let data = s
                .data
                .as_ref()
                .ok_or_else(|| format_err!("sample '{}' is not normalized", name))?;
            Ok(Batch {
                name: name.clone(),
                values: dense_rows(&data.values, &rows),
            })
        })
        .collect::<Result<Vec<_>, Error>>()?;

    // largest sample is the initial reference
    let order = (0..batches.len())
        .sorted_by_key(|&i| std::cmp::Reverse(batches[i].values.ncols()))
        .collect::<Vec<_>>();
    let mut reference = batches[order[0]].clone();
    let mut placed = vec![(order[0], 0usize)];
    for &i in &order[1..] {
        let corrected = integrator.integrate(&reference, &batches[i])?;
        placed.push((i, reference.values.ncols()));
        reference = Batch {
            name: format!("{}+{}", reference.name, batches[i].name),
            values: concatenate(Axis(1), &[reference.values.view(), corrected.view()])?,
        };
    }

    // back to the input sample order used by merge_samples
    let merged = normalize(&merge_samples(samples)?, reduce.normalization);
    let mut offsets = vec![0; batches.len()];
    let mut acc = 0;
    for (i, b) in batches.iter().enumerate() {
        offsets[i] = acc;
        acc += b.values.ncols();
    }
    let mut values = Array2::zeros((features.len(), merged.num_cells()));
    for (i, start) in placed {
        let n = batches[i].values.ncols();
        values
            .slice_mut(s![.., offsets[i]..offsets[i] + n])
            .assign(&reference.values.slice(s![.., start..start + n]));
    }
    scale_rows(&mut values, true, Some(SCALE_CLIP));

    let mut s = merged;
    s.scale = Some(ScaledData {
        features,
        values,
        regressed: Vec::new(),
    });
    if !reduce.regress.is_empty() {
        s = regress_out(&s, &reduce.regress)?;
    }
    let unique: HashSet<&str> = samples.iter().map(|(n, _)| n.as_str()).collect();
    if unique.len() != samples.len() {
        warn!("sample names are not unique; barcodes may collide");
    }
    cluster_and_embed(&s, reduce)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::reduce::test::small_params;
    use crate::session::CLUSTERS;
    use approx::assert_abs_diff_eq;

    /// Two populations; `shift` is added to every count of the first 4 genes.
    fn sample(name: &str, cells: usize, shift: u32, phase: usize) -> Session {
        let counts = Array2::from_shape_fn((12, cells), |(g, c)| {
            let first = c < cells / 2;
            let marker = (g < 6) == first;
            let noise = ((g * 31 + c * 17 + phase) % 3) as u32;
            let base = if marker { 20 + noise } else { noise };
            if g < 4 {
                base + shift
            } else {
                base
            }
        });
        let m = ExpressionMatrix::from_dense(
            name,
            (0..12).map(|g| format!("G{g}")).collect(),
            (0..cells).map(|c| format!("cell{c}")).collect(),
            counts.view(),
        )
        .unwrap();
        Session::new(m, name).unwrap()
    }

    #[test]
    fn test_merge_samples() {
        let a = sample("a", 4, 0, 0);
        let mut b = sample("b", 2, 0, 1);
        b.counts = b.counts.select_features(&[0, 11]);
        let b = b.with_column("extra", Column::Numeric(vec![Some(1.0), Some(2.0)])).unwrap();
        let m = merge_samples(&[("a".into(), a.clone()), ("b".into(), b.clone())]).unwrap();
        assert_eq!(m.num_cells(), 6);
        assert_eq!(m.counts.num_features(), 12);
        assert_eq!(m.counts.barcodes[4], "b_cell0");
        assert_eq!(m.metadata.factor(ORIG_IDENT).unwrap().levels, vec!["a", "b"]);
        assert_eq!(m.metadata.numeric("extra").unwrap()[0], None);
        // genes absent from b count zero there
        let dense = m.counts.to_dense();
        assert_eq!(dense[[5, 4]], 0.0);
        assert_eq!(dense[[11, 5]], b.counts.to_dense()[[1, 1]]);
        assert!(merge_samples(&[]).is_err());
    }

    #[test]
    fn test_sample_count_rules() {
        let params = IntegrationParams::default();
        let err = integrate_batches(&[], &params, &small_params()).unwrap_err();
        assert_eq!(err.downcast_ref::<AnalysisError>(), Some(&AnalysisError::TooFewSamples(0)));

        let one = vec![("a".to_string(), sample("a", 30, 0, 0))];
        let required = IntegrationParams {
            require_integration: true,
            ..IntegrationParams::default()
        };
        let err = integrate_batches(&one, &required, &small_params()).unwrap_err();
        assert_eq!(err.downcast_ref::<AnalysisError>(), Some(&AnalysisError::TooFewSamples(1)));

        // a single sample is reduced directly
        let s = integrate_batches(&one, &params, &small_params()).unwrap();
        assert_eq!(s.counts.barcodes[0], "cell0");
        assert_eq!(s.active_ident.as_deref(), Some(CLUSTERS));
    }

    #[test]
    fn test_anchor_correction_removes_shift() {
        // two groups of 10 cells over 6 features, query shifted by 5 everywhere
        let reference = Array2::from_shape_fn((6, 20), |(f, c)| {
            let group = if c < 10 { 0.0 } else { 10.0 };
            group * if f % 2 == 0 { 1.0 } else { -1.0 } + ((f * 7 + c * 3) % 5) as f64 * 0.1
        });
        let query = reference.mapv(|v| v + 5.0);
        let integrator = AnchorIntegrator::default();
        let corrected = integrator
            .integrate(
                &Batch {
                    name: "r".into(),
                    values: reference.clone(),
                },
                &Batch {
                    name: "q".into(),
                    values: query,
                },
            )
            .unwrap();
        let r_mean = reference.mean_axis(Axis(1)).unwrap();
        let c_mean = corrected.mean_axis(Axis(1)).unwrap();
        assert_abs_diff_eq!(r_mean, c_mean, epsilon = 1.0);
    }

    #[test]
    fn test_mutual_nearest_neighbors() {
        let r = ndarray::array![[0.0], [10.0]];
        let q = ndarray::array![[0.5], [9.0], [20.0]];
        let mut anchors = mutual_nearest_neighbors(&r, &q, 1);
        anchors.sort();
        assert_eq!(anchors, vec![(0, 0), (1, 1)]);
    }

    #[test]
    fn test_integration_clusters_by_population() {
        let samples = vec![
            ("a".to_string(), sample("a", 30, 0, 0)),
            ("b".to_string(), sample("b", 24, 6, 2)),
        ];
        let s = integrate_batches(&samples, &IntegrationParams::default(), &small_params()).unwrap();
        s.validate().unwrap();
        assert_eq!(s.num_cells(), 54);
        let scale = s.scale.as_ref().unwrap();
        assert_eq!(scale.values.ncols(), 54);
        let clusters = s.ident().unwrap();
        // first halves of both samples share a cluster
        assert_eq!(clusters.get(0), clusters.get(30));
        assert_eq!(clusters.get(15), clusters.get(42));
        assert_ne!(clusters.get(0), clusters.get(15));
    }
}
