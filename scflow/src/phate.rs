//! Diffusion-based embedding (PHATE) and imputation (MAGIC).
//!
//! Both build a sparse alpha-decay affinity over each cell's nearest neighbours in PCA space
//! and diffuse over the resulting Markov operator. MAGIC multiplies the diffused operator
//! into the normalized expression matrix. PHATE turns the diffused operator into potential
//! distances and embeds them by classical MDS. Above `n_landmark` cells it works on a
//! landmark operator instead and places every cell by its transitions to the landmarks.

use crate::dim_red::{run_pca, BkSvdPca};
use crate::error::AnalysisError;
use crate::nn::{knn_graph, nearest_neighbors};
use crate::plot::{gradient_colors, scatter, PALETTE};
use crate::session::Session;
use crate::stats::median;
use anyhow::{bail, format_err, Error};
use log::info;
use ndarray::{s, Array2, Axis};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::{Eigh, SVDDC, UPLO};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use scflow_types::ExpressionMatrix;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::path::Path;

/// Genes detected in this many cells or fewer are dropped on the raw path.
pub const RAW_MIN_CELLS: usize = 10;
/// Cells with this many total counts or fewer are dropped on the raw path.
pub const RAW_MIN_LIBRARY: f64 = 1000.0;
/// Largest diffusion time considered when choosing `t` automatically.
pub const T_MAX: usize = 100;
const KERNEL_THRESHOLD: f64 = 1e-4;
const POTENTIAL_EPS: f64 = 1e-7;
/// Neighbours searched for kernel entries, as a multiple of the bandwidth neighbour.
const KERNEL_SEARCH: usize = 3;
const LANDMARK_ITERATIONS: usize = 10;
const LANDMARK_SEED: u64 = 42;

/// Which expression values feed the embedding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhateInput {
    /// the scaled (or batch-corrected) layer
    Integrated,
    /// raw counts, filtered and normalized here
    #[default]
    Raw,
}

/// Cells whose categorical `column` takes one of `values`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellSubset {
    /// metadata column
    pub column: String,
    /// accepted labels
    pub values: Vec<String>,
}

/// Parameters of [`run_phate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhateParams {
    /// input values
    pub input: PhateInput,
    /// restrict to a subset of cells first
    pub subset: Option<CellSubset>,
    /// diffusion time; chosen from the von Neumann entropy knee when absent
    pub t: Option<usize>,
    /// gene whose imputed expression colours the plot
    pub color_gene: Option<String>,
    /// neighbour used for the adaptive bandwidth
    pub knn: usize,
    /// kernel decay exponent
    pub decay: f64,
    /// principal components computed before building the kernel
    pub n_pca: usize,
    /// larger inputs are diffused over this many landmarks
    pub n_landmark: usize,
    /// MAGIC diffusion time
    pub magic_t: usize,
    /// MAGIC bandwidth neighbour
    pub magic_knn: usize,
    /// MAGIC kernel decay
    pub magic_decay: f64,
}

impl Default for PhateParams {
    fn default() -> Self {
        PhateParams {
            input: PhateInput::Raw,
            subset: None,
            t: None,
            color_gene: None,
            knn: 5,
            decay: 40.0,
            n_pca: 100,
            n_landmark: 2000,
            magic_t: 3,
            magic_knn: 5,
            magic_decay: 15.0,
        }
    }
}

/// Imputed expression, cells x genes.
#[derive(Clone, Debug, PartialEq)]
pub struct ImputedMatrix {
    /// column labels
    pub genes: Vec<String>,
    /// cells x genes
    pub values: Array2<f64>,
}

impl ImputedMatrix {
    /// Imputed values of one gene.
    pub fn gene(&self, name: &str) -> Result<Vec<f64>, Error> {
        let j = self
            .genes
            .iter()
            .position(|g| g == name)
            .ok_or_else(|| AnalysisError::GeneNotFound(name.to_string()))?;
        Ok(self.values.column(j).to_vec())
    }
}

/// Output of [`run_phate`].
#[derive(Clone, Debug)]
pub struct PhateResult {
    /// cells x 2
    pub embedding: Array2<f64>,
    /// MAGIC output, raw path only
    pub imputed: Option<ImputedMatrix>,
    /// barcodes of the embedded cells
    pub cells: Vec<String>,
}

/// Filtered, normalized raw counts.
#[derive(Clone, Debug)]
pub struct RawMatrix {
    /// kept gene symbols
    pub genes: Vec<String>,
    /// kept cell indices into the input matrix
    pub cells: Vec<usize>,
    /// cells x genes, square-root of median library-size normalized counts
    pub values: Array2<f64>,
}

/// Raw-path preprocessing, in order: drop genes detected in at most [`RAW_MIN_CELLS`]
/// cells, drop cells with at most [`RAW_MIN_LIBRARY`] counts over the kept genes, scale
/// every cell to the median library size, take square roots.
///
/// Gene detection is counted over all input cells, so a gene stays even when some of the
/// cells it was seen in are dropped by the library-size filter.
pub fn raw_preprocess(counts: &ExpressionMatrix) -> Result<RawMatrix, Error> {
    let genes = counts
        .feature_cells()
        .into_iter()
        .enumerate()
        .filter_map(|(g, n)| (n > RAW_MIN_CELLS).then_some(g))
        .collect::<Vec<_>>();
    let by_gene = counts.select_features(&genes);
    let cells = by_gene
        .cell_totals()
        .into_iter()
        .enumerate()
        .filter_map(|(c, total)| (total as f64 > RAW_MIN_LIBRARY).then_some(c))
        .collect::<Vec<_>>();
    if genes.is_empty() || cells.is_empty() {
        bail!(
            "raw preprocessing left {} genes and {} cells",
            genes.len(),
            cells.len()
        );
    }
    let kept = by_gene.select_cells(&cells);
    info!(
        "raw preprocessing kept {} genes x {} cells",
        kept.num_features(),
        kept.num_cells()
    );

    let mut values = kept.to_dense().reversed_axes();
    let totals = values.sum_axis(Axis(1));
    let target = median(&totals.to_vec());
    for (mut row, &total) in values.rows_mut().into_iter().zip(totals.iter()) {
        row.mapv_inplace(|v| (v * target / total).sqrt());
    }
    Ok(RawMatrix {
        genes: kept.feature_names.clone(),
        cells,
        values,
    })
}

/// Euclidean distances between all rows.
pub fn pairwise_distances(x: &Array2<f64>) -> Array2<f64> {
    let norms = x.map_axis(Axis(1), |r| r.dot(&r));
    let gram = x.dot(&x.t());
    Array2::from_shape_fn(gram.dim(), |(i, j)| (norms[i] + norms[j] - 2.0 * gram[[i, j]]).max(0.0).sqrt())
}

/// Symmetric alpha-decay affinity `exp(-(d_ij / sigma_i)^decay)`, with `sigma_i` the
/// distance to the `knn`-th neighbour, averaged with its transpose. Entries are only formed
/// between a cell and its nearest few neighbours, and tiny ones are dropped.
pub fn alpha_decay_affinity(x: &Array2<f64>, knn: usize, decay: f64) -> CsMat<f64> {
    let n = x.nrows();
    let neighbors = knn_graph(&x.view(), knn * KERNEL_SEARCH);
    let mut tri = TriMat::new((n, n));
    for i in 0..n {
        tri.add_triplet(i, i, 1.0);
        let d = neighbors.distances.row(i);
        let sigma = d
            .get(knn.saturating_sub(1))
            .or_else(|| d.iter().last())
            .copied()
            .filter(|&v| v > 0.0)
            .unwrap_or(1.0);
        for (&j, &dist) in neighbors.indices.row(i).iter().zip(d.iter()) {
            let a = (-(dist / sigma).powf(decay)).exp();
            if a >= KERNEL_THRESHOLD {
                tri.add_triplet(i, j, a);
            }
        }
    }
    let k: CsMat<f64> = tri.to_csr();
    let kt = k.transpose_view().to_csr();
    &(&k + &kt) * 0.5
}

/// Row-normalize an affinity into a Markov transition matrix. Empty rows stay empty.
pub fn markov_normalize(k: &CsMat<f64>) -> CsMat<f64> {
    let sums = k
        .outer_iterator()
        .map(|row| row.data().iter().sum::<f64>())
        .collect::<Vec<_>>();
    let mut tri = TriMat::with_capacity(k.shape(), k.nnz());
    for (&v, (i, j)) in k.iter() {
        if sums[i] > 0.0 {
            tri.add_triplet(i, j, v / sums[i]);
        }
    }
    tri.to_csr()
}

/// Dense `p` raised to the power `t`.
pub fn diffuse(p: &Array2<f64>, t: usize) -> Array2<f64> {
    let mut out = Array2::eye(p.nrows());
    let mut base = p.clone();
    let mut e = t;
    while e > 0 {
        if e & 1 == 1 {
            out = out.dot(&base);
        }
        base = base.dot(&base);
        e >>= 1;
    }
    out
}

/// `P^t x`, one sparse product per step.
pub fn diffuse_values(p: &CsMat<f64>, x: &Array2<f64>, t: usize) -> Array2<f64> {
    (0..t).fold(x.clone(), |acc, _| p * &acc)
}

/// Group cells (rows of `x`) into at most `n_landmark` landmarks by k-means, with
/// nearest-centre assignment through the ball tree. Labels are consecutive from 0.
pub fn landmark_assignment(x: &Array2<f64>, n_landmark: usize, seed: u64) -> Vec<usize> {
    let n = x.nrows();
    let m = n_landmark.clamp(1, n.max(1));
    let mut rng = SmallRng::seed_from_u64(seed);
    let picks = rand::seq::index::sample(&mut rng, n, m).into_vec();
    let mut centers = x.select(Axis(0), &picks);
    let mut assign = Vec::new();
    for _ in 0..LANDMARK_ITERATIONS {
        let next = nearest_neighbors(&centers.view(), &x.view(), 1, false)
            .indices
            .column(0)
            .to_vec();
        if next == assign {
            break;
        }
        assign = next;
        let mut sums = Array2::<f64>::zeros(centers.dim());
        let mut sizes = vec![0usize; m];
        for (i, &c) in assign.iter().enumerate() {
            let mut row = sums.row_mut(c);
            row += &x.row(i);
            sizes[c] += 1;
        }
        for (c, &size) in sizes.iter().enumerate() {
            if size > 0 {
                centers.row_mut(c).assign(&sums.row(c).mapv(|v| v / size as f64));
            }
        }
    }

    // drop landmarks that ended up empty
    let mut relabel = vec![None; m];
    let mut used = 0;
    for a in assign.iter_mut() {
        let label = *relabel[*a].get_or_insert_with(|| {
            used += 1;
            used - 1
        });
        *a = label;
    }
    assign
}

/// Cell-to-landmark transitions (cells x landmarks) and the landmark operator
/// (landmarks x landmarks) obtained by stepping landmark to cell to landmark.
pub fn landmark_operator(k: &CsMat<f64>, assign: &[usize]) -> (CsMat<f64>, Array2<f64>) {
    let m = assign.iter().max().map_or(0, |&a| a + 1);
    let mut tri = TriMat::with_capacity((k.rows(), m), k.nnz());
    for (&v, (i, j)) in k.iter() {
        tri.add_triplet(i, assign[j], v);
    }
    let to_landmark: CsMat<f64> = tri.to_csr();
    let from_landmark = markov_normalize(&to_landmark.transpose_view().to_csr());
    let to_landmark = markov_normalize(&to_landmark);
    let operator = (&from_landmark * &to_landmark).to_dense();
    (to_landmark, operator)
}

/// Diffusion time at the knee of the von Neumann entropy of `P^t`, searched over
/// `1..=t_max`, using the singular values of the dense operator `p`.
pub fn optimal_t(p: &Array2<f64>, t_max: usize) -> Result<usize, Error> {
    let (_, sigma, _) = p.svddc(JobSvd::None)?;
    let entropy = (1..=t_max)
        .map(|t| {
            let eta = sigma.mapv(|l| l.abs().powi(t as i32));
            let total = eta.sum();
            eta.iter()
                .filter(|&&v| v > 0.0)
                .map(|&v| {
                    let p = v / total;
                    -p * p.ln()
                })
                .sum::<f64>()
        })
        .collect::<Vec<_>>();
    Ok(knee(&entropy) + 1)
}

/// Index of the point farthest from the chord joining the first and last points,
/// after scaling both axes to [0, 1].
fn knee(y: &[f64]) -> usize {
    let n = y.len();
    if n < 3 {
        return 0;
    }
    let (lo, hi) = y.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let span = (hi - lo).max(1e-12);
    let (y0, y1) = ((y[0] - lo) / span, (y[n - 1] - lo) / span);
    let mut best = (0, 0.0);
    for (i, &v) in y.iter().enumerate() {
        let x = i as f64 / (n - 1) as f64;
        let yy = (v - lo) / span;
        let chord = y0 + (y1 - y0) * x;
        let dist = (chord - yy).abs();
        if dist > best.1 {
            best = (i, dist);
        }
    }
    best.0
}

/// Classical multidimensional scaling of a distance matrix into `k` dimensions.
pub fn classical_mds(dist: &Array2<f64>, k: usize) -> Result<Array2<f64>, Error> {
    let n = dist.nrows();
    let sq = dist.mapv(|d| d * d);
    let row_mean = sq.mean_axis(Axis(1)).ok_or_else(|| format_err!("empty distance matrix"))?;
    let grand = row_mean.mean().unwrap_or(0.0);
    let b = Array2::from_shape_fn((n, n), |(i, j)| -0.5 * (sq[[i, j]] - row_mean[i] - row_mean[j] + grand));
    let (values, vectors) = b.eigh(UPLO::Lower)?;
    let k = k.min(n);
    let mut out = Array2::zeros((n, k));
    for c in 0..k {
        let idx = n - 1 - c;
        let scale = values[idx].max(0.0).sqrt();
        let mut col = vectors.column(idx).mapv(|v| v * scale);
        let pivot = col.iter().copied().fold(0.0f64, |b, v| if v.abs() > b.abs() { v } else { b });
        if pivot < 0.0 {
            col.mapv_inplace(|v| -v);
        }
        out.column_mut(c).assign(&col);
    }
    Ok(out)
}

/// Centered cells x features values, reduced to `n_pca` components when that is smaller
/// than the data.
fn pca_space(x: &Array2<f64>, n_pca: usize) -> Result<Array2<f64>, Error> {
    let mean = x.mean_axis(Axis(0)).ok_or_else(|| format_err!("no cells to embed"))?;
    let centered = x - &mean;
    if n_pca >= x.nrows().min(x.ncols()) {
        return Ok(centered);
    }
    Ok(run_pca(&BkSvdPca, &centered.t().to_owned(), n_pca)?.embedding)
}

/// Embeds cells (rows) into two dimensions by diffusion.
pub trait DiffusionEmbedder {
    /// cells x 2 coordinates
    fn embed(&self, x: &Array2<f64>) -> Result<Array2<f64>, Error>;
}

/// Denoises cells x genes expression by diffusion.
pub trait Imputer {
    /// Imputed values with the shape of `x`.
    fn impute(&self, x: &Array2<f64>) -> Result<Array2<f64>, Error>;
}

/// PHATE: potential distances of the diffused operator, embedded by classical MDS.
#[derive(Clone, Debug)]
pub struct Phate {
    /// bandwidth neighbour
    pub knn: usize,
    /// kernel decay
    pub decay: f64,
    /// diffusion time, automatic when absent
    pub t: Option<usize>,
    /// principal components
    pub n_pca: usize,
    /// landmark count above which cells are grouped before diffusion
    pub n_landmark: usize,
}

impl DiffusionEmbedder for Phate {
    fn embed(&self, x: &Array2<f64>) -> Result<Array2<f64>, Error> {
        if x.nrows() < 3 {
            bail!("PHATE needs at least 3 cells, got {}", x.nrows());
        }
        let pcs = pca_space(x, self.n_pca)?;
        let k = alpha_decay_affinity(&pcs, self.knn, self.decay);
        let (transitions, operator) = if x.nrows() > self.n_landmark {
            let assign = landmark_assignment(&pcs, self.n_landmark, LANDMARK_SEED);
            let (transitions, operator) = landmark_operator(&k, &assign);
            info!("PHATE landmark operator over {} landmarks", operator.nrows());
            (Some(transitions), operator)
        } else {
            (None, markov_normalize(&k).to_dense())
        };
        let t = match self.t {
            Some(t) => t,
            None => optimal_t(&operator, T_MAX)?,
        };
        info!("PHATE diffusion on {} cells with t = {}", x.nrows(), t);
        let potential = diffuse(&operator, t).mapv(|v| -(v + POTENTIAL_EPS).ln());
        let coords = classical_mds(&pairwise_distances(&potential), 2)?;
        Ok(match transitions {
            Some(p) => &p * &coords,
            None => coords,
        })
    }
}

/// MAGIC: `P^t X` over the alpha-decay operator.
#[derive(Clone, Debug)]
pub struct Magic {
    /// bandwidth neighbour
    pub knn: usize,
    /// kernel decay
    pub decay: f64,
    /// diffusion time
    pub t: usize,
    /// principal components
    pub n_pca: usize,
}

impl Imputer for Magic {
    fn impute(&self, x: &Array2<f64>) -> Result<Array2<f64>, Error> {
        let pcs = pca_space(x, self.n_pca)?;
        let p = markov_normalize(&alpha_decay_affinity(&pcs, self.knn, self.decay));
        info!("MAGIC imputation of {} genes with t = {}", x.ncols(), self.t);
        Ok(diffuse_values(&p, x, self.t))
    }
}

impl From<&PhateParams> for Phate {
    fn from(p: &PhateParams) -> Self {
        Phate {
            knn: p.knn,
            decay: p.decay,
            t: p.t,
            n_pca: p.n_pca,
            n_landmark: p.n_landmark,
        }
    }
}

impl From<&PhateParams> for Magic {
    fn from(p: &PhateParams) -> Self {
        Magic {
            knn: p.magic_knn,
            decay: p.magic_decay,
            t: p.magic_t,
            n_pca: p.n_pca,
        }
    }
}

/// Run PHATE, plus MAGIC on the raw path.
pub fn run_phate(session: &Session, params: &PhateParams) -> Result<PhateResult, Error> {
    run_phate_with(&Phate::from(params), &Magic::from(params), session, params)
}

/// [`run_phate`] with explicit engines.
pub fn run_phate_with(
    embedder: &impl DiffusionEmbedder,
    imputer: &impl Imputer,
    session: &Session,
    params: &PhateParams,
) -> Result<PhateResult, Error> {
    let session = match &params.subset {
        Some(sub) => session.subset_by(&sub.column, &sub.values)?,
        None => session.clone(),
    };
    let result = match params.input {
        PhateInput::Integrated => {
            if let Some(gene) = &params.color_gene {
                bail!("cannot colour by '{}': the integrated path computes no imputation", gene);
            }
            let scale = session
                .scale
                .as_ref()
                .ok_or_else(|| format_err!("the integrated PHATE path requires a scaled layer"))?;
            PhateResult {
                embedding: embedder.embed(&scale.values.t().to_owned())?,
                imputed: None,
                cells: session.counts.barcodes.clone(),
            }
        }
        PhateInput::Raw => {
            let raw = raw_preprocess(&session.counts)?;
            let embedding = embedder.embed(&raw.values)?;
            let imputed = imputer.impute(&raw.values)?;
            PhateResult {
                embedding,
                imputed: Some(ImputedMatrix {
                    genes: raw.genes,
                    values: imputed,
                }),
                cells: raw.cells.iter().map(|&c| session.counts.barcodes[c].clone()).collect(),
            }
        }
    };
    if let Some(gene) = &params.color_gene {
        // surfaces a missing gene before any plotting
        colour_values(&result, Some(gene.as_str()))?;
    }
    Ok(result)
}

fn colour_values(result: &PhateResult, gene: Option<&str>) -> Result<Option<Vec<f64>>, Error> {
    match gene {
        None => Ok(None),
        Some(g) => match &result.imputed {
            Some(m) => Ok(Some(m.gene(g)?)),
            None => Err(AnalysisError::GeneNotFound(g.to_string()).into()),
        },
    }
}

/// Restrict `session` to the embedded cells and store the embedding as `phate`.
pub fn attach_phate(session: &Session, result: &PhateResult) -> Result<Session, Error> {
    let index = session
        .counts
        .barcodes
        .iter()
        .enumerate()
        .map(|(i, b)| (b.as_str(), i))
        .collect::<std::collections::HashMap<_, _>>();
    let cells = result
        .cells
        .iter()
        .map(|b| index.get(b.as_str()).copied().ok_or_else(|| format_err!("embedded cell '{}' is not in the session", b)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut s = session.subset_cells(&cells);
    s.embeddings.insert("phate".to_string(), result.embedding.clone());
    s.validate()?;
    Ok(s)
}

/// Scatter of the embedding, coloured by a gene's imputed expression or uncoloured.
pub fn plot_phate(result: &PhateResult, gene: Option<&str>, path: impl AsRef<Path>) -> Result<(), Error> {
    let colors = match colour_values(result, gene)? {
        Some(v) => gradient_colors(&v),
        None => vec![PALETTE[0]; result.embedding.nrows()],
    };
    scatter(path, &result.embedding.slice(s![.., ..2]).to_owned(), &colors)
}
