//! Pseudotime ordering of cells along a principal tree.
//!
//! Size factors and dispersions come from the sSeq estimator in `diff-exp`. Ordering genes
//! are those well expressed and more dispersed than the mean-dispersion trend. The tree is a
//! minimum spanning tree over k-means centres of the 2-D PCA of the ordering genes; cells
//! are projected onto its nearest edge.

use crate::dim_red::{run_pca, BkSvdPca};
use crate::error::AnalysisError;
use crate::plot::{category_colors, trajectory_plot};
use crate::session::Session;
use crate::stats::{one_hot, regress_out_rows, sq_dist};
use anyhow::{bail, format_err, Error};
use diff_exp::diff_exp::SSeqParams;
use log::info;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use petgraph::algo::{dijkstra, min_spanning_tree};
use petgraph::data::FromElements;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use scflow_types::{CellMetadata, Column, CountMatrix, Factor};
use serde::{Deserialize, Serialize};
use sqz::AdaptiveMat;
use std::collections::HashMap;
use std::path::Path;

/// Pseudotime column.
pub const PSEUDOTIME: &str = "Pseudotime";
/// Trajectory state column.
pub const STATE: &str = "State";
const KMEANS_ITERATIONS: usize = 100;

/// Count model of a [`CellDataSet`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpressionFamily {
    /// negative binomial with per-cell size factors
    #[default]
    NegBinomialSize,
}

/// The modelling container: counts plus cell and gene annotations.
pub struct CellDataSet {
    /// genes x cells counts
    pub counts: CountMatrix,
    /// compressed copy of `counts` for the sSeq estimator
    pub adaptive: AdaptiveMat,
    /// per-cell annotations
    pub cells: CellMetadata,
    /// gene symbols
    pub genes: Vec<String>,
    /// count model
    pub family: ExpressionFamily,
    /// size factors, dispersions and normalized moments once estimated
    pub params: Option<SSeqParams>,
}

impl CellDataSet {
    /// Build from a session's counts and metadata.
    pub fn from_session(session: &Session) -> CellDataSet {
        CellDataSet {
            counts: session.counts.matrix.clone(),
            adaptive: session.counts.to_adaptive(),
            cells: session.metadata.clone(),
            genes: session.counts.feature_names.clone(),
            family: ExpressionFamily::NegBinomialSize,
            params: None,
        }
    }

    /// Estimate size factors and per-gene dispersions.
    pub fn estimate_size_factors_and_dispersions(mut self) -> CellDataSet {
        self.params = Some(diff_exp::compute_sseq_params(&self.adaptive, None, None, None));
        self
    }

    fn sseq(&self) -> Result<&SSeqParams, Error> {
        self.params
            .as_ref()
            .ok_or_else(|| format_err!("size factors and dispersions have not been estimated"))
    }

    /// Per-cell library size over the median library size.
    pub fn size_factors(&self) -> Result<&[f64], Error> {
        Ok(&self.sseq()?.size_factors)
    }

    /// `ln(1 + count / size_factor)` of the given gene rows, cells x genes. Cells with a
    /// zero size factor stay at zero.
    pub fn log_expression(&self, genes: &[usize]) -> Result<Array2<f64>, Error> {
        let sf = self.size_factors()?;
        let mut col_of = vec![None; self.counts.rows()];
        for (j, &g) in genes.iter().enumerate() {
            col_of[g] = Some(j);
        }
        let mut x = Array2::zeros((self.counts.cols(), genes.len()));
        for (c, col) in self.counts.outer_iterator().enumerate() {
            if sf[c] <= 0.0 {
                continue;
            }
            for (g, &v) in col.iter() {
                if let Some(j) = col_of[g] {
                    x[[c, j]] = (f64::from(v) / sf[c]).ln_1p();
                }
            }
        }
        Ok(x)
    }
}

/// Mean-dispersion trend `phi(mu) = a1 / mu + a0`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DispersionTrend {
    /// asymptotic dispersion
    pub a0: f64,
    /// extra Poisson-like dispersion
    pub a1: f64,
}

impl DispersionTrend {
    /// Least-squares fit over genes with positive mean and dispersion.
    pub fn fit(means: &[f64], dispersions: &[f64]) -> Result<DispersionTrend, Error> {
        let points = means
            .iter()
            .zip(dispersions)
            .filter(|&(&m, &d)| m > 0.0 && d > 0.0 && d.is_finite())
            .map(|(&m, &d)| (1.0 / m, d))
            .collect::<Vec<_>>();
        if points.is_empty() {
            bail!("no genes with positive mean and dispersion to fit the dispersion trend");
        }
        let n = points.len() as f64;
        let mx = points.iter().map(|p| p.0).sum::<f64>() / n;
        let my = points.iter().map(|p| p.1).sum::<f64>() / n;
        let sxx = points.iter().map(|p| (p.0 - mx).powi(2)).sum::<f64>();
        let sxy = points.iter().map(|p| (p.0 - mx) * (p.1 - my)).sum::<f64>();
        let a1 = if sxx > 0.0 { sxy / sxx } else { 0.0 };
        Ok(DispersionTrend { a0: my - a1 * mx, a1 })
    }

    /// Fitted dispersion at mean `mu`.
    pub fn eval(&self, mu: f64) -> f64 {
        self.a1 / mu + self.a0
    }
}

/// Parameters of [`run_trajectory`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryParams {
    /// metadata column regressed out before the tree fit
    pub batch: Option<String>,
    /// genes with at least this mean are detected
    pub detection_threshold: f64,
    /// ordering genes need at least this mean
    pub min_mean: f64,
    /// ordering genes need dispersion at least this multiple of the trend
    pub dispersion_ratio: f64,
    /// tree nodes; derived from the cell count when absent
    pub n_centers: Option<usize>,
    /// k-means seed
    pub seed: u64,
}

impl Default for TrajectoryParams {
    fn default() -> Self {
        TrajectoryParams {
            batch: None,
            detection_threshold: 0.1,
            min_mean: 0.5,
            dispersion_ratio: 0.5,
            n_centers: None,
            seed: 0,
        }
    }
}

/// Genes whose normalized mean reaches `threshold`.
pub fn detect_genes(cds: &CellDataSet, threshold: f64) -> Result<Vec<bool>, Error> {
    Ok(cds.sseq()?.gene_means.iter().map(|&m| m >= threshold).collect())
}

/// Indices of ordering genes among the `detected` ones.
pub fn ordering_genes(
    cds: &CellDataSet,
    detected: &[bool],
    min_mean: f64,
    dispersion_ratio: f64,
) -> Result<Vec<usize>, Error> {
    let sseq = cds.sseq()?;
    let trend = DispersionTrend::fit(&sseq.gene_means, &sseq.gene_moment_phi)?;
    info!("dispersion trend: phi = {:.4} / mu + {:.4}", trend.a1, trend.a0);
    let genes = (0..sseq.gene_means.len())
        .filter(|&g| detected[g])
        .filter(|&g| {
            let mu = sseq.gene_means[g];
            mu >= min_mean && sseq.gene_moment_phi[g] >= dispersion_ratio * trend.eval(mu)
        })
        .collect::<Vec<_>>();
    if genes.is_empty() {
        return Err(AnalysisError::NoOrderingGenes {
            min_mean,
            dispersion_ratio,
        }
        .into());
    }
    Ok(genes)
}

/// A fitted trajectory.
#[derive(Clone, Debug)]
pub struct Trajectory {
    /// cells x 2 reduced coordinates
    pub coords: Array2<f64>,
    /// tree nodes x 2
    pub centers: Array2<f64>,
    /// tree edges between node indices
    pub edges: Vec<(usize, usize)>,
    /// root node
    pub root: usize,
    /// geodesic distance from the root along the tree
    pub pseudotime: Vec<f64>,
    /// 1-based segment between branch points
    pub state: Vec<usize>,
}

/// Fits a tree through cells (rows) and orders them along it.
pub trait TrajectoryFitter {
    /// Fit cells x genes expression.
    fn fit(&self, x: &Array2<f64>) -> Result<Trajectory, Error>;
}

/// Principal tree over k-means centres in two PCA dimensions.
#[derive(Clone, Debug, Default)]
pub struct PrincipalTree {
    /// tree nodes; `min(2 ceil(sqrt(n)), n / 2)` when absent
    pub n_centers: Option<usize>,
    /// k-means seed
    pub seed: u64,
}

/// Lloyd's k-means with k-means++ seeding. Returns centres and assignments.
pub fn kmeans(x: &Array2<f64>, k: usize, seed: u64) -> (Array2<f64>, Vec<usize>) {
    let n = x.nrows();
    let k = k.clamp(1, n.max(1));
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut chosen = vec![rng.random_range(0..n)];
    while chosen.len() < k {
        let d2 = (0..n)
            .map(|i| {
                chosen
                    .iter()
                    .map(|&c| sq_dist(x.row(i), x.row(c)))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect::<Vec<_>>();
        let total = d2.iter().sum::<f64>();
        if total <= 0.0 {
            break;
        }
        let mut target = rng.random::<f64>() * total;
        let mut pick = n - 1;
        for (i, &d) in d2.iter().enumerate() {
            if target < d {
                pick = i;
                break;
            }
            target -= d;
        }
        chosen.push(pick);
    }
    let mut centers = x.select(Axis(0), &chosen);
    let mut assign = vec![0; n];
    for _ in 0..KMEANS_ITERATIONS {
        let next = (0..n).map(|i| nearest_row(&centers, x.row(i))).collect::<Vec<_>>();
        let changed = next != assign;
        assign = next;
        for c in 0..centers.nrows() {
            let members = (0..n).filter(|&i| assign[i] == c).collect::<Vec<_>>();
            if let Some(mean) = x.select(Axis(0), &members).mean_axis(Axis(0)) {
                centers.row_mut(c).assign(&mean);
            }
        }
        if !changed {
            break;
        }
    }
    (centers, assign)
}

fn nearest_row(points: &Array2<f64>, p: ArrayView1<f64>) -> usize {
    points
        .rows()
        .into_iter()
        .map(|r| sq_dist(r, p))
        .enumerate()
        .fold((0, f64::INFINITY), |best, (i, d)| if d < best.1 { (i, d) } else { best })
        .0
}

/// Minimum spanning tree over the rows of `centers` by Euclidean distance.
pub fn spanning_tree(centers: &Array2<f64>) -> UnGraph<usize, f64> {
    let n = centers.nrows();
    let mut complete = UnGraph::<usize, f64>::with_capacity(n, n * n.saturating_sub(1) / 2);
    let nodes = (0..n).map(|i| complete.add_node(i)).collect::<Vec<_>>();
    for i in 0..n {
        for j in i + 1..n {
            let d = sq_dist(centers.row(i), centers.row(j)).sqrt();
            complete.add_edge(nodes[i], nodes[j], d);
        }
    }
    UnGraph::from_elements(min_spanning_tree(&complete))
}

fn farthest(tree: &UnGraph<usize, f64>, from: NodeIndex) -> (NodeIndex, HashMap<NodeIndex, f64>) {
    let dist = dijkstra(tree, from, None, |e| *e.weight());
    let far = dist
        .iter()
        .fold((from, 0.0), |best, (&node, &d)| if d > best.1 { (node, d) } else { best })
        .0;
    (far, dist)
}

/// Label every tree edge with the 1-based id of the segment it belongs to. Segments start
/// at the root and at every branch point, numbered in depth-first order.
pub fn branch_segments(tree: &UnGraph<usize, f64>, root: NodeIndex) -> HashMap<(usize, usize), usize> {
    let mut labels = HashMap::new();
    let mut next = 0;
    // (node, parent, segment of the edge into node)
    let mut stack = vec![(root, None, 0usize)];
    while let Some((node, parent, segment)) = stack.pop() {
        let children = tree
            .neighbors(node)
            .filter(|&c| Some(c) != parent)
            .collect::<Vec<_>>();
        let splits = parent.is_none() || tree.neighbors(node).count() >= 3;
        for child in children.into_iter().rev() {
            let seg = if splits {
                next += 1;
                next
            } else {
                segment
            };
            let key = edge_key(node.index(), child.index());
            labels.insert(key, seg);
            stack.push((child, Some(node), seg));
        }
    }
    labels
}

fn edge_key(a: usize, b: usize) -> (usize, usize) {
    (a.min(b), a.max(b))
}

/// Position of `p` on segment `a -> b` as a fraction in [0, 1], and its squared distance
/// from the segment.
fn project(p: ArrayView1<f64>, a: ArrayView1<f64>, b: ArrayView1<f64>) -> (f64, f64) {
    let ab = &b - &a;
    let len2 = ab.dot(&ab);
    let t = if len2 > 0.0 {
        ((&p - &a).dot(&ab) / len2).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let foot = &a + &(&ab * t);
    (t, sq_dist(p, foot.view()))
}

impl PrincipalTree {
    fn n_centers(&self, n: usize) -> usize {
        self.n_centers.unwrap_or_else(|| {
            let by_sqrt = 2 * (n as f64).sqrt().ceil() as usize;
            by_sqrt.min(n / 2).max(2)
        })
    }
}

impl TrajectoryFitter for PrincipalTree {
    fn fit(&self, x: &Array2<f64>) -> Result<Trajectory, Error> {
        let n = x.nrows();
        if n < 3 {
            bail!("trajectory fitting needs at least 3 cells, got {}", n);
        }
        let mean = x.mean_axis(Axis(0)).ok_or_else(|| format_err!("no cells"))?;
        let centered = x - &mean;
        let pcs = run_pca(&BkSvdPca, &centered.t().to_owned(), 2)?.embedding;
        let mut coords = Array2::zeros((n, 2));
        for c in 0..pcs.ncols().min(2) {
            coords.column_mut(c).assign(&pcs.column(c));
        }

        let (centers, assign) = kmeans(&coords, self.n_centers(n), self.seed);
        let tree = spanning_tree(&centers);
        let (end, _) = farthest(&tree, NodeIndex::new(0));
        let (_, from_root) = farthest(&tree, end);
        let root = end;
        let segments = branch_segments(&tree, root);
        info!(
            "principal tree with {} nodes and {} segments",
            centers.nrows(),
            segments.values().max().copied().unwrap_or(1)
        );

        let mut pseudotime = vec![0.0; n];
        let mut state = vec![1; n];
        for i in 0..n {
            let c = NodeIndex::new(assign[i]);
            let mut best: Option<(f64, f64, usize)> = None;
            for e in tree.edges(c) {
                let (a, b) = (e.source(), e.target());
                // orient the edge away from the root
                let (near, far) = if from_root[&a] <= from_root[&b] { (a, b) } else { (b, a) };
                let (t, d2) = project(coords.row(i), centers.row(near.index()), centers.row(far.index()));
                if best.map_or(true, |(_, bd, _)| d2 < bd) {
                    let time = from_root[&near] + t * e.weight();
                    best = Some((time, d2, segments[&edge_key(a.index(), b.index())]));
                }
            }
            if let Some((time, _, seg)) = best {
                pseudotime[i] = time;
                state[i] = seg;
            }
        }

        let edges = tree
            .edge_indices()
            .filter_map(|e| tree.edge_endpoints(e))
            .map(|(a, b)| (a.index(), b.index()))
            .collect();
        Ok(Trajectory {
            coords,
            centers,
            edges,
            root: root.index(),
            pseudotime,
            state,
        })
    }
}

/// Order cells along a trajectory with the default [`PrincipalTree`].
pub fn run_trajectory(session: &Session, params: &TrajectoryParams) -> Result<(Session, Trajectory), Error> {
    let fitter = PrincipalTree {
        n_centers: params.n_centers,
        seed: params.seed,
    };
    run_trajectory_with(&fitter, session, params)
}

/// Estimate dispersions, pick ordering genes, optionally remove a batch effect, fit the tree,
/// and record `Pseudotime`, `State` and a `ddrtree` embedding.
pub fn run_trajectory_with(
    fitter: &impl TrajectoryFitter,
    session: &Session,
    params: &TrajectoryParams,
) -> Result<(Session, Trajectory), Error> {
    if session.num_cells() < 3 {
        bail!("trajectory inference needs at least 3 cells, got {}", session.num_cells());
    }
    let cds = CellDataSet::from_session(session).estimate_size_factors_and_dispersions();
    let detected = detect_genes(&cds, params.detection_threshold)?;
    info!(
        "{} of {} genes detected",
        detected.iter().filter(|&&d| d).count(),
        detected.len()
    );
    let genes = ordering_genes(&cds, &detected, params.min_mean, params.dispersion_ratio)?;
    info!("{} ordering genes", genes.len());
    let mut x = cds.log_expression(&genes)?;

    if let Some(batch) = &params.batch {
        let design = one_hot(cds.cells.factor(batch)?);
        x = regress_out_rows(&x.t(), &design.view())?.reversed_axes();
    }

    let trajectory = fitter.fit(&x)?;
    let mut s = session.clone();
    s.metadata.insert(
        PSEUDOTIME,
        Column::Numeric(trajectory.pseudotime.iter().map(|&t| Some(t)).collect()),
    )?;
    s.metadata.insert(
        STATE,
        Column::Categorical(Factor::from_values_sorted(
            trajectory.state.iter().map(|st| Some(st.to_string())),
        )),
    )?;
    s.embeddings.insert("ddrtree".to_string(), trajectory.coords.clone());
    Ok((s, trajectory))
}

/// Cells coloured by state with the tree overlaid.
pub fn plot_trajectory(trajectory: &Trajectory, path: impl AsRef<Path>) -> Result<(), Error> {
    let states = Factor::from_values_sorted(trajectory.state.iter().map(|s| Some(s.to_string())));
    trajectory_plot(
        path,
        &trajectory.coords,
        &category_colors(&states),
        &trajectory.centers,
        &trajectory.edges,
    )
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let a = Array1::from(a.to_vec());
    let b = Array1::from(b.to_vec());
    let (ma, mb) = (a.mean().unwrap_or(0.0), b.mean().unwrap_or(0.0));
    let (da, db) = (&a - ma, &b - mb);
    da.dot(&db) / (da.dot(&da).sqrt() * db.dot(&db).sqrt())
}

/// Correlation of pseudotime with a numeric metadata column, for checking orientation.
pub fn pseudotime_correlation(session: &Session, column: &str) -> Result<f64, Error> {
    let t = session.metadata.numeric(PSEUDOTIME)?;
    let v = session.metadata.numeric(column)?;
    let (a, b): (Vec<f64>, Vec<f64>) = t.iter().zip(v).filter_map(|(x, y)| Some(((*x)?, (*y)?))).unzip();
    Ok(pearson(&a, &b))
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::array;
    use scflow_types::ExpressionMatrix;

    /// 40 cells ordered by `t = c / 39`: genes 0..8 rise, 8..16 fall, 16..24 are flat.
    fn progression() -> Session {
        let counts = Array2::from_shape_fn((24, 40), |(g, c)| {
            let t = c as f64 / 39.0;
            let jitter = ((g * 7 + c * 3) % 3) as f64;
            let v = match g {
                0..=7 => 40.0 * t,
                8..=15 => 40.0 * (1.0 - t),
                _ => 6.0,
            };
            (v + jitter).round() as u32
        });
        let m = ExpressionMatrix::from_dense(
            "traj",
            (0..24).map(|g| format!("G{g}")).collect(),
            (0..40).map(|c| format!("c{c}")).collect(),
            counts.view(),
        )
        .unwrap();
        let s = Session::new(m, "traj").unwrap();
        let time = (0..40).map(|c| Some(c as f64 / 39.0)).collect();
        let batch = (0..40).map(|c| Some(if c % 2 == 0 { "x" } else { "y" }));
        s.with_column("time", Column::Numeric(time))
            .unwrap()
            .with_column("batch", Column::Categorical(Factor::from_values(batch)))
            .unwrap()
    }

    #[test]
    fn test_dispersion_trend() {
        // phi = 2 / mu + 0.5 exactly
        let means = [1.0, 2.0, 4.0, 8.0];
        let disp = means.iter().map(|m| 2.0 / m + 0.5).collect::<Vec<_>>();
        let fit = DispersionTrend::fit(&means, &disp).unwrap();
        assert!((fit.a1 - 2.0).abs() < 1e-9 && (fit.a0 - 0.5).abs() < 1e-9);
        assert!((fit.eval(4.0) - 1.0).abs() < 1e-9);
        assert!(DispersionTrend::fit(&[0.0], &[1.0]).is_err());
    }

    #[test]
    fn test_branch_segments() {
        // 0 - 1 - 2, with 2 branching to 3 and 4
        let mut g = UnGraph::<usize, f64>::new_undirected();
        let n = (0..5).map(|i| g.add_node(i)).collect::<Vec<_>>();
        for (a, b) in [(0, 1), (1, 2), (2, 3), (2, 4)] {
            g.add_edge(n[a], n[b], 1.0);
        }
        let seg = branch_segments(&g, n[0]);
        assert_eq!(seg[&(0, 1)], 1);
        assert_eq!(seg[&(1, 2)], 1);
        assert_ne!(seg[&(2, 3)], seg[&(2, 4)]);
        let mut rest = vec![seg[&(2, 3)], seg[&(2, 4)]];
        rest.sort();
        assert_eq!(rest, vec![2, 3]);
    }

    #[test]
    fn test_kmeans_two_groups() {
        let x = array![[0.0, 0.0], [0.1, 0.0], [0.0, 0.1], [5.0, 5.0], [5.1, 5.0], [5.0, 5.1]];
        let (centers, assign) = kmeans(&x, 2, 0);
        assert_eq!(centers.nrows(), 2);
        assert_eq!(assign[0], assign[1]);
        assert_eq!(assign[3], assign[5]);
        assert_ne!(assign[0], assign[3]);
    }

    #[test]
    fn test_trajectory_orders_cells() {
        let s = progression();
        let (out, traj) = run_trajectory(&s, &TrajectoryParams::default()).unwrap();
        out.validate().unwrap();
        assert_eq!(traj.pseudotime.len(), 40);
        assert!(traj.pseudotime.iter().all(|&t| t >= 0.0));
        assert!(traj.state.iter().all(|&st| st >= 1));
        assert_eq!(traj.edges.len(), traj.centers.nrows() - 1);
        let r = pseudotime_correlation(&out, "time").unwrap();
        assert!(r.abs() > 0.8, "correlation {r}");
        assert_eq!(out.embedding("ddrtree").unwrap().dim(), (40, 2));

        let dir = tempfile::tempdir().unwrap();
        plot_trajectory(&traj, dir.path().join("trajectory.png")).unwrap();
    }

    #[test]
    fn test_batch_branch() {
        let s = progression();
        let params = TrajectoryParams {
            batch: Some("batch".into()),
            ..TrajectoryParams::default()
        };
        let (out, _) = run_trajectory(&s, &params).unwrap();
        assert!(pseudotime_correlation(&out, "time").unwrap().abs() > 0.8);

        let missing = TrajectoryParams {
            batch: Some("nope".into()),
            ..TrajectoryParams::default()
        };
        assert!(run_trajectory(&s, &missing).is_err());
    }

    #[test]
    fn test_no_ordering_genes() {
        let s = progression();
        let params = TrajectoryParams {
            min_mean: 1e9,
            ..TrajectoryParams::default()
        };
        assert!(matches!(
            run_trajectory(&s, &params).unwrap_err().downcast_ref::<AnalysisError>(),
            Some(AnalysisError::NoOrderingGenes { .. })
        ));

        let undetected = TrajectoryParams {
            detection_threshold: 1e9,
            min_mean: 0.0,
            ..TrajectoryParams::default()
        };
        assert!(matches!(
            run_trajectory(&s, &undetected).unwrap_err().downcast_ref::<AnalysisError>(),
            Some(AnalysisError::NoOrderingGenes { .. })
        ));
    }

    #[test]
    fn test_ordering_genes_are_detected() {
        let cds = CellDataSet::from_session(&progression()).estimate_size_factors_and_dispersions();
        let mut detected = detect_genes(&cds, 0.1).unwrap();
        let all = ordering_genes(&cds, &detected, 0.5, 0.5).unwrap();
        detected[all[0]] = false;
        match ordering_genes(&cds, &detected, 0.5, 0.5) {
            Ok(genes) => assert!(!genes.contains(&all[0]) && genes.len() == all.len() - 1),
            Err(_) => assert_eq!(all.len(), 1),
        }
    }
}
