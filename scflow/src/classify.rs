//! Marker-based hierarchical cell-type classification.
//!
//! Training scores every cell for every cell type from its marker expression, takes the
//! confidently scored cells of each type as representatives and the least marked cells as an
//! `Unknown` outgroup, and fits one Gaussian naive Bayes model per level of the type
//! hierarchy. Classification walks the hierarchy from the top, refining each assigned parent
//! with its own subtype model.

use crate::markers::{GeneDatabase, MarkerSpec, Species};
use crate::session::Session;
use crate::stats::quantile;
use crate::trajectory::CellDataSet;
use anyhow::{bail, Context, Error};
use log::{info, warn};
use ndarray::{Array1, Array2, Axis};
use scflow_types::{Column, Factor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Label of unassigned cells.
pub const UNKNOWN: &str = "Unknown";
/// Per-cell predicted type column.
pub const CELL_TYPE: &str = "cell_type";
/// Cluster-extended type column.
pub const CLUSTER_EXT_TYPE: &str = "cluster_ext_type";
/// Share of a cluster's assigned cells that must agree for cluster extension.
pub const CLUSTER_EXTEND_FRACTION: f64 = 0.9;
const VAR_FLOOR: f64 = 1e-2;

/// Training parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainParams {
    /// cells in the `Unknown` outgroup of each level
    pub num_unknown: usize,
    /// representatives score at or above this quantile of their type
    pub representative_quantile: f64,
    /// posterior gap between the two best classes below which a cell stays unassigned
    pub min_margin: f64,
}

impl Default for TrainParams {
    fn default() -> Self {
        TrainParams {
            num_unknown: 50,
            representative_quantile: 0.75,
            min_margin: 0.1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct GaussianClass {
    name: String,
    log_prior: f64,
    mean: Vec<f64>,
    var: Vec<f64>,
}

impl GaussianClass {
    fn fit(name: &str, x: &Array2<f64>, rows: &[usize], total: usize) -> GaussianClass {
        let sub = x.select(Axis(0), rows);
        let mean = sub.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(x.ncols()));
        let var = sub.var_axis(Axis(0), 0.0) + VAR_FLOOR;
        GaussianClass {
            name: name.to_string(),
            log_prior: (rows.len() as f64 / total as f64).ln(),
            mean: mean.to_vec(),
            var: var.to_vec(),
        }
    }

    fn log_likelihood(&self, x: &[f64]) -> f64 {
        self.log_prior
            + x.iter()
                .zip(self.mean.iter().zip(&self.var))
                .map(|(v, (m, s2))| -0.5 * (2.0 * std::f64::consts::PI * s2).ln() - (v - m).powi(2) / (2.0 * s2))
                .sum::<f64>()
    }
}

/// The naive Bayes model that splits one parent (or the root) into its subtypes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct LevelModel {
    parent: Option<String>,
    genes: Vec<String>,
    classes: Vec<GaussianClass>,
}

impl LevelModel {
    /// Best class and the posterior gap to the runner-up.
    fn predict(&self, x: &[f64]) -> (&str, f64) {
        let ll = self.classes.iter().map(|c| c.log_likelihood(x)).collect::<Vec<_>>();
        let max = ll.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let p = ll.iter().map(|l| (l - max).exp()).collect::<Vec<_>>();
        let z = p.iter().sum::<f64>();
        let mut order = (0..p.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| p[b].total_cmp(&p[a]));
        let margin = match order.get(1) {
            Some(&second) => (p[order[0]] - p[second]) / z,
            None => 1.0,
        };
        (self.classes[order[0]].name.as_str(), margin)
    }
}

/// A trained marker classifier. Serialized as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarkerClassifier {
    /// species the markers were validated against
    pub species: Species,
    /// the hierarchy the classifier was trained on
    pub markers: MarkerSpec,
    /// posterior gap below which a cell stays unassigned
    pub min_margin: f64,
    levels: Vec<LevelModel>,
}

impl MarkerClassifier {
    /// Write as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }

    /// Read a classifier written by [`MarkerClassifier::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<MarkerClassifier, Error> {
        let path = path.as_ref();
        let f = File::open(path).with_context(|| format!("opening classifier {}", path.display()))?;
        serde_json::from_reader(BufReader::new(f)).with_context(|| format!("parsing classifier {}", path.display()))
    }
}

/// Assigns a cell type to every cell of a session.
pub trait CellClassifier {
    /// One label per cell; unassigned cells are [`UNKNOWN`].
    fn classify(&self, session: &Session) -> Result<Vec<String>, Error>;
}

/// Log-normalized expression of `genes` by symbol, cells x genes. Genes absent from the
/// session are zero.
fn marker_expression(session: &Session, genes: &[String]) -> Result<Array2<f64>, Error> {
    let lookup = session.counts.feature_lookup();
    let present = genes.iter().filter_map(|g| lookup.get(g.as_str()).copied()).collect::<Vec<_>>();
    let cds = CellDataSet::from_session(session).estimate_size_factors_and_dispersions();
    let x = cds.log_expression(&present)?;
    let mut out = Array2::zeros((session.num_cells(), genes.len()));
    let mut j = 0;
    for (k, g) in genes.iter().enumerate() {
        if lookup.contains_key(g.as_str()) {
            out.column_mut(k).assign(&x.column(j));
            j += 1;
        }
    }
    Ok(out)
}

/// Per cell type scores: mean over its markers of max-scaled expression weighted by an
/// inverse detection frequency.
fn type_scores(x: &Array2<f64>, genes: &[String], spec: &MarkerSpec) -> Array2<f64> {
    let n = x.nrows() as f64;
    let weighted = {
        let mut w = x.clone();
        for mut col in w.axis_iter_mut(Axis(1)) {
            let max = col.iter().copied().fold(0.0, f64::max);
            let detected = col.iter().filter(|&&v| v > 0.0).count() as f64;
            let idf = (1.0 + n / (1.0 + detected)).ln();
            if max > 0.0 {
                col.mapv_inplace(|v| v / max * idf);
            }
        }
        w
    };
    let col = genes.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect::<HashMap<_, _>>();
    let mut scores = Array2::zeros((x.nrows(), spec.types().len()));
    for (t, ty) in spec.types().iter().enumerate() {
        let idx = ty.expressed.iter().filter_map(|g| col.get(g.as_str()).copied()).collect::<Vec<_>>();
        if let Some(m) = weighted.select(Axis(1), &idx).mean_axis(Axis(1)) {
            scores.column_mut(t).assign(&m);
        }
    }
    scores
}

/// Train a classifier on `reference`. Markers must all be known to `db`; markers missing
/// from the reference are dropped with a warning.
pub fn train_garnett(
    reference: &Session,
    markers: &MarkerSpec,
    db: &GeneDatabase,
    params: &TrainParams,
) -> Result<MarkerClassifier, Error> {
    db.check_markers(markers)?;
    let lookup = reference.counts.feature_lookup();
    let (genes, absent): (Vec<String>, Vec<String>) =
        markers.genes().into_iter().partition(|g| lookup.contains_key(g.as_str()));
    if !absent.is_empty() {
        warn!("{} marker genes are absent from the reference and ignored: {:?}", absent.len(), absent);
    }
    for t in markers.types() {
        if !t.expressed.iter().any(|g| genes.contains(g)) {
            bail!("cell type '{}' has no markers expressed in the reference", t.name);
        }
    }

    let x = marker_expression(reference, &genes)?;
    let scores = type_scores(&x, &genes, markers);
    let type_index = |name: &str| markers.types().iter().position(|t| t.name == name);
    let gene_col = genes.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect::<HashMap<_, _>>();
    let n = reference.num_cells();

    // best top-down type per cell by score, used to restrict subtype candidates
    let best_among = |cell: usize, siblings: &[usize]| {
        siblings
            .iter()
            .copied()
            .filter(|&t| scores[[cell, t]] > 0.0)
            .max_by(|&a, &b| scores[[cell, a]].total_cmp(&scores[[cell, b]]))
    };

    let mut candidates_of: HashMap<Option<String>, Vec<usize>> = HashMap::new();
    candidates_of.insert(None, (0..n).collect());

    // parents are visited breadth first so each level follows the level assigning its parent
    let mut queue = VecDeque::from([None]);
    let mut levels = Vec::new();
    while let Some(parent) = queue.pop_front() {
        let children = markers.children(parent.as_deref());
        queue.extend(children.iter().map(|c| Some(c.name.clone())));
        if children.is_empty() {
            continue;
        }
        let Some(candidates) = candidates_of.get(&parent).cloned() else {
            continue;
        };
        let sibs = children
            .iter()
            .filter_map(|c| type_index(&c.name))
            .collect::<Vec<_>>();

        let mut reps: Vec<(usize, Vec<usize>)> = Vec::new();
        let mut assigned = vec![false; n];
        for &t in &sibs {
            let s = candidates.iter().map(|&c| scores[[c, t]]).collect::<Vec<_>>();
            let threshold = quantile(&s, params.representative_quantile);
            let rows = candidates
                .iter()
                .copied()
                .filter(|&c| scores[[c, t]] > 0.0 && scores[[c, t]] >= threshold && best_among(c, &sibs) == Some(t))
                .collect::<Vec<_>>();
            rows.iter().for_each(|&c| assigned[c] = true);
            let members = candidates
                .iter()
                .copied()
                .filter(|&c| best_among(c, &sibs) == Some(t))
                .collect::<Vec<_>>();
            candidates_of.insert(Some(markers.types()[t].name.clone()), members);
            reps.push((t, rows));
        }

        let level_genes = children
            .iter()
            .flat_map(|c| c.expressed.iter())
            .filter(|g| gene_col.contains_key(g.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        let cols = level_genes.iter().map(|g| gene_col[g.as_str()]).collect::<Vec<_>>();
        let lx = x.select(Axis(1), &cols);

        // outgroup: the least marked cells for this level, from anywhere in the reference
        let mut outgroup = (0..n).filter(|&c| !assigned[c]).collect::<Vec<_>>();
        let total = |c: usize| sibs.iter().map(|&t| scores[[c, t]]).sum::<f64>();
        outgroup.sort_by(|&a, &b| total(a).total_cmp(&total(b)).then(a.cmp(&b)));
        outgroup.truncate(params.num_unknown);

        let n_train = reps.iter().map(|r| r.1.len()).sum::<usize>() + outgroup.len();
        let mut classes = Vec::new();
        for (t, rows) in &reps {
            let name = &markers.types()[*t].name;
            if rows.is_empty() {
                warn!("no representative cells for '{}'; it cannot be assigned", name);
                continue;
            }
            classes.push(GaussianClass::fit(name, &lx, rows, n_train));
        }
        if !outgroup.is_empty() {
            classes.push(GaussianClass::fit(UNKNOWN, &lx, &outgroup, n_train));
        }
        info!(
            "trained level {:?}: {} classes on {} cells",
            parent.as_deref().unwrap_or("root"),
            classes.len(),
            n_train
        );
        if classes.len() < 2 {
            warn!("level {:?} has fewer than two classes", parent.as_deref().unwrap_or("root"));
        }
        if !classes.is_empty() {
            levels.push(LevelModel {
                parent,
                genes: level_genes,
                classes,
            });
        }
    }
    if levels.is_empty() {
        bail!("no cell type has representative cells in the reference");
    }

    Ok(MarkerClassifier {
        species: db.species,
        markers: markers.clone(),
        min_margin: params.min_margin,
        levels,
    })
}

impl CellClassifier for MarkerClassifier {
    fn classify(&self, session: &Session) -> Result<Vec<String>, Error> {
        let genes = self.markers.genes();
        let lookup = session.counts.feature_lookup();
        let missing = genes.iter().filter(|g| !lookup.contains_key(g.as_str())).count();
        if missing > 0 {
            warn!("{} marker genes are absent from the query and read as zero", missing);
        }
        let x = marker_expression(session, &genes)?;
        let gene_col = genes.iter().enumerate().map(|(i, g)| (g.as_str(), i)).collect::<HashMap<_, _>>();

        let mut labels: Vec<Option<String>> = vec![None; session.num_cells()];
        for level in &self.levels {
            let cols = level.genes.iter().map(|g| gene_col[g.as_str()]).collect::<Vec<_>>();
            for (c, label) in labels.iter_mut().enumerate() {
                if *label != level.parent {
                    continue;
                }
                let row = cols.iter().map(|&j| x[[c, j]]).collect::<Vec<_>>();
                let (best, margin) = level.predict(&row);
                if best != UNKNOWN && margin >= self.min_margin {
                    *label = Some(best.to_string());
                } else if level.parent.is_none() {
                    *label = Some(UNKNOWN.to_string());
                }
                // an ambiguous subtype keeps its parent's label
            }
        }
        Ok(labels.into_iter().map(|l| l.unwrap_or_else(|| UNKNOWN.to_string())).collect())
    }
}

/// Majority type per cluster when at least 90% of the cluster's assigned cells agree,
/// otherwise the cell's own type.
pub fn extend_by_cluster(types: &[String], clusters: &Factor) -> Vec<String> {
    let mut majority = vec![None; clusters.levels.len()];
    for (k, slot) in majority.iter_mut().enumerate() {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for c in clusters.indices_of(&clusters.levels[k]) {
            if types[c] != UNKNOWN {
                *counts.entry(types[c].as_str()).or_default() += 1;
            }
        }
        let assigned = counts.values().sum::<usize>();
        if let Some((ty, &n)) = counts.iter().max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0))) {
            if n as f64 >= CLUSTER_EXTEND_FRACTION * assigned as f64 {
                *slot = Some(ty.to_string());
            }
        }
    }
    types
        .iter()
        .zip(&clusters.codes)
        .map(|(t, code)| {
            code.and_then(|k| majority[k as usize].clone())
                .unwrap_or_else(|| t.clone())
        })
        .collect()
}

/// Classify every cell of `session`, recording `cell_type` and, with `cluster_extend`,
/// `cluster_ext_type` computed over the active identity.
pub fn run_garnett(session: &Session, classifier: &impl CellClassifier, cluster_extend: bool) -> Result<Session, Error> {
    let types = classifier.classify(session)?;
    let column = |labels: &[String]| Column::Categorical(Factor::from_values(labels.iter().map(|l| Some(l.as_str()))));
    let mut s = session.with_column(CELL_TYPE, column(&types))?;
    let assigned = types.iter().filter(|t| *t != UNKNOWN).count();
    info!("{} of {} cells assigned a cell type", assigned, types.len());
    if cluster_extend {
        let clusters = session.ident().context("cluster extension needs an active identity")?;
        let extended = extend_by_cluster(&types, &clusters);
        s = s.with_column(CLUSTER_EXT_TYPE, column(&extended))?;
    }
    Ok(s)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::AnalysisError;
    use crate::markers::test::immune_spec;
    use scflow_types::ExpressionMatrix;

    const GENES: [&str; 5] = ["CD3D", "CD3E", "CD4", "CD8A", "MS4A1"];

    /// cells 0..20 CD4 T, 20..40 CD8 T, 40..60 B, 60..66 marker-free
    fn immune_session() -> Session {
        let n_bg = 10;
        let counts = Array2::from_shape_fn((GENES.len() + n_bg, 66), |(g, c)| {
            let high = 20 + ((c * 7 + g) % 6) as u32;
            let leak = ((c + g) % 2) as u32;
            let on = match g {
                0 | 1 => c < 40,
                2 => c < 20,
                3 => (20..40).contains(&c),
                4 => (40..60).contains(&c),
                _ => return 5 + ((g * c) % 4) as u32,
            };
            if on {
                high
            } else if c < 60 {
                leak
            } else {
                0
            }
        });
        let genes = GENES
            .iter()
            .map(|g| g.to_string())
            .chain((0..n_bg).map(|i| format!("BG{i}")))
            .collect();
        let m = ExpressionMatrix::from_dense("immune", genes, (0..66).map(|c| format!("c{c}")).collect(), counts.view())
            .unwrap();
        let clusters = (0..66).map(|c| {
            Some(match c {
                0..=19 => "0",
                20..=39 => "1",
                40..=59 => "2",
                _ => "3",
            })
        });
        Session::new(m, "immune")
            .unwrap()
            .with_column("seurat_clusters", Column::Categorical(Factor::from_values(clusters)))
            .unwrap()
            .with_ident("seurat_clusters")
            .unwrap()
    }

    fn params() -> TrainParams {
        TrainParams {
            num_unknown: 6,
            ..TrainParams::default()
        }
    }

    fn accuracy(labels: &[String], range: std::ops::Range<usize>, expected: &str) -> f64 {
        let n = range.len() as f64;
        labels[range].iter().filter(|l| *l == expected).count() as f64 / n
    }

    #[test]
    fn test_train_and_classify() {
        let s = immune_session();
        let db = GeneDatabase::new(Species::Human, GENES);
        let clf = train_garnett(&s, &immune_spec(), &db, &params()).unwrap();
        let labels = clf.classify(&s).unwrap();
        assert!(accuracy(&labels, 0..20, "CD4 T cells") >= 0.9);
        assert!(accuracy(&labels, 20..40, "CD8 T cells") >= 0.9);
        assert!(accuracy(&labels, 40..60, "B cells") >= 0.9);
        assert!(accuracy(&labels, 60..66, UNKNOWN) >= 0.8);
    }

    #[test]
    fn test_run_garnett_cluster_extend() {
        let s = immune_session();
        let db = GeneDatabase::new(Species::Human, GENES);
        let clf = train_garnett(&s, &immune_spec(), &db, &params()).unwrap();
        let out = run_garnett(&s, &clf, true).unwrap();
        let ext = out.metadata.factor(CLUSTER_EXT_TYPE).unwrap();
        assert!((0..20).all(|c| ext.get(c) == Some("CD4 T cells")));
        assert!((40..60).all(|c| ext.get(c) == Some("B cells")));
        assert!(out.metadata.contains(CELL_TYPE));

        let plain = run_garnett(&s, &clf, false).unwrap();
        assert!(!plain.metadata.contains(CLUSTER_EXT_TYPE));
    }

    #[test]
    fn test_extend_by_cluster() {
        let clusters = Factor::from_values(vec![Some("a"); 10].into_iter().chain(vec![Some("b"); 4]));
        let mut types = vec!["T".to_string(); 9];
        types.push(UNKNOWN.to_string());
        types.extend(["T", "B", "B", UNKNOWN].iter().map(|s| s.to_string()));
        let ext = extend_by_cluster(&types, &clusters);
        // cluster a: 9 of 9 assigned agree; cluster b: 2 of 3 is below 90%
        assert!(ext[..10].iter().all(|t| t == "T"));
        assert_eq!(ext[10..], types[10..]);
    }

    #[test]
    fn test_unknown_marker_genes() {
        let s = immune_session();
        let db = GeneDatabase::new(Species::Mouse, ["CD3D"]);
        let err = train_garnett(&s, &immune_spec(), &db, &params()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AnalysisError>(),
            Some(AnalysisError::UnknownMarkerGenes { species, .. }) if species == "mouse"
        ));
    }

    #[test]
    fn test_classifier_json_round_trip() {
        let s = immune_session();
        let db = GeneDatabase::new(Species::Human, GENES);
        let clf = train_garnett(&s, &immune_spec(), &db, &params()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("classifier.json");
        clf.save(&path).unwrap();
        let back = MarkerClassifier::load(&path).unwrap();
        assert_eq!(back.species, Species::Human);
        assert_eq!(back.markers, clf.markers);
        assert_eq!(back.classify(&s).unwrap(), clf.classify(&s).unwrap());
    }
}
