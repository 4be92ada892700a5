//! TOML analysis configuration and the driver that runs every configured stage in order.
//!
//! ```toml
//! output_dir = "out"
//!
//! [[samples]]
//! name = "ctrl"
//! path = "data/ctrl/filtered_feature_bc_matrix"
//! condition = "ctrl"
//!
//! [qc]
//! min_features = 200
//!
//! [integration]
//! dims = 30
//!
//! [cluster_names]
//! "0" = "T cells"
//! ```

use crate::aggregate::{sc_aggregate, AggregateParams};
use crate::cell_cycle::{cell_cycle_from_file, ModuleScoreParams, PHASE};
use crate::classify::{run_garnett, train_garnett, TrainParams};
use crate::clonotype::{annotate_clonotypes, prefix_barcodes, read_clonotypes};
use crate::differential::{condition_de, DeParams};
use crate::integrate::{integrate_batches, merge_samples, IntegrationParams};
use crate::markers::{parse_marker_file, write_garnett, GeneDatabase, Species};
use crate::phate::{attach_phate, plot_phate, run_phate, PhateParams};
use crate::plot::plot_embedding;
use crate::qc::{load, QcParams};
use crate::reduce::{reduce_dim, ReduceParams};
use crate::session::{Session, CLUSTERS, ORIG_IDENT};
use crate::tables::{expression_by_sample, write_records};
use crate::trajectory::{plot_trajectory, run_trajectory, TrajectoryParams};
use anyhow::{bail, Context, Error};
use log::info;
use scflow_types::{Column, Factor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Metadata column holding the experimental condition of each sample.
pub const CONDITION: &str = "condition";
/// Metadata column written from `cluster_names`.
pub const CLUSTER_CELLTYPE: &str = "celltype";

/// One 10X sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// sample name, recorded as `orig.ident`
    pub name: String,
    /// 10X matrix directory
    pub path: PathBuf,
    /// optional experimental condition
    #[serde(default)]
    pub condition: Option<String>,
}

/// Cell-cycle scoring inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellCycleConfig {
    /// tab-delimited stage list
    pub genes: PathBuf,
    /// symbol column convention
    pub species: Species,
    /// module score parameters
    #[serde(default)]
    pub score: ModuleScoreParams,
}

/// Marker-based classification inputs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassifyConfig {
    /// marker file
    pub markers: PathBuf,
    /// species of the markers
    pub species: Species,
    /// one-symbol-per-line gene list; the data's own symbols when absent
    #[serde(default)]
    pub gene_db: Option<PathBuf>,
    /// training parameters
    #[serde(default)]
    pub train: TrainParams,
    /// extend confident assignments to whole clusters
    #[serde(default)]
    pub cluster_extend: bool,
}

/// V(D)J outputs to join.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClonotypeConfig {
    /// directory with `filtered_contig_annotations.csv` and `clonotypes.csv`
    pub dir: PathBuf,
    /// suffix of the added columns
    #[serde(default)]
    pub tag: String,
    /// sample the V(D)J library was sequenced alongside; required when several samples are
    /// merged, since merged barcodes carry the sample name
    #[serde(default)]
    pub sample: Option<String>,
}

/// A whole analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// where tables and plots go
    pub output_dir: PathBuf,
    /// input samples
    pub samples: Vec<SampleConfig>,
    /// per-sample QC
    #[serde(default)]
    pub qc: QcParams,
    /// normalization, reduction and clustering
    #[serde(default)]
    pub reduce: ReduceParams,
    /// anchor integration; samples are merged without correction when absent
    #[serde(default)]
    pub integration: Option<IntegrationParams>,
    /// cluster label to cell type name
    #[serde(default)]
    pub cluster_names: BTreeMap<String, String>,
    /// cell-cycle scoring
    #[serde(default)]
    pub cell_cycle: Option<CellCycleConfig>,
    /// clonotype joins
    #[serde(default)]
    pub clonotypes: Vec<ClonotypeConfig>,
    /// marker classification
    #[serde(default)]
    pub classify: Option<ClassifyConfig>,
    /// PHATE embedding
    #[serde(default)]
    pub phate: Option<PhateParams>,
    /// trajectory inference
    #[serde(default)]
    pub trajectory: Option<TrajectoryParams>,
    /// proportion tables
    #[serde(default)]
    pub aggregate: Vec<AggregateParams>,
    /// per cell type differential expression
    #[serde(default)]
    pub diffexp: Vec<DeParams>,
    /// genes exported as a long expression table
    #[serde(default)]
    pub expression_genes: Vec<String>,
}

impl AnalysisConfig {
    /// Parse a TOML config. Relative sample and input paths are resolved against the
    /// config file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<AnalysisConfig, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: AnalysisConfig =
            toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))?;
        if let Some(base) = path.parent() {
            cfg.resolve_paths(base);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let fix = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        fix(&mut self.output_dir);
        self.samples.iter_mut().for_each(|s| fix(&mut s.path));
        self.clonotypes.iter_mut().for_each(|c| fix(&mut c.dir));
        if let Some(cc) = &mut self.cell_cycle {
            fix(&mut cc.genes);
        }
        if let Some(cl) = &mut self.classify {
            fix(&mut cl.markers);
            if let Some(db) = &mut cl.gene_db {
                fix(db);
            }
        }
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<(), Error> {
        if self.samples.is_empty() {
            bail!("the analysis config lists no samples");
        }
        let mut names = self.samples.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.samples.len() {
            bail!("sample names must be unique");
        }
        for c in &self.clonotypes {
            match &c.sample {
                Some(sample) if !names.contains(&sample.as_str()) => {
                    bail!("clonotypes in {} name unknown sample '{}'", c.dir.display(), sample)
                }
                None if self.samples.len() > 1 => bail!(
                    "clonotypes in {} must name their sample when several samples are merged",
                    c.dir.display()
                ),
                _ => (),
            }
        }
        self.reduce.validate()?;
        Ok(())
    }
}

fn load_samples(cfg: &AnalysisConfig) -> Result<Vec<(String, Session)>, Error> {
    cfg.samples
        .iter()
        .map(|sample| {
            let qc = QcParams {
                project: sample.name.clone(),
                ..cfg.qc.clone()
            };
            let mut s = load(&sample.path, &qc)?;
            if let Some(cond) = &sample.condition {
                s = s.with_column(CONDITION, Column::Categorical(Factor::constant(cond, s.num_cells())))?;
            }
            info!("sample '{}': {} cells", sample.name, s.num_cells());
            Ok((sample.name.clone(), s))
        })
        .collect()
}

/// Run every configured stage and return the final session. Tables and plots are written
/// under `output_dir`.
pub fn run_analysis(cfg: &AnalysisConfig) -> Result<Session, Error> {
    cfg.validate()?;
    let out = &cfg.output_dir;
    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    let samples = load_samples(cfg)?;
    let mut session = match (&cfg.integration, samples.len()) {
        (Some(params), _) => integrate_batches(&samples, params, &cfg.reduce).context("integrating samples")?,
        (None, 1) => reduce_dim(&samples[0].1, &cfg.reduce)?,
        (None, _) => reduce_dim(&merge_samples(&samples)?, &cfg.reduce)?,
    };
    if cfg.reduce.umap {
        plot_embedding(&session, "umap", CLUSTERS, out.join("umap_clusters.png"))?;
        plot_embedding(&session, "umap", ORIG_IDENT, out.join("umap_samples.png"))?;
    }

    if !cfg.cluster_names.is_empty() {
        session = session.rename_levels(CLUSTERS, CLUSTER_CELLTYPE, &cfg.cluster_names)?;
    }

    if let Some(cc) = &cfg.cell_cycle {
        let ident = session.active_ident.clone();
        session = cell_cycle_from_file(&session, &cc.genes, cc.species, &cc.score)?;
        if cfg.reduce.umap {
            plot_embedding(&session, "umap", PHASE, out.join("umap_phase.png"))?;
        }
        // keep clusters as the grouping for later stages
        if let Some(ident) = ident {
            session = session.with_ident(&ident)?;
        }
    }

    for c in &cfg.clonotypes {
        let mut calls = read_clonotypes(&c.dir).with_context(|| format!("clonotypes in {}", c.dir.display()))?;
        if let (Some(sample), true) = (&c.sample, samples.len() > 1) {
            calls = prefix_barcodes(calls, sample);
        }
        session = annotate_clonotypes(&session, &calls, &c.tag)?;
    }

    if let Some(cl) = &cfg.classify {
        let markers = parse_marker_file(&cl.markers)?;
        write_garnett(&markers, out.join("markers.txt"))?;
        let db = match &cl.gene_db {
            Some(p) => GeneDatabase::from_file(cl.species, p)?,
            None => GeneDatabase::new(cl.species, session.counts.feature_names.iter().cloned()),
        };
        let classifier = train_garnett(&session, &markers, &db, &cl.train)?;
        classifier.save(out.join("classifier.json"))?;
        session = run_garnett(&session, &classifier, cl.cluster_extend)?;
    }

    if let Some(params) = &cfg.phate {
        let result = run_phate(&session, params)?;
        plot_phate(&result, params.color_gene.as_deref(), out.join("phate.png"))?;
        if params.subset.is_none() && result.cells.len() == session.num_cells() {
            session = attach_phate(&session, &result)?;
        }
    }

    if let Some(params) = &cfg.trajectory {
        let (s, trajectory) = run_trajectory(&session, params)?;
        plot_trajectory(&trajectory, out.join("trajectory.png"))?;
        session = s;
    }

    for agg in &cfg.aggregate {
        let dir = out.join("aggregate").join(format!("{}_by_{}", agg.group, agg.by));
        sc_aggregate(&session, agg, Some(&dir))?;
    }

    for de in &cfg.diffexp {
        let dir = out
            .join("diffexp")
            .join(format!("{}_{}_vs_{}", de.celltype_col, de.a, de.b));
        condition_de(&session, de, &dir)?;
    }

    if !cfg.expression_genes.is_empty() {
        let condition = session.metadata.contains(CONDITION).then_some(CONDITION);
        let records = expression_by_sample(&session, &cfg.expression_genes, ORIG_IDENT, condition)?;
        write_records(out.join("expression_by_sample.tsv"), &records)?;
    }

    session.validate()?;
    info!("analysis finished with {} cells", session.num_cells());
    Ok(session)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clonotype::{CLONOTYPES, CONTIG_ANNOTATIONS};
    use crate::mtx::test::write_10x_dir;

    const CONFIG: &str = r#"
output_dir = "out"
expression_genes = ["G0", "G7"]

[[samples]]
name = "a"
path = "a"
condition = "ctrl"

[[samples]]
name = "b"
path = "b"
condition = "stim"

[qc]
min_features = 2
max_features = 100
min_cells = 1

[reduce]
normalization = "lognormalize"
n_variable_features = 12
n_pcs = 5
ndims = 3
k = 5
umap = false

[cluster_names]
"0" = "high"
"1" = "low"

[[aggregate]]
group = "orig.ident"
by = "seurat_clusters"

[[diffexp]]
celltype_col = "celltype"
condition_col = "condition"
a = "stim"
b = "ctrl"
"#;

    /// 12 genes x `n` cells: genes 0..6 high in the first half, genes 6..12 in the second.
    fn two_population_counts(n: usize, shift: u32) -> Vec<Vec<u32>> {
        (0..12)
            .map(|g| {
                (0..n)
                    .map(|c| {
                        let high = (g < 6) == (c < n / 2);
                        let jitter = ((g * 5 + c * 3) % 4) as u32;
                        if high {
                            30 + jitter + shift
                        } else {
                            2 + jitter
                        }
                    })
                    .collect()
            })
            .collect()
    }

    fn write_project(root: &Path) -> PathBuf {
        let genes = (0..12).map(|g| format!("G{g}")).collect::<Vec<_>>();
        let genes = genes.iter().map(String::as_str).collect::<Vec<_>>();
        for (name, shift) in [("a", 0), ("b", 4)] {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            write_10x_dir(&dir, &genes, &two_population_counts(20, shift), false);
        }
        let path = root.join("analysis.toml");
        fs::write(&path, CONFIG).unwrap();
        path
    }

    #[test]
    fn test_parse_and_resolve() {
        let root = tempfile::tempdir().unwrap();
        let path = write_project(root.path());
        let cfg = AnalysisConfig::from_file(&path).unwrap();
        assert_eq!(cfg.samples.len(), 2);
        assert_eq!(cfg.samples[1].path, root.path().join("b"));
        assert_eq!(cfg.output_dir, root.path().join("out"));
        assert_eq!(cfg.qc.percent_mt, 20.0);
        assert_eq!(cfg.reduce.ndims, 3);
        assert!(cfg.integration.is_none() && cfg.phate.is_none());
        assert_eq!(cfg.diffexp[0].a, "stim");
    }

    #[test]
    fn test_invalid_configs() {
        let bad = r#"
output_dir = "out"
samples = []
"#;
        let cfg: AnalysisConfig = toml::from_str(bad).unwrap();
        assert!(cfg.validate().is_err());

        let dup = r#"
output_dir = "out"
[[samples]]
name = "a"
path = "x"
[[samples]]
name = "a"
path = "y"
"#;
        let cfg: AnalysisConfig = toml::from_str(dup).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_clonotypes_join_merged_samples() {
        let root = tempfile::tempdir().unwrap();
        write_project(root.path());
        let vdj = root.path().join("vdj");
        fs::create_dir_all(&vdj).unwrap();
        fs::write(
            vdj.join(CONTIG_ANNOTATIONS),
            "barcode,raw_clonotype_id\nCELL0-1,clonotype1\nCELL3-1,None\n",
        )
        .unwrap();
        fs::write(vdj.join(CLONOTYPES), "clonotype_id,cdr3s_aa\nclonotype1,TRB:CASS\n").unwrap();

        let unnamed = root.path().join("unnamed.toml");
        fs::write(&unnamed, format!("{CONFIG}\n[[clonotypes]]\ndir = \"vdj\"\n")).unwrap();
        assert!(AnalysisConfig::from_file(&unnamed).is_err());

        let named = root.path().join("named.toml");
        fs::write(
            &named,
            format!("{CONFIG}\n[[clonotypes]]\ndir = \"vdj\"\nsample = \"b\"\ntag = \"_T\"\n"),
        )
        .unwrap();
        let cfg = AnalysisConfig::from_file(&named).unwrap();
        assert_eq!(cfg.clonotypes[0].dir, vdj);
        let s = run_analysis(&cfg).unwrap();
        let ids = s.metadata.factor("clonotype_id_T").unwrap();
        let at = |b: &str| s.metadata.barcodes.iter().position(|x| x == b).unwrap();
        assert_eq!(ids.get(at("b_CELL0-1")), Some("clonotype1"));
        assert_eq!(ids.get(at("a_CELL0-1")), None);
        assert_eq!(ids.iter().filter(Option::is_some).count(), 1);
        let cdr3 = s.metadata.factor("cdr3s_aa_T").unwrap();
        assert_eq!(cdr3.get(at("b_CELL0-1")), Some("TRB:CASS"));
    }

    #[test]
    fn test_run_analysis_end_to_end() {
        let root = tempfile::tempdir().unwrap();
        let cfg = AnalysisConfig::from_file(write_project(root.path())).unwrap();
        let s = run_analysis(&cfg).unwrap();
        assert_eq!(s.num_cells(), 40);
        assert_eq!(s.metadata.factor(ORIG_IDENT).unwrap().levels, vec!["a", "b"]);
        let types = s.metadata.factor(CLUSTER_CELLTYPE).unwrap();
        assert_eq!(types.levels.len(), 2);
        let out = root.path().join("out");
        assert!(out.join("aggregate/orig.ident_by_seurat_clusters/proportions_wide.tsv").exists());
        assert!(out.join("diffexp/celltype_stim_vs_ctrl").is_dir());
        let expr = fs::read_to_string(out.join("expression_by_sample.tsv")).unwrap();
        // header plus one line per cell and gene
        assert_eq!(expr.lines().count(), 81);
        assert!(expr.lines().nth(1).is_some_and(|l| l.ends_with("\tctrl")));
    }
}
