//! Cell-cycle phase scoring from S and G2/M gene modules.

use crate::markers::Species;
use crate::normalization::log_normalize;
use crate::session::Session;
use anyhow::{bail, format_err, Context, Error};
use log::{info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use scflow_types::{Column, Factor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// S phase score column.
pub const S_SCORE: &str = "S.Score";
/// G2/M phase score column.
pub const G2M_SCORE: &str = "G2M.Score";
/// Phase column.
pub const PHASE: &str = "Phase";

/// Parameters of the module score.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleScoreParams {
    /// expression bins genes are drawn from
    pub n_bins: usize,
    /// control genes drawn per module gene
    pub n_controls: usize,
    /// control sampling seed
    pub seed: u64,
}

impl Default for ModuleScoreParams {
    fn default() -> Self {
        ModuleScoreParams {
            n_bins: 24,
            n_controls: 100,
            seed: 1,
        }
    }
}

/// S and G2/M gene symbols.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CellCycleGenes {
    /// `G1-S` genes
    pub s: Vec<String>,
    /// `G2-M` genes
    pub g2m: Vec<String>,
}

/// Read a tab-delimited stage list with a `Stage` column and a symbol column chosen by
/// species: `Gene_Name` for human, `mGeneName` for mouse.
pub fn read_cell_cycle_genes(path: impl AsRef<Path>, species: Species) -> Result<CellCycleGenes, Error> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("opening cell-cycle genes {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| format_err!("{} has no '{}' column", path.display(), name))
    };
    let stage = column("Stage")?;
    let symbol = column(match species {
        Species::Human => "Gene_Name",
        Species::Mouse => "mGeneName",
    })?;

    let mut genes = CellCycleGenes::default();
    for rec in rdr.records() {
        let rec = rec.with_context(|| format!("reading {}", path.display()))?;
        let (Some(st), Some(g)) = (rec.get(stage), rec.get(symbol)) else {
            continue;
        };
        let g = g.trim();
        if g.is_empty() || g == "NA" {
            continue;
        }
        match st.trim() {
            "G1-S" => genes.s.push(g.to_string()),
            "G2-M" => genes.g2m.push(g.to_string()),
            _ => {}
        }
    }
    if genes.s.is_empty() || genes.g2m.is_empty() {
        bail!("{} lists no G1-S or no G2-M genes", path.display());
    }
    Ok(genes)
}

/// Per-cell module score: mean log-normalized expression of `genes` minus the mean of
/// control genes drawn from the same average-expression bins.
pub fn module_score(session: &Session, genes: &[String], params: &ModuleScoreParams) -> Result<Vec<f64>, Error> {
    let lookup = session.counts.feature_lookup();
    let features = genes
        .iter()
        .filter_map(|g| lookup.get(g.as_str()).copied())
        .collect::<BTreeSet<_>>();
    if features.len() < genes.len() {
        warn!("{} of {} module genes are not in the data", genes.len() - features.len(), genes.len());
    }
    if features.is_empty() {
        bail!("none of the module genes are in the data");
    }

    let data = log_normalize(&session.counts.matrix);
    let n_genes = data.rows();
    let n_cells = data.cols() as f64;
    let mut means = vec![0.0; n_genes];
    for col in data.outer_iterator() {
        for (g, &v) in col.iter() {
            means[g] += v / n_cells;
        }
    }
    let mut order = (0..n_genes).collect::<Vec<_>>();
    order.sort_by(|&a, &b| means[a].total_cmp(&means[b]).then(a.cmp(&b)));
    let n_bins = params.n_bins.clamp(1, n_genes);
    let mut bin = vec![0; n_genes];
    for (rank, &g) in order.iter().enumerate() {
        bin[g] = rank * n_bins / n_genes;
    }
    let mut members = vec![Vec::new(); n_bins];
    for g in 0..n_genes {
        members[bin[g]].push(g);
    }

    let mut rng = SmallRng::seed_from_u64(params.seed);
    let mut controls = BTreeSet::new();
    for &g in &features {
        let pool = &members[bin[g]];
        let n = params.n_controls.min(pool.len());
        for i in rand::seq::index::sample(&mut rng, pool.len(), n) {
            controls.insert(pool[i]);
        }
    }

    let mut in_module = vec![0.0; data.cols()];
    let mut in_control = vec![0.0; data.cols()];
    for (c, col) in data.outer_iterator().enumerate() {
        for (g, &v) in col.iter() {
            if features.contains(&g) {
                in_module[c] += v;
            }
            if controls.contains(&g) {
                in_control[c] += v;
            }
        }
    }
    let (nf, nc) = (features.len() as f64, controls.len() as f64);
    Ok(in_module
        .iter()
        .zip(&in_control)
        .map(|(m, k)| m / nf - k / nc)
        .collect())
}

/// `G1` when both scores are negative, otherwise the larger of `S` and `G2M`.
pub fn assign_phase(s: f64, g2m: f64) -> &'static str {
    if s < 0.0 && g2m < 0.0 {
        "G1"
    } else if s > g2m {
        "S"
    } else {
        "G2M"
    }
}

/// Score S and G2/M modules, assign `Phase`, and make `Phase` the active identity.
pub fn cell_cycle_analysis(
    session: &Session,
    genes: &CellCycleGenes,
    params: &ModuleScoreParams,
) -> Result<Session, Error> {
    let s = module_score(session, &genes.s, params).context("scoring S phase genes")?;
    let g2m = module_score(session, &genes.g2m, params).context("scoring G2/M phase genes")?;
    let phase = s.iter().zip(&g2m).map(|(&a, &b)| Some(assign_phase(a, b))).collect::<Vec<_>>();
    let factor = Factor::from_values(phase);
    for (level, n) in factor.levels.iter().zip(factor.counts()) {
        info!("phase {}: {} cells", level, n);
    }
    session
        .with_column(S_SCORE, Column::Numeric(s.into_iter().map(Some).collect()))?
        .with_column(G2M_SCORE, Column::Numeric(g2m.into_iter().map(Some).collect()))?
        .with_column(PHASE, Column::Categorical(factor))?
        .with_ident(PHASE)
}

/// Read the stage list at `path` and run [`cell_cycle_analysis`].
pub fn cell_cycle_from_file(
    session: &Session,
    path: impl AsRef<Path>,
    species: Species,
    params: &ModuleScoreParams,
) -> Result<Session, Error> {
    let genes = read_cell_cycle_genes(path, species)?;
    info!("{} S and {} G2/M genes", genes.s.len(), genes.g2m.len());
    cell_cycle_analysis(session, &genes, params)
}

#[cfg(test)]
mod test {
    use super::*;
    use ndarray::Array2;
    use scflow_types::ExpressionMatrix;

    /// cells 0..10 in S, 10..20 in G2/M, 20..30 in G1. Genes 0..5 are S genes,
    /// 5..10 G2/M genes, the rest background with means spread over 1..6.
    fn cycling() -> Session {
        let counts = Array2::from_shape_fn((210, 30), |(g, c)| match g {
            0..=4 => if c < 10 { 8 } else { 1 },
            5..=9 => if (10..20).contains(&c) { 8 } else { 1 },
            _ => 1 + (g % 6) as u32,
        });
        let genes = (0..210)
            .map(|g| match g {
                0..=4 => format!("S{g}"),
                5..=9 => format!("M{g}"),
                _ => format!("BG{g}"),
            })
            .collect();
        let m = ExpressionMatrix::from_dense("cc", genes, (0..30).map(|c| format!("c{c}")).collect(), counts.view())
            .unwrap();
        Session::new(m, "cc").unwrap()
    }

    #[test]
    fn test_phases() {
        let s = cycling();
        let genes = CellCycleGenes {
            s: (0..5).map(|g| format!("S{g}")).collect(),
            g2m: (5..10).map(|g| format!("M{g}")).chain(["ABSENT".to_string()]).collect(),
        };
        let out = cell_cycle_analysis(&s, &genes, &ModuleScoreParams::default()).unwrap();
        let phase = out.metadata.factor(PHASE).unwrap();
        assert!((0..10).all(|c| phase.get(c) == Some("S")));
        assert!((10..20).all(|c| phase.get(c) == Some("G2M")));
        assert!((20..30).all(|c| phase.get(c) == Some("G1")));
        assert_eq!(out.active_ident.as_deref(), Some(PHASE));
        assert_eq!(out.metadata.numeric(S_SCORE).unwrap().len(), 30);
    }

    #[test]
    fn test_assign_phase() {
        assert_eq!(assign_phase(-0.1, -0.2), "G1");
        assert_eq!(assign_phase(0.3, -0.2), "S");
        assert_eq!(assign_phase(-0.3, 0.1), "G2M");
        assert_eq!(assign_phase(0.2, 0.2), "G2M");
    }

    #[test]
    fn test_read_genes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cc.tsv");
        std::fs::write(
            &path,
            "Stage\tGene_Name\tmGeneName\nG1-S\tMCM5\tMcm5\nG1-S\tPCNA\tPcna\nG2-M\tTOP2A\tTop2a\nG2-M\tNA\tMki67\n",
        )
        .unwrap();
        let human = read_cell_cycle_genes(&path, Species::Human).unwrap();
        assert_eq!(human.s, vec!["MCM5", "PCNA"]);
        assert_eq!(human.g2m, vec!["TOP2A"]);
        let mouse = read_cell_cycle_genes(&path, Species::Mouse).unwrap();
        assert_eq!(mouse.g2m, vec!["Top2a", "Mki67"]);

        let bad = dir.path().join("bad.tsv");
        std::fs::write(&bad, "Phase\tGene_Name\nG1-S\tMCM5\n").unwrap();
        assert!(read_cell_cycle_genes(&bad, Species::Human).is_err());
    }
}
