//! Differential expression between two conditions within each cell-type stratum, using the
//! sSeq negative binomial exact test.

use crate::session::Session;
use crate::tables::write_records;
use anyhow::{Context, Error};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which columns and levels [`condition_de`] compares.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeParams {
    /// stratifying column, usually a cell type
    pub celltype_col: String,
    /// condition column
    pub condition_col: String,
    /// first condition level
    pub a: String,
    /// second condition level
    pub b: String,
}

/// One gene's test result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeRecord {
    /// gene id
    pub feature_id: String,
    /// gene symbol
    pub gene: String,
    /// mean size-normalized count in condition a
    pub mean_a: f64,
    /// mean size-normalized count in condition b
    pub mean_b: f64,
    /// log2 fold change of a over b
    pub log2_fold_change: f64,
    /// exact test p-value
    pub p_value: f64,
    /// Benjamini-Hochberg adjusted p-value
    pub adjusted_p_value: f64,
}

/// Test condition `a` against `b` in one set of cells. Genes come out sorted by adjusted
/// p-value.
pub fn test_conditions(session: &Session, cond_a: &[usize], cond_b: &[usize]) -> Vec<DeRecord> {
    let mat = session.counts.to_adaptive();
    let cells = cond_a.iter().chain(cond_b).copied().collect::<Vec<_>>();
    let params = diff_exp::compute_sseq_params(&mat, None, Some(&cells), None);
    let res = diff_exp::sseq_differential_expression(&mat, cond_a, cond_b, &params, None);
    let mut out = (0..session.counts.num_features())
        .map(|g| DeRecord {
            feature_id: session.counts.feature_ids[g].clone(),
            gene: session.counts.feature_names[g].clone(),
            mean_a: res.normalized_mean_in[g],
            mean_b: res.normalized_mean_out[g],
            log2_fold_change: res.log2_fold_change[g],
            p_value: res.p_values[g],
            adjusted_p_value: res.adjusted_p_values[g],
        })
        .collect::<Vec<_>>();
    out.sort_by(|x, y| x.adjusted_p_value.total_cmp(&y.adjusted_p_value).then(x.p_value.total_cmp(&y.p_value)));
    out
}

/// File name for a stratum; path separators are replaced.
fn stratum_file(level: &str) -> String {
    let safe = level
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect::<String>();
    format!("{}.tsv", safe)
}

/// Run [`test_conditions`] in every level of `params.celltype_col` and write
/// `<out_dir>/<cell type>.tsv`. Strata lacking cells of either condition are skipped.
/// Returns the files written.
pub fn condition_de(session: &Session, params: &DeParams, out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let strata = session.metadata.factor(&params.celltype_col)?;
    let condition = session
        .metadata
        .get(&params.condition_col)
        .with_context(|| format!("metadata column '{}' not found", params.condition_col))?;
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;

    let mut written = Vec::new();
    for level in &strata.levels {
        let cells = strata.indices_of(level);
        let pick = |target: &str| {
            cells
                .iter()
                .copied()
                .filter(|&c| condition.display(c).as_deref() == Some(target))
                .collect::<Vec<_>>()
        };
        let (cond_a, cond_b) = (pick(&params.a), pick(&params.b));
        if cond_a.is_empty() || cond_b.is_empty() {
            warn!(
                "skipping '{}': {} cells in '{}' and {} in '{}'",
                level,
                cond_a.len(),
                params.a,
                cond_b.len(),
                params.b
            );
            continue;
        }
        let records = test_conditions(session, &cond_a, &cond_b);
        let path = out_dir.join(stratum_file(level));
        write_records(&path, &records)?;
        info!(
            "'{}': {} vs {} cells, {} genes with adjusted p < 0.05",
            level,
            cond_a.len(),
            cond_b.len(),
            records.iter().filter(|r| r.adjusted_p_value < 0.05).count()
        );
        written.push(path);
    }
    Ok(written)
}
