//! Composition of one categorical annotation within each level of another.

use crate::plot::stacked_bar;
use crate::session::{Session, CLUSTERS, ORIG_IDENT};
use crate::tables::{write_records, write_tsv};
use anyhow::Error;
use log::info;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Columns compared by [`sc_aggregate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateParams {
    /// column whose distribution is measured
    pub group: String,
    /// column whose levels each get a distribution
    pub by: String,
}

impl Default for AggregateParams {
    fn default() -> Self {
        AggregateParams {
            group: ORIG_IDENT.to_string(),
            by: CLUSTERS.to_string(),
        }
    }
}

/// Wide proportion table: one row per `by` level, one column per `group` level.
#[derive(Clone, Debug, PartialEq)]
pub struct Proportions {
    /// row labels
    pub by_levels: Vec<String>,
    /// column labels
    pub group_levels: Vec<String>,
    /// rows sum to one
    pub values: Array2<f64>,
}

/// One cell of the long proportion table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProportionRecord {
    /// `by` level
    pub by: String,
    /// `group` level
    pub group: String,
    /// share of the `by` level's cells in this group
    pub proportion: f64,
}

impl Proportions {
    /// Reorder rows by descending proportion of the first group level. Ties keep their order.
    pub fn sort_by_first_group(&mut self) {
        if self.group_levels.is_empty() {
            return;
        }
        let mut order = (0..self.by_levels.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| self.values[[b, 0]].total_cmp(&self.values[[a, 0]]));
        self.by_levels = order.iter().map(|&i| self.by_levels[i].clone()).collect();
        self.values = self.values.select(ndarray::Axis(0), &order);
    }

    /// Melt into `(by, group, proportion)` records, row by row.
    pub fn to_long(&self) -> Vec<ProportionRecord> {
        let mut out = Vec::with_capacity(self.values.len());
        for (i, by) in self.by_levels.iter().enumerate() {
            for (j, group) in self.group_levels.iter().enumerate() {
                out.push(ProportionRecord {
                    by: by.clone(),
                    group: group.clone(),
                    proportion: self.values[[i, j]],
                });
            }
        }
        out
    }

    /// Write the wide table with a leading `by` column.
    pub fn write_wide(&self, path: impl AsRef<Path>, by_name: &str) -> Result<(), Error> {
        let header = std::iter::once(by_name.to_string())
            .chain(self.group_levels.iter().cloned())
            .collect::<Vec<_>>();
        let rows = self
            .by_levels
            .iter()
            .zip(self.values.rows())
            .map(|(by, row)| std::iter::once(by.clone()).chain(row.iter().map(|v| v.to_string())).collect())
            .collect::<Vec<_>>();
        write_tsv(path, &header, &rows)
    }
}

/// Distribution of `group` levels within every `by` level. Cells missing either value
/// are ignored. A group level absent from a `by` level gets proportion zero.
pub fn proportions(session: &Session, group: &str, by: &str) -> Result<Proportions, Error> {
    let mut g = session.metadata.get(group).map(|c| c.to_factor()).ok_or_else(|| missing(group))?;
    let mut b = session.metadata.get(by).map(|c| c.to_factor()).ok_or_else(|| missing(by))?;
    g.drop_unused_levels();
    b.drop_unused_levels();
    let mut counts = Array2::<f64>::zeros((b.levels.len(), g.levels.len()));
    for (bc, gc) in b.codes.iter().zip(&g.codes) {
        if let (Some(bc), Some(gc)) = (bc, gc) {
            counts[[*bc as usize, *gc as usize]] += 1.0;
        }
    }
    for mut row in counts.rows_mut() {
        let total = row.sum();
        if total > 0.0 {
            row /= total;
        }
    }
    Ok(Proportions {
        by_levels: b.levels,
        group_levels: g.levels,
        values: counts,
    })
}

fn missing(column: &str) -> Error {
    anyhow::format_err!("metadata column '{}' not found", column)
}

/// Proportion tables of `params.group` by `params.by`, sorted by the first group level.
/// With `out_dir`, writes `proportions_wide.tsv`, `proportions_long.tsv` and a stacked
/// bar chart `proportions.png`.
pub fn sc_aggregate(
    session: &Session,
    params: &AggregateParams,
    out_dir: Option<&Path>,
) -> Result<(Proportions, Vec<ProportionRecord>), Error> {
    let mut wide = proportions(session, &params.group, &params.by)?;
    wide.sort_by_first_group();
    let long = wide.to_long();
    info!(
        "{} proportions over {} {} levels",
        params.group,
        wide.by_levels.len(),
        params.by
    );
    if let Some(dir) = out_dir {
        std::fs::create_dir_all(dir)?;
        wide.write_wide(dir.join("proportions_wide.tsv"), &params.by)?;
        write_records(dir.join("proportions_long.tsv"), &long)?;
        let bars = wide.values.rows().into_iter().map(|r| r.to_vec()).collect::<Vec<_>>();
        stacked_bar(dir.join("proportions.png"), &bars)?;
    }
    Ok((wide, long))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test::toy_session;
    use approx::assert_abs_diff_eq;
    use scflow_types::{Column, Factor};

    fn annotated() -> Session {
        // 4 cells: sample s1 s1 s2 s2, cluster 0 0 0 1
        toy_session()
            .with_column(
                ORIG_IDENT,
                Column::Categorical(Factor::from_values(["s1", "s1", "s2", "s2"].map(Some))),
            )
            .unwrap()
            .with_column(CLUSTERS, Column::Categorical(Factor::from_values(["0", "0", "0", "1"].map(Some))))
            .unwrap()
    }

    #[test]
    fn test_rows_sum_to_one_and_zero_fill() {
        let p = proportions(&annotated(), ORIG_IDENT, CLUSTERS).unwrap();
        assert_eq!(p.by_levels, vec!["0", "1"]);
        assert_eq!(p.group_levels, vec!["s1", "s2"]);
        for row in p.values.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        // cluster 1 has no s1 cells
        assert_eq!(p.values[[1, 0]], 0.0);
        assert_abs_diff_eq!(p.values[[0, 0]], 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sc_aggregate_sorted_and_written() {
        let s = annotated();
        let dir = tempfile::tempdir().unwrap();
        let params = AggregateParams {
            group: CLUSTERS.into(),
            by: ORIG_IDENT.into(),
        };
        let (wide, long) = sc_aggregate(&s, &params, Some(dir.path())).unwrap();
        // share of cluster 0: s1 = 1.0, s2 = 0.5
        assert_eq!(wide.by_levels, vec!["s1", "s2"]);
        assert_eq!(long.len(), 4);
        assert_eq!(long[1].group, "1");
        assert_eq!(long[1].proportion, 0.0);

        let text = std::fs::read_to_string(dir.path().join("proportions_wide.tsv")).unwrap();
        assert_eq!(text.lines().next(), Some("orig.ident\t0\t1"));
        assert!(dir.path().join("proportions_long.tsv").exists());
        assert!(dir.path().join("proportions.png").exists());

        let bad = AggregateParams {
            group: "nope".into(),
            ..AggregateParams::default()
        };
        assert!(sc_aggregate(&s, &bad, None).is_err());
    }

    #[test]
    fn test_sort_by_first_group() {
        let mut p = Proportions {
            by_levels: vec!["a".into(), "b".into(), "c".into()],
            group_levels: vec!["x".into(), "y".into()],
            values: ndarray::array![[0.2, 0.8], [0.9, 0.1], [0.5, 0.5]],
        };
        p.sort_by_first_group();
        assert_eq!(p.by_levels, vec!["b", "c", "a"]);
        assert_eq!(p.values.row(0).to_vec(), vec![0.9, 0.1]);
    }
}
