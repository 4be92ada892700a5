//! Tab-separated exports.

use crate::error::AnalysisError;
use crate::normalization::log_normalize;
use crate::session::Session;
use anyhow::{Context, Error};
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Serialize `records` to a TSV file with a header row taken from the field names.
pub fn write_records<T: Serialize>(path: impl AsRef<Path>, records: &[T]) -> Result<(), Error> {
    let path = path.as_ref();
    let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(BufWriter::new(f));
    for r in records {
        wtr.serialize(r)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Write a TSV file from a header and string rows.
pub fn write_tsv(path: impl AsRef<Path>, header: &[String], rows: &[Vec<String>]) -> Result<(), Error> {
    let path = path.as_ref();
    let f = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(BufWriter::new(f));
    wtr.write_record(header)?;
    for row in rows {
        wtr.write_record(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// One cell's expression of one gene, with its sample annotations.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExpressionRecord {
    /// cell barcode
    pub barcode: String,
    /// gene symbol
    pub gene: String,
    /// log-normalized expression
    pub expression: f64,
    /// sample of origin
    pub sample: Option<String>,
    /// experimental condition, when requested
    pub condition: Option<String>,
}

/// Long table of log-normalized expression of `genes` in every cell.
pub fn expression_by_sample(
    session: &Session,
    genes: &[String],
    sample_col: &str,
    condition_col: Option<&str>,
) -> Result<Vec<ExpressionRecord>, Error> {
    let rows = genes
        .iter()
        .map(|g| {
            session
                .counts
                .feature_index(g)
                .ok_or_else(|| AnalysisError::GeneNotFound(g.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let sample = session.metadata.get(sample_col).with_context(|| format!("metadata column '{}' not found", sample_col))?;
    let condition = condition_col
        .map(|c| session.metadata.get(c).with_context(|| format!("metadata column '{}' not found", c)))
        .transpose()?;

    let data = log_normalize(&session.counts.matrix);
    let mut out = Vec::with_capacity(genes.len() * session.num_cells());
    for (gene, &row) in genes.iter().zip(&rows) {
        for c in 0..session.num_cells() {
            out.push(ExpressionRecord {
                barcode: session.metadata.barcodes[c].clone(),
                gene: gene.clone(),
                expression: data.get(row, c).copied().unwrap_or(0.0),
                sample: sample.display(c),
                condition: condition.and_then(|col| col.display(c)),
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test::toy_session;

    #[test]
    fn test_expression_by_sample() {
        let s = toy_session();
        let genes = vec![s.counts.feature_names[0].clone()];
        let recs = expression_by_sample(&s, &genes, "orig.ident", None).unwrap();
        assert_eq!(recs.len(), s.num_cells());
        assert!(recs.iter().all(|r| r.expression >= 0.0 && r.sample.is_some() && r.condition.is_none()));
        assert!(expression_by_sample(&s, &["NOPE".to_string()], "orig.ident", None).is_err());
        assert!(expression_by_sample(&s, &genes, "missing", None).is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("expr.tsv");
        write_records(&path, &recs).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("barcode\tgene\texpression\tsample\tcondition\n"));
        assert_eq!(text.lines().count(), s.num_cells() + 1);
    }
}
