//! Join V(D)J clonotype calls onto cells by barcode.

use crate::session::Session;
use anyhow::{Context, Error};
use log::info;
use scflow_types::{Column, Factor};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Per-contig annotations file.
pub const CONTIG_ANNOTATIONS: &str = "filtered_contig_annotations.csv";
/// Clonotype table file.
pub const CLONOTYPES: &str = "clonotypes.csv";

#[derive(Debug, Deserialize)]
struct ContigRow {
    barcode: String,
    raw_clonotype_id: String,
}

#[derive(Debug, Deserialize)]
struct ClonotypeRow {
    clonotype_id: String,
    cdr3s_aa: String,
}

/// Clonotype call of one barcode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClonotypeCall {
    /// clonotype id
    pub clonotype_id: String,
    /// CDR3 amino-acid sequences, when the clonotype is listed
    pub cdr3s_aa: Option<String>,
}

fn read_rows<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, Error> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    rdr.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .with_context(|| format!("reading {}", path.display()))
}

/// Read both files of a V(D)J output directory and join them. The first contig line of a
/// barcode decides its clonotype.
pub fn read_clonotypes(dir: impl AsRef<Path>) -> Result<HashMap<String, ClonotypeCall>, Error> {
    let dir = dir.as_ref();
    let contigs: Vec<ContigRow> = read_rows(&dir.join(CONTIG_ANNOTATIONS))?;
    let clonotypes: Vec<ClonotypeRow> = read_rows(&dir.join(CLONOTYPES))?;
    let cdr3 = clonotypes
        .into_iter()
        .map(|r| (r.clonotype_id, r.cdr3s_aa))
        .collect::<HashMap<_, _>>();

    // the first line decides, even when it carries no clonotype
    let mut first = HashMap::new();
    for row in contigs {
        first.entry(row.barcode).or_insert(row.raw_clonotype_id);
    }
    let calls = first
        .into_iter()
        .filter(|(_, id)| !id.is_empty() && id != "None")
        .map(|(barcode, id)| {
            let call = ClonotypeCall {
                cdr3s_aa: cdr3.get(&id).cloned(),
                clonotype_id: id,
            };
            (barcode, call)
        })
        .collect();
    Ok(calls)
}

/// Rename every barcode to `<sample>_<barcode>`, the form cells take after samples are
/// merged.
pub fn prefix_barcodes(calls: HashMap<String, ClonotypeCall>, sample: &str) -> HashMap<String, ClonotypeCall> {
    calls
        .into_iter()
        .map(|(b, call)| (format!("{sample}_{b}"), call))
        .collect()
}

/// Add `clonotype_id<tag>` and `cdr3s_aa<tag>` columns. Cells without an exact barcode
/// match are left missing rather than rejected, since V(D)J libraries routinely cover only
/// part of the expression cells.
pub fn annotate_clonotypes(session: &Session, calls: &HashMap<String, ClonotypeCall>, tag: &str) -> Result<Session, Error> {
    let matched = session.metadata.barcodes.iter().map(|b| calls.get(b)).collect::<Vec<_>>();
    let n = matched.iter().filter(|m| m.is_some()).count();
    info!("{} of {} cells have a clonotype", n, session.num_cells());
    let ids = matched.iter().map(|m| m.map(|c| c.clonotype_id.as_str()));
    let cdr3 = matched.iter().map(|m| m.and_then(|c| c.cdr3s_aa.as_deref()));
    session
        .with_column(&format!("clonotype_id{}", tag), Column::Categorical(Factor::from_values(ids)))?
        .with_column(&format!("cdr3s_aa{}", tag), Column::Categorical(Factor::from_values(cdr3)))
}

/// Read the V(D)J outputs in `dir` and annotate `session` with them.
pub fn add_clonotype(session: &Session, dir: impl AsRef<Path>, tag: &str) -> Result<Session, Error> {
    let calls = read_clonotypes(dir)?;
    annotate_clonotypes(session, &calls, tag)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::session::test::toy_session;

    fn vdj_dir(contigs: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONTIG_ANNOTATIONS), contigs).unwrap();
        std::fs::write(
            dir.path().join(CLONOTYPES),
            "clonotype_id,frequency,cdr3s_aa\nclonotype1,2,TRA:CAVR;TRB:CASS\nclonotype2,1,TRB:CSAR\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_join_matches_and_leaves_rest_missing() {
        // toy session barcodes are c0..c3; c9 is not a cell
        let dir = vdj_dir(
            "barcode,chain,raw_clonotype_id\nc0,TRA,clonotype1\nc0,TRB,clonotype1\nc2,TRB,clonotype2\nc9,TRB,clonotype1\n",
        );
        let s = add_clonotype(&toy_session(), dir.path(), "_T").unwrap();
        let ids = s.metadata.factor("clonotype_id_T").unwrap();
        let cdr3 = s.metadata.factor("cdr3s_aa_T").unwrap();
        assert_eq!(ids.iter().collect::<Vec<_>>(), vec![Some("clonotype1"), None, Some("clonotype2"), None]);
        assert_eq!(cdr3.get(0), Some("TRA:CAVR;TRB:CASS"));
        assert_eq!(cdr3.get(2), Some("TRB:CSAR"));
        assert_eq!(cdr3.get(1), None);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let dir = vdj_dir("barcode,raw_clonotype_id\nc1,clonotype2\nc1,clonotype1\nc3,None\n");
        let calls = read_clonotypes(dir.path()).unwrap();
        assert_eq!(calls["c1"].clonotype_id, "clonotype2");
        assert!(!calls.contains_key("c3"));

        // a leading line without a clonotype leaves the barcode uncalled
        let dir = vdj_dir("barcode,raw_clonotype_id\nc1,None\nc1,clonotype1\nc2,\nc2,clonotype2\n");
        let calls = read_clonotypes(dir.path()).unwrap();
        assert!(calls.is_empty());
        let s = add_clonotype(&toy_session(), dir.path(), "").unwrap();
        assert!(s.metadata.factor("clonotype_id").unwrap().iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_prefixed_join() {
        let dir = vdj_dir("barcode,raw_clonotype_id\nc0,clonotype1\n");
        let calls = prefix_barcodes(read_clonotypes(dir.path()).unwrap(), "s1");
        assert_eq!(calls.keys().collect::<Vec<_>>(), vec!["s1_c0"]);
        assert_eq!(calls["s1_c0"].cdr3s_aa.as_deref(), Some("TRA:CAVR;TRB:CASS"));
    }

    #[test]
    fn test_missing_files_and_columns() {
        let empty = tempfile::tempdir().unwrap();
        assert!(add_clonotype(&toy_session(), empty.path(), "").is_err());
        let dir = vdj_dir("cell,clonotype\nc0,clonotype1\n");
        assert!(read_clonotypes(dir.path()).is_err());
    }
}
