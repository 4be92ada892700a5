use anyhow::{bail, format_err, Context, Error};
use flate2::bufread::MultiGzDecoder;
use log::info;
use scflow_types::{CountMatrix, ExpressionMatrix};
use sprs::TriMat;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const MATRIX_FILES: &[&str] = &["matrix.mtx.gz", "matrix.mtx"];
const FEATURE_FILES: &[&str] = &["features.tsv.gz", "features.tsv", "genes.tsv.gz", "genes.tsv"];
const BARCODE_FILES: &[&str] = &["barcodes.tsv.gz", "barcodes.tsv"];

/// Open a file for line reading, decompressing when the name ends in `.gz`.
fn open_text(path: &Path) -> Result<Box<dyn BufRead>, Error> {
    let file = BufReader::new(File::open(path).with_context(|| path.display().to_string())?);
    if path.extension().is_some_and(|e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(file))
    }
}

fn find_file(dir: &Path, candidates: &[&str]) -> Result<PathBuf, Error> {
    candidates
        .iter()
        .map(|c| dir.join(c))
        .find(|p| p.is_file())
        .ok_or_else(|| format_err!("{} contains none of {:?}", dir.display(), candidates))
}

/// Load a genes x cells count matrix from MTX coordinate format, gzipped or plain.
pub fn load_mtx(path: impl AsRef<Path>) -> Result<CountMatrix, Error> {
    let path = path.as_ref();
    let mut reader = open_text(path)?;
    let mut line = String::new();
    let mut mat: Option<TriMat<u32>> = None;

    while reader.read_line(&mut line).with_context(|| path.display().to_string())? > 0 {
        if line.starts_with('%') || line.trim().is_empty() {
            line.clear();
            continue;
        }
        let mut data = line.split_whitespace();
        match mat.as_mut() {
            None => {
                let nrow = data.next().ok_or_else(|| format_err!("no NROW"))?.parse::<usize>()?;
                let ncol = data.next().ok_or_else(|| format_err!("no NCOL"))?.parse::<usize>()?;
                let nnz = data.next().ok_or_else(|| format_err!("no NNZ"))?.parse::<usize>()?;
                mat = Some(TriMat::with_capacity((nrow, ncol), nnz));
            }
            Some(m) => {
                let row = data.next().ok_or_else(|| format_err!("missing ROW"))?.parse::<usize>()?;
                let col = data.next().ok_or_else(|| format_err!("missing COL"))?.parse::<usize>()?;
                let val = data.next().ok_or_else(|| format_err!("missing VAL"))?.parse::<u32>()?;
                if row == 0 || col == 0 || row > m.rows() || col > m.cols() {
                    bail!("entry ({}, {}) outside {}x{} matrix", row, col, m.rows(), m.cols());
                }
                m.add_triplet(row - 1, col - 1, val);
            }
        }
        line.clear();
    }

    let Some(matrix) = mat else { bail!("no matrix found in {}", path.display()) };
    Ok(matrix.to_csc())
}

fn read_column(path: &Path, column: usize) -> Result<Vec<String>, Error> {
    let mut values = Vec::new();
    for line in open_text(path)?.lines() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let fields = line.split('\t').collect::<Vec<_>>();
        // genes.tsv from older pipelines may carry a single column
        let field = fields.get(column).or_else(|| fields.first()).copied().unwrap_or_default();
        values.push(field.to_string());
    }
    Ok(values)
}

/// Load a 10X `filtered_feature_bc_matrix`-style directory.
pub fn load_10x_dir(dir: impl AsRef<Path>, name: &str) -> Result<ExpressionMatrix, Error> {
    let dir = dir.as_ref();
    let matrix_path = find_file(dir, MATRIX_FILES)?;
    let features_path = find_file(dir, FEATURE_FILES)?;
    let barcodes_path = find_file(dir, BARCODE_FILES)?;

    let matrix = load_mtx(&matrix_path)?;
    let feature_ids = read_column(&features_path, 0)?;
    let feature_names = read_column(&features_path, 1)?;
    let barcodes = read_column(&barcodes_path, 0)?;
    info!(
        "loaded {} features x {} barcodes from {}",
        matrix.rows(),
        matrix.cols(),
        dir.display()
    );
    ExpressionMatrix::new(name, barcodes, feature_ids, feature_names, matrix)
        .with_context(|| format!("inconsistent 10X directory {}", dir.display()))
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    /// Write a small 10X directory. `counts[g][c]` is the count of gene g in cell c.
    pub(crate) fn write_10x_dir(dir: &Path, genes: &[&str], counts: &[Vec<u32>], gz: bool) {
        let ncells = counts[0].len();
        let mut mtx = String::from("%%MatrixMarket matrix coordinate integer general\n%\n");
        let nnz = counts.iter().flatten().filter(|&&v| v > 0).count();
        mtx.push_str(&format!("{} {} {}\n", genes.len(), ncells, nnz));
        for (g, row) in counts.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                if v > 0 {
                    mtx.push_str(&format!("{} {} {}\n", g + 1, c + 1, v));
                }
            }
        }
        let features = genes
            .iter()
            .map(|g| format!("ENSG_{g}\t{g}\tGene Expression\n"))
            .collect::<String>();
        let barcodes = (0..ncells).map(|c| format!("CELL{c}-1\n")).collect::<String>();
        for (name, body) in [("matrix.mtx", mtx), ("features.tsv", features), ("barcodes.tsv", barcodes)] {
            if gz {
                let f = File::create(dir.join(format!("{name}.gz"))).unwrap();
                let mut enc = GzEncoder::new(f, Compression::default());
                enc.write_all(body.as_bytes()).unwrap();
                enc.finish().unwrap();
            } else {
                std::fs::write(dir.join(name), body).unwrap();
            }
        }
    }

    #[test]
    fn test_load_plain_and_gz() {
        for gz in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            write_10x_dir(dir.path(), &["A", "B", "MT-1"], &[vec![1, 0], vec![0, 0], vec![4, 2]], gz);
            let m = load_10x_dir(dir.path(), "p").unwrap();
            assert_eq!(m.num_features(), 3);
            assert_eq!(m.num_cells(), 2);
            assert_eq!(m.feature_names, vec!["A", "B", "MT-1"]);
            assert_eq!(m.feature_ids[0], "ENSG_A");
            assert_eq!(m.barcodes, vec!["CELL0-1", "CELL1-1"]);
            assert_eq!(m.cell_totals(), vec![5, 2]);
        }
    }

    #[test]
    fn test_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_10x_dir(dir.path(), "p").unwrap_err();
        assert!(err.to_string().contains("matrix.mtx"));
    }

    #[test]
    fn test_out_of_range_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.mtx");
        std::fs::write(&path, "%%MatrixMarket\n2 2 1\n3 1 5\n").unwrap();
        assert!(load_mtx(&path).is_err());
    }
}
