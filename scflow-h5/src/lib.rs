//! HDF5 persistence for [`scflow::session::Session`].
//!
//! Layout of a session file:
//!
//! ```text
//! /matrix        name, barcodes, feature_ids, feature_names, shape, data, indices, indptr (CSC)
//! /metadata      names, kinds, and one group per column: levels + codes, or values
//! /data          optional normalized layer: method, shape, data, indices, indptr
//! /scale         optional scaled layer: features, values, regressed
//! /embeddings    one cells x k dataset per embedding
//! /active_ident  optional one-element string dataset
//! ```
//!
//! Missing categorical values are stored as code `-1`; missing numeric values as NaN.

#![deny(warnings)]

use anyhow::{bail, format_err, Context, Error};
use hdf5::types::VarLenUnicode;
use hdf5::Group;
use log::info;
use ndarray::{Array1, Array2};
use scflow::normalization::Normalization;
use scflow::session::{NormalizedData, ScaledData, Session};
use scflow_types::{CellMetadata, Column, ExpressionMatrix, Factor};
use sprs::CsMat;
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

const CATEGORICAL: &str = "categorical";
const NUMERIC: &str = "numeric";

fn to_unicode(values: &[String]) -> Result<Array1<VarLenUnicode>, Error> {
    values
        .iter()
        .map(|s| VarLenUnicode::from_str(s).map_err(|e| format_err!("cannot store '{}': {}", s, e)))
        .collect::<Result<Vec<_>, _>>()
        .map(Array1::from)
}

fn write_strings(group: &Group, name: &str, values: &[String]) -> Result<(), Error> {
    group.new_dataset_builder().with_data(&to_unicode(values)?).create(name)?;
    Ok(())
}

fn read_strings(group: &Group, name: &str) -> Result<Vec<String>, Error> {
    Ok(group
        .dataset(name)?
        .read_1d::<VarLenUnicode>()?
        .iter()
        .map(|s| s.as_str().to_string())
        .collect())
}

fn read_string(group: &Group, name: &str) -> Result<String, Error> {
    read_strings(group, name)?
        .pop()
        .ok_or_else(|| format_err!("dataset '{}' is empty", name))
}

fn write_csc<T: hdf5::H5Type + Clone>(group: &Group, m: &CsMat<T>) -> Result<(), Error> {
    let m = if m.is_csc() { m.clone() } else { m.to_csc() };
    let shape = Array1::from(vec![m.rows() as u64, m.cols() as u64]);
    let indices = m.indices().iter().map(|&i| i as u64).collect::<Array1<_>>();
    let indptr = m.indptr().raw_storage().iter().map(|&i| i as u64).collect::<Array1<_>>();
    let data = Array1::from(m.data().to_vec());
    group.new_dataset_builder().with_data(&shape).create("shape")?;
    group.new_dataset_builder().with_data(&data).create("data")?;
    group.new_dataset_builder().with_data(&indices).create("indices")?;
    group.new_dataset_builder().with_data(&indptr).create("indptr")?;
    Ok(())
}

fn read_csc<T: hdf5::H5Type + Clone>(group: &Group) -> Result<CsMat<T>, Error> {
    let shape = group.dataset("shape")?.read_1d::<u64>()?;
    if shape.len() != 2 {
        bail!("matrix shape has {} entries", shape.len());
    }
    let data = group.dataset("data")?.read_1d::<T>()?.to_vec();
    let indices = group.dataset("indices")?.read_1d::<u64>()?.iter().map(|&i| i as usize).collect();
    let indptr = group.dataset("indptr")?.read_1d::<u64>()?.iter().map(|&i| i as usize).collect();
    CsMat::try_new_csc((shape[0] as usize, shape[1] as usize), indptr, indices, data)
        .map_err(|(_, _, _, e)| format_err!("invalid sparse matrix: {}", e))
}

fn method_name(method: Normalization) -> &'static str {
    match method {
        Normalization::Sct => "sct",
        Normalization::LogNormalize => "lognormalize",
        Normalization::Sqrt => "sqrt",
    }
}

fn write_metadata(group: &Group, metadata: &CellMetadata) -> Result<(), Error> {
    write_strings(group, "barcodes", &metadata.barcodes)?;
    let mut names = Vec::new();
    let mut kinds = Vec::new();
    for (i, (name, column)) in metadata.columns().enumerate() {
        let g = group.create_group(&format!("col{i}"))?;
        names.push(name.to_string());
        match column {
            Column::Categorical(f) => {
                kinds.push(CATEGORICAL.to_string());
                write_strings(&g, "levels", &f.levels)?;
                let codes = f.codes.iter().map(|c| c.map_or(-1, i64::from)).collect::<Array1<_>>();
                g.new_dataset_builder().with_data(&codes).create("codes")?;
            }
            Column::Numeric(v) => {
                kinds.push(NUMERIC.to_string());
                let values = v.iter().map(|x| x.unwrap_or(f64::NAN)).collect::<Array1<_>>();
                g.new_dataset_builder().with_data(&values).create("values")?;
            }
        }
    }
    write_strings(group, "names", &names)?;
    write_strings(group, "kinds", &kinds)?;
    Ok(())
}

fn read_metadata(group: &Group) -> Result<CellMetadata, Error> {
    let mut metadata = CellMetadata::new(read_strings(group, "barcodes")?);
    let names = read_strings(group, "names")?;
    let kinds = read_strings(group, "kinds")?;
    for (i, (name, kind)) in names.iter().zip(&kinds).enumerate() {
        let g = group.group(&format!("col{i}"))?;
        let column = match kind.as_str() {
            CATEGORICAL => {
                let levels = read_strings(&g, "levels")?;
                let codes = g
                    .dataset("codes")?
                    .read_1d::<i64>()?
                    .iter()
                    .map(|&c| u32::try_from(c).ok())
                    .collect();
                Column::Categorical(Factor::new(levels, codes)?)
            }
            NUMERIC => Column::Numeric(
                g.dataset("values")?
                    .read_1d::<f64>()?
                    .iter()
                    .map(|&x| (!x.is_nan()).then_some(x))
                    .collect(),
            ),
            other => bail!("column '{}' has unknown kind '{}'", name, other),
        };
        metadata.insert(name.as_str(), column)?;
    }
    Ok(metadata)
}

/// Write every layer of `session` to a new HDF5 file at `path`, replacing any existing file.
pub fn write_session(session: &Session, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    session.validate()?;
    let file = hdf5::File::create(path).with_context(|| format!("creating {}", path.display()))?;

    let matrix = file.create_group("matrix")?;
    write_strings(&matrix, "name", &[session.counts.name.clone()])?;
    write_strings(&matrix, "barcodes", &session.counts.barcodes)?;
    write_strings(&matrix, "feature_ids", &session.counts.feature_ids)?;
    write_strings(&matrix, "feature_names", &session.counts.feature_names)?;
    write_csc(&matrix, &session.counts.matrix)?;

    write_metadata(&file.create_group("metadata")?, &session.metadata)?;

    if let Some(d) = &session.data {
        let g = file.create_group("data")?;
        write_strings(&g, "method", &[method_name(d.method).to_string()])?;
        write_csc(&g, &d.values)?;
    }
    if let Some(s) = &session.scale {
        let g = file.create_group("scale")?;
        write_strings(&g, "features", &s.features)?;
        write_strings(&g, "regressed", &s.regressed)?;
        g.new_dataset_builder().with_data(&s.values).create("values")?;
    }
    let emb = file.create_group("embeddings")?;
    for (name, e) in &session.embeddings {
        emb.new_dataset_builder().with_data(e).create(name.as_str())?;
    }
    if let Some(ident) = &session.active_ident {
        write_strings(&file, "active_ident", &[ident.clone()])?;
    }
    info!(
        "wrote {} cells, {} metadata columns, {} embeddings to {}",
        session.num_cells(),
        session.metadata.column_names().count(),
        session.embeddings.len(),
        path.display()
    );
    Ok(())
}

/// Read a session written by [`write_session`].
pub fn read_session(path: impl AsRef<Path>) -> Result<Session, Error> {
    let path = path.as_ref();
    let file = hdf5::File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let matrix = file.group("matrix")?;
    let counts = ExpressionMatrix::new(
        read_string(&matrix, "name")?,
        read_strings(&matrix, "barcodes")?,
        read_strings(&matrix, "feature_ids")?,
        read_strings(&matrix, "feature_names")?,
        read_csc::<u32>(&matrix)?,
    )?;
    let metadata = read_metadata(&file.group("metadata")?)?;

    let data = if file.link_exists("data") {
        let g = file.group("data")?;
        Some(NormalizedData {
            method: Normalization::from_str(&read_string(&g, "method")?)?,
            values: read_csc::<f64>(&g)?,
        })
    } else {
        None
    };
    let scale = if file.link_exists("scale") {
        let g = file.group("scale")?;
        Some(ScaledData {
            features: read_strings(&g, "features")?,
            values: g.dataset("values")?.read_2d::<f64>()?,
            regressed: read_strings(&g, "regressed")?,
        })
    } else {
        None
    };
    let mut embeddings = BTreeMap::new();
    let emb = file.group("embeddings")?;
    for name in emb.member_names()? {
        let e: Array2<f64> = emb.dataset(&name)?.read_2d::<f64>()?;
        embeddings.insert(name, e);
    }
    let active_ident = if file.link_exists("active_ident") {
        Some(read_string(&file, "active_ident")?)
    } else {
        None
    };

    let session = Session {
        counts,
        metadata,
        data,
        scale,
        embeddings,
        active_ident,
    };
    session.validate().with_context(|| format!("{} holds an inconsistent session", path.display()))?;
    info!("read {} cells from {}", session.num_cells(), path.display());
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use scflow::normalization::normalize;

    fn session() -> Session {
        let counts = array![[1u32, 0, 3, 0], [0, 2, 1, 0], [2, 5, 0, 7]];
        let m = ExpressionMatrix::from_dense(
            "toy",
            vec!["A".into(), "B".into(), "MT-C".into()],
            (0..4).map(|i| format!("c{i}")).collect(),
            counts.view(),
        )
        .unwrap();
        let mut s = normalize(&Session::new(m, "toy").unwrap(), Normalization::LogNormalize)
            .with_column(
                "grp",
                Column::Categorical(Factor::from_values(vec![Some("x"), None, Some("y"), Some("x")])),
            )
            .unwrap()
            .with_column("score", Column::Numeric(vec![Some(0.5), Some(-1.0), None, Some(2.0)]))
            .unwrap()
            .with_ident("grp")
            .unwrap();
        s.scale = Some(ScaledData {
            features: vec!["A".into(), "B".into()],
            values: array![[0.1, -0.2, 0.3, 0.4], [1.0, 0.0, -1.0, 0.0]],
            regressed: vec!["percent.mt".into()],
        });
        s.embeddings.insert("umap".into(), array![[0.0, 1.0], [1.0, 2.0], [2.0, 3.0], [3.0, 4.0]]);
        s
    }

    #[test]
    fn test_session_survives_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.h5");
        let s = session();
        write_session(&s, &path).unwrap();
        let back = read_session(&path).unwrap();

        assert_eq!(back.counts, s.counts);
        assert_eq!(back.metadata, s.metadata);
        assert_eq!(back.metadata.column_names().collect::<Vec<_>>(), vec!["orig.ident", "grp", "score"]);
        assert_eq!(back.metadata.factor("grp").unwrap().get(1), None);
        assert_eq!(back.metadata.numeric("score").unwrap()[2], None);
        assert_eq!(back.data, s.data);
        assert_eq!(back.scale, s.scale);
        assert_eq!(back.embeddings, s.embeddings);
        assert_eq!(back.active_ident.as_deref(), Some("grp"));
    }

    #[test]
    fn test_optional_layers_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.h5");
        let mut s = session();
        s.data = None;
        s.scale = None;
        s.embeddings.clear();
        s.active_ident = None;
        write_session(&s, &path).unwrap();
        let back = read_session(&path).unwrap();
        assert!(back.data.is_none() && back.scale.is_none());
        assert!(back.embeddings.is_empty());
        assert!(back.active_ident.is_none());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_session(dir.path().join("absent.h5")).is_err());
    }
}
