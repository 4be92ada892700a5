use crate::factor::Factor;
use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

/// One annotation column of the cell table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Column {
    /// Labels such as sample, cluster or phase.
    Categorical(Factor),
    /// Numbers such as QC metrics or scores. `None` is missing.
    Numeric(Vec<Option<f64>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Column::Categorical(f) => f.len(),
            Column::Numeric(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, cells: &[usize]) -> Column {
        match self {
            Column::Categorical(f) => Column::Categorical(f.select(cells)),
            Column::Numeric(v) => Column::Numeric(cells.iter().map(|&i| v[i]).collect()),
        }
    }

    /// Cell value rendered as text; numbers use their shortest representation.
    pub fn display(&self, i: usize) -> Option<String> {
        match self {
            Column::Categorical(f) => f.get(i).map(str::to_string),
            Column::Numeric(v) => v[i].map(|x| x.to_string()),
        }
    }

    /// The column as a factor. Numeric columns are converted through their text form.
    pub fn to_factor(&self) -> Factor {
        match self {
            Column::Categorical(f) => f.clone(),
            Column::Numeric(_) => Factor::from_values_sorted((0..self.len()).map(|i| self.display(i))),
        }
    }
}

/// Per-cell annotations. Row `i` describes cell `i` of the paired expression matrix.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CellMetadata {
    pub barcodes: Vec<String>,
    columns: Vec<(String, Column)>,
}

impl CellMetadata {
    pub fn new(barcodes: Vec<String>) -> CellMetadata {
        CellMetadata {
            barcodes,
            columns: Vec::new(),
        }
    }

    pub fn num_cells(&self) -> usize {
        self.barcodes.len()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.columns.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Look up a categorical column, erroring if absent or numeric.
    pub fn factor(&self, name: &str) -> Result<&Factor, Error> {
        match self.get(name) {
            Some(Column::Categorical(f)) => Ok(f),
            Some(Column::Numeric(_)) => Err(format_err!("metadata column '{}' is not categorical", name)),
            None => Err(format_err!("metadata column '{}' not found", name)),
        }
    }

    /// Look up a numeric column, erroring if absent or categorical.
    pub fn numeric(&self, name: &str) -> Result<&[Option<f64>], Error> {
        match self.get(name) {
            Some(Column::Numeric(v)) => Ok(v),
            Some(Column::Categorical(_)) => Err(format_err!("metadata column '{}' is not numeric", name)),
            None => Err(format_err!("metadata column '{}' not found", name)),
        }
    }

    /// Add or replace a column. Its length must match the number of cells.
    pub fn insert(&mut self, name: impl Into<String>, column: Column) -> Result<(), Error> {
        let name = name.into();
        if column.len() != self.num_cells() {
            bail!(
                "column '{}' has {} values for {} cells",
                name,
                column.len(),
                self.num_cells()
            );
        }
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, c)) => *c = column,
            None => self.columns.push((name, column)),
        }
        Ok(())
    }

    /// Builder form of [`CellMetadata::insert`].
    pub fn with_column(mut self, name: impl Into<String>, column: Column) -> Result<CellMetadata, Error> {
        self.insert(name, column)?;
        Ok(self)
    }

    pub fn remove(&mut self, name: &str) -> Option<Column> {
        let pos = self.columns.iter().position(|(n, _)| n == name)?;
        Some(self.columns.remove(pos).1)
    }

    /// Keep the given cells, in the given order, across every column.
    pub fn select(&self, cells: &[usize]) -> CellMetadata {
        CellMetadata {
            barcodes: cells.iter().map(|&i| self.barcodes[i].clone()).collect(),
            columns: self
                .columns
                .iter()
                .map(|(n, c)| (n.clone(), c.select(cells)))
                .collect(),
        }
    }

    /// Stack tables row-wise. Columns missing from a part are filled with missing values.
    pub fn concat(parts: &[&CellMetadata]) -> Result<CellMetadata, Error> {
        let mut names: Vec<String> = Vec::new();
        for p in parts {
            for n in p.column_names() {
                if !names.iter().any(|x| x == n) {
                    names.push(n.to_string());
                }
            }
        }
        let barcodes = parts.iter().flat_map(|p| p.barcodes.iter().cloned()).collect();
        let mut out = CellMetadata::new(barcodes);
        for name in names {
            let numeric = parts
                .iter()
                .filter_map(|p| p.get(&name))
                .all(|c| matches!(c, Column::Numeric(_)));
            let column = if numeric {
                let mut v = Vec::with_capacity(out.num_cells());
                for p in parts {
                    match p.get(&name) {
                        Some(Column::Numeric(x)) => v.extend_from_slice(x),
                        _ => v.extend(std::iter::repeat(None).take(p.num_cells())),
                    }
                }
                Column::Numeric(v)
            } else {
                let mut labels = Vec::with_capacity(out.num_cells());
                for p in parts {
                    match p.get(&name) {
                        Some(c) => labels.extend((0..p.num_cells()).map(|i| c.display(i))),
                        None => labels.extend(std::iter::repeat(None).take(p.num_cells())),
                    }
                }
                Column::Categorical(Factor::from_values(labels))
            };
            out.insert(name, column)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> CellMetadata {
        CellMetadata::new(vec!["a".into(), "b".into(), "c".into()])
            .with_column("n", Column::Numeric(vec![Some(1.0), None, Some(3.0)]))
            .unwrap()
            .with_column(
                "s",
                Column::Categorical(Factor::from_values(vec![Some("x"), Some("y"), Some("x")])),
            )
            .unwrap()
    }

    #[test]
    fn test_insert_length() {
        let mut t = table();
        assert!(t.insert("bad", Column::Numeric(vec![Some(1.0)])).is_err());
        t.insert("n", Column::Numeric(vec![None, None, None])).unwrap();
        assert_eq!(t.numeric("n").unwrap(), &[None, None, None]);
        assert_eq!(t.column_names().count(), 2);
    }

    #[test]
    fn test_select_keeps_rows_aligned() {
        let t = table().select(&[2, 0]);
        assert_eq!(t.barcodes, vec!["c", "a"]);
        assert_eq!(t.numeric("n").unwrap(), &[Some(3.0), Some(1.0)]);
        assert_eq!(t.factor("s").unwrap().get(1), Some("x"));
        assert!(t.factor("n").is_err());
        assert!(t.numeric("missing").is_err());
    }

    #[test]
    fn test_concat_fills_missing() {
        let a = table();
        let b = CellMetadata::new(vec!["d".into()])
            .with_column("s", Column::Categorical(Factor::constant("z", 1)))
            .unwrap();
        let c = CellMetadata::concat(&[&a, &b]).unwrap();
        assert_eq!(c.num_cells(), 4);
        assert_eq!(c.numeric("n").unwrap()[3], None);
        assert_eq!(c.factor("s").unwrap().get(3), Some("z"));
    }
}
