use anyhow::{format_err, Error};
use serde::{self, Deserialize, Serialize};
use std::collections::BTreeMap;

/// A categorical column: an ordered set of level labels plus one optional
/// level code per cell. `None` is a missing value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Factor {
    pub levels: Vec<String>,
    #[serde(deserialize_with = "default_if_empty")]
    pub codes: Vec<Option<u32>>,
}

impl Factor {
    pub fn new(levels: Vec<String>, codes: Vec<Option<u32>>) -> Result<Factor, Error> {
        if let Some(bad) = codes.iter().flatten().find(|&&c| c as usize >= levels.len()) {
            return Err(format_err!("level code {} out of range for {} levels", bad, levels.len()));
        }
        Ok(Factor { levels, codes })
    }

    /// Build a factor from raw values, with levels in order of first appearance.
    pub fn from_values<I, S>(values: I) -> Factor
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut lookup = BTreeMap::<String, u32>::new();
        let mut levels = Vec::new();
        let codes = values
            .into_iter()
            .map(|v| {
                v.map(|v| {
                    let v = v.as_ref();
                    *lookup.entry(v.to_string()).or_insert_with(|| {
                        levels.push(v.to_string());
                        (levels.len() - 1) as u32
                    })
                })
            })
            .collect();
        Factor { levels, codes }
    }

    /// Build a factor with levels sorted so that integer-like labels order numerically.
    pub fn from_values_sorted<I, S>(values: I) -> Factor
    where
        I: IntoIterator<Item = Option<S>>,
        S: AsRef<str>,
    {
        let mut f = Factor::from_values(values);
        let mut order = (0..f.levels.len()).collect::<Vec<_>>();
        order.sort_by(|&a, &b| level_order(&f.levels[a], &f.levels[b]));
        f.reorder_levels(&order);
        f
    }

    /// Constant factor of length `n` with a single level.
    pub fn constant(level: &str, n: usize) -> Factor {
        Factor {
            levels: vec![level.to_string()],
            codes: vec![Some(0); n],
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// Label of cell `i`, or None if missing.
    pub fn get(&self, i: usize) -> Option<&str> {
        self.codes[i].map(|c| self.levels[c as usize].as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Get the code of a level string. Returns None if the level is not found.
    pub fn level_code(&self, level: &str) -> Option<u32> {
        self.levels.iter().position(|x| x == level).map(|v| v as u32)
    }

    /// Cells carrying `level`, in cell order. Empty if the level doesn't exist.
    pub fn indices_of(&self, level: &str) -> Vec<usize> {
        match self.level_code(level) {
            Some(code) => self
                .codes
                .iter()
                .enumerate()
                .filter_map(|(i, &c)| (c == Some(code)).then_some(i))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of cells per level, in level order.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.levels.len()];
        for c in self.codes.iter().flatten() {
            counts[*c as usize] += 1;
        }
        counts
    }

    /// Subset to the given cells. Unused levels are kept.
    pub fn select(&self, cells: &[usize]) -> Factor {
        Factor {
            levels: self.levels.clone(),
            codes: cells.iter().map(|&i| self.codes[i]).collect(),
        }
    }

    /// Drop levels that no cell carries.
    pub fn drop_unused_levels(&mut self) {
        let counts = self.counts();
        let keep = (0..self.levels.len()).filter(|&l| counts[l] > 0).collect::<Vec<_>>();
        self.reorder_levels(&keep);
    }

    /// Rearrange levels: new level `j` is old level `order[j]`. Cells whose level is not
    /// in `order` become missing.
    pub fn reorder_levels(&mut self, order: &[usize]) {
        let mut remap = vec![None; self.levels.len()];
        for (new, &old) in order.iter().enumerate() {
            remap[old] = Some(new as u32);
        }
        self.levels = order.iter().map(|&old| self.levels[old].clone()).collect();
        for c in self.codes.iter_mut() {
            *c = c.and_then(|old| remap[old as usize]);
        }
    }

    /// Concatenate factors, merging their level sets in order of first appearance.
    pub fn concat<'a>(parts: impl IntoIterator<Item = &'a Factor>) -> Factor {
        Factor::from_values(parts.into_iter().flat_map(Factor::iter))
    }
}

fn level_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

pub fn default_if_empty<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: serde::Deserialize<'de> + Default,
{
    Option::<T>::deserialize(de).map(std::option::Option::unwrap_or_default)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_values() {
        let f = Factor::from_values(vec![Some("b"), None, Some("a"), Some("b")]);
        assert_eq!(f.levels, vec!["b", "a"]);
        assert_eq!(f.codes, vec![Some(0), None, Some(1), Some(0)]);
        assert_eq!(f.get(2), Some("a"));
        assert_eq!(f.get(1), None);
        assert_eq!(f.indices_of("b"), vec![0, 3]);
        assert_eq!(f.counts(), vec![2, 1]);
    }

    #[test]
    fn test_sorted_levels() {
        let f = Factor::from_values_sorted(vec![Some("10"), Some("2"), Some("x"), Some("0")]);
        assert_eq!(f.levels, vec!["0", "2", "10", "x"]);
        assert_eq!(f.get(0), Some("10"));
        assert_eq!(f.get(2), Some("x"));
    }

    #[test]
    fn test_select_and_drop() {
        let f = Factor::from_values(vec![Some("a"), Some("b"), Some("c"), Some("a")]);
        let mut s = f.select(&[0, 3, 2]);
        assert_eq!(s.levels.len(), 3);
        s.drop_unused_levels();
        assert_eq!(s.levels, vec!["a", "c"]);
        assert_eq!(s.iter().collect::<Vec<_>>(), vec![Some("a"), Some("a"), Some("c")]);
    }

    #[test]
    fn test_concat() {
        let a = Factor::from_values(vec![Some("x"), Some("y")]);
        let b = Factor::from_values(vec![Some("z"), None, Some("x")]);
        let c = Factor::concat([&a, &b]);
        assert_eq!(c.levels, vec!["x", "y", "z"]);
        assert_eq!(c.len(), 5);
        assert_eq!(c.get(4), Some("x"));
        assert_eq!(c.get(3), None);
    }

    #[test]
    fn test_bad_code() {
        assert!(Factor::new(vec!["a".into()], vec![Some(1)]).is_err());
    }
}
