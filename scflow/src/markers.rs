//! Hierarchical marker specifications and the flat marker-file format.
//!
//! ```text
//! >T cells
//! expressed: CD3D, CD3E
//!
//! >CD4 T cells
//! expressed: CD4
//! subtype of: T cells
//! ```

use crate::error::AnalysisError;
use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// One cell type of a [`MarkerSpec`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellTypeMarkers {
    /// cell type name
    pub name: String,
    /// expressed marker symbols
    pub expressed: Vec<String>,
    /// parent type for subtypes
    pub parent: Option<String>,
}

/// Ordered cell types with their markers. Every parent names a type in the same spec.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MarkerSpec {
    types: Vec<CellTypeMarkers>,
}

impl<'de> Deserialize<'de> for MarkerSpec {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            types: Vec<CellTypeMarkers>,
        }
        let raw = Raw::deserialize(de)?;
        MarkerSpec::new(raw.types).map_err(serde::de::Error::custom)
    }
}

impl MarkerSpec {
    /// Validate names and parent references.
    pub fn new(types: Vec<CellTypeMarkers>) -> Result<MarkerSpec, Error> {
        let mut names = HashSet::new();
        for t in &types {
            if t.name.trim().is_empty() {
                bail!("cell type with an empty name");
            }
            if t.expressed.is_empty() {
                bail!("cell type '{}' has no expressed markers", t.name);
            }
            if !names.insert(t.name.as_str()) {
                bail!("cell type '{}' is defined twice", t.name);
            }
        }
        for t in &types {
            if let Some(parent) = &t.parent {
                if parent == &t.name || !names.contains(parent.as_str()) {
                    return Err(AnalysisError::UndefinedParent {
                        child: t.name.clone(),
                        parent: parent.clone(),
                    }
                    .into());
                }
            }
        }
        let spec = MarkerSpec { types };
        for t in &spec.types {
            // walking up from any type must reach a root
            let mut seen = HashSet::new();
            let mut cur = t;
            while let Some(p) = &cur.parent {
                if !seen.insert(p.as_str()) {
                    bail!("cell type hierarchy has a cycle through '{}'", p);
                }
                cur = spec.get(p).context("parent vanished")?;
            }
        }
        Ok(spec)
    }

    /// Types in definition order.
    pub fn types(&self) -> &[CellTypeMarkers] {
        &self.types
    }

    /// Look up a type by name.
    pub fn get(&self, name: &str) -> Option<&CellTypeMarkers> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Direct children of `parent`, or the top-level types when `None`.
    pub fn children(&self, parent: Option<&str>) -> Vec<&CellTypeMarkers> {
        self.types.iter().filter(|t| t.parent.as_deref() == parent).collect()
    }

    /// Every marker symbol, sorted and deduplicated.
    pub fn genes(&self) -> Vec<String> {
        self.types
            .iter()
            .flat_map(|t| t.expressed.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Render in the marker-file format.
    pub fn to_marker_file(&self) -> String {
        self.types
            .iter()
            .map(|t| {
                let mut rec = format!(">{}\nexpressed: {}\n", t.name, t.expressed.join(", "));
                if let Some(p) = &t.parent {
                    rec.push_str(&format!("subtype of: {}\n", p));
                }
                rec
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl FromStr for MarkerSpec {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self, Error> {
        let mut types: Vec<CellTypeMarkers> = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('>') {
                types.push(CellTypeMarkers {
                    name: name.trim().to_string(),
                    expressed: Vec::new(),
                    parent: None,
                });
                continue;
            }
            let Some(current) = types.last_mut() else {
                bail!("line {}: '{}' appears before any '>' cell type", n + 1, line);
            };
            let (key, value) = line
                .split_once(':')
                .with_context(|| format!("line {}: expected 'key: value', got '{}'", n + 1, line))?;
            match key.trim() {
                "expressed" => current.expressed.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string),
                ),
                "subtype of" => current.parent = Some(value.trim().to_string()),
                other => bail!("line {}: unsupported marker attribute '{}'", n + 1, other),
            }
        }
        MarkerSpec::new(types)
    }
}

/// Write `spec` to `path` in the marker-file format.
pub fn write_garnett(spec: &MarkerSpec, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    fs::write(path, spec.to_marker_file()).with_context(|| format!("writing marker file {}", path.display()))
}

/// Read a marker file.
pub fn parse_marker_file(path: impl AsRef<Path>) -> Result<MarkerSpec, Error> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading marker file {}", path.display()))?;
    text.parse().with_context(|| format!("parsing marker file {}", path.display()))
}

/// Organism whose gene symbols are used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Species {
    /// Homo sapiens
    Human,
    /// Mus musculus
    Mouse,
}

impl FromStr for Species {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "org.hs.eg.db" => Ok(Species::Human),
            "mouse" | "org.mm.eg.db" => Ok(Species::Mouse),
            _ => Err(AnalysisError::UnknownSpecies(s.to_string())),
        }
    }
}

impl TryFrom<String> for Species {
    type Error = AnalysisError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Species> for String {
    fn from(s: Species) -> String {
        s.to_string()
    }
}

impl std::fmt::Display for Species {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Species::Human => "human",
            Species::Mouse => "mouse",
        })
    }
}

/// Valid gene symbols of one species.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneDatabase {
    /// organism
    pub species: Species,
    symbols: HashSet<String>,
}

impl GeneDatabase {
    /// Database from an iterator of symbols.
    pub fn new<I, S>(species: Species, symbols: I) -> GeneDatabase
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GeneDatabase {
            species,
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }

    /// Load a one-symbol-per-line file. Blank lines and `#` comments are skipped.
    pub fn from_file(species: Species, path: impl AsRef<Path>) -> Result<GeneDatabase, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading gene database {}", path.display()))?;
        Ok(GeneDatabase::new(
            species,
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#')),
        ))
    }

    /// Whether `symbol` is known.
    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Number of symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// True when the database has no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Fail with every marker of `spec` the database does not know.
    pub fn check_markers(&self, spec: &MarkerSpec) -> Result<(), AnalysisError> {
        let missing = spec
            .genes()
            .into_iter()
            .filter(|g| !self.contains(g))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(AnalysisError::UnknownMarkerGenes {
                species: self.species.to_string(),
                genes: missing,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn immune_spec() -> MarkerSpec {
        MarkerSpec::new(vec![
            CellTypeMarkers {
                name: "T cells".into(),
                expressed: vec!["CD3D".into(), "CD3E".into()],
                parent: None,
            },
            CellTypeMarkers {
                name: "B cells".into(),
                expressed: vec!["MS4A1".into()],
                parent: None,
            },
            CellTypeMarkers {
                name: "CD4 T cells".into(),
                expressed: vec!["CD4".into()],
                parent: Some("T cells".into()),
            },
            CellTypeMarkers {
                name: "CD8 T cells".into(),
                expressed: vec!["CD8A".into()],
                parent: Some("T cells".into()),
            },
        ])
        .unwrap()
    }

    #[test]
    fn test_marker_file_round_trip() {
        let spec = immune_spec();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markers.txt");
        write_garnett(&spec, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with(">T cells\nexpressed: CD3D, CD3E\n\n>B cells"));
        assert!(text.contains(">CD8 T cells\nexpressed: CD8A\nsubtype of: T cells\n"));
        assert_eq!(parse_marker_file(&path).unwrap(), spec);
    }

    #[test]
    fn test_hierarchy() {
        let spec = immune_spec();
        let top = spec.children(None).iter().map(|t| t.name.as_str()).collect::<Vec<_>>();
        assert_eq!(top, vec!["T cells", "B cells"]);
        assert_eq!(spec.children(Some("T cells")).len(), 2);
        assert_eq!(spec.genes(), vec!["CD3D", "CD3E", "CD4", "CD8A", "MS4A1"]);
    }

    #[test]
    fn test_undefined_parent() {
        let err = ">NK cells\nexpressed: NKG7\nsubtype of: Lymphocytes\n"
            .parse::<MarkerSpec>()
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<AnalysisError>(),
            Some(&AnalysisError::UndefinedParent {
                child: "NK cells".into(),
                parent: "Lymphocytes".into()
            })
        );
        assert!("expressed: CD3D\n".parse::<MarkerSpec>().is_err());
        assert!(">A\nexpressed: X\n>A\nexpressed: Y\n".parse::<MarkerSpec>().is_err());
    }

    #[test]
    fn test_species() {
        assert_eq!("Human".parse::<Species>().unwrap(), Species::Human);
        assert_eq!("org.Mm.eg.db".parse::<Species>().unwrap(), Species::Mouse);
        assert_eq!(
            "zebrafish".parse::<Species>(),
            Err(AnalysisError::UnknownSpecies("zebrafish".into()))
        );
        assert!("hs".parse::<Species>().is_err());
        assert!("mm".parse::<Species>().is_err());
    }

    #[test]
    fn test_gene_database() {
        let spec = immune_spec();
        let db = GeneDatabase::new(Species::Human, ["CD3D", "CD3E", "CD4", "MS4A1"]);
        match db.check_markers(&spec) {
            Err(AnalysisError::UnknownMarkerGenes { species, genes }) => {
                assert_eq!(species, "human");
                assert_eq!(genes, vec!["CD8A"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genes.txt");
        std::fs::write(&path, "# symbols\nCD3D\nCD3E\n\nCD4\nCD8A\nMS4A1\n").unwrap();
        let db = GeneDatabase::from_file(Species::Human, &path).unwrap();
        assert_eq!(db.len(), 5);
        db.check_markers(&spec).unwrap();
    }
}
