//! Failures that callers are expected to match on. Everything else travels as
//! `anyhow::Error` with context attached at the stage boundary.

use thiserror::Error;

/// Typed analysis failures.
#[derive(Debug, Error, PartialEq)]
pub enum AnalysisError {
    /// QC thresholds removed every cell.
    #[error("no cells pass QC (min_features={min_features}, max_features={max_features}, percent_mt={percent_mt})")]
    NoCellsPassQc {
        /// lower bound on detected features
        min_features: usize,
        /// upper bound on detected features
        max_features: usize,
        /// upper bound on mitochondrial percentage
        percent_mt: f64,
    },

    /// Gene filtering removed every gene.
    #[error("no genes are detected in at least {0} cells")]
    NoGenesPassQc(usize),

    /// A requested number of dimensions exceeds what the data provides.
    #[error("requested {requested} dimensions but only {available} are available")]
    TooManyDimensions {
        /// dimensions asked for
        requested: usize,
        /// dimensions computed
        available: usize,
    },

    /// Clustering resolution outside [0, 3].
    #[error("clustering resolution {0} is outside [0, 3]")]
    InvalidResolution(f64),

    /// Integration was requested with fewer than two samples.
    #[error("integration requires at least two samples, got {0}")]
    TooFewSamples(usize),

    /// No mutual nearest neighbours between two samples.
    #[error("no anchors found between samples '{0}' and '{1}'")]
    NoAnchors(String, String),

    /// A subset predicate selected nothing.
    #[error("no cells have '{column}' in {values:?}")]
    EmptySubset {
        /// metadata column tested
        column: String,
        /// accepted values
        values: Vec<String>,
    },

    /// A gene is not present where it was looked up.
    #[error("gene '{0}' not found")]
    GeneNotFound(String),

    /// Marker genes missing from the species gene database.
    #[error("marker genes not found in the {species} gene database: {genes:?}")]
    UnknownMarkerGenes {
        /// species name
        species: String,
        /// offending symbols
        genes: Vec<String>,
    },

    /// A species string other than human or mouse.
    #[error("unrecognized species '{0}', expected human or mouse")]
    UnknownSpecies(String),

    /// A `subtype of` line names a type not defined in the marker file.
    #[error("cell type '{child}' is a subtype of '{parent}', which is not defined")]
    UndefinedParent {
        /// the subtype
        child: String,
        /// the missing parent
        parent: String,
    },

    /// No genes passed the ordering-gene filter.
    #[error("no ordering genes (mean >= {min_mean} and dispersion >= {dispersion_ratio} x fit)")]
    NoOrderingGenes {
        /// mean expression floor
        min_mean: f64,
        /// multiple of fitted dispersion
        dispersion_ratio: f64,
    },
}
