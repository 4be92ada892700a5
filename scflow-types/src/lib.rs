//! Shared container types for scflow: the gene x cell count matrix and
//! the per-cell annotation table that travels with it.

#![deny(warnings)]

pub mod factor;
pub mod matrix;
pub mod metadata;

pub use factor::Factor;
pub use matrix::{CountMatrix, ExpressionMatrix};
pub use metadata::{CellMetadata, Column};
