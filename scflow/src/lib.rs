//! # scflow: single-cell RNA-seq analysis workflows
//!
//! Stages take an immutable [`session::Session`] and return a new one: QC, normalization and
//! clustering, batch integration, PHATE, trajectories, marker classification, cell-cycle
//! scoring, clonotype joins and summary tables.

#![deny(missing_docs)]

#[allow(unused_extern_crates)]
extern crate blas_src;

pub mod aggregate;

/// Cell-cycle phase scoring
pub mod cell_cycle;

pub mod classify;

pub mod clonotype;

/// Graph-based clustering
pub mod cluster;

pub mod config;

pub mod differential;

/// Dimensionality reduction methods
pub mod dim_red;

pub mod error;

/// Variable feature selection
pub mod features;

pub mod integrate;

pub mod markers;

/// MTX loading routine
pub mod mtx;

/// Nearest-neighbor search
pub mod nn;

/// Count matrix normalization methods
pub mod normalization;

/// PHATE embedding and MAGIC imputation
pub mod phate;

pub mod plot;

pub mod qc;

pub mod reduce;

pub mod session;

pub mod stats;

pub mod tables;

/// Pseudotime and trajectory inference
pub mod trajectory;
