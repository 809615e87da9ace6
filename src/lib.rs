//! Turn a clinical journal export into flat, fixed-width datasets.
//!
//! The export is a pair of SQL dumps: a journal table with one row per patient/code association,
//! and a patient table with demographics. From these we produce several alternative encodings of
//! each patient's code history - over the whole history, per visit, and per year of age; as counts,
//! presence flags, or raw values; dense or sparse.
//!
//! The work is done in two passes over the journal. The first pass works out which codes and
//! patients make it into the output ([`catalog`], [`filter`]), which fixes the output columns. The
//! second pass aggregates each patient's events ([`aggregate`]) and writes their rows ([`output`])
//! before moving on to the next patient, so only one patient's history is ever held in memory.
//!
//! This relies on the journal listing each patient's events contiguously.
pub mod age;
pub mod aggregate;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod output;
pub mod patient;
pub mod pipeline;
pub mod sql;
mod util;

pub use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use std::{fmt, io, path::Path, sync::Arc};

pub use crate::{
    aggregate::{HistoryAggregator, PatientHistory},
    catalog::{Catalog, CatalogBuilder, Statistics},
    config::Config,
    error::DatasetError,
    event::Event,
    filter::Filters,
    output::DatasetWriter,
    patient::{Patient, Patients},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
/// Patient ids are kept as text: they are only ever compared and copied to the output.
pub type PatientId = ArcStr;

/// Sex is encoded 'M' or 'F' in our outputs.
///
/// Ordering is arbitrary.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize, Hash, Ord, PartialOrd)]
pub enum Sex {
    #[serde(rename = "M", alias = "m")]
    Male,
    #[serde(rename = "F", alias = "f")]
    Female,
}

impl Sex {
    /// The single-letter code used in the dataset files.
    pub fn code(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Sex::Male => f.write_str("Male"),
            Sex::Female => f.write_str("Female"),
        }
    }
}

pub fn file_exists(path: &Path) -> io::Result<bool> {
    util::path_exists(path)
}
