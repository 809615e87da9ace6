//! Conditions that stop a run.
//!
//! Malformed lines and rows without a code or patient id are not errors - they are skipped where
//! they are found. Everything here aborts the run, and reaches the caller wrapped in an
//! `anyhow::Error` so it can be recovered with `downcast_ref`.
use crate::ArcStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    /// An admitted event refers to a patient with no demographics row.
    #[error("missing patient: no demographics found for patient \"{patient_id}\"")]
    MissingPatient { patient_id: ArcStr },
    #[error("line {line}: could not parse date \"{value}\" (expected YYYY-MM-DD)")]
    InvalidDate { value: String, line: usize },
    #[error("line {line}: could not parse value \"{value}\" as a number")]
    InvalidValue { value: String, line: usize },
    /// Only raised when strict patient ordering is switched on.
    #[error("events for patient \"{patient_id}\" are not contiguous in the journal")]
    PatientOutOfOrder { patient_id: ArcStr },
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    InvalidConfig(Vec<String>),
}
