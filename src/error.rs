//! Analysis error types.

use serde::Serialize;
use thiserror::Error;

use crate::models::Horizon;

/// Errors surfaced by the retention analysis engine.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum AnalysisError {
    /// The dataset holds no records
    #[error("dataset is empty")]
    EmptyDataset,

    /// Control and treatment name the same arm
    #[error("control and treatment both name arm `{label}`")]
    IdenticalArms { label: String },

    /// Neither requested arm appears in the dataset
    #[error("neither arm `{control}` nor arm `{treatment}` appears in the dataset")]
    UnknownArmLabel { control: String, treatment: String },

    /// A row or column of the contingency table sums to zero
    #[error("insufficient data to compute significance for {horizon} retention")]
    InsufficientData { horizon: Horizon },

    /// An expected cell count fell below the configured validity threshold
    #[error(
        "expected cell count {min_expected:.2} for {horizon} retention is below the threshold {threshold}"
    )]
    LowExpectedCount {
        horizon: Horizon,
        min_expected: f64,
        threshold: f64,
    },

    /// The reference distribution could not be constructed
    #[error("distribution error: {0}")]
    Distribution(String),
}

/// Result type for analysis operations.
pub type Result<T> = std::result::Result<T, AnalysisError>;
