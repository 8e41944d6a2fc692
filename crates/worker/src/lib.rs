//! Worker-side code for the MarketSight training pipeline: the contract that a training function
//! must satisfy, and a reference [LinearTrainer] that fits price data.

use std::path::Path;

use error_stack::Report;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod linear;
#[cfg(feature = "stats")]
pub mod stats;

pub use linear::{LinearModel, LinearTrainer};

/// The columns that every dataset must contain. The last one is the prediction target.
pub const REQUIRED_COLUMNS: [&str; 5] = ["open", "high", "low", "volume", "close"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrainingError {
    #[error("Dataset is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("Dataset contains invalid data")]
    InvalidData,
    #[error("Failed to read or write training files")]
    Io,
    #[error("Failed to fit the model")]
    Fit,
}

impl TrainingError {
    /// Return true if the failure was caused by the contents of the dataset, rather than by the
    /// environment or the fitting procedure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TrainingError::MissingColumns(_) | TrainingError::InvalidData
        )
    }
}

/// Information about a finished training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// The number of dataset rows used to fit the model.
    pub rows: usize,
    pub epochs: usize,
    /// The mean squared error, in scaled units, of the last epoch.
    pub final_loss: f64,
}

/// A function that turns a dataset into a model artifact.
///
/// Training is a long-running, CPU-bound call. Callers in an async context should run it with
/// [tokio::task::spawn_blocking].
pub trait Trainer: Send + Sync + 'static {
    /// The extension of the artifact files that this trainer writes, without the leading dot.
    fn artifact_extension(&self) -> &str;

    /// Read the dataset at `input`, fit a model, and write the model to `output`.
    fn train(&self, input: &Path, output: &Path) -> Result<TrainingSummary, Report<TrainingError>>;
}
