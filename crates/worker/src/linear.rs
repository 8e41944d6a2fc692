use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};

use crate::{Trainer, TrainingError, TrainingSummary, REQUIRED_COLUMNS};

const NUM_FEATURES: usize = REQUIRED_COLUMNS.len() - 1;
/// Added to the denominator of the min-max scaling so constant columns don't divide by zero.
const SCALE_EPSILON: f64 = 1e-7;

/// Fits a linear regression of `close` on `open`, `high`, `low`, and `volume` with full-batch
/// gradient descent over min-max scaled data.
#[derive(Debug, Clone)]
pub struct LinearTrainer {
    pub learning_rate: f64,
    pub epochs: usize,
}

impl Default for LinearTrainer {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            epochs: 100,
        }
    }
}

/// The artifact written by [LinearTrainer].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    pub features: Vec<String>,
    pub target: String,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub feature_min: Vec<f64>,
    pub feature_max: Vec<f64>,
    pub target_min: f64,
    pub target_max: f64,
    pub epochs: usize,
    pub final_loss: f64,
}

impl LinearModel {
    /// Load a model artifact from disk.
    pub fn load(path: &Path) -> Result<Self, Report<TrainingError>> {
        let file = File::open(path)
            .change_context(TrainingError::Io)
            .attach_printable_lazy(|| format!("Opening model {}", path.display()))?;
        let model: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .change_context(TrainingError::InvalidData)
            .attach_printable("Parsing model")?;

        let num_features = model.features.len();
        if [&model.weights, &model.feature_min, &model.feature_max]
            .iter()
            .any(|values| values.len() != num_features)
        {
            return Err(Report::new(TrainingError::InvalidData)).attach_printable_lazy(|| {
                format!(
                    "Model has {num_features} features but {} weights and {}/{} bounds",
                    model.weights.len(),
                    model.feature_min.len(),
                    model.feature_max.len()
                )
            });
        }

        Ok(model)
    }

    /// Predict the closing price from unscaled `open`, `high`, `low`, and `volume` values.
    pub fn predict(&self, features: &[f64]) -> f64 {
        let scaled = features
            .iter()
            .zip(&self.weights)
            .zip(self.feature_min.iter().zip(&self.feature_max))
            .map(|((value, weight), (min, max))| scale(*value, *min, *max) * weight)
            .sum::<f64>()
            + self.bias;

        scaled * (self.target_max - self.target_min + SCALE_EPSILON) + self.target_min
    }
}

struct Dataset {
    features: Vec<[f64; NUM_FEATURES]>,
    targets: Vec<f64>,
}

fn scale(value: f64, min: f64, max: f64) -> f64 {
    (value - min) / (max - min + SCALE_EPSILON)
}

fn read_dataset(path: &Path) -> Result<Dataset, Report<TrainingError>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .change_context(TrainingError::Io)
        .attach_printable_lazy(|| format!("Opening dataset {}", path.display()))?;

    let headers = reader
        .headers()
        .change_context(TrainingError::InvalidData)
        .attach_printable("Reading dataset header")?
        .clone();

    let mut columns = [0usize; REQUIRED_COLUMNS.len()];
    let mut missing = Vec::new();
    for (slot, name) in REQUIRED_COLUMNS.iter().enumerate() {
        match headers.iter().position(|header| header == *name) {
            Some(index) => columns[slot] = index,
            None => missing.push(name.to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(Report::new(TrainingError::MissingColumns(missing)));
    }

    let mut features = Vec::new();
    let mut targets = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record
            .change_context(TrainingError::InvalidData)
            .attach_printable_lazy(|| format!("Reading row {}", row + 1))?;

        let mut values = [0.0; REQUIRED_COLUMNS.len()];
        for (slot, column) in columns.iter().enumerate() {
            let cell = record.get(*column).unwrap_or_default();
            let value = cell
                .parse::<f64>()
                .change_context(TrainingError::InvalidData)
                .attach_printable_lazy(|| {
                    format!(
                        "Row {} column {}: {cell:?} is not a number",
                        row + 1,
                        REQUIRED_COLUMNS[slot]
                    )
                })?;

            if !value.is_finite() {
                return Err(Report::new(TrainingError::InvalidData)).attach_printable(format!(
                    "Row {} column {} is not finite",
                    row + 1,
                    REQUIRED_COLUMNS[slot]
                ));
            }

            values[slot] = value;
        }

        let mut row_features = [0.0; NUM_FEATURES];
        row_features.copy_from_slice(&values[..NUM_FEATURES]);
        features.push(row_features);
        targets.push(values[NUM_FEATURES]);
    }

    if targets.is_empty() {
        return Err(Report::new(TrainingError::InvalidData))
            .attach_printable("Dataset has no rows");
    }

    Ok(Dataset { features, targets })
}

fn bounds(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values.fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), v| {
        (min.min(v), max.max(v))
    })
}

impl LinearTrainer {
    fn fit(&self, dataset: &Dataset) -> Result<LinearModel, Report<TrainingError>> {
        let n = dataset.targets.len() as f64;

        let mut feature_min = vec![0.0; NUM_FEATURES];
        let mut feature_max = vec![0.0; NUM_FEATURES];
        for i in 0..NUM_FEATURES {
            let (min, max) = bounds(dataset.features.iter().map(|row| row[i]));
            feature_min[i] = min;
            feature_max[i] = max;
        }
        let (target_min, target_max) = bounds(dataset.targets.iter().copied());

        let x = dataset
            .features
            .iter()
            .map(|row| {
                let mut scaled = [0.0; NUM_FEATURES];
                for i in 0..NUM_FEATURES {
                    scaled[i] = scale(row[i], feature_min[i], feature_max[i]);
                }
                scaled
            })
            .collect::<Vec<_>>();
        let y = dataset
            .targets
            .iter()
            .map(|t| scale(*t, target_min, target_max))
            .collect::<Vec<_>>();

        let mut weights = [0.0; NUM_FEATURES];
        let mut bias = 0.0;
        let mut loss = f64::NAN;

        for epoch in 0..self.epochs {
            let mut grad_w = [0.0; NUM_FEATURES];
            let mut grad_b = 0.0;
            let mut total_sq = 0.0;

            for (row, target) in x.iter().zip(y.iter()) {
                let prediction = row
                    .iter()
                    .zip(weights.iter())
                    .map(|(v, w)| v * w)
                    .sum::<f64>()
                    + bias;
                let err = prediction - target;
                total_sq += err * err;
                for i in 0..NUM_FEATURES {
                    grad_w[i] += err * row[i];
                }
                grad_b += err;
            }

            loss = total_sq / n;
            if !loss.is_finite() {
                return Err(Report::new(TrainingError::Fit))
                    .attach_printable(format!("Loss diverged at epoch {}", epoch + 1));
            }

            for i in 0..NUM_FEATURES {
                weights[i] -= self.learning_rate * 2.0 * grad_w[i] / n;
            }
            bias -= self.learning_rate * 2.0 * grad_b / n;

            #[cfg(feature = "tracing")]
            if (epoch + 1) % 20 == 0 {
                tracing::debug!(epoch = epoch + 1, epochs = self.epochs, loss, "Training");
            }
        }

        Ok(LinearModel {
            features: REQUIRED_COLUMNS[..NUM_FEATURES]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            target: REQUIRED_COLUMNS[NUM_FEATURES].to_string(),
            weights: weights.to_vec(),
            bias,
            feature_min,
            feature_max,
            target_min,
            target_max,
            epochs: self.epochs,
            final_loss: loss,
        })
    }
}

impl Trainer for LinearTrainer {
    fn artifact_extension(&self) -> &str {
        "json"
    }

    fn train(
        &self,
        input: &Path,
        output: &Path,
    ) -> Result<TrainingSummary, Report<TrainingError>> {
        let dataset = read_dataset(input)?;
        let model = self.fit(&dataset)?;

        let file = File::create(output)
            .change_context(TrainingError::Io)
            .attach_printable_lazy(|| format!("Creating model file {}", output.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &model)
            .change_context(TrainingError::Io)
            .attach_printable("Writing model")?;
        writer
            .flush()
            .change_context(TrainingError::Io)
            .attach_printable("Writing model")?;

        Ok(TrainingSummary {
            rows: dataset.targets.len(),
            epochs: model.epochs,
            final_loss: model.final_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write as _;

    use super::*;

    fn write_dataset(dir: &Path, name: &str, header: &str, rows: usize) -> std::path::PathBuf {
        let mut contents = format!("{header}\n");
        let columns = header.split(',').count();
        for i in 0..rows {
            let base = 100.0 + i as f64;
            let values = (0..columns)
                .map(|c| format!("{}", base + c as f64))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(contents, "{values}").unwrap();
        }

        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn trains_and_writes_model() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_dataset(dir.path(), "data.csv", "open,high,low,volume,close", 50);
        let output = dir.path().join("model.json");

        let summary = LinearTrainer::default()
            .train(&input, &output)
            .expect("training succeeds");

        assert_eq!(summary.rows, 50);
        assert_eq!(summary.epochs, 100);
        assert!(summary.final_loss.is_finite());

        let model = LinearModel::load(&output).expect("model loads");
        assert_eq!(model.features, vec!["open", "high", "low", "volume"]);
        assert_eq!(model.target, "close");
        assert_eq!(model.weights.len(), 4);
        assert_eq!(model.final_loss, summary.final_loss);
    }

    #[test]
    fn loss_decreases_with_more_epochs() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_dataset(dir.path(), "data.csv", "open,high,low,volume,close", 50);

        let short = LinearTrainer {
            epochs: 5,
            ..Default::default()
        }
        .train(&input, &dir.path().join("short.json"))
        .unwrap();
        let long = LinearTrainer {
            epochs: 200,
            ..Default::default()
        }
        .train(&input, &dir.path().join("long.json"))
        .unwrap();

        assert!(long.final_loss < short.final_loss);
    }

    #[test]
    fn extra_and_reordered_columns() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_dataset(
            dir.path(),
            "data.csv",
            "date_index,close,volume,low,high,open",
            10,
        );
        let output = dir.path().join("model.json");

        let summary = LinearTrainer::default().train(&input, &output).unwrap();
        assert_eq!(summary.rows, 10);
    }

    #[test]
    fn missing_volume_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_dataset(dir.path(), "bad.csv", "open,high,low,close", 50);
        let output = dir.path().join("model.json");

        let err = LinearTrainer::default()
            .train(&input, &output)
            .expect_err("training should fail");
        assert_eq!(
            err.current_context(),
            &TrainingError::MissingColumns(vec!["volume".to_string()])
        );
        assert!(!output.exists(), "no model written");
    }

    #[test]
    fn empty_file_is_missing_every_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("empty.csv");
        std::fs::write(&input, "").unwrap();

        let err = LinearTrainer::default()
            .train(&input, &dir.path().join("model.json"))
            .unwrap_err();
        assert_eq!(
            err.current_context(),
            &TrainingError::MissingColumns(
                REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect()
            )
        );
    }

    #[test]
    fn header_only() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_dataset(dir.path(), "data.csv", "open,high,low,volume,close", 0);

        let err = LinearTrainer::default()
            .train(&input, &dir.path().join("model.json"))
            .unwrap_err();
        assert_eq!(err.current_context(), &TrainingError::InvalidData);
    }

    #[test]
    fn non_numeric_cell() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.csv");
        std::fs::write(&input, "open,high,low,volume,close\n1,2,3,lots,5\n").unwrap();

        let err = LinearTrainer::default()
            .train(&input, &dir.path().join("model.json"))
            .unwrap_err();
        assert_eq!(err.current_context(), &TrainingError::InvalidData);
    }

    #[test]
    fn missing_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LinearTrainer::default()
            .train(&dir.path().join("nope.csv"), &dir.path().join("model.json"))
            .unwrap_err();
        assert_eq!(err.current_context(), &TrainingError::Io);
    }

    #[test]
    fn constant_columns_do_not_divide_by_zero() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("data.csv");
        let mut contents = "open,high,low,volume,close\n".to_string();
        for _ in 0..10 {
            contents.push_str("5,5,5,5,5\n");
        }
        std::fs::write(&input, contents).unwrap();

        let output = dir.path().join("model.json");
        let summary = LinearTrainer::default().train(&input, &output).unwrap();
        assert!(summary.final_loss.is_finite());

        let model = LinearModel::load(&output).unwrap();
        assert!((model.predict(&[5.0, 5.0, 5.0, 5.0]) - 5.0).abs() < 1e-3);
    }

    #[test]
    fn load_rejects_mismatched_lengths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(
            &path,
            r#"{
                "features": ["open", "high", "low", "volume"],
                "target": "close",
                "weights": [1.0, 1.0, 1.0, 1.0],
                "bias": 0.0,
                "feature_min": [],
                "feature_max": [1.0, 1.0, 1.0, 1.0],
                "target_min": 0.0,
                "target_max": 1.0,
                "epochs": 1,
                "final_loss": 0.0
            }"#,
        )
        .unwrap();

        let err = LinearModel::load(&path).unwrap_err();
        assert_eq!(err.current_context(), &TrainingError::InvalidData);
    }
}
