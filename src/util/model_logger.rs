use anyhow::Result;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One training run, written as pretty JSON next to the other runs of an
/// experiment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ModelExperiment {
    pub timestamp: String,
    pub model_type: String,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub train_rmse: Option<f64>,
    pub validation_rmse: Option<f64>,
    pub training_time_seconds: Option<f64>,
    pub notes: String,
}

impl ModelExperiment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model_type: &str,
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        epochs: usize,
        batch_size: usize,
        learning_rate: f64,
    ) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            model_type: model_type.to_string(),
            input_dim,
            hidden_dim,
            output_dim,
            epochs,
            batch_size,
            learning_rate,
            train_rmse: None,
            validation_rmse: None,
            training_time_seconds: None,
            notes: String::new(),
        }
    }

    pub fn set_train_rmse(&mut self, rmse: f64) {
        self.train_rmse = Some(rmse);
    }

    pub fn set_validation_rmse(&mut self, rmse: f64) {
        self.validation_rmse = Some(rmse);
    }

    pub fn set_training_time(&mut self, seconds: f64) {
        self.training_time_seconds = Some(seconds);
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes.push('\n');
        }
        self.notes.push_str(note);
    }

    pub fn save(&self, experiment_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(experiment_dir)?;

        let filename = format!(
            "{}_i{}_h{}_o{}_experiment.json",
            self.model_type, self.input_dim, self.hidden_dim, self.output_dim,
        );
        let file_path = experiment_dir.join(filename);

        let json = serde_json::to_string_pretty(&self)?;
        fs::write(&file_path, json)?;

        Ok(file_path)
    }
}

/// Creates `{root}/{YYYYmmdd_HHMMSS}` for the runs of one experiment.
pub fn create_experiment_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(Local::now().format("%Y%m%d_%H%M%S").to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
