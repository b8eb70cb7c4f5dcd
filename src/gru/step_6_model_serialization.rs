// External imports
use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// Internal imports
use super::step_3_feedforward_gru::{FeedForwardGru, FeedForwardGruConfig};
use crate::built_info;
use crate::constants::METADATA_SUFFIX;

/// # Model Metadata
///
/// Saved next to the weights so the layer can be rebuilt with the right
/// architecture before the record is loaded into it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ModelMetadata {
    /// Layer configuration the weights belong to
    pub config: FeedForwardGruConfig,

    /// Feature count the layer was built for
    pub input_dim: usize,

    /// Unix timestamp when the model was saved
    pub timestamp: u64,

    /// Version of this crate that wrote the files
    pub crate_version: String,

    /// Human-readable description of the model
    pub description: String,
}

impl ModelMetadata {
    pub fn for_model<B: Backend>(model: &FeedForwardGru<B>, description: &str) -> Self {
        Self {
            config: model.config().clone(),
            input_dim: model.input_dim(),
            timestamp: Utc::now().timestamp().max(0) as u64,
            crate_version: built_info::PKG_VERSION.to_string(),
            description: description.to_string(),
        }
    }
}

fn recorder() -> BinFileRecorder<FullPrecisionSettings> {
    BinFileRecorder::<FullPrecisionSettings>::new()
}

/// `dir/name.bin` -> `dir/name`
fn base_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "bin") {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

fn metadata_path(base: &Path) -> PathBuf {
    let stem = base
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    base.with_file_name(format!("{}{}", stem, METADATA_SUFFIX))
}

/// # Save Model
///
/// Writes the layer weights and its metadata.
///
/// ## File Format
///
/// 1. `{path}.bin` - burn binary record of every parameter
/// 2. `{path}_meta.json` - [`ModelMetadata`]
///
/// # Returns
///
/// The path of the weights file
pub fn save_model<B: Backend>(
    model: &FeedForwardGru<B>,
    path: &Path,
    description: &str,
) -> Result<PathBuf> {
    let base = base_path(path);
    if let Some(parent) = base.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create model directory {}", parent.display()))?;
    }

    model
        .clone()
        .save_file(base.clone(), &recorder())
        .with_context(|| format!("Failed to save model to {}", base.display()))?;

    let metadata = ModelMetadata::for_model(model, description);
    let metadata_path = metadata_path(&base);
    let metadata_json = serde_json::to_string_pretty(&metadata)?;
    fs::write(&metadata_path, metadata_json)
        .with_context(|| format!("Failed to write metadata to {}", metadata_path.display()))?;

    let weights_path = base.with_extension("bin");
    info!(
        "Saved model to {} with metadata at {}",
        weights_path.display(),
        metadata_path.display()
    );
    Ok(weights_path)
}

/// Saves a training checkpoint as `{dir}/{name}_epoch_{epoch}`.
pub fn save_model_checkpoint<B: Backend>(
    model: &FeedForwardGru<B>,
    dir: &Path,
    name: &str,
    epoch: usize,
) -> Result<PathBuf> {
    let path = dir.join(format!("{}_epoch_{}", name, epoch));
    save_model(model, &path, &format!("checkpoint after epoch {}", epoch))
}

/// Finds the most recently modified `{stem}*.bin` in `dir`.
pub fn find_latest_model(dir: &Path, stem: &str) -> Option<PathBuf> {
    fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| {
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            file_name.starts_with(stem) && file_name.ends_with(".bin")
        })
        .max_by_key(|entry| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
        .map(|entry| entry.path())
}

/// Reads the metadata written by [`save_model`].
pub fn load_metadata(path: &Path) -> Result<ModelMetadata> {
    let metadata_path = metadata_path(&base_path(path));
    let metadata_json = fs::read_to_string(&metadata_path)
        .with_context(|| format!("Failed to read metadata file {}", metadata_path.display()))?;
    serde_json::from_str(&metadata_json).context("Failed to parse metadata")
}

/// # Load Model
///
/// Rebuilds the layer from its metadata and loads the saved weights into it.
/// When `path` does not exist, the most recent model in the same directory
/// whose name starts with the same stem is used instead.
pub fn load_model<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(FeedForwardGru<B>, ModelMetadata)> {
    let mut base = base_path(path);
    let weights_path = base.with_extension("bin");

    if !weights_path.exists() {
        let parent = base.parent().unwrap_or_else(|| Path::new("."));
        let stem = base
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let latest = find_latest_model(parent, &stem)
            .with_context(|| format!("Model file not found: {}", weights_path.display()))?;
        warn!(
            "{} does not exist, using most recent model {}",
            weights_path.display(),
            latest.display()
        );
        base = base_path(&latest);
    }

    let metadata = load_metadata(&base)?;
    let model = metadata
        .config
        .build::<B>(&[0, 0, metadata.input_dim], device)
        .context("Saved configuration is invalid")?
        .load_file(base.clone(), &recorder(), device)
        .with_context(|| format!("Failed to load model weights from {}", base.display()))?;

    info!("Loaded model from {}", base.display());
    Ok((model, metadata))
}
