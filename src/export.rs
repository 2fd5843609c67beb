//! Bundle export.
//!
//! A bundle is one directory, `{output_root}/{basename}-finetune`, holding
//! the merged weights, the architecture files and every auxiliary artifact.
//! Nothing in it refers back to the base model or adapter locations.
//!
//! Files are written in place. If a write fails part-way the directory may
//! be left holding a partial bundle; re-running the export overwrites it.
//! Weight layouts, vocabulary tables and the generation config left by an
//! earlier export are removed when the new bundle does not have them.

use std::path::{Path, PathBuf};

use candle_core::Device;

use crate::artifacts::ArtifactSet;
use crate::error::{MergeError, Result};
use crate::hub::model_basename;
use crate::model::{MergedModel, ModelFiles, GENERATION_CONFIG_FILE, MODEL_CONFIG_FILE};
use crate::store::{SafetensorsStore, TensorMap, WeightStore};

/// Suffix appended to the base model name for the bundle directory.
pub const BUNDLE_SUFFIX: &str = "-finetune";

/// Writes bundles under a fixed output root.
#[derive(Debug, Clone)]
pub struct BundleExporter {
    output_root: PathBuf,
}

impl BundleExporter {
    /// Exporter writing under `output_root`.
    pub fn new<P: AsRef<Path>>(output_root: P) -> Self {
        Self {
            output_root: output_root.as_ref().to_path_buf(),
        }
    }

    /// Directory a bundle for `base_model` is written to.
    ///
    /// ```rust
    /// use std::path::Path;
    /// use merge_lora_rs::BundleExporter;
    ///
    /// let exporter = BundleExporter::new("models/");
    /// assert_eq!(
    ///     exporter.bundle_dir("openai/whisper-tiny"),
    ///     Path::new("models/whisper-tiny-finetune")
    /// );
    /// ```
    #[must_use]
    pub fn bundle_dir(&self, base_model: &str) -> PathBuf {
        self.output_root
            .join(format!("{}{BUNDLE_SUFFIX}", model_basename(base_model)))
    }

    /// Write `merged` and `artifacts` into the bundle for `base_model`.
    ///
    /// Creating a directory that already exists is not an error; existing
    /// files are overwritten.
    ///
    /// # Errors
    ///
    /// Returns an error on the first write that fails.
    pub fn export(&self, base_model: &str, merged: &MergedModel, artifacts: &ArtifactSet) -> Result<PathBuf> {
        let dir = self.bundle_dir(base_model);
        std::fs::create_dir_all(&dir)?;
        tracing::info!("Exporting bundle to {:?}", dir);

        SafetensorsStore::new(&dir).store(merged.tensors())?;
        write_model_files(&dir, merged.files())?;
        artifacts.write_to(&dir)?;

        Ok(dir)
    }
}

fn write_model_files(dir: &Path, files: &ModelFiles) -> Result<()> {
    std::fs::write(dir.join(MODEL_CONFIG_FILE), &files.config)?;
    let generation_path = dir.join(GENERATION_CONFIG_FILE);
    match &files.generation_config {
        Some(bytes) => std::fs::write(generation_path, bytes)?,
        None if generation_path.exists() => std::fs::remove_file(generation_path)?,
        None => {}
    }
    Ok(())
}

/// A bundle read back from disk.
#[derive(Debug, Clone)]
pub struct Bundle {
    /// Bundle directory.
    pub dir: PathBuf,
    /// Merged weights.
    pub tensors: TensorMap,
    /// Architecture files.
    pub files: ModelFiles,
    /// Auxiliary artifacts.
    pub artifacts: ArtifactSet,
}

impl Bundle {
    /// Load a bundle using nothing but its own directory.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if `dir` is not a directory,
    /// or the error of the first part that fails to load.
    pub fn load<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(MergeError::ConfigNotFound {
                path: dir.to_path_buf(),
            });
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            tensors: SafetensorsStore::new(dir).load(device)?,
            files: ModelFiles::load(dir)?,
            artifacts: ArtifactSet::load(dir)?,
        })
    }
}
