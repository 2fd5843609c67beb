//! Base and merged models.
//!
//! A model is a [`TensorMap`] plus the architecture files
//! (`config.json`, `generation_config.json`) needed to load it standalone.
//! The architecture files are carried verbatim; the merge never changes the
//! architecture.

use std::path::Path;

use candle_core::Device;
use serde_json::Value;

use crate::error::{MergeError, Result};
use crate::store::{TensorMap, WeightStore};

/// Architecture config written next to the weights.
pub const MODEL_CONFIG_FILE: &str = "config.json";

/// Optional decoding defaults written next to the weights.
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// Raw architecture files of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    /// Contents of `config.json`.
    pub config: Vec<u8>,
    /// Contents of `generation_config.json`, when the model ships one.
    pub generation_config: Option<Vec<u8>>,
}

impl ModelFiles {
    /// Read the architecture files from a model directory.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if `config.json` is missing and
    /// [`MergeError::MalformedConfig`] if either file is not a JSON object.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join(MODEL_CONFIG_FILE);
        if !config_path.is_file() {
            return Err(MergeError::ConfigNotFound { path: config_path });
        }
        let config = std::fs::read(&config_path)?;
        ensure_json_object(MODEL_CONFIG_FILE, &config)?;

        let generation_path = dir.join(GENERATION_CONFIG_FILE);
        let generation_config = if generation_path.is_file() {
            let bytes = std::fs::read(&generation_path)?;
            ensure_json_object(GENERATION_CONFIG_FILE, &bytes)?;
            Some(bytes)
        } else {
            None
        };

        Ok(Self {
            config,
            generation_config,
        })
    }

    /// `model_type` from `config.json`, if present.
    #[must_use]
    pub fn model_type(&self) -> Option<String> {
        serde_json::from_slice::<Value>(&self.config)
            .ok()?
            .get("model_type")?
            .as_str()
            .map(str::to_string)
    }
}

fn ensure_json_object(file: &str, bytes: &[u8]) -> Result<()> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(_)) => Ok(()),
        Ok(_) => Err(MergeError::malformed(file, "expected a JSON object")),
        Err(e) => Err(MergeError::malformed(file, e.to_string())),
    }
}

/// The pretrained dense model an adapter was trained against.
#[derive(Debug, Clone)]
pub struct BaseModel {
    tensors: TensorMap,
    files: ModelFiles,
}

impl BaseModel {
    /// Assemble a base model from already loaded parts.
    #[must_use]
    pub fn new(tensors: TensorMap, files: ModelFiles) -> Self {
        Self { tensors, files }
    }

    /// Load weights through `store` and architecture files from `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights or `config.json` cannot be loaded.
    pub fn load<P: AsRef<Path>>(dir: P, store: &dyn WeightStore, device: &Device) -> Result<Self> {
        let files = ModelFiles::load(&dir)?;
        let tensors = store.load(device)?;
        tracing::info!(
            "Base model ({}) has {} tensors",
            files.model_type().as_deref().unwrap_or("unknown type"),
            tensors.len()
        );
        Ok(Self { tensors, files })
    }

    /// Weight tensors by name.
    #[must_use]
    pub fn tensors(&self) -> &TensorMap {
        &self.tensors
    }

    /// Architecture files.
    #[must_use]
    pub fn files(&self) -> &ModelFiles {
        &self.files
    }
}

/// A dense model with the adapter folded in.
///
/// Same key set and shapes as the [`BaseModel`] it came from; carries no
/// adapter metadata.
#[derive(Debug, Clone)]
pub struct MergedModel {
    tensors: TensorMap,
    files: ModelFiles,
}

impl MergedModel {
    pub(crate) fn new(tensors: TensorMap, files: ModelFiles) -> Self {
        Self { tensors, files }
    }

    /// Weight tensors by name.
    #[must_use]
    pub fn tensors(&self) -> &TensorMap {
        &self.tensors
    }

    /// Architecture files.
    #[must_use]
    pub fn files(&self) -> &ModelFiles {
        &self.files
    }

    /// Split into weights and architecture files.
    #[must_use]
    pub fn into_parts(self) -> (TensorMap, ModelFiles) {
        (self.tensors, self.files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SafetensorsStore;
    use candle_core::{DType, Tensor};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_model_files_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MODEL_CONFIG_FILE), r#"{"model_type": "whisper"}"#).unwrap();

        let files = ModelFiles::load(dir.path()).unwrap();
        assert_eq!(files.model_type().as_deref(), Some("whisper"));
        assert!(files.generation_config.is_none());
    }

    #[test]
    fn test_model_files_missing_config() {
        let dir = TempDir::new().unwrap();
        let err = ModelFiles::load(dir.path()).unwrap_err();
        assert!(matches!(err, MergeError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_model_files_rejects_non_object() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MODEL_CONFIG_FILE), "[1, 2]").unwrap();
        let err = ModelFiles::load(dir.path()).unwrap_err();
        assert!(matches!(err, MergeError::MalformedConfig { ref field, .. } if field == MODEL_CONFIG_FILE));
    }

    #[test]
    fn test_base_model_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(MODEL_CONFIG_FILE), r#"{"model_type": "whisper"}"#).unwrap();
        fs::write(dir.path().join(GENERATION_CONFIG_FILE), r#"{"max_length": 448}"#).unwrap();
        let mut tensors = TensorMap::new();
        tensors.insert(
            "proj_out.weight".into(),
            Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let store = SafetensorsStore::new(dir.path());
        store.store(&tensors).unwrap();

        let base = BaseModel::load(dir.path(), &store, &Device::Cpu).unwrap();
        assert_eq!(base.tensors().len(), 1);
        assert!(base.files().generation_config.is_some());
    }
}
