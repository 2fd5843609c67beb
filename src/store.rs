//! Tensor storage by name.
//!
//! [`WeightStore`] is the only place that knows how tensors are laid out on
//! disk. The merge never touches files; it receives and returns
//! [`TensorMap`]s.
//!
//! Safetensors is read first; PyTorch pickles (`pytorch_model.bin`, single
//! or sharded) are the fallback for older checkpoints. Only safetensors is
//! ever written.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use serde::Deserialize;

use crate::error::{MergeError, Result};

/// Name → tensor mapping, ordered so iteration is deterministic.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Single-file weights written by [`SafetensorsStore::store`].
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Index of a sharded checkpoint.
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// PyTorch pickle weights.
pub const PICKLE_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// Index of a sharded PyTorch pickle checkpoint.
pub const PICKLE_WEIGHTS_INDEX_FILE: &str = "pytorch_model.bin.index.json";

/// Read one weights file onto `device`, by extension: `.bin` is a PyTorch
/// pickle, anything else safetensors.
///
/// # Errors
///
/// Returns a candle error if the file cannot be decoded.
pub fn load_weights_file(path: &Path, device: &Device) -> Result<TensorMap> {
    if path.extension().is_some_and(|ext| ext == "bin") {
        candle_core::pickle::read_all(path)?
            .into_iter()
            .map(|(name, tensor)| -> Result<(String, Tensor)> { Ok((name, tensor.to_device(device)?)) })
            .collect()
    } else {
        Ok(candle_core::safetensors::load(path, device)?.into_iter().collect())
    }
}

/// Load and store a tensor mapping by name.
pub trait WeightStore {
    /// Read every tensor onto `device`.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights are missing or cannot be decoded.
    fn load(&self, device: &Device) -> Result<TensorMap>;

    /// Persist `tensors`, replacing anything stored before.
    ///
    /// # Errors
    ///
    /// Returns an error if the weights cannot be written.
    fn store(&self, tensors: &TensorMap) -> Result<()>;
}

/// A directory holding `model.safetensors`, or shards listed in
/// `model.safetensors.index.json`.
#[derive(Debug, Clone)]
pub struct SafetensorsStore {
    dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

impl SafetensorsStore {
    /// Create a store rooted at `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Directory this store reads from and writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_index(index_path: &Path, index_file: &str) -> Result<ShardIndex> {
        serde_json::from_str(&std::fs::read_to_string(index_path)?)
            .map_err(|e| MergeError::malformed(index_file, e.to_string()))
    }

    fn load_sharded(&self, index_file: &str, device: &Device) -> Result<TensorMap> {
        let index = Self::read_index(&self.dir.join(index_file), index_file)?;

        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        let mut tensors = TensorMap::new();
        for shard in shards {
            let shard_path = self.dir.join(shard);
            if !shard_path.exists() {
                return Err(MergeError::ConfigNotFound { path: shard_path });
            }
            tracing::debug!("Loading shard {:?}", shard_path);
            tensors.extend(load_weights_file(&shard_path, device)?);
        }

        for name in index.weight_map.keys() {
            if !tensors.contains_key(name) {
                return Err(MergeError::malformed(
                    index_file,
                    format!("tensor `{name}` is listed in the index but missing from its shard"),
                ));
            }
        }
        Ok(tensors)
    }

    /// Remove weights a previous write may have left behind in another
    /// layout, so that [`WeightStore::load`] only ever sees the new tensors.
    fn remove_stale_weights(&self) -> Result<()> {
        for index_file in [WEIGHTS_INDEX_FILE, PICKLE_WEIGHTS_INDEX_FILE] {
            let index_path = self.dir.join(index_file);
            if !index_path.is_file() {
                continue;
            }
            if let Ok(index) = Self::read_index(&index_path, index_file) {
                let shards: BTreeSet<String> = index.weight_map.into_values().collect();
                for shard in shards {
                    let shard_path = self.dir.join(&shard);
                    if shard != WEIGHTS_FILE && shard_path.is_file() {
                        std::fs::remove_file(&shard_path)?;
                    }
                }
            }
            tracing::debug!("Removing stale {:?}", index_path);
            std::fs::remove_file(&index_path)?;
        }
        let pickle = self.dir.join(PICKLE_WEIGHTS_FILE);
        if pickle.is_file() {
            std::fs::remove_file(&pickle)?;
        }
        Ok(())
    }
}

impl WeightStore for SafetensorsStore {
    fn load(&self, device: &Device) -> Result<TensorMap> {
        let single = self.dir.join(WEIGHTS_FILE);
        let pickle = self.dir.join(PICKLE_WEIGHTS_FILE);

        let tensors = if single.is_file() {
            load_weights_file(&single, device)?
        } else if self.dir.join(WEIGHTS_INDEX_FILE).is_file() {
            self.load_sharded(WEIGHTS_INDEX_FILE, device)?
        } else if pickle.is_file() {
            tracing::info!("No safetensors weights; reading {:?}", pickle);
            load_weights_file(&pickle, device)?
        } else if self.dir.join(PICKLE_WEIGHTS_INDEX_FILE).is_file() {
            self.load_sharded(PICKLE_WEIGHTS_INDEX_FILE, device)?
        } else {
            return Err(MergeError::ConfigNotFound { path: single });
        };

        tracing::info!("Loaded {} tensors from {:?}", tensors.len(), self.dir);
        Ok(tensors)
    }

    fn store(&self, tensors: &TensorMap) -> Result<()> {
        let weights_path = self.dir.join(WEIGHTS_FILE);
        let metadata: HashMap<String, String> =
            HashMap::from([("format".to_string(), "pt".to_string())]);

        let cpu_tensors = tensors
            .iter()
            .map(|(name, tensor)| Ok((name.as_str(), tensor.to_device(&Device::Cpu)?)))
            .collect::<Result<Vec<(&str, Tensor)>>>()?;

        self.remove_stale_weights()?;
        safetensors::tensor::serialize_to_file(cpu_tensors, &Some(metadata), &weights_path)?;
        tracing::info!("Wrote {} tensors to {:?}", tensors.len(), weights_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use tempfile::TempDir;

    fn sample_tensors() -> TensorMap {
        let device = Device::Cpu;
        let mut tensors = TensorMap::new();
        tensors.insert(
            "encoder.weight".into(),
            Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap(),
        );
        tensors.insert(
            "encoder.bias".into(),
            Tensor::new(&[0.5f32, -0.5], &device).unwrap(),
        );
        tensors
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let store = SafetensorsStore::new(dir.path());
        store.store(&sample_tensors()).unwrap();

        assert!(dir.path().join(WEIGHTS_FILE).exists());
        let loaded = store.load(&Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 2);
        let weight: Vec<Vec<f32>> = loaded["encoder.weight"].to_vec2().unwrap();
        assert_eq!(weight, vec![vec![1., 2.], vec![3., 4.]]);
    }

    #[test]
    fn test_store_is_deterministic() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        SafetensorsStore::new(dir_a.path()).store(&sample_tensors()).unwrap();
        SafetensorsStore::new(dir_b.path()).store(&sample_tensors()).unwrap();

        let a = std::fs::read(dir_a.path().join(WEIGHTS_FILE)).unwrap();
        let b = std::fs::read(dir_b.path().join(WEIGHTS_FILE)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_load_missing_weights() {
        let dir = TempDir::new().unwrap();
        let err = SafetensorsStore::new(dir.path()).load(&Device::Cpu).unwrap_err();
        match err {
            MergeError::ConfigNotFound { path } => assert!(path.ends_with(WEIGHTS_FILE)),
            other => panic!("expected ConfigNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_load_sharded_checkpoint() {
        let dir = TempDir::new().unwrap();
        let device = Device::Cpu;
        let a = Tensor::ones((2, 2), DType::F32, &device).unwrap();
        let b = Tensor::zeros(3, DType::F32, &device).unwrap();

        safetensors::tensor::serialize_to_file(
            [("layer.0.weight", &a)],
            &None,
            &dir.path().join("model-00001-of-00002.safetensors"),
        )
        .unwrap();
        safetensors::tensor::serialize_to_file(
            [("layer.1.bias", &b)],
            &None,
            &dir.path().join("model-00002-of-00002.safetensors"),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"metadata": {}, "weight_map": {
                "layer.0.weight": "model-00001-of-00002.safetensors",
                "layer.1.bias": "model-00002-of-00002.safetensors"}}"#,
        )
        .unwrap();

        let loaded = SafetensorsStore::new(dir.path()).load(&device).unwrap();
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            vec!["layer.0.weight", "layer.1.bias"]
        );
    }

    #[test]
    fn test_load_sharded_missing_shard() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {"w": "model-00001-of-00001.safetensors"}}"#,
        )
        .unwrap();

        let err = SafetensorsStore::new(dir.path()).load(&Device::Cpu).unwrap_err();
        assert!(matches!(err, MergeError::ConfigNotFound { .. }));
    }

    fn pickle_fixture() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/pytorch_model.bin")
    }

    #[test]
    fn test_load_falls_back_to_pytorch_pickle() {
        let dir = TempDir::new().unwrap();
        std::fs::copy(pickle_fixture(), dir.path().join(PICKLE_WEIGHTS_FILE)).unwrap();

        let loaded = SafetensorsStore::new(dir.path()).load(&Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 5);
        let conv = &loaded["model.encoder.conv1.weight"];
        assert_eq!(conv.dims(), &[4, 2, 3]);
        assert_eq!(conv.dtype(), DType::F32);
        let bias: Vec<f32> = loaded["model.encoder.layers.0.self_attn.q_proj.bias"]
            .to_vec1()
            .unwrap();
        assert_eq!(bias, vec![0.0, 0.125, 0.25, 0.375]);
    }

    #[test]
    fn test_safetensors_preferred_over_pickle() {
        let dir = TempDir::new().unwrap();
        std::fs::copy(pickle_fixture(), dir.path().join(PICKLE_WEIGHTS_FILE)).unwrap();
        safetensors::tensor::serialize_to_file(
            sample_tensors().iter().map(|(k, v)| (k.as_str(), v)),
            &None,
            &dir.path().join(WEIGHTS_FILE),
        )
        .unwrap();

        let loaded = SafetensorsStore::new(dir.path()).load(&Device::Cpu).unwrap();
        assert_eq!(
            loaded.keys().collect::<Vec<_>>(),
            vec!["encoder.bias", "encoder.weight"]
        );
    }

    #[test]
    fn test_store_removes_weights_in_other_layouts() {
        let dir = TempDir::new().unwrap();
        let shard = "model-00001-of-00001.safetensors";
        safetensors::tensor::serialize_to_file(
            [("old.weight", &Tensor::ones(2, DType::F32, &Device::Cpu).unwrap())],
            &None,
            &dir.path().join(shard),
        )
        .unwrap();
        std::fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            format!(r#"{{"weight_map": {{"old.weight": "{shard}"}}}}"#),
        )
        .unwrap();
        std::fs::copy(pickle_fixture(), dir.path().join(PICKLE_WEIGHTS_FILE)).unwrap();

        let store = SafetensorsStore::new(dir.path());
        store.store(&sample_tensors()).unwrap();

        assert!(!dir.path().join(WEIGHTS_INDEX_FILE).exists());
        assert!(!dir.path().join(shard).exists());
        assert!(!dir.path().join(PICKLE_WEIGHTS_FILE).exists());
        let loaded = store.load(&Device::Cpu).unwrap();
        assert!(!loaded.contains_key("old.weight"));
        assert_eq!(loaded.len(), 2);
    }
}
