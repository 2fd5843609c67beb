//! Base model resolution.
//!
//! The adapter config names its base model either by local path or by hub
//! identity (`openai/whisper-small`). Resolution turns that into a local
//! directory holding the weights and artifact files.

use std::path::{Path, PathBuf};

use crate::error::{MergeError, Result};

/// Files fetched when the `download` feature resolves a remote model.
#[cfg(feature = "download")]
const REQUIRED_FILES: &[&str] = &["config.json", "preprocessor_config.json", "tokenizer_config.json"];

#[cfg(feature = "download")]
const OPTIONAL_FILES: &[&str] = &[
    "generation_config.json",
    "tokenizer.json",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
    "special_tokens_map.json",
    "normalizer.json",
];

/// Final path component of a model identity, used to name the bundle.
///
/// ```rust
/// use merge_lora_rs::hub::model_basename;
///
/// assert_eq!(model_basename("openai/whisper-tiny"), "whisper-tiny");
/// assert_eq!(model_basename("/models/whisper-large-v3/"), "whisper-large-v3");
/// ```
#[must_use]
pub fn model_basename(identity: &str) -> &str {
    identity
        .trim_end_matches(['/', '\\'])
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(identity)
}

/// Local hub cache (`models--{org}--{name}/snapshots/{revision}`).
#[derive(Debug, Clone)]
pub struct HubCache {
    root: PathBuf,
}

impl HubCache {
    /// Cache rooted at an explicit directory.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Cache location from `HF_HUB_CACHE`, `HF_HOME` or `~/.cache/huggingface`.
    #[must_use]
    pub fn from_env() -> Self {
        let root = std::env::var("HF_HUB_CACHE")
            .map(PathBuf::from)
            .or_else(|_| std::env::var("HF_HOME").map(|h| PathBuf::from(h).join("hub")))
            .or_else(|_| {
                std::env::var("HOME").map(|h| PathBuf::from(h).join(".cache/huggingface/hub"))
            })
            .unwrap_or_else(|_| PathBuf::from("/tmp/huggingface/hub"));
        Self { root }
    }

    /// Cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot directory for `identity` at the `main` ref, if cached.
    #[must_use]
    pub fn snapshot(&self, identity: &str) -> Option<PathBuf> {
        let repo_dir = self
            .root
            .join(format!("models--{}", identity.replace('/', "--")));
        let revision = std::fs::read_to_string(repo_dir.join("refs").join("main")).ok()?;
        let snapshot = repo_dir.join("snapshots").join(revision.trim());
        snapshot.is_dir().then_some(snapshot)
    }
}

/// Resolve a base model identity to a local directory.
///
/// Local directories win, then the hub cache. Only when neither has the model
/// and `local_files_only` is false is a download attempted (requires the
/// `download` feature).
///
/// # Errors
///
/// Returns [`MergeError::ModelNotFound`] if the model is not available.
pub fn resolve_model_dir(identity: &str, cache: &HubCache, local_files_only: bool) -> Result<PathBuf> {
    let local = PathBuf::from(identity);
    if local.is_dir() {
        tracing::debug!("Base model {} is a local directory", identity);
        return Ok(local);
    }

    if let Some(snapshot) = cache.snapshot(identity) {
        tracing::debug!("Base model {} found in hub cache at {:?}", identity, snapshot);
        return Ok(snapshot);
    }

    if local_files_only {
        return Err(MergeError::ModelNotFound {
            identity: identity.to_string(),
        });
    }

    download(identity, cache)
}

#[cfg(feature = "download")]
fn download(identity: &str, cache: &HubCache) -> Result<PathBuf> {
    use hf_hub::api::sync::ApiBuilder;

    tracing::info!("Downloading {} into {:?}", identity, cache.root());
    let api = ApiBuilder::new()
        .with_cache_dir(cache.root().to_path_buf())
        .with_progress(true)
        .build()?;
    let repo = api.model(identity.to_string());

    let config_path = repo.get(REQUIRED_FILES[0])?;
    for file in &REQUIRED_FILES[1..] {
        repo.get(file)?;
    }
    for file in OPTIONAL_FILES {
        if let Err(err) = repo.get(file) {
            tracing::debug!("Optional file {} not fetched: {}", file, err);
        }
    }

    if repo.get(crate::store::WEIGHTS_FILE).is_err() {
        let index_path = match repo.get(crate::store::WEIGHTS_INDEX_FILE) {
            Ok(path) => path,
            Err(err) => {
                tracing::debug!("No safetensors index ({}); trying PyTorch weights", err);
                if repo.get(crate::store::PICKLE_WEIGHTS_FILE).is_ok() {
                    return snapshot_dir(&config_path, identity);
                }
                repo.get(crate::store::PICKLE_WEIGHTS_INDEX_FILE)?
            }
        };
        let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
        let shards: std::collections::BTreeSet<&str> = index["weight_map"]
            .as_object()
            .into_iter()
            .flat_map(|map| map.values())
            .filter_map(serde_json::Value::as_str)
            .collect();
        for shard in shards {
            repo.get(shard)?;
        }
    }

    snapshot_dir(&config_path, identity)
}

#[cfg(feature = "download")]
fn snapshot_dir(config_path: &Path, identity: &str) -> Result<PathBuf> {
    config_path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| MergeError::ModelNotFound {
            identity: identity.to_string(),
        })
}

#[cfg(not(feature = "download"))]
fn download(identity: &str, _cache: &HubCache) -> Result<PathBuf> {
    tracing::warn!("Model download requested but the `download` feature is not enabled");
    Err(MergeError::ModelNotFound {
        identity: identity.to_string(),
    })
}
