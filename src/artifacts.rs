//! Auxiliary processing artifacts.
//!
//! A speech model is only usable with the vocabulary it was trained with,
//! the feature-extraction settings that produced its inputs, and the
//! language/task prompt configuration. These travel alongside the weights.
//! Only [`TaskConfig`] is ever modified; everything else is copied verbatim.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Task;
use crate::error::{MergeError, Result};

/// Feature extraction settings file.
pub const FEATURE_CONFIG_FILE: &str = "preprocessor_config.json";

/// Tokenizer settings file carrying `language` and `task`.
pub const TASK_CONFIG_FILE: &str = "tokenizer_config.json";

/// Vocabulary files copied when present.
pub const VOCABULARY_FILES: &[&str] = &[
    "tokenizer.json",
    "vocab.json",
    "merges.txt",
    "added_tokens.json",
    "special_tokens_map.json",
    "normalizer.json",
];

fn read_required(dir: &Path, file: &str) -> Result<Vec<u8>> {
    let path = dir.join(file);
    if !path.is_file() {
        return Err(MergeError::ConfigNotFound { path });
    }
    Ok(std::fs::read(path)?)
}

/// Tokenization tables, kept byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    files: BTreeMap<String, Vec<u8>>,
}

impl Vocabulary {
    /// Collect the vocabulary files present in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::MalformedConfig`] if neither `tokenizer.json`
    /// nor `vocab.json` exists, and a tokenizer error if `tokenizer.json`
    /// does not parse.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = BTreeMap::new();
        for name in VOCABULARY_FILES {
            let path = dir.join(name);
            if path.is_file() {
                files.insert((*name).to_string(), std::fs::read(&path)?);
            }
        }

        if !files.contains_key("tokenizer.json") && !files.contains_key("vocab.json") {
            return Err(MergeError::malformed(
                "vocabulary",
                format!("neither tokenizer.json nor vocab.json found in {}", dir.display()),
            ));
        }
        if let Some(bytes) = files.get("tokenizer.json") {
            let tokenizer = tokenizers::Tokenizer::from_bytes(bytes)?;
            tracing::debug!("Vocabulary size: {}", tokenizer.get_vocab_size(true));
        }

        Ok(Self { files })
    }

    /// File names and contents, in name order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(name, bytes)| (name.as_str(), bytes.as_slice()))
    }

    /// Write every vocabulary file into `dir`.
    ///
    /// Known vocabulary files already in `dir` that this vocabulary does not
    /// have are removed, so the directory holds exactly these tables.
    ///
    /// # Errors
    ///
    /// Returns an IO error if a file cannot be written or removed.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        for name in VOCABULARY_FILES {
            let path = dir.join(name);
            if !self.files.contains_key(*name) && path.is_file() {
                tracing::debug!("Removing stale vocabulary file {:?}", path);
                std::fs::remove_file(&path)?;
            }
        }
        for (name, bytes) in &self.files {
            std::fs::write(dir.join(name), bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct FeatureFields {
    feature_size: usize,
    sampling_rate: u32,
    #[serde(default)]
    hop_length: Option<usize>,
    #[serde(default)]
    chunk_length: Option<usize>,
    #[serde(default)]
    n_fft: Option<usize>,
    #[serde(default)]
    padding_value: Option<f64>,
}

/// Feature extraction settings (`preprocessor_config.json`).
///
/// The typed fields are validated on load; the file itself is passed through
/// unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureNormalizationConfig {
    /// Number of mel bins.
    pub feature_size: usize,
    /// Audio sampling rate in Hz.
    pub sampling_rate: u32,
    /// STFT hop length.
    pub hop_length: Option<usize>,
    /// Input window in seconds.
    pub chunk_length: Option<usize>,
    /// STFT size.
    pub n_fft: Option<usize>,
    /// Value used for padding.
    pub padding_value: Option<f64>,
    raw: Vec<u8>,
}

impl FeatureNormalizationConfig {
    /// Parse from the raw file contents.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::MalformedConfig`] if a required field is missing
    /// or zero.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let fields: FeatureFields = serde_json::from_slice(&raw)
            .map_err(|e| MergeError::malformed(FEATURE_CONFIG_FILE, e.to_string()))?;
        if fields.feature_size == 0 {
            return Err(MergeError::malformed("feature_size", "must be positive"));
        }
        if fields.sampling_rate == 0 {
            return Err(MergeError::malformed("sampling_rate", "must be positive"));
        }
        Ok(Self {
            feature_size: fields.feature_size,
            sampling_rate: fields.sampling_rate,
            hop_length: fields.hop_length,
            chunk_length: fields.chunk_length,
            n_fft: fields.n_fft,
            padding_value: fields.padding_value,
            raw,
        })
    }

    /// Load `preprocessor_config.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if the file is missing.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_bytes(read_required(dir.as_ref(), FEATURE_CONFIG_FILE)?)
    }

    /// Write the unmodified file into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be written.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        std::fs::write(dir.as_ref().join(FEATURE_CONFIG_FILE), &self.raw)?;
        Ok(())
    }
}

/// Tokenizer prompt settings (`tokenizer_config.json`).
///
/// `language` and `task` are typed; every other key is preserved as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Language the decoder is prompted with.
    #[serde(default)]
    pub language: Option<String>,
    /// Task the decoder is prompted with.
    ///
    /// A value that is not a known task is read as `None`; it is always
    /// replaced before the config is written.
    #[serde(default, deserialize_with = "lenient_task")]
    pub task: Option<Task>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn lenient_task<'de, D>(deserializer: D) -> std::result::Result<Option<Task>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) => match raw.parse() {
            Ok(task) => Some(task),
            Err(_) => {
                tracing::warn!("Ignoring unknown task `{}` in {}", raw, TASK_CONFIG_FILE);
                None
            }
        },
        Some(Value::Null) | None => None,
        Some(other) => {
            tracing::warn!("Ignoring non-string task {} in {}", other, TASK_CONFIG_FILE);
            None
        }
    })
}

impl TaskConfig {
    /// Parse from the raw file contents.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::MalformedConfig`] if the file is not a JSON
    /// object.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| MergeError::malformed(TASK_CONFIG_FILE, e.to_string()))
    }

    /// Load `tokenizer_config.json` from `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if the file is missing.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        Self::from_bytes(&read_required(dir.as_ref(), TASK_CONFIG_FILE)?)
    }

    /// Set `task`, and `language` unless it is `None`.
    pub fn apply_overrides(&mut self, language: Option<&str>, task: Task) {
        if let Some(language) = language {
            self.language = Some(language.to_string());
        }
        self.task = Some(task);
    }

    /// Untyped keys carried through unchanged.
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    /// Serialized form, stable across runs.
    ///
    /// # Errors
    ///
    /// Returns a JSON error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Write the file into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be serialized or written.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        std::fs::write(dir.as_ref().join(TASK_CONFIG_FILE), self.to_bytes()?)?;
        Ok(())
    }
}

/// One instance of every auxiliary artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSet {
    /// Tokenization tables.
    pub vocabulary: Vocabulary,
    /// Feature extraction settings.
    pub feature_config: FeatureNormalizationConfig,
    /// Language and task settings.
    pub task_config: TaskConfig,
}

impl ArtifactSet {
    /// Load all artifacts from `dir` without applying any override.
    ///
    /// # Errors
    ///
    /// Returns an error if any artifact is missing or malformed.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        Ok(Self {
            vocabulary: Vocabulary::load(dir)?,
            feature_config: FeatureNormalizationConfig::load(dir)?,
            task_config: TaskConfig::load(dir)?,
        })
    }

    /// Write all artifacts into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error on the first write that fails.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        let dir = dir.as_ref();
        self.feature_config.write_to(dir)?;
        self.vocabulary.write_to(dir)?;
        self.task_config.write_to(dir)?;
        Ok(())
    }
}

/// Loads the artifacts tied to a base model and applies run overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCoordinator {
    language: Option<String>,
    task: Task,
}

impl ArtifactCoordinator {
    /// `language = None` keeps the base model's language.
    #[must_use]
    pub fn new(language: Option<String>, task: Task) -> Self {
        Self { language, task }
    }

    /// Load artifacts from the base model directory with overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if any artifact is missing or malformed.
    pub fn load<P: AsRef<Path>>(&self, model_dir: P) -> Result<ArtifactSet> {
        let mut artifacts = ArtifactSet::load(model_dir)?;
        artifacts
            .task_config
            .apply_overrides(self.language.as_deref(), self.task);
        tracing::info!(
            "Artifacts loaded: {} vocabulary files, {} mel bins at {} Hz, language={}, task={}",
            artifacts.vocabulary.files().count(),
            artifacts.feature_config.feature_size,
            artifacts.feature_config.sampling_rate,
            artifacts.task_config.language.as_deref().unwrap_or("none"),
            self.task
        );
        Ok(artifacts)
    }
}
