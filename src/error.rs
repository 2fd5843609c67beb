//! Error types for merge-lora-rs.
//!
//! Every failure in the merge pipeline is fatal. Each variant carries enough
//! context (layer name, shapes, offending field) to diagnose the problem
//! without re-running with extra logging.
//!
//! # Example - Pattern Matching
//!
//! ```rust
//! use merge_lora_rs::{MergeError, Task};
//!
//! # fn main() {
//! match "summarize".parse::<Task>() {
//!     Ok(task) => println!("task: {task}"),
//!     Err(MergeError::InvalidTask(task)) => eprintln!("unsupported task: {task}"),
//!     Err(e) => eprintln!("other error: {e}"),
//! }
//! # }
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for merge-lora-rs operations.
pub type Result<T> = std::result::Result<T, MergeError>;

/// Errors that can occur while merging and exporting a model.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum MergeError {
    /// The location holds no adapter metadata or required artifact file.
    #[error("config not found: {}", path.display())]
    ConfigNotFound {
        /// Path that was expected to exist.
        path: PathBuf,
    },

    /// A required field is absent or has the wrong type or value.
    #[error("malformed config field `{field}`: {reason}")]
    MalformedConfig {
        /// Name of the offending field or file.
        field: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The adapter targets a layer the base model does not have.
    #[error("adapter targets unknown layer `{layer}`")]
    UnknownLayer {
        /// Name of the offending layer.
        layer: String,
    },

    /// Adapter factor shapes disagree with the base tensor.
    #[error("shape mismatch in layer `{layer}`: base {base:?}, lora_A {down:?}, lora_B {up:?}")]
    ShapeMismatch {
        /// Name of the offending layer.
        layer: String,
        /// Shape of the base weight.
        base: Vec<usize>,
        /// Shape of the down (A) factor.
        down: Vec<usize>,
        /// Shape of the up (B) factor.
        up: Vec<usize>,
    },

    /// Task outside {transcribe, translate}.
    #[error("invalid task `{0}`: expected one of transcribe, translate")]
    InvalidTask(String),

    /// The base model could not be located.
    #[error("base model `{identity}` not found locally")]
    ModelNotFound {
        /// Base model identity as written in the adapter config.
        identity: String,
    },

    /// IO error while loading inputs or writing the bundle.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid JSON in a model, adapter or artifact config.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid YAML run file.
    #[error("invalid config file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] tokenizers::Error),

    /// Safetensors serialization error.
    #[error("safetensors error: {0}")]
    Safetensors(String),

    /// Progress bar template error.
    #[error("template error: {0}")]
    Template(String),

    /// Hub download error.
    #[error("hub error: {0}")]
    Hub(String),
}

impl MergeError {
    /// Shorthand for [`MergeError::MalformedConfig`].
    pub(crate) fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<indicatif::style::TemplateError> for MergeError {
    fn from(err: indicatif::style::TemplateError) -> Self {
        MergeError::Template(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for MergeError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        MergeError::Safetensors(err.to_string())
    }
}

#[cfg(feature = "download")]
impl From<hf_hub::api::sync::ApiError> for MergeError {
    fn from(err: hf_hub::api::sync::ApiError) -> Self {
        MergeError::Hub(err.to_string())
    }
}
