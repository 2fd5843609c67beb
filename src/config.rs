//! Run configuration parsing and validation.
//!
//! A run is described by [`MergeConfig`], a strongly typed structure built
//! from [`RunSettings`] layers (defaults, an optional YAML run file, then
//! command-line flags). Everything that can be rejected without touching the
//! model (task, device, language sentinel) is rejected here, before any
//! loading occurs.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceChoice;
use crate::error::{MergeError, Result};

/// Sentinel accepted for `language` meaning "keep the base model's value".
pub const UNSPECIFIED_LANGUAGE: &str = "unspecified";

/// Task the exported model is configured for.
///
/// # Example
///
/// ```rust
/// use merge_lora_rs::Task;
///
/// assert_eq!("translate".parse::<Task>().unwrap(), Task::Translate);
/// assert!("summarize".parse::<Task>().is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    /// Speech to text in the source language.
    #[default]
    Transcribe,
    /// Speech to English text.
    Translate,
}

impl Task {
    /// Wire name of the task.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Task::Transcribe => "transcribe",
            Task::Translate => "translate",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "transcribe" => Ok(Task::Transcribe),
            "translate" => Ok(Task::Translate),
            other => Err(MergeError::InvalidTask(other.to_string())),
        }
    }
}

/// Raw, partially specified run settings.
///
/// Used both as the schema of the YAML run file and as the set of flags given
/// on the command line. Later layers win field by field.
///
/// # Example
///
/// ```rust
/// use merge_lora_rs::config::RunSettings;
///
/// let settings: RunSettings = serde_yaml::from_str("task: translate\nlanguage: German\n").unwrap();
/// assert_eq!(settings.task.as_deref(), Some("translate"));
/// assert!(settings.lora_model.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    /// Adapter directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_model: Option<String>,

    /// Output root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,

    /// Language override, or `unspecified`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    /// Task name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,

    /// Forbid any remote resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_files_only: Option<bool>,

    /// Compute device (`auto`, `cpu`, `cuda`, `cuda:N`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

impl RunSettings {
    /// Load settings from a YAML run file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    #[must_use]
    pub fn overlay(self, other: RunSettings) -> Self {
        Self {
            lora_model: other.lora_model.or(self.lora_model),
            output_dir: other.output_dir.or(self.output_dir),
            language: other.language.or(self.language),
            task: other.task.or(self.task),
            local_files_only: other.local_files_only.or(self.local_files_only),
            device: other.device.or(self.device),
        }
    }
}

/// Validated configuration for one merge run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConfig {
    /// Adapter directory holding `adapter_config.json`.
    pub lora_model: PathBuf,

    /// Root under which the bundle directory is created.
    pub output_dir: PathBuf,

    /// Language written into the task config; `None` keeps the base value.
    pub language: Option<String>,

    /// Task written into the task config.
    pub task: Task,

    /// Only use files already present locally.
    pub local_files_only: bool,

    /// Where tensors are materialized and merged.
    pub device: DeviceChoice,
}

fn default_lora_model() -> String {
    "output/checkpoint-final".into()
}
fn default_output_dir() -> String {
    "models/".into()
}
fn default_language() -> String {
    "Chinese".into()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            lora_model: PathBuf::from(default_lora_model()),
            output_dir: PathBuf::from(default_output_dir()),
            language: Some(default_language()),
            task: Task::Transcribe,
            local_files_only: false,
            device: DeviceChoice::Auto,
        }
    }
}

impl TryFrom<RunSettings> for MergeConfig {
    type Error = MergeError;

    fn try_from(settings: RunSettings) -> Result<Self> {
        let task = match settings.task.as_deref() {
            Some(task) => task.parse()?,
            None => Task::default(),
        };
        let device = match settings.device.as_deref() {
            Some(device) => device.parse()?,
            None => DeviceChoice::default(),
        };
        let language = parse_language(&settings.language.unwrap_or_else(default_language))?;

        Ok(Self {
            lora_model: PathBuf::from(settings.lora_model.unwrap_or_else(default_lora_model)),
            output_dir: PathBuf::from(settings.output_dir.unwrap_or_else(default_output_dir)),
            language,
            task,
            local_files_only: settings.local_files_only.unwrap_or(false),
            device,
        })
    }
}

fn parse_language(raw: &str) -> Result<Option<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(MergeError::malformed(
            "language",
            format!("must be a language name or `{UNSPECIFIED_LANGUAGE}`"),
        ));
    }
    if trimmed.eq_ignore_ascii_case(UNSPECIFIED_LANGUAGE) {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

impl MergeConfig {
    /// Check the inputs that must exist before anything is loaded.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if the adapter location does not
    /// exist.
    pub fn validate(&self) -> Result<()> {
        if !self.lora_model.exists() {
            return Err(MergeError::ConfigNotFound {
                path: self.lora_model.clone(),
            });
        }
        Ok(())
    }

    /// Print the effective arguments, one per line.
    pub fn print_arguments(&self) {
        println!("-----------  Configuration Arguments -----------");
        println!("lora_model: {}", self.lora_model.display());
        println!("output_dir: {}", self.output_dir.display());
        println!(
            "language: {}",
            self.language.as_deref().unwrap_or(UNSPECIFIED_LANGUAGE)
        );
        println!("task: {}", self.task);
        println!("local_files_only: {}", self.local_files_only);
        println!("device: {}", self.device);
        println!("------------------------------------------------");
    }
}
