//! LoRA adapter metadata and factors.
//!
//! An adapter directory holds `adapter_config.json` (PEFT schema) and
//! `adapter_model.safetensors`. [`AdapterDescriptor`] is the typed, eagerly
//! validated view of the config; [`AdapterDelta`] pairs the saved `lora_A` /
//! `lora_B` tensors per targeted layer.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{Device, Tensor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MergeError, Result};
use crate::store::load_weights_file;

/// Adapter metadata file.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Adapter weights file.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Adapter weights as a PyTorch pickle, written by older PEFT releases.
pub const ADAPTER_PICKLE_FILE: &str = "adapter_model.bin";

/// Prefix PEFT puts in front of every saved tensor name.
const PEFT_PREFIX: &str = "base_model.model.";

/// `target_modules` is either a list of module names or a single name.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TargetModules {
    List(Vec<String>),
    Single(String),
}

/// Typed view of `adapter_config.json`.
///
/// # Example
///
/// ```rust
/// use merge_lora_rs::AdapterDescriptor;
///
/// let json = r#"{
///     "peft_type": "LORA",
///     "base_model_name_or_path": "openai/whisper-tiny",
///     "r": 8,
///     "lora_alpha": 32,
///     "target_modules": ["q_proj", "v_proj"]
/// }"#;
/// let descriptor = AdapterDescriptor::from_json(json).unwrap();
/// assert_eq!(descriptor.r, 8);
/// assert!((descriptor.scale() - 4.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterDescriptor {
    /// Identity of the base model the adapter was trained against.
    pub base_model: String,
    /// Default rank.
    pub r: usize,
    /// Default alpha.
    pub lora_alpha: f64,
    /// Module-name suffixes the adapter was attached to.
    pub target_modules: Vec<String>,
    /// Base weights are stored transposed (`in × out`).
    pub fan_in_fan_out: bool,
    /// Scale by `alpha / sqrt(r)` instead of `alpha / r`.
    pub use_rslora: bool,
    /// Per-module rank overrides.
    pub rank_pattern: BTreeMap<String, usize>,
    /// Per-module alpha overrides.
    pub alpha_pattern: BTreeMap<String, f64>,
}

fn required<T: DeserializeOwned>(obj: &Map<String, Value>, field: &str) -> Result<T> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(MergeError::malformed(field, "missing required field")),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|e| MergeError::malformed(field, e.to_string()))
        }
    }
}

fn optional<T: DeserializeOwned + Default>(obj: &Map<String, Value>, field: &str) -> Result<T> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|e| MergeError::malformed(field, e.to_string()))
        }
    }
}

/// `name` equals `key` or ends with `.{key}`.
fn module_matches(name: &str, key: &str) -> bool {
    name == key
        || name
            .strip_suffix(key)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Value of the most specific pattern key matching `module`.
fn pattern_lookup<T: Copy>(pattern: &BTreeMap<String, T>, module: &str) -> Option<T> {
    pattern
        .iter()
        .filter(|(key, _)| module_matches(module, key))
        .max_by_key(|(key, _)| key.len())
        .map(|(_, value)| *value)
}

fn module_name(layer: &str) -> &str {
    layer.strip_suffix(".weight").unwrap_or(layer)
}

impl AdapterDescriptor {
    /// Read and validate `adapter_config.json` from an adapter directory.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if the directory or the config
    /// file does not exist, and [`MergeError::MalformedConfig`] if a field is
    /// missing or invalid.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let config_path = dir.as_ref().join(ADAPTER_CONFIG_FILE);
        if !config_path.is_file() {
            return Err(MergeError::ConfigNotFound { path: config_path });
        }
        let json = std::fs::read_to_string(&config_path)?;
        let descriptor = Self::from_json(&json)?;
        tracing::info!(
            "Adapter for {}: r={}, alpha={}, scale={}, targets={:?}",
            descriptor.base_model,
            descriptor.r,
            descriptor.lora_alpha,
            descriptor.scale(),
            descriptor.target_modules
        );
        Ok(descriptor)
    }

    /// Parse and validate adapter metadata from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::MalformedConfig`] naming the offending field.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)
            .map_err(|e| MergeError::malformed(ADAPTER_CONFIG_FILE, e.to_string()))?;
        let Value::Object(obj) = value else {
            return Err(MergeError::malformed(ADAPTER_CONFIG_FILE, "expected a JSON object"));
        };

        if let Some(peft_type) = optional::<Option<String>>(&obj, "peft_type")? {
            if peft_type != "LORA" {
                return Err(MergeError::malformed(
                    "peft_type",
                    format!("only LORA adapters can be merged, found {peft_type}"),
                ));
            }
        }

        let base_model: String = required(&obj, "base_model_name_or_path")?;
        if base_model.trim().is_empty() {
            return Err(MergeError::malformed("base_model_name_or_path", "must not be empty"));
        }

        let r: usize = required(&obj, "r")?;
        if r == 0 {
            return Err(MergeError::malformed("r", "rank must be positive"));
        }

        let lora_alpha: f64 = required(&obj, "lora_alpha")?;
        if !lora_alpha.is_finite() {
            return Err(MergeError::malformed("lora_alpha", "must be finite"));
        }

        let target_modules = match required::<TargetModules>(&obj, "target_modules")? {
            TargetModules::List(list) => list,
            TargetModules::Single(name) => vec![name],
        };
        if target_modules.is_empty() {
            return Err(MergeError::malformed("target_modules", "must not be empty"));
        }

        let rank_pattern: BTreeMap<String, usize> = optional(&obj, "rank_pattern")?;
        if let Some((key, _)) = rank_pattern.iter().find(|(_, r)| **r == 0) {
            return Err(MergeError::malformed(
                "rank_pattern",
                format!("rank for `{key}` must be positive"),
            ));
        }

        Ok(Self {
            base_model,
            r,
            lora_alpha,
            target_modules,
            fan_in_fan_out: optional(&obj, "fan_in_fan_out")?,
            use_rslora: optional(&obj, "use_rslora")?,
            rank_pattern,
            alpha_pattern: optional(&obj, "alpha_pattern")?,
        })
    }

    /// Default scale, `alpha / r` (or `alpha / sqrt(r)` with rsLoRA).
    #[must_use]
    pub fn scale(&self) -> f64 {
        self.compute_scale(self.r, self.lora_alpha)
    }

    /// Rank declared for a layer, after `rank_pattern`.
    #[must_use]
    pub fn rank_for(&self, layer: &str) -> usize {
        pattern_lookup(&self.rank_pattern, module_name(layer)).unwrap_or(self.r)
    }

    /// Scale applied to a layer, after `rank_pattern` and `alpha_pattern`.
    #[must_use]
    pub fn scale_for(&self, layer: &str) -> f64 {
        let module = module_name(layer);
        let alpha = pattern_lookup(&self.alpha_pattern, module).unwrap_or(self.lora_alpha);
        self.compute_scale(self.rank_for(layer), alpha)
    }

    /// Whether any target module matches `layer`.
    #[must_use]
    pub fn targets(&self, layer: &str) -> bool {
        let module = module_name(layer);
        self.target_modules
            .iter()
            .any(|target| module_matches(module, target))
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute_scale(&self, r: usize, alpha: f64) -> f64 {
        if self.use_rslora {
            alpha / (r as f64).sqrt()
        } else {
            alpha / r as f64
        }
    }
}

/// Low-rank factors for one layer.
#[derive(Debug, Clone)]
pub struct LayerDelta {
    /// `lora_A`, shape `r × in`.
    pub down: Tensor,
    /// `lora_B`, shape `out × r`.
    pub up: Tensor,
    /// Multiplier applied to `up · down`.
    pub scale: f64,
}

/// Per-layer low-rank deltas, keyed by base tensor name.
#[derive(Debug, Clone, Default)]
pub struct AdapterDelta {
    layers: BTreeMap<String, LayerDelta>,
    fan_in_fan_out: bool,
}

#[derive(Default)]
struct FactorPair {
    down: Option<Tensor>,
    up: Option<Tensor>,
}

impl AdapterDelta {
    /// Empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether base weights are stored `in × out`.
    #[must_use]
    pub fn with_fan_in_fan_out(mut self, fan_in_fan_out: bool) -> Self {
        self.fan_in_fan_out = fan_in_fan_out;
        self
    }

    /// Add (or replace) the delta for `layer`.
    pub fn insert(&mut self, layer: impl Into<String>, delta: LayerDelta) {
        self.layers.insert(layer.into(), delta);
    }

    /// Delta for `layer`, if targeted.
    #[must_use]
    pub fn get(&self, layer: &str) -> Option<&LayerDelta> {
        self.layers.get(layer)
    }

    /// Targeted layers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LayerDelta)> {
        self.layers.iter()
    }

    /// Number of targeted layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether no layer is targeted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Whether base weights are stored `in × out`.
    #[must_use]
    pub fn fan_in_fan_out(&self) -> bool {
        self.fan_in_fan_out
    }

    /// Load `adapter_model.safetensors` (or `adapter_model.bin`) and pair
    /// factors per layer.
    ///
    /// # Errors
    ///
    /// Returns [`MergeError::ConfigNotFound`] if neither weights file exists
    /// and [`MergeError::MalformedConfig`] if a factor lacks its partner, has
    /// an unexpected name, or disagrees with the declared rank.
    pub fn load<P: AsRef<Path>>(dir: P, descriptor: &AdapterDescriptor, device: &Device) -> Result<Self> {
        let weights_path = dir.as_ref().join(ADAPTER_WEIGHTS_FILE);
        let pickle_path = dir.as_ref().join(ADAPTER_PICKLE_FILE);
        let tensors = if weights_path.is_file() {
            load_weights_file(&weights_path, device)?
        } else if pickle_path.is_file() {
            tracing::info!("Reading adapter factors from {:?}", pickle_path);
            load_weights_file(&pickle_path, device)?
        } else {
            return Err(MergeError::ConfigNotFound { path: weights_path });
        };
        Self::from_tensors(tensors, descriptor)
    }

    /// Pair PEFT-named factors (`<prefix><module>.lora_A[.<adapter>].weight`).
    ///
    /// # Errors
    ///
    /// See [`AdapterDelta::load`].
    pub fn from_tensors<I>(tensors: I, descriptor: &AdapterDescriptor) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut pairs: BTreeMap<String, FactorPair> = BTreeMap::new();
        for (name, tensor) in tensors {
            let stripped = name.strip_prefix(PEFT_PREFIX).unwrap_or(&name);
            let (module, is_down) = if let Some((module, _)) = stripped.split_once(".lora_A.") {
                (module, true)
            } else if let Some((module, _)) = stripped.split_once(".lora_B.") {
                (module, false)
            } else {
                return Err(MergeError::malformed(
                    ADAPTER_WEIGHTS_FILE,
                    format!("unexpected tensor `{name}`; only lora_A/lora_B factors can be merged"),
                ));
            };

            let pair = pairs.entry(format!("{module}.weight")).or_default();
            let slot = if is_down { &mut pair.down } else { &mut pair.up };
            if slot.replace(tensor).is_some() {
                return Err(MergeError::malformed(
                    ADAPTER_WEIGHTS_FILE,
                    format!("duplicate factor for `{module}`"),
                ));
            }
        }

        let mut delta = Self::new().with_fan_in_fan_out(descriptor.fan_in_fan_out);
        for (layer, pair) in pairs {
            let (Some(down), Some(up)) = (pair.down, pair.up) else {
                return Err(MergeError::malformed(
                    ADAPTER_WEIGHTS_FILE,
                    format!("layer `{layer}` is missing its lora_A or lora_B factor"),
                ));
            };

            let declared = descriptor.rank_for(&layer);
            let rank = down.dims().first().copied().unwrap_or(0);
            if rank != declared {
                return Err(MergeError::malformed(
                    "r",
                    format!("layer `{layer}` has rank {rank} but the config declares {declared}"),
                ));
            }
            if !descriptor.targets(&layer) {
                tracing::warn!("Layer {} is not matched by target_modules", layer);
            }

            let scale = descriptor.scale_for(&layer);
            delta.insert(layer, LayerDelta { down, up, scale });
        }

        tracing::info!("Loaded adapter factors for {} layers", delta.len());
        Ok(delta)
    }
}
