//! # merge-lora-rs
//!
//! Merge a LoRA adapter into its Whisper-style base model and export the
//! result as a standalone bundle.
//!
//! The merged weights are `W' = W + scale · (B · A)` for every layer the
//! adapter targets. The bundle carries the merged weights together with the
//! vocabulary, feature-extraction config and language/task config, so it
//! loads without the base model or the adapter.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Merge output/checkpoint-final into models/<base>-finetune
//! merge-lora --lora-model output/checkpoint-final --language Chinese --task transcribe
//!
//! # Inspect an exported bundle
//! merge-lora inspect models/whisper-tiny-finetune
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use merge_lora_rs::config::RunSettings;
//! use merge_lora_rs::{MergeConfig, Pipeline};
//!
//! # fn main() -> merge_lora_rs::Result<()> {
//! let settings = RunSettings {
//!     lora_model: Some("output/checkpoint-final".into()),
//!     task: Some("translate".into()),
//!     ..Default::default()
//! };
//! let config = MergeConfig::try_from(settings)?;
//! let bundle = Pipeline::new(config).run()?;
//! println!("{}", bundle.display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod artifacts;
pub mod config;
pub mod device;
pub mod error;
pub mod export;
pub mod hub;
pub mod merge;
pub mod model;
pub mod pipeline;
pub mod store;

pub use adapter::{AdapterDelta, AdapterDescriptor, LayerDelta};
pub use artifacts::{ArtifactCoordinator, ArtifactSet};
pub use config::{MergeConfig, Task};
pub use error::{MergeError, Result};
pub use export::{Bundle, BundleExporter};
pub use merge::merge;
pub use model::{BaseModel, MergedModel};
pub use pipeline::{Pipeline, Stage};
