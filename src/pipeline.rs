//! The merge pipeline.
//!
//! `Resolving → Loading → Merging → ArtifactLoading → Exporting → Done`,
//! strictly linear. Any error moves the run to `Failed` and is returned to
//! the caller unchanged.

use std::fmt;
use std::path::PathBuf;

use crate::adapter::{AdapterDelta, AdapterDescriptor};
use crate::artifacts::ArtifactCoordinator;
use crate::config::MergeConfig;
use crate::device::select_device;
use crate::error::Result;
use crate::export::BundleExporter;
use crate::hub::{resolve_model_dir, HubCache};
use crate::merge::merge;
use crate::model::BaseModel;
use crate::store::SafetensorsStore;

/// Pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Reading adapter metadata and locating the base model.
    Resolving,
    /// Loading base weights and adapter factors.
    Loading,
    /// Folding the deltas into the base weights.
    Merging,
    /// Loading auxiliary artifacts and applying overrides.
    ArtifactLoading,
    /// Writing the bundle.
    Exporting,
    /// Bundle written.
    Done,
    /// A stage returned an error.
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolving",
            Stage::Loading => "loading",
            Stage::Merging => "merging",
            Stage::ArtifactLoading => "artifact-loading",
            Stage::Exporting => "exporting",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One merge run.
///
/// # Example
///
/// ```no_run
/// use merge_lora_rs::{MergeConfig, Pipeline};
///
/// # fn main() -> merge_lora_rs::Result<()> {
/// let config = MergeConfig {
///     lora_model: "output/checkpoint-final".into(),
///     ..Default::default()
/// };
/// let bundle = Pipeline::new(config).run()?;
/// println!("merged model saved to {}", bundle.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Pipeline {
    config: MergeConfig,
    cache: HubCache,
    stage: Stage,
}

impl Pipeline {
    /// Pipeline resolving base models through the environment's hub cache.
    #[must_use]
    pub fn new(config: MergeConfig) -> Self {
        Self::with_cache(config, HubCache::from_env())
    }

    /// Pipeline resolving base models through an explicit hub cache.
    #[must_use]
    pub fn with_cache(config: MergeConfig, cache: HubCache) -> Self {
        Self {
            config,
            cache,
            stage: Stage::Resolving,
        }
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn enter(&mut self, stage: Stage) {
        tracing::info!("Stage: {}", stage);
        self.stage = stage;
    }

    /// Run every stage and return the bundle directory.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by any stage; the pipeline is left in
    /// [`Stage::Failed`].
    pub fn run(&mut self) -> Result<PathBuf> {
        let result = self.run_stages();
        match &result {
            Ok(_) => self.enter(Stage::Done),
            Err(err) => {
                tracing::error!("Merge failed while {}: {}", self.stage, err);
                self.stage = Stage::Failed;
            }
        }
        result
    }

    fn run_stages(&mut self) -> Result<PathBuf> {
        self.enter(Stage::Resolving);
        self.config.validate()?;
        let descriptor = AdapterDescriptor::from_dir(&self.config.lora_model)?;
        let model_dir = resolve_model_dir(
            &descriptor.base_model,
            &self.cache,
            self.config.local_files_only,
        )?;
        let device = select_device(self.config.device)?;

        self.enter(Stage::Loading);
        let base = BaseModel::load(&model_dir, &SafetensorsStore::new(&model_dir), &device)?;
        let delta = AdapterDelta::load(&self.config.lora_model, &descriptor, &device)?;

        self.enter(Stage::Merging);
        let merged = merge(&base, &delta)?;
        drop(base);
        drop(delta);

        self.enter(Stage::ArtifactLoading);
        let artifacts = ArtifactCoordinator::new(self.config.language.clone(), self.config.task)
            .load(&model_dir)?;

        self.enter(Stage::Exporting);
        BundleExporter::new(&self.config.output_dir).export(&descriptor.base_model, &merged, &artifacts)
    }
}
