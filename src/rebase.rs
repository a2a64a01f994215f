//! Rebase: swap an image's base layers without rebuilding
//!
//! The provenance label records the diffID of the topmost run image layer.
//! Everything above that layer belongs to the app and is carried over by
//! value onto the new base.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::error::{KilnError, KilnResult};
use crate::image::{Image, ImageStore, Layer};
use crate::lifecycle::cancellable;
use crate::metadata::{BuildMetadata, RunImageMetadata, METADATA_LABEL, STACK_LABEL};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Read-only view of the base part of an image
pub struct BaseLayers<'a> {
    layers: &'a [Layer],
    boundary: usize,
}

impl<'a> BaseLayers<'a> {
    /// Base layers of `image` up to and including the layer with `diff_id`
    pub fn truncate(image: &'a Image, diff_id: &str) -> KilnResult<Self> {
        let boundary = image
            .layers
            .iter()
            .position(|l| l.diff_id == diff_id)
            .ok_or_else(|| KilnError::RebaseBoundaryNotFound {
                image: image.name.clone(),
                diff_id: diff_id.to_string(),
            })?;
        Ok(Self {
            layers: &image.layers[..=boundary],
            boundary,
        })
    }

    pub fn layers(&self) -> &'a [Layer] {
        self.layers
    }

    /// Index of the topmost base layer
    pub fn boundary(&self) -> usize {
        self.boundary
    }
}

/// `target` with its base replaced by `new_base`. Nothing is persisted.
pub fn rebase_image(
    store: &dyn ImageStore,
    target: &Image,
    metadata: &BuildMetadata,
    new_base: &Image,
) -> KilnResult<Image> {
    let base = BaseLayers::truncate(target, &metadata.run_image.sha)?;
    debug!(
        "{} sits on {} base layers",
        target.name,
        base.layers().len()
    );

    let mut rebased = Image::derive(new_base, target.name.clone());
    rebased.config = target.config.clone();
    for layer in &target.layers[base.boundary() + 1..] {
        rebased = store.append_layer(rebased, layer.clone());
    }

    let mut metadata = metadata.clone();
    metadata.run_image = RunImageMetadata {
        name: new_base.name.clone(),
        sha: new_base.top_diff_id()?.to_string(),
    };
    Ok(store.set_label(rebased, METADATA_LABEL, &metadata.to_label()?))
}

/// What to rebase and onto what
#[derive(Debug, Clone, Default)]
pub struct RebaseRequest {
    pub repo_name: String,
    /// New base; when absent it comes from the image's stack
    pub run_image: Option<String>,
    /// Stack to take the run image from, over the one recorded on the image
    pub stack: Option<String>,
}

/// Run image a rebase moves onto
pub fn resolve_run_image(config: &Config, target: &Image, request: &RebaseRequest) -> KilnResult<String> {
    if let Some(run_image) = &request.run_image {
        return Ok(run_image.clone());
    }
    let stack_id = request.stack.as_deref().or_else(|| target.label(STACK_LABEL));
    let stack = config.require_stack(stack_id)?;
    Ok(stack.require_run_image_for(&request.repo_name)?.to_string())
}

/// Rebase `request.repo_name` and write it back; returns the new digest.
///
/// With `puller` set both the target and the new base are pulled into the
/// engine before they are read; a failed pull is fatal. A target without
/// build metadata, or whose metadata names a layer it does not have, is left
/// untouched.
pub async fn run_rebase(
    store: &dyn ImageStore,
    puller: Option<&dyn ContainerEngine>,
    config: &Config,
    request: &RebaseRequest,
    cancel: &CancellationToken,
) -> KilnResult<String> {
    if let Some(engine) = puller {
        cancellable(cancel, engine.pull_image(&request.repo_name)).await?;
    }
    let target = cancellable(cancel, store.read_existing(&request.repo_name)).await?;
    let label = target
        .label(METADATA_LABEL)
        .ok_or_else(|| KilnError::MissingProvenance(target.name.clone()))?;
    let metadata = BuildMetadata::from_label(&target.name, label)?;

    let new_base_name = resolve_run_image(config, &target, request)?;
    if let Some(engine) = puller {
        cancellable(cancel, engine.pull_image(&new_base_name)).await?;
    }
    let new_base = cancellable(cancel, store.read_existing(&new_base_name)).await?;

    let rebased = rebase_image(store, &target, &metadata, &new_base)?;
    info!(
        "Rebasing {} from {} onto {}",
        target.name, metadata.run_image.name, new_base.name
    );

    let digest = cancellable(cancel, store.write(&rebased)).await?;
    info!("Replaced {} ({})", rebased.name, digest);
    Ok(digest)
}
