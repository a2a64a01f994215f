//! Export: build output to layers plus the provenance record
//!
//! The launch directory holds `app/`, `config/` and, per buildpack,
//! `<buildpack-id>/<name>/` artifact directories with a `<name>.toml`
//! descriptor next to each. Every artifact directory becomes one layer.
//! An artifact whose directory was not produced this time is carried over
//! from the previous image when its provenance label records it.

use crate::error::{KilnError, KilnResult};
use crate::image::{Image, ImageStore, Layer};
use crate::layer::LayerBuilder;
use crate::lifecycle::BuildpackGroup;
use crate::metadata::{
    BuildMetadata, BuildpackMetadata, LayerMetadata, LayerSha, RunImageMetadata, METADATA_LABEL,
    STACK_LABEL,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Descriptor that belongs to the buildpack rather than to an artifact
const LAUNCH_DESCRIPTOR: &str = "launch.toml";

/// Previously built image and its decoded provenance label
#[derive(Debug, Clone)]
pub struct PreviousImage {
    pub image: Image,
    pub metadata: BuildMetadata,
}

/// Layers to append on top of the run image, and the record describing them
#[derive(Debug, Clone)]
pub struct ExportPlan {
    /// Everything but `run_image`, which is filled in by [`assemble`]
    pub metadata: BuildMetadata,
    /// `app`, `config`, then artifact layers in group order
    pub layers: Vec<Layer>,
}

/// Walks a launch directory and decides what goes into the image
pub struct Exporter<'a> {
    group: &'a BuildpackGroup,
    launch_dir: &'a Path,
    previous: Option<&'a PreviousImage>,
    builder: LayerBuilder,
}

impl<'a> Exporter<'a> {
    pub fn new(group: &'a BuildpackGroup, launch_dir: &'a Path) -> Self {
        Self {
            group,
            launch_dir,
            previous: None,
            builder: LayerBuilder::default(),
        }
    }

    pub fn with_previous(mut self, previous: Option<&'a PreviousImage>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_builder(mut self, builder: LayerBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn plan(&self) -> KilnResult<ExportPlan> {
        let mut metadata = BuildMetadata::default();
        let mut layers = Vec::new();

        let app = self.builder.build(&self.launch_dir.join("app"), "launch/app")?;
        metadata.app = LayerSha {
            sha: app.digest.clone(),
        };
        layers.push(app);

        let config = self.config_layer()?;
        metadata.config = LayerSha {
            sha: config.digest.clone(),
        };
        layers.push(config);

        for bp in &self.group.buildpacks {
            let mut record = BuildpackMetadata {
                key: bp.id.clone(),
                ..BuildpackMetadata::default()
            };

            for name in self.artifact_names(&bp.id)? {
                if let Some((layer, entry)) = self.artifact(&bp.id, &name)? {
                    record.layers.insert(name, entry);
                    layers.push(layer);
                }
            }

            metadata.buildpacks.push(record);
        }

        Ok(ExportPlan { metadata, layers })
    }

    /// `launch/config`, or an empty layer when buildpacks wrote no config
    fn config_layer(&self) -> KilnResult<Layer> {
        let dir = self.launch_dir.join("config");
        if dir.is_dir() {
            return self.builder.build(&dir, "launch/config");
        }

        let empty = tempfile::tempdir()
            .map_err(|e| KilnError::io("creating empty config dir", e))?;
        self.builder.build(empty.path(), "launch/config")
    }

    /// Artifact names declared by descriptors in a buildpack's directory, sorted
    fn artifact_names(&self, bp_id: &str) -> KilnResult<Vec<String>> {
        let dir = self.launch_dir.join(bp_id);
        if !dir.is_dir() {
            debug!("Buildpack {} wrote no launch directory", bp_id);
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| KilnError::io(format!("listing {}", dir.display()), e))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name == LAUNCH_DESCRIPTOR {
                continue;
            }
            if let Some(name) = file_name.strip_suffix(".toml") {
                if !name.is_empty() && entry.path().is_file() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn artifact(&self, bp_id: &str, name: &str) -> KilnResult<Option<(Layer, LayerMetadata)>> {
        let dir = self.launch_dir.join(bp_id).join(name);

        if dir.is_dir() {
            let data = read_descriptor(&self.launch_dir.join(bp_id).join(format!("{}.toml", name)))?;
            let layer = self.builder.build(&dir, &format!("launch/{}/{}", bp_id, name))?;
            let entry = LayerMetadata {
                sha: layer.digest.clone(),
                data,
            };
            return Ok(Some((layer, entry)));
        }

        let Some(previous) = self.previous else {
            debug!("Artifact {}/{} declared but not produced", bp_id, name);
            return Ok(None);
        };
        let Some(recorded) = previous.metadata.layer(bp_id, name) else {
            debug!("Artifact {}/{} not produced and not in previous image", bp_id, name);
            return Ok(None);
        };

        match previous.image.find_layer(&recorded.sha) {
            Some(layer) => {
                info!("Reusing {}/{} from {}", bp_id, name, previous.image.name);
                Ok(Some((layer.clone(), recorded.clone())))
            }
            None => {
                warn!(
                    "Previous image {} records {}/{} as {} but has no such layer",
                    previous.image.name, bp_id, name, recorded.sha
                );
                Ok(None)
            }
        }
    }
}

/// Descriptor content as JSON
fn read_descriptor(path: &Path) -> KilnResult<serde_json::Value> {
    let text = fs::read_to_string(path)
        .map_err(|e| KilnError::io(format!("reading descriptor {}", path.display()), e))?;
    let value: toml::Value = toml::from_str(&text).map_err(|e| KilnError::LayerConstruction {
        path: PathBuf::from(path),
        reason: format!("invalid descriptor: {}", e),
    })?;
    Ok(serde_json::to_value(value)?)
}

/// Stack the planned layers on the run image and label the result.
///
/// Everything happens in memory through the store's append/label calls; the
/// caller persists the returned image with a single `write`.
pub fn assemble(
    store: &dyn ImageStore,
    run_image: &Image,
    repo_name: &str,
    plan: ExportPlan,
    stack_id: Option<&str>,
) -> KilnResult<Image> {
    let ExportPlan {
        mut metadata,
        layers,
    } = plan;

    metadata.run_image = RunImageMetadata {
        name: run_image.name.clone(),
        sha: run_image.top_diff_id()?.to_string(),
    };

    let mut image = Image::derive(run_image, repo_name);
    for layer in layers {
        image = store.append_layer(image, layer);
    }
    image = store.set_label(image, METADATA_LABEL, &metadata.to_label()?);
    if let Some(stack_id) = stack_id {
        image = store.set_label(image, STACK_LABEL, stack_id);
    }
    Ok(image)
}
