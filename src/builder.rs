//! Builder images: a stack build image with buildpacks baked in
//!
//! `builder.toml` names each buildpack's source directory and the groups
//! detection tries, in order. The buildpacks land in one layer under
//! `/buildpacks/<id>/<version>/` next to `/buildpacks/order.toml`, appended
//! to the stack's build image.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::error::{KilnError, KilnResult};
use crate::image::{Image, ImageStore, Layer};
use crate::layer::{LayerBuilder, LayerOptions};
use crate::lifecycle::{cancellable, is_relative_id};
use crate::metadata::STACK_LABEL;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Root of the buildpacks layer inside the image
pub const BUILDPACKS_DIR: &str = "buildpacks";

/// Version directory used when `builder.toml` gives none
pub const DEFAULT_VERSION: &str = "latest";

/// A buildpack and where its files come from
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildpackSource {
    pub id: String,
    /// Local directory, optionally as a `file://` URI. Relative paths are
    /// taken from the directory holding `builder.toml`.
    pub uri: String,
    #[serde(default = "default_version")]
    pub version: String,
}

/// One entry of a detection group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderEntry {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// Buildpacks detection tries together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderGroup {
    pub buildpacks: Vec<OrderEntry>,
}

/// Contents of `order.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildpackOrder {
    pub groups: Vec<OrderGroup>,
}

/// Parsed `builder.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuilderConfig {
    pub buildpacks: Vec<BuildpackSource>,
    #[serde(default)]
    pub groups: Vec<OrderGroup>,
    /// Directory relative URIs resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

impl BuilderConfig {
    /// Read and validate `builder.toml`
    pub async fn load(path: &Path) -> KilnResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading {}", path.display()), e))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::parse(&content, base_dir).map_err(|reason| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason,
        })
    }

    fn parse(content: &str, base_dir: PathBuf) -> Result<Self, String> {
        let mut config: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        config.base_dir = base_dir;

        if config.buildpacks.is_empty() {
            return Err("no buildpacks declared".to_string());
        }
        let mut seen = HashSet::new();
        for bp in &config.buildpacks {
            if !is_relative_id(&bp.id) || !is_relative_id(&bp.version) {
                return Err(format!("buildpack {:?}@{:?} cannot be a directory name", bp.id, bp.version));
            }
            if !seen.insert(bp.id.as_str()) {
                return Err(format!("buildpack {} is declared twice", bp.id));
            }
        }
        for entry in config.groups.iter().flat_map(|g| &g.buildpacks) {
            if !seen.contains(entry.id.as_str()) {
                return Err(format!("group names undeclared buildpack {}", entry.id));
            }
        }
        if config.groups.iter().any(|g| g.buildpacks.is_empty()) {
            return Err("empty group".to_string());
        }
        Ok(config)
    }

    /// Detection order; one group per buildpack when `builder.toml` has none
    pub fn order(&self) -> BuildpackOrder {
        if !self.groups.is_empty() {
            return BuildpackOrder {
                groups: self.groups.clone(),
            };
        }
        BuildpackOrder {
            groups: self
                .buildpacks
                .iter()
                .map(|bp| OrderGroup {
                    buildpacks: vec![OrderEntry {
                        id: bp.id.clone(),
                        version: bp.version.clone(),
                        optional: false,
                    }],
                })
                .collect(),
        }
    }

    /// Local directory a buildpack's files come from
    pub fn source_dir(&self, bp: &BuildpackSource) -> KilnResult<PathBuf> {
        let raw = match bp.uri.split_once("://") {
            Some(("file", path)) => path,
            Some((scheme, _)) => {
                return Err(KilnError::ConfigInvalid {
                    path: self.base_dir.join("builder.toml"),
                    reason: format!("buildpack {}: {} URIs are not supported", bp.id, scheme),
                })
            }
            None => bp.uri.as_str(),
        };
        let dir = self.base_dir.join(raw);
        if !dir.is_dir() {
            return Err(KilnError::LayerConstruction {
                path: dir,
                reason: format!("source of buildpack {} is not a directory", bp.id),
            });
        }
        Ok(dir)
    }
}

fn copy_error(path: &Path, e: std::io::Error) -> KilnError {
    KilnError::LayerConstruction {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Copy a tree, keeping permission bits and symlinks
fn copy_tree(from: &Path, to: &Path) -> KilnResult<()> {
    fs::create_dir_all(to).map_err(|e| copy_error(to, e))?;
    fs::set_permissions(to, fs::metadata(from).map_err(|e| copy_error(from, e))?.permissions())
        .map_err(|e| copy_error(to, e))?;

    for entry in fs::read_dir(from).map_err(|e| copy_error(from, e))? {
        let entry = entry.map_err(|e| copy_error(from, e))?;
        let src = entry.path();
        let dest = to.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| copy_error(&src, e))?;

        if file_type.is_dir() {
            copy_tree(&src, &dest)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&src).map_err(|e| copy_error(&src, e))?;
            symlink(&target, &dest)?;
        } else {
            fs::copy(&src, &dest).map_err(|e| copy_error(&src, e))?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> KilnResult<()> {
    std::os::unix::fs::symlink(target, link).map_err(|e| copy_error(link, e))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> KilnResult<()> {
    Err(KilnError::LayerConstruction {
        path: link.to_path_buf(),
        reason: "symlinks in buildpacks need a unix host".to_string(),
    })
}

/// The `/buildpacks` layer for `config`
pub fn buildpacks_layer(config: &BuilderConfig, options: LayerOptions) -> KilnResult<Layer> {
    let staging = TempDir::new().map_err(|e| KilnError::io("creating buildpack staging dir", e))?;
    // The temp dir itself is private; the layer root must not be
    let root = staging.path().join(BUILDPACKS_DIR);
    fs::create_dir(&root).map_err(|e| copy_error(&root, e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&root, fs::Permissions::from_mode(0o755)).map_err(|e| copy_error(&root, e))?;
    }

    for bp in &config.buildpacks {
        let source = config.source_dir(bp)?;
        let dest = root.join(&bp.id).join(&bp.version);
        debug!("Staging buildpack {} from {}", bp.id, source.display());
        copy_tree(&source, &dest)?;
    }

    let order = toml::to_string_pretty(&config.order())?;
    let order_path = root.join("order.toml");
    fs::write(&order_path, order).map_err(|e| KilnError::io(format!("writing {}", order_path.display()), e))?;

    LayerBuilder::new(options).build(&root, BUILDPACKS_DIR)
}

/// What to build and from what
#[derive(Debug, Clone, Default)]
pub struct BuilderRequest {
    pub repo_name: String,
    pub builder_toml: PathBuf,
    /// Base image; when absent the stack's build image
    pub build_image: Option<String>,
    pub stack: Option<String>,
}

/// `builder` on top of `base`, labelled with the stack. Nothing is persisted.
pub fn assemble_builder(
    store: &dyn ImageStore,
    base: &Image,
    repo_name: &str,
    stack_id: &str,
    layer: Layer,
) -> Image {
    let image = store.append_layer(Image::derive(base, repo_name), layer);
    store.set_label(image, STACK_LABEL, stack_id)
}

/// Create the builder image and write it; returns its digest.
///
/// With `puller` set the base image is pulled into the engine first.
pub async fn create_builder(
    store: &dyn ImageStore,
    puller: Option<&dyn ContainerEngine>,
    config: &Config,
    request: &BuilderRequest,
    cancel: &CancellationToken,
) -> KilnResult<String> {
    let builder_config = BuilderConfig::load(&request.builder_toml).await?;
    let stack = config.require_stack(request.stack.as_deref())?;
    let base_name = match &request.build_image {
        Some(image) => image.clone(),
        None => stack.require_build_image_for(&request.repo_name)?.to_string(),
    };

    if let Some(engine) = puller {
        cancellable(cancel, engine.pull_image(&base_name)).await?;
    }
    let base = cancellable(cancel, store.read_existing(&base_name)).await?;

    let options = LayerOptions {
        uid: config.lifecycle.layer_uid,
        gid: config.lifecycle.layer_gid,
    };
    let layer = tokio::task::spawn_blocking(move || buildpacks_layer(&builder_config, options))
        .await
        .map_err(|e| KilnError::Internal(format!("buildpack staging failed: {}", e)))??;
    info!(
        "Adding buildpacks layer {} to {} for {}",
        layer.digest, base_name, request.repo_name
    );

    let image = assemble_builder(store, &base, &request.repo_name, &stack.id, layer);
    let digest = cancellable(cancel, store.write(&image)).await?;
    info!("Wrote builder {} ({})", image.name, digest);
    Ok(digest)
}
