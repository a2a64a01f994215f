//! In-memory images and the stores that persist them
//!
//! An [`Image`] is assembled entirely in memory; [`ImageStore::write`] is the
//! only call with an external side effect. The store is chosen once per
//! session by the publish flag: [`LocalStore`] talks to the container
//! engine's image store, [`RemoteStore`] to a registry.

pub mod archive;
pub mod local;
pub mod oci;
pub mod reference;
pub mod registry;
pub mod remote;

pub use local::LocalStore;
pub use reference::ImageRef;
pub use remote::RemoteStore;

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::error::{KilnError, KilnResult};
use crate::layer::sha256_digest;
use async_trait::async_trait;
use oci_spec::image::ImageConfiguration;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a layer's bytes live
#[derive(Debug, Clone)]
pub enum LayerBlob {
    /// Held in memory
    Bytes(Arc<[u8]>),
    /// Left in a registry repository; fetched only if a write needs it
    Remote(ImageRef),
}

/// An immutable image layer
#[derive(Debug, Clone)]
pub struct Layer {
    pub blob: LayerBlob,
    /// Digest of the stored blob
    pub digest: String,
    /// Digest of the uncompressed tar
    pub diff_id: String,
    pub media_type: String,
    pub size: u64,
    /// Path the layer was rooted at, for layers kiln built
    pub prefix: Option<String>,
}

impl Layer {
    /// Layer from an uncompressed tar; digest and diffID coincide
    pub fn from_tar(tar: Vec<u8>, prefix: Option<String>) -> Self {
        let digest = sha256_digest(&tar);
        Self {
            size: tar.len() as u64,
            blob: LayerBlob::Bytes(Arc::from(tar)),
            diff_id: digest.clone(),
            digest,
            media_type: oci::MEDIA_TYPE_OCI_LAYER.to_string(),
            prefix,
        }
    }

    /// Layer whose blob stays in a registry
    pub fn remote(
        source: ImageRef,
        digest: String,
        diff_id: String,
        media_type: String,
        size: u64,
    ) -> Self {
        Self {
            blob: LayerBlob::Remote(source),
            digest,
            diff_id,
            media_type,
            size,
            prefix: None,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Blob bytes, when held in memory
    pub fn bytes(&self) -> KilnResult<&[u8]> {
        match &self.blob {
            LayerBlob::Bytes(bytes) => Ok(bytes),
            LayerBlob::Remote(source) => Err(KilnError::Internal(format!(
                "layer {} is only available from {}",
                self.digest, source
            ))),
        }
    }
}

/// The parts of an image config kiln reads and writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageConfig {
    pub labels: BTreeMap<String, String>,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub os: String,
    pub architecture: String,
}

impl ImageConfig {
    /// Lift the runtime fields out of a config blob
    pub fn from_file(file: &ImageConfiguration) -> Self {
        let inner = file.config().clone().unwrap_or_default();
        let os = file.os().to_string();
        Self {
            labels: inner.labels().clone().unwrap_or_default().into_iter().collect(),
            env: inner.env().clone().unwrap_or_default(),
            entrypoint: inner.entrypoint().clone(),
            cmd: inner.cmd().clone(),
            working_dir: inner.working_dir().clone().filter(|w| !w.is_empty()),
            user: inner.user().clone().filter(|u| !u.is_empty()),
            os: if os.is_empty() { "linux".to_string() } else { os },
            architecture: file.architecture().to_string(),
        }
    }

    /// Config blob for a given layer stack
    pub fn to_file(&self, layers: &[Layer]) -> KilnResult<ImageConfiguration> {
        let mut runtime = oci_spec::image::Config::default();
        runtime
            .set_env(Some(self.env.clone()))
            .set_entrypoint(self.entrypoint.clone())
            .set_cmd(self.cmd.clone())
            .set_working_dir(self.working_dir.clone())
            .set_user(self.user.clone())
            .set_labels(Some(self.labels.clone().into_iter().collect()));

        let architecture = if self.architecture.is_empty() {
            oci::host_architecture()
        } else {
            &self.architecture
        };
        let os = if self.os.is_empty() { "linux" } else { &self.os };
        oci::build_config(
            architecture,
            os,
            runtime,
            layers.iter().map(|l| l.diff_id.clone()).collect(),
        )
    }
}

/// An image under construction or read back from a store
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub layers: Vec<Layer>,
    pub config: ImageConfig,
    /// Known only for images read from or written to a store
    pub digest: Option<String>,
}

impl Image {
    pub fn new(name: impl Into<String>, layers: Vec<Layer>, config: ImageConfig) -> Self {
        Self {
            name: name.into(),
            layers,
            config,
            digest: None,
        }
    }

    /// A new, unpersisted image named `name` on top of `base`
    pub fn derive(base: &Image, name: impl Into<String>) -> Self {
        Self::new(name, base.layers.clone(), base.config.clone())
    }

    pub fn with_layer(mut self, layer: Layer) -> Self {
        self.layers.push(layer);
        self.digest = None;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.labels.insert(key.into(), value.into());
        self.digest = None;
        self
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.get(key).map(String::as_str)
    }

    /// DiffID of the topmost layer
    pub fn top_diff_id(&self) -> KilnResult<&str> {
        self.layers
            .last()
            .map(|l| l.diff_id.as_str())
            .ok_or_else(|| KilnError::ImageFormat {
                name: self.name.clone(),
                reason: "image has no layers".to_string(),
            })
    }

    /// Layer with the given blob digest or diffID
    pub fn find_layer(&self, sha: &str) -> Option<&Layer> {
        self.layers
            .iter()
            .find(|l| l.digest == sha || l.diff_id == sha)
    }
}

/// Backend that reads and persists images
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Read an existing image. A missing image is `ImageNotFound`;
    /// anything else that goes wrong is `ImageAccess`.
    async fn read_existing(&self, name: &str) -> KilnResult<Image>;

    /// Append a layer. In memory only.
    fn append_layer(&self, image: Image, layer: Layer) -> Image {
        image.with_layer(layer)
    }

    /// Set a config label. In memory only.
    fn set_label(&self, image: Image, key: &str, value: &str) -> Image {
        image.with_label(key, value)
    }

    /// Persist `image` under its name and return its digest
    async fn write(&self, image: &Image) -> KilnResult<String>;

    /// Human-readable backend name
    fn store_name(&self) -> &'static str;
}

/// Pick the store for a session
pub fn select_store(
    publish: bool,
    engine: Arc<dyn ContainerEngine>,
    config: &Config,
) -> Box<dyn ImageStore> {
    if publish {
        Box::new(RemoteStore::new(config.engine.docker_config_dir()))
    } else {
        Box::new(LocalStore::new(engine))
    }
}
