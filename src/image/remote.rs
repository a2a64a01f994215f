//! Image store backed by a registry

use super::oci;
use super::registry::{DockerCredentials, PushBlob, RegistryClient};
use super::{Image, ImageConfig, ImageRef, ImageStore, Layer, LayerBlob};
use crate::error::{KilnError, KilnResult};
use crate::layer::sha256_digest;
use async_trait::async_trait;
use oci_distribution::manifest::OciImageManifest;
use std::path::PathBuf;
use tracing::info;

/// Reads and publishes images over the distribution API.
///
/// Layers read from a registry stay there until a write needs their bytes.
pub struct RemoteStore {
    client: RegistryClient,
}

impl RemoteStore {
    /// Store using credentials from `docker_config_dir/config.json`
    pub fn new(docker_config_dir: PathBuf) -> Self {
        Self::with_client(RegistryClient::new(DockerCredentials::load(&docker_config_dir)))
    }

    pub fn with_client(client: RegistryClient) -> Self {
        Self { client }
    }
}

async fn read_image(client: &RegistryClient, name: &str) -> KilnResult<Image> {
    let reference = ImageRef::parse(name)?;
    let fetched = client.fetch_manifest(&reference).await?;
    let config_file = oci::parse_config(name, &fetched.config)?;
    let diff_ids = oci::diff_ids(&config_file);
    let manifest = &fetched.manifest;

    if diff_ids.len() != manifest.layers.len() {
        return Err(KilnError::ImageFormat {
            name: name.to_string(),
            reason: format!(
                "{} layers but {} diff IDs",
                manifest.layers.len(),
                diff_ids.len()
            ),
        });
    }

    let layers = manifest
        .layers
        .iter()
        .zip(diff_ids)
        .map(|(desc, diff_id)| {
            Layer::remote(
                reference.clone(),
                desc.digest.clone(),
                diff_id.clone(),
                desc.media_type.clone(),
                desc.size.max(0) as u64,
            )
        })
        .collect();

    let mut image = Image::new(name, layers, ImageConfig::from_file(&config_file));
    image.digest = Some(fetched.digest);
    Ok(image)
}

/// Media type a layer is published under in a manifest of the given flavour
fn published_media_type(layer: &Layer, docker: bool) -> String {
    if docker && layer.media_type == oci::MEDIA_TYPE_OCI_LAYER {
        oci::MEDIA_TYPE_DOCKER_LAYER.to_string()
    } else {
        layer.media_type.clone()
    }
}

/// Config blob and manifest for `image`, in the flavour its base layers use
fn documents(image: &Image) -> KilnResult<(Vec<u8>, &'static str, OciImageManifest)> {
    let docker = image
        .layers
        .iter()
        .any(|l| oci::is_docker_media_type(&l.media_type));
    let config_type = if docker {
        oci::MEDIA_TYPE_DOCKER_CONFIG
    } else {
        oci::MEDIA_TYPE_OCI_CONFIG
    };

    let config = serde_json::to_vec(&image.config.to_file(&image.layers)?)?;
    let config_descriptor = oci::descriptor(config_type, &sha256_digest(&config), config.len() as u64)?;
    let layers = image
        .layers
        .iter()
        .map(|l| oci::descriptor(&published_media_type(l, docker), &l.digest, l.size()))
        .collect::<KilnResult<Vec<_>>>()?;
    let manifest = oci::build_manifest(config_descriptor, layers)?;

    // Same JSON, in the shape the distribution client pushes
    let manifest: OciImageManifest = serde_json::from_slice(&serde_json::to_vec(&manifest)?)?;
    Ok((config, config_type, manifest))
}

async fn write_image(client: &RegistryClient, image: &Image) -> KilnResult<String> {
    let target = ImageRef::parse(&image.name)?;
    if target.is_digest() {
        return Err(KilnError::InvalidReference(format!(
            "{} is pinned to a digest and cannot be published",
            image.name
        )));
    }

    let (config, config_type, manifest) = documents(image)?;
    let blobs = image
        .layers
        .iter()
        .zip(&manifest.layers)
        .map(|(layer, desc)| match &layer.blob {
            LayerBlob::Bytes(bytes) => PushBlob::Data {
                bytes: bytes.to_vec(),
                media_type: desc.media_type.clone(),
            },
            LayerBlob::Remote(source) => PushBlob::Existing {
                source,
                digest: &layer.digest,
                media_type: &layer.media_type,
                size: layer.size(),
            },
        })
        .collect();

    client.push(&target, blobs, config, config_type, manifest).await
}

#[async_trait]
impl ImageStore for RemoteStore {
    async fn read_existing(&self, name: &str) -> KilnResult<Image> {
        read_image(&self.client, name).await
    }

    async fn write(&self, image: &Image) -> KilnResult<String> {
        let digest = write_image(&self.client, image).await?;
        info!("Published {} as {}", image.name, digest);
        Ok(digest)
    }

    fn store_name(&self) -> &'static str {
        "remote"
    }
}
