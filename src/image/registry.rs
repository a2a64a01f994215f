//! Registry access over the OCI distribution API
//!
//! Wraps `oci-distribution`. Credentials come from the `auths` section of
//! the docker `config.json`; registries without an entry are used
//! anonymously.

use super::oci::host_architecture;
use super::reference::{registry_scheme, ImageRef, DOCKER_HUB};
use crate::error::{KilnError, KilnResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Registry credentials from a docker `config.json`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerCredentials {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

impl DockerCredentials {
    /// Read `config.json` from `dir`; a missing or unreadable file means no credentials
    pub fn load(dir: &Path) -> Self {
        let path = dir.join("config.json");
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                debug!("Ignoring unparseable {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    fn encoded(&self, registry: &str) -> Option<&str> {
        let candidates: Vec<String> = if registry == DOCKER_HUB {
            vec![
                "https://index.docker.io/v1/".to_string(),
                "index.docker.io".to_string(),
                "docker.io".to_string(),
                DOCKER_HUB.to_string(),
            ]
        } else {
            vec![registry.to_string(), format!("https://{}", registry)]
        };

        candidates
            .iter()
            .filter_map(|key| self.auths.get(key))
            .find_map(|entry| entry.auth.as_deref())
            .filter(|auth| !auth.is_empty())
    }

    /// Auth for a registry host; anonymous when there is no usable entry
    pub fn auth_for(&self, registry: &str) -> RegistryAuth {
        let decoded = self
            .encoded(registry)
            .and_then(|auth| STANDARD.decode(auth).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());

        match decoded.as_deref().and_then(|pair| pair.split_once(':')) {
            Some((user, password)) => RegistryAuth::Basic(user.to_string(), password.to_string()),
            None => RegistryAuth::Anonymous,
        }
    }

    fn has_auth(&self, registry: &str) -> bool {
        matches!(self.auth_for(registry), RegistryAuth::Basic(..))
    }
}

/// A single-platform manifest with its config blob
pub struct FetchedManifest {
    pub manifest: OciImageManifest,
    pub digest: String,
    pub config: Vec<u8>,
}

/// A blob that should end up in the target repository
pub enum PushBlob<'a> {
    /// Bytes kiln holds
    Data { bytes: Vec<u8>, media_type: String },
    /// Already stored in `source`
    Existing { source: &'a ImageRef, digest: &'a str, media_type: &'a str, size: u64 },
}

/// Registry access with one credential set.
///
/// Each operation gets its own `oci-distribution` client, configured for
/// the registries it touches.
pub struct RegistryClient {
    credentials: DockerCredentials,
}

impl RegistryClient {
    pub fn new(credentials: DockerCredentials) -> Self {
        Self { credentials }
    }

    fn client_for<'a>(&self, registries: impl IntoIterator<Item = &'a str>) -> Client {
        let config = ClientConfig {
            protocol: ClientProtocol::HttpsExcept(plain_http_registries(registries)),
            platform_resolver: Some(Box::new(host_platform_resolver)),
            ..Default::default()
        };
        Client::new(config)
    }

    fn auth(&self, image: &ImageRef) -> RegistryAuth {
        self.credentials.auth_for(&image.registry)
    }

    /// Resolve `image` to a single-platform manifest, its digest and config blob.
    ///
    /// An index is narrowed to the host platform.
    pub async fn fetch_manifest(&self, image: &ImageRef) -> KilnResult<FetchedManifest> {
        let reference = to_oci_reference(image)?;
        let (manifest, digest, config) = self
            .client_for([image.registry.as_str()])
            .pull_manifest_and_config(&reference, &self.auth(image))
            .await
            .map_err(|e| self.access_error(image, "pulling manifest", e))?;

        debug!("Resolved {} to {}", image, digest);
        Ok(FetchedManifest {
            manifest,
            digest,
            config: config.into_bytes(),
        })
    }

    /// Download a blob from `image`'s repository
    pub async fn fetch_blob(&self, image: &ImageRef, digest: &str, media_type: &str, size: u64) -> KilnResult<Vec<u8>> {
        let client = self.client_for([image.registry.as_str()]);
        self.fetch_blob_with(&client, image, digest, media_type, size).await
    }

    async fn fetch_blob_with(
        &self,
        client: &Client,
        image: &ImageRef,
        digest: &str,
        media_type: &str,
        size: u64,
    ) -> KilnResult<Vec<u8>> {
        let reference = to_oci_reference(image)?;
        client
            .auth(&reference, &self.auth(image), RegistryOperation::Pull)
            .await
            .map_err(|e| self.access_error(image, "authenticating", e))?;

        let descriptor = OciDescriptor {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size: size as i64,
            ..Default::default()
        };
        let mut bytes = Vec::with_capacity(size as usize);
        client
            .pull_blob(&reference, &descriptor, &mut bytes)
            .await
            .map_err(|e| self.access_error(image, &format!("pulling blob {}", digest), e))?;
        Ok(bytes)
    }

    /// Push blobs, config and manifest under `target`'s tag. Returns the manifest digest.
    ///
    /// Existing blobs in the same registry are mounted; blobs elsewhere are
    /// copied through memory.
    pub async fn push(
        &self,
        target: &ImageRef,
        blobs: Vec<PushBlob<'_>>,
        config: Vec<u8>,
        config_media_type: &str,
        manifest: OciImageManifest,
    ) -> KilnResult<String> {
        let reference = to_oci_reference(target)?;
        let sources = blobs.iter().filter_map(|blob| match blob {
            PushBlob::Existing { source, .. } => Some(source.registry.as_str()),
            PushBlob::Data { .. } => None,
        });
        let client = self.client_for(sources.chain([target.registry.as_str()]));
        let auth = self.auth(target);
        client
            .auth(&reference, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| self.access_error(target, "authenticating", e))?;

        let mut layers = Vec::with_capacity(blobs.len());
        for blob in blobs {
            match blob {
                PushBlob::Data { bytes, media_type } => {
                    layers.push(ImageLayer::new(bytes, media_type, None));
                }
                PushBlob::Existing { source, digest, media_type, size } => {
                    if mount(&client, &reference, source, digest).await {
                        continue;
                    }
                    let bytes = self.fetch_blob_with(&client, source, digest, media_type, size).await?;
                    layers.push(ImageLayer::new(bytes, media_type.to_string(), None));
                }
            }
        }

        let response = client
            .push(
                &reference,
                &layers,
                Config::new(config, config_media_type.to_string(), None),
                &auth,
                Some(manifest),
            )
            .await
            .map_err(|e| self.access_error(target, "pushing image", e))?;
        info!("Pushed {}", response.manifest_url);

        let (_, digest) = client
            .pull_manifest(&reference, &auth)
            .await
            .map_err(|e| self.access_error(target, "reading back manifest", e))?;
        Ok(digest)
    }

    fn access_error(&self, image: &ImageRef, action: &str, e: OciDistributionError) -> KilnError {
        if is_not_found(&e, self.credentials.has_auth(&image.registry)) {
            return KilnError::ImageNotFound(image.to_string());
        }
        KilnError::image_access(image.to_string(), format!("{}: {}", action, e))
    }
}

/// Cross-repository mount; `false` when the registry declines
async fn mount(client: &Client, target: &Reference, source: &ImageRef, digest: &str) -> bool {
    if source.registry != target.registry() {
        return false;
    }
    let Ok(from) = to_oci_reference(source) else {
        return false;
    };
    match client.mount_blob(target, &from, digest).await {
        Ok(()) => {
            debug!("Mounted {} from {}", digest, source);
            true
        }
        Err(e) => {
            debug!("Mount of {} from {} declined: {}", digest, source, e);
            false
        }
    }
}

/// Whether an error means the image does not exist. Anonymous requests to
/// a repository that does not exist are answered with 401.
fn is_not_found(e: &OciDistributionError, authenticated: bool) -> bool {
    match e {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|err| {
            matches!(err.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)
                || (!authenticated && matches!(err.code, OciErrorCode::Unauthorized | OciErrorCode::Denied))
        }),
        OciDistributionError::AuthenticationFailure(_) | OciDistributionError::UnauthorizedError { .. } => {
            !authenticated
        }
        _ => false,
    }
}

fn to_oci_reference(image: &ImageRef) -> KilnResult<Reference> {
    let raw = image.to_string();
    raw.parse::<Reference>()
        .map_err(|e| KilnError::InvalidReference(format!("{}: {}", raw, e)))
}

/// The registries among `registries` that speak plain HTTP
fn plain_http_registries<'a>(registries: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut plain: Vec<String> = registries
        .into_iter()
        .filter(|registry| registry_scheme(registry) == "http")
        .map(str::to_string)
        .collect();
    plain.dedup();
    plain
}

/// Picks the linux manifest for the host architecture out of an index
fn host_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
