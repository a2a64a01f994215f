//! Image config and manifest documents
//!
//! The document types come from `oci-spec`; this module holds the media
//! types kiln writes and the conversions that keep docker's quirks out of
//! the rest of the crate.

use crate::error::{KilnError, KilnResult};
use oci_spec::image::{
    Arch, Config, Descriptor, DescriptorBuilder, ImageConfiguration, ImageConfigurationBuilder,
    ImageManifest, ImageManifestBuilder, MediaType, Os, RootFsBuilder,
};
use oci_spec::OciSpecError;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";

/// Returns `true` for docker (schema 2) media types
pub fn is_docker_media_type(media_type: &str) -> bool {
    media_type.starts_with("application/vnd.docker.")
}

/// Architecture of the current host in GOARCH spelling
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

fn format_error(what: &str, e: OciSpecError) -> KilnError {
    KilnError::ImageFormat {
        name: what.to_string(),
        reason: e.to_string(),
    }
}

/// Parse a config blob
pub fn parse_config(name: &str, bytes: &[u8]) -> KilnResult<ImageConfiguration> {
    serde_json::from_slice(bytes).map_err(|e| KilnError::ImageFormat {
        name: name.to_string(),
        reason: format!("config blob: {}", e),
    })
}

/// Diff IDs of a parsed config, bottom first
pub fn diff_ids(config: &ImageConfiguration) -> &[String] {
    config.rootfs().diff_ids()
}

/// Assemble a config blob
pub fn build_config(
    architecture: &str,
    os: &str,
    runtime: Config,
    diff_ids: Vec<String>,
) -> KilnResult<ImageConfiguration> {
    let rootfs = RootFsBuilder::default()
        .typ("layers")
        .diff_ids(diff_ids)
        .build()
        .map_err(|e| format_error("rootfs", e))?;

    ImageConfigurationBuilder::default()
        .architecture(Arch::from(architecture))
        .os(Os::from(os))
        .config(runtime)
        .rootfs(rootfs)
        .build()
        .map_err(|e| format_error("config", e))
}

/// Descriptor for a blob of `size` bytes
pub fn descriptor(media_type: &str, digest: &str, size: u64) -> KilnResult<Descriptor> {
    DescriptorBuilder::default()
        .media_type(MediaType::from(media_type))
        .digest(digest.to_string())
        .size(size as i64)
        .build()
        .map_err(|e| format_error(digest, e))
}

/// Single-platform manifest. Docker flavour when any layer carries a docker media type.
pub fn build_manifest(config: Descriptor, layers: Vec<Descriptor>) -> KilnResult<ImageManifest> {
    let docker = layers
        .iter()
        .any(|l| is_docker_media_type(&l.media_type().to_string()));
    let media_type = if docker {
        MEDIA_TYPE_DOCKER_MANIFEST
    } else {
        MEDIA_TYPE_OCI_MANIFEST
    };

    ImageManifestBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::from(media_type))
        .config(config)
        .layers(layers)
        .build()
        .map_err(|e| format_error("manifest", e))
}
