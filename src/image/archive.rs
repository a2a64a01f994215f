//! `docker save` / `docker load` archives

use super::oci::{self, MEDIA_TYPE_DOCKER_LAYER};
use super::{Image, ImageConfig, Layer, LayerBlob};
use crate::error::{KilnError, KilnResult};
use crate::layer::sha256_digest;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Option<Vec<String>>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// `name` with `:latest` added when it carries no tag
pub fn tagged(name: &str) -> KilnResult<String> {
    if name.contains('@') {
        return Err(KilnError::InvalidReference(format!(
            "{} is pinned to a digest and cannot be tagged",
            name
        )));
    }
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') {
        Ok(name.to_string())
    } else {
        Ok(format!("{}:latest", name))
    }
}

fn format_error(name: &str, reason: impl ToString) -> KilnError {
    KilnError::ImageFormat {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}

/// Decode an archive produced by `docker save <name>`
pub fn decode(name: &str, archive: &[u8]) -> KilnResult<Image> {
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    let mut reader = tar::Archive::new(archive);
    let entries = reader.entries().map_err(|e| format_error(name, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| format_error(name, e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| format_error(name, e))?
            .to_string_lossy()
            .into_owned();
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| format_error(name, e))?;
        files.insert(normalize(&path).to_string(), contents);
    }

    let manifest_bytes = files
        .get("manifest.json")
        .ok_or_else(|| format_error(name, "archive has no manifest.json"))?;
    let mut entries: Vec<ManifestEntry> = serde_json::from_slice(manifest_bytes)?;
    if entries.is_empty() {
        return Err(format_error(name, "manifest.json lists no images"));
    }
    let entry = entries.swap_remove(0);

    let config_bytes = files
        .get(normalize(&entry.config))
        .ok_or_else(|| format_error(name, format!("missing config {}", entry.config)))?;
    let config_file = oci::parse_config(name, config_bytes)?;
    let diff_ids = oci::diff_ids(&config_file);

    if diff_ids.len() != entry.layers.len() {
        return Err(format_error(
            name,
            format!("{} layers but {} diff IDs", entry.layers.len(), diff_ids.len()),
        ));
    }

    let mut layers = Vec::with_capacity(entry.layers.len());
    for (path, diff_id) in entry.layers.iter().zip(diff_ids) {
        let blob = files
            .get(normalize(path))
            .ok_or_else(|| format_error(name, format!("missing layer {}", path)))?;
        let media_type = if blob.starts_with(&GZIP_MAGIC) {
            format!("{}.gzip", MEDIA_TYPE_DOCKER_LAYER)
        } else {
            MEDIA_TYPE_DOCKER_LAYER.to_string()
        };
        layers.push(Layer {
            digest: sha256_digest(blob),
            diff_id: diff_id.clone(),
            media_type,
            size: blob.len() as u64,
            blob: LayerBlob::Bytes(Arc::from(blob.as_slice())),
            prefix: None,
        });
    }

    let mut image = Image::new(name, layers, ImageConfig::from_file(&config_file));
    image.digest = Some(sha256_digest(config_bytes));
    Ok(image)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, contents: &[u8]) -> KilnResult<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_mode(0o644);
    header.set_size(contents.len() as u64);
    builder
        .append_data(&mut header, path, contents)
        .map_err(|e| KilnError::io(format!("adding {} to image archive", path), e))
}

/// Encode `image` for `docker load`. Returns the archive and the image ID.
pub fn encode(image: &Image) -> KilnResult<(Vec<u8>, String)> {
    let config_bytes = serde_json::to_vec(&image.config.to_file(&image.layers)?)?;
    let image_id = sha256_digest(&config_bytes);
    let config_path = format!("{}.json", hex_of(&image_id));

    let mut builder = tar::Builder::new(Vec::new());
    let mut written = HashSet::new();
    let mut layer_paths = Vec::with_capacity(image.layers.len());

    for layer in &image.layers {
        let path = format!("{}/layer.tar", hex_of(&layer.digest));
        if written.insert(path.clone()) {
            append_file(&mut builder, &path, layer.bytes()?)?;
        }
        layer_paths.push(path);
    }

    append_file(&mut builder, &config_path, &config_bytes)?;

    let manifest = vec![ManifestEntry {
        config: config_path,
        repo_tags: Some(vec![tagged(&image.name)?]),
        layers: layer_paths,
    }];
    append_file(&mut builder, "manifest.json", &serde_json::to_vec(&manifest)?)?;

    let archive = builder
        .into_inner()
        .map_err(|e| KilnError::io("finishing image archive", e))?;
    Ok((archive, image_id))
}

fn hex_of(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
