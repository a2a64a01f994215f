//! Layer builder
//!
//! Turns a directory subtree into a deterministic tar blob. Headers carry
//! no timestamps or user names, so two directories with the same relative
//! paths, bytes, modes and link targets always produce the same digest.

use crate::error::{KilnError, KilnResult};
use crate::image::Layer;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Ownership written into tar headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerOptions {
    pub uid: u64,
    pub gid: u64,
}

impl Default for LayerOptions {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Builds layers with fixed ownership
#[derive(Debug, Clone, Default)]
pub struct LayerBuilder {
    options: LayerOptions,
}

impl LayerBuilder {
    pub fn new(options: LayerOptions) -> Self {
        Self { options }
    }

    /// Build a layer from `source`, naming every entry under `prefix`.
    ///
    /// Regular files keep their bytes and permission bits, directories are
    /// header-only and symlinks keep their target. Any other file kind is a
    /// `LayerConstruction` error.
    pub fn build(&self, source: &Path, prefix: &str) -> KilnResult<Layer> {
        let blob = tar_directory(source, prefix, &self.options)?;
        let layer = Layer::from_tar(blob, Some(normalize_prefix(prefix)));
        debug!(
            "Built layer {} from {} ({} bytes)",
            layer.digest,
            source.display(),
            layer.size()
        );
        Ok(layer)
    }
}

/// Build a layer with default ownership
pub fn build_layer(source: &Path, prefix: &str) -> KilnResult<Layer> {
    LayerBuilder::default().build(source, prefix)
}

/// `sha256:<hex>` digest of a byte string
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

fn construction_error(path: &Path, reason: impl ToString) -> KilnError {
    KilnError::LayerConstruction {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Every path below `root`, relative to it, in byte order
fn walk_sorted(root: &Path) -> KilnResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| construction_error(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| construction_error(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| construction_error(&path, e))?;
            if file_type.is_dir() {
                pending.push(path.clone());
            }
            let rel = path
                .strip_prefix(root)
                .map_err(|e| construction_error(&path, e))?
                .to_path_buf();
            paths.push(rel);
        }
    }

    paths.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    Ok(paths)
}

fn entry_name(prefix: &str, rel: &Path) -> PathBuf {
    if prefix.is_empty() {
        rel.to_path_buf()
    } else {
        Path::new(prefix).join(rel)
    }
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata) -> u32 {
    if meta.is_dir() {
        0o755
    } else if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn unsupported_kind(file_type: &fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_block_device() {
        "block device"
    } else if file_type.is_char_device() {
        "character device"
    } else {
        "unknown file type"
    }
}

#[cfg(not(unix))]
fn unsupported_kind(_file_type: &fs::FileType) -> &'static str {
    "unknown file type"
}

/// Tar the tree at `source` with entries named under `prefix`.
///
/// When the prefix is non-empty the prefix directory itself is the first entry.
pub fn tar_directory(source: &Path, prefix: &str, options: &LayerOptions) -> KilnResult<Vec<u8>> {
    let prefix = normalize_prefix(prefix);
    let root_meta = fs::metadata(source).map_err(|e| construction_error(source, e))?;
    if !root_meta.is_dir() {
        return Err(construction_error(source, "not a directory"));
    }

    let mut builder = tar::Builder::new(Vec::new());

    let new_header = |entry_type: tar::EntryType, mode: u32, size: u64| {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mtime(0);
        header.set_uid(options.uid);
        header.set_gid(options.gid);
        header.set_mode(mode);
        header.set_size(size);
        header
    };

    if !prefix.is_empty() {
        let mut header = new_header(tar::EntryType::Directory, mode_of(&root_meta), 0);
        builder
            .append_data(&mut header, &prefix, std::io::empty())
            .map_err(|e| construction_error(source, e))?;
    }

    for rel in walk_sorted(source)? {
        let path = source.join(&rel);
        let name = entry_name(&prefix, &rel);
        let meta = fs::symlink_metadata(&path).map_err(|e| construction_error(&path, e))?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            let mut header = new_header(tar::EntryType::Directory, mode_of(&meta), 0);
            builder
                .append_data(&mut header, &name, std::io::empty())
                .map_err(|e| construction_error(&path, e))?;
        } else if file_type.is_file() {
            let file = fs::File::open(&path).map_err(|e| construction_error(&path, e))?;
            let mut header = new_header(tar::EntryType::Regular, mode_of(&meta), meta.len());
            builder
                .append_data(&mut header, &name, file)
                .map_err(|e| construction_error(&path, e))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path).map_err(|e| construction_error(&path, e))?;
            let mut header = new_header(tar::EntryType::Symlink, 0o777, 0);
            builder
                .append_link(&mut header, &name, &target)
                .map_err(|e| construction_error(&path, e))?;
        } else {
            return Err(construction_error(
                &path,
                format!("unsupported {}", unsupported_kind(&file_type)),
            ));
        }
    }

    builder
        .into_inner()
        .map_err(|e| construction_error(source, e))
}

/// Tar holding one file
pub fn single_file_tar(name: &str, contents: &[u8]) -> KilnResult<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mtime(0);
    header.set_mode(0o666);
    header.set_size(contents.len() as u64);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, name, contents)
        .map_err(|e| KilnError::io(format!("creating tar for {}", name), e))?;
    builder
        .into_inner()
        .map_err(|e| KilnError::io(format!("finishing tar for {}", name), e))
}

/// Contents of the first regular file in a tar stream
pub fn read_single_file(archive: &[u8]) -> KilnResult<Vec<u8>> {
    let mut archive = tar::Archive::new(archive);
    let entries = archive
        .entries()
        .map_err(|e| KilnError::io("reading tar entries", e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| KilnError::io("reading tar entry", e))?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| KilnError::io("reading tar entry contents", e))?;
            return Ok(contents);
        }
    }

    Err(KilnError::io(
        "reading tar",
        std::io::Error::new(std::io::ErrorKind::NotFound, "archive holds no regular file"),
    ))
}

/// Unpack a tar stream under `dest`, keeping permission bits
pub fn unpack(archive: &[u8], dest: &Path) -> KilnResult<()> {
    let mut archive = tar::Archive::new(archive);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive
        .unpack(dest)
        .map_err(|e| KilnError::io(format!("unpacking into {}", dest.display()), e))
}
