//! Build session and buildpack group

use crate::error::{KilnError, KilnResult};
use crate::image::ImageRef;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// Volumes a session mounts into its phase containers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionVolumes {
    /// App source and buildpack output; removed when the session ends
    pub launch: String,
    /// Detection output; removed when the session ends
    pub workspace: String,
    /// Incremental build cache, keyed by app dir; never removed by a session
    pub cache: String,
}

impl SessionVolumes {
    fn new(id: &Uuid, app_dir: &Path) -> Self {
        let id = id.simple().to_string();
        Self {
            launch: format!("kiln-launch-{}", id),
            workspace: format!("kiln-workspace-{}", id),
            cache: cache_volume_name(app_dir),
        }
    }
}

/// Cache volume for an app directory: same directory, same volume
pub fn cache_volume_name(app_dir: &Path) -> String {
    let hash = Sha256::digest(app_dir.to_string_lossy().as_bytes());
    format!("kiln-cache-{}", &hex::encode(hash)[..12])
}

/// One build invocation
#[derive(Debug, Clone)]
pub struct BuildSession {
    pub id: Uuid,
    /// Absolute path of the app source
    pub app_dir: PathBuf,
    pub build_image: String,
    pub run_image: String,
    pub repo_name: String,
    pub publish: bool,
    /// Recorded on the image so a later rebase can find the stack's run image
    pub stack_id: Option<String>,
    pub volumes: SessionVolumes,
}

impl BuildSession {
    pub fn new(
        app_dir: &Path,
        build_image: impl Into<String>,
        run_image: impl Into<String>,
        repo_name: impl Into<String>,
        publish: bool,
    ) -> KilnResult<Self> {
        let app_dir = app_dir
            .canonicalize()
            .map_err(|e| KilnError::io(format!("resolving app dir {}", app_dir.display()), e))?;
        if !app_dir.is_dir() {
            return Err(KilnError::io(
                format!("app dir {}", app_dir.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let repo_name = repo_name.into();
        ImageRef::parse(&repo_name)?;

        let id = Uuid::new_v4();
        Ok(Self {
            volumes: SessionVolumes::new(&id, &app_dir),
            id,
            app_dir,
            build_image: build_image.into(),
            run_image: run_image.into(),
            repo_name,
            publish,
            stack_id: None,
        })
    }

    pub fn with_stack(mut self, stack_id: impl Into<String>) -> Self {
        self.stack_id = Some(stack_id.into());
        self
    }

    /// Short form of the session ID used in container names
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// A buildpack selected by detection
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Buildpack {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

/// Buildpacks selected by detection, in order, plus the build image to use
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildpackGroup {
    #[serde(default)]
    pub buildpacks: Vec<Buildpack>,
    #[serde(default, alias = "repository")]
    pub build_image: String,
}

impl BuildpackGroup {
    /// Decode the detector's `group.toml`
    pub fn parse(bytes: &[u8]) -> KilnResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| KilnError::DetectionFailed(format!("group.toml is not UTF-8: {}", e)))?;
        let group: Self = toml::from_str(text)
            .map_err(|e| KilnError::DetectionFailed(format!("unparseable group.toml: {}", e)))?;

        if group.buildpacks.is_empty() {
            return Err(KilnError::DetectionFailed(
                "group.toml selects no buildpacks".to_string(),
            ));
        }
        if let Some(bp) = group.buildpacks.iter().find(|bp| bp.id.is_empty()) {
            return Err(KilnError::DetectionFailed(format!(
                "buildpack with empty id (version {:?})",
                bp.version
            )));
        }
        if let Some(bp) = group.buildpacks.iter().find(|bp| !is_relative_id(&bp.id)) {
            return Err(KilnError::DetectionFailed(format!(
                "buildpack id {:?} is not a relative path",
                bp.id
            )));
        }
        Ok(group)
    }

    /// The group's build image, falling back to the session's
    pub fn build_image_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.build_image.is_empty() {
            fallback
        } else {
            &self.build_image
        }
    }
}

/// Buildpack ids become directory names under the launch and cache dirs
pub fn is_relative_id(id: &str) -> bool {
    id.split('/').all(|segment| {
        !matches!(segment, "" | "." | "..")
            && matches!(
                Path::new(segment).components().next(),
                Some(Component::Normal(_))
            )
    })
}
