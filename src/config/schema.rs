//! Configuration schema for kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use crate::error::{KilnError, KilnResult};
use crate::image::reference::registry_of;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stack used when none is configured or selected
pub const DEFAULT_STACK_ID: &str = "io.buildpacks.stacks.bionic";

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stack used when `--stack` is not given
    pub default_stack_id: String,

    /// General settings
    pub general: GeneralConfig,

    /// Container engine settings
    pub engine: EngineConfig,

    /// Lifecycle binaries and layer ownership
    pub lifecycle: LifecycleConfig,

    /// Known stacks
    pub stacks: Vec<Stack>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_stack_id: DEFAULT_STACK_ID.to_string(),
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            lifecycle: LifecycleConfig::default(),
            stacks: vec![Stack::builtin()],
        }
    }
}

impl Config {
    /// Append the built-in stack if the file did not declare it
    pub fn with_builtin_stack(mut self) -> Self {
        if !self.stacks.iter().any(|s| s.id == DEFAULT_STACK_ID) {
            self.stacks.push(Stack::builtin());
        }
        self
    }

    /// Look up a stack by id, falling back to `default_stack_id`
    pub fn stack(&self, id: Option<&str>) -> Option<&Stack> {
        let id = id.unwrap_or(&self.default_stack_id);
        self.stacks.iter().find(|s| s.id == id)
    }

    /// Like [`Config::stack`], but a missing stack is an error
    pub fn require_stack(&self, id: Option<&str>) -> KilnResult<&Stack> {
        self.stack(id).ok_or_else(|| {
            KilnError::StackNotFound(id.unwrap_or(&self.default_stack_id).to_string())
        })
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Container engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI binary (`docker` or `podman`)
    pub binary: String,

    /// Directory holding `config.json` with registry credentials.
    /// Defaults to `~/.docker`.
    pub docker_config_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            docker_config_dir: None,
        }
    }
}

impl EngineConfig {
    /// Resolved docker config directory
    pub fn docker_config_dir(&self) -> PathBuf {
        self.docker_config_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".docker")
        })
    }
}

/// Paths and images the lifecycle phases run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Detector binary inside the build image
    pub detector: String,

    /// Builder binary inside the build image
    pub builder: String,

    /// Image that runs the analyzer
    pub analyzer_image: String,

    /// `user:group` the launch volume is chowned to after the app upload
    pub app_owner: String,

    /// Owner recorded in layer tar headers
    pub layer_uid: u64,
    pub layer_gid: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            detector: "/packs/detector".to_string(),
            builder: "/packs/builder".to_string(),
            analyzer_image: "packs/util".to_string(),
            app_owner: "packs:packs".to_string(),
            layer_uid: 1000,
            layer_gid: 1000,
        }
    }
}

/// A stack: compatible build and run images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: String,
    #[serde(default)]
    pub build_images: Vec<String>,
    #[serde(default)]
    pub run_images: Vec<String>,
}

impl Stack {
    /// The stack kiln ships with
    pub fn builtin() -> Self {
        Self {
            id: DEFAULT_STACK_ID.to_string(),
            build_images: vec!["packs/build".to_string()],
            run_images: vec!["packs/run".to_string()],
        }
    }

    /// Build image living on the same registry as `repo`, else the first
    pub fn build_image_for(&self, repo: &str) -> Option<&str> {
        pick_for_registry(&self.build_images, repo)
    }

    /// Run image living on the same registry as `repo`, else the first
    pub fn run_image_for(&self, repo: &str) -> Option<&str> {
        pick_for_registry(&self.run_images, repo)
    }

    pub fn require_build_image_for(&self, repo: &str) -> KilnResult<&str> {
        self.build_image_for(repo)
            .ok_or_else(|| KilnError::StackImagesMissing {
                stack: self.id.clone(),
                kind: "build",
            })
    }

    pub fn require_run_image_for(&self, repo: &str) -> KilnResult<&str> {
        self.run_image_for(repo)
            .ok_or_else(|| KilnError::StackImagesMissing {
                stack: self.id.clone(),
                kind: "run",
            })
    }
}

fn pick_for_registry<'a>(images: &'a [String], repo: &str) -> Option<&'a str> {
    let wanted = registry_of(repo);
    images
        .iter()
        .find(|image| registry_of(image) == wanted)
        .or_else(|| images.first())
        .map(String::as_str)
}
