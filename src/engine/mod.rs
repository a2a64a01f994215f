//! Container engine abstraction
//!
//! The lifecycle and the local image store only talk to the engine through
//! [`ContainerEngine`]. The handle is created once per invocation and passed
//! explicitly; there is no process-global client.

mod cli;

pub use cli::CliEngine;

use crate::config::Config;
use crate::error::KilnResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// A volume or host path mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Bind {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// `-v` argument: `source:target[:ro]`
    pub fn arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Everything needed to create one container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `Some(vec![])` clears the image entrypoint
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub binds: Vec<Bind>,
    pub user: Option<String>,
    pub working_dir: Option<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = Some(entrypoint.into_iter().map(Into::into).collect());
        self
    }

    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn bind(mut self, bind: Bind) -> Self {
        self.binds.push(bind);
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// What the engine reports about a local image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInspect {
    pub id: String,
    pub labels: BTreeMap<String, String>,
}

pub type LogReader = Pin<Box<dyn AsyncRead + Send>>;

/// Follow-mode stdout and stderr of a container.
///
/// `guard` keeps whatever produces the streams alive; dropping it stops them.
pub struct LogStreams {
    pub stdout: LogReader,
    pub stderr: LogReader,
    pub guard: Option<Box<dyn Send>>,
}

impl LogStreams {
    pub fn new(stdout: LogReader, stderr: LogReader) -> Self {
        Self {
            stdout,
            stderr,
            guard: None,
        }
    }

    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }
}

/// Container engine operations kiln needs
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Fail early if the engine cannot be reached
    async fn ensure_ready(&self) -> KilnResult<()>;

    /// Pull an image into the engine's store
    async fn pull_image(&self, image: &str) -> KilnResult<()>;

    /// Create (but do not start) a container and return its ID
    async fn create_container(&self, spec: &ContainerSpec) -> KilnResult<String>;

    /// Extract a tar stream into the container filesystem at `dest`
    async fn upload_tar(&self, id: &str, tar: Vec<u8>, dest: &str) -> KilnResult<()>;

    /// Tar stream of `path` inside the container
    async fn download_tar(&self, id: &str, path: &str) -> KilnResult<Vec<u8>>;

    async fn start(&self, id: &str) -> KilnResult<()>;

    /// Follow the container's output until it exits
    async fn stream_logs(&self, id: &str) -> KilnResult<LogStreams>;

    /// Block until the container exits and return its exit code
    async fn wait(&self, id: &str) -> KilnResult<i64>;

    /// Force-remove a container; a missing container is not an error
    async fn remove_container(&self, id: &str) -> KilnResult<()>;

    async fn create_volume(&self, name: &str) -> KilnResult<()>;

    /// Force-remove a volume; a missing volume is not an error
    async fn remove_volume(&self, name: &str) -> KilnResult<()>;

    /// `None` when the image does not exist locally
    async fn inspect_image(&self, name: &str) -> KilnResult<Option<ImageInspect>>;

    /// `docker save` archive of an image
    async fn save_image(&self, name: &str) -> KilnResult<Vec<u8>>;

    /// Load a `docker save` archive
    async fn load_image(&self, archive: Vec<u8>) -> KilnResult<()>;

    /// Human-readable engine name
    fn engine_name(&self) -> &str;
}

/// Create the engine handle for this invocation
pub fn create_engine(config: &Config) -> Arc<dyn ContainerEngine> {
    Arc::new(CliEngine::new(config.engine.binary.clone()))
}
