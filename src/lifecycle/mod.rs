//! Phase orchestrator
//!
//! Drives one build session through a fixed sequence of phase containers:
//!
//! ```text
//! Init -> CopyApp -> Detect -> Analyze -> Build -> (PullRunImage) -> Export -> Done
//! ```
//!
//! Any failure moves the session to `Failed` and skips what is left. The
//! launch and workspace volumes a session creates are removed on every exit
//! path, panics included; the cache volume outlives the session.

mod runner;
mod session;

pub use runner::{cancellable, log_sink, OutputSink, OUTPUT_TAIL_LINES};
pub use session::{
    cache_volume_name, is_relative_id, BuildSession, Buildpack, BuildpackGroup, SessionVolumes,
};

use crate::config::Config;
use crate::engine::{Bind, ContainerEngine, ContainerSpec};
use crate::error::{KilnError, KilnResult};
use crate::export::{assemble, Exporter, PreviousImage};
use crate::image::{select_store, ImageStore};
use crate::layer::{self, LayerBuilder, LayerOptions};
use crate::metadata::{BuildMetadata, METADATA_LABEL};
use futures_util::FutureExt;
use runner::{run_to_completion, with_container};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where a build session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    CopyApp,
    Detect,
    Analyze,
    Build,
    PullRunImage,
    Export,
    Done,
    Failed,
}

impl Phase {
    /// Slug used in logs and container names
    pub fn slug(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::CopyApp => "copy-app",
            Phase::Detect => "detect",
            Phase::Analyze => "analyze",
            Phase::Build => "build",
            Phase::PullRunImage => "pull-run-image",
            Phase::Export => "export",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

const LAUNCH_DIR: &str = "/launch";
const WORKSPACE_DIR: &str = "/workspace";
const CACHE_DIR: &str = "/cache";
const GROUP_PATH: &str = "/workspace/group.toml";
const ANALYZER_METADATA_DIR: &str = "/tmp";
const ANALYZER_DOCKER_CONFIG: &str = "/home/packs/.docker";

/// Binaries, images and ownership the phases use
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub detector: String,
    pub builder: String,
    pub analyzer_image: String,
    /// `user:group` the launch volume is chowned to
    pub app_owner: String,
    pub layer_options: LayerOptions,
    /// Mounted read-only into the analyzer when publishing
    pub docker_config_dir: PathBuf,
}

impl LifecycleSettings {
    pub fn from_config(config: &Config) -> Self {
        let lc = &config.lifecycle;
        Self {
            detector: lc.detector.clone(),
            builder: lc.builder.clone(),
            analyzer_image: lc.analyzer_image.clone(),
            app_owner: lc.app_owner.clone(),
            layer_options: LayerOptions {
                uid: lc.layer_uid,
                gid: lc.layer_gid,
            },
            docker_config_dir: config.engine.docker_config_dir(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Run blocking filesystem work off the async runtime
async fn blocking<T, F>(f: F) -> KilnResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> KilnResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal(format!("blocking task failed: {}", e)))?
}

/// Drives build sessions against one engine and one image store
pub struct Lifecycle {
    engine: Arc<dyn ContainerEngine>,
    store: Box<dyn ImageStore>,
    settings: LifecycleSettings,
    sink: OutputSink,
    phase: Phase,
}

impl Lifecycle {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Box<dyn ImageStore>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            engine,
            store,
            settings,
            sink: log_sink(),
            phase: Phase::Init,
        }
    }

    /// Deliver container output to `sink` instead of the debug log
    pub fn with_output(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    /// Current (or, after `run`, final) phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run every phase of `session` and return the written image's digest
    pub async fn run(
        &mut self,
        session: &BuildSession,
        cancel: &CancellationToken,
    ) -> KilnResult<String> {
        self.phase = Phase::Init;
        info!(
            "Building {} from {} (session {})",
            session.repo_name,
            session.app_dir.display(),
            session.short_id()
        );

        let mut created = Vec::new();
        let outcome = AssertUnwindSafe(self.run_phases(session, cancel, &mut created))
            .catch_unwind()
            .await;

        self.release_volumes(&created).await;

        match outcome {
            Ok(Ok(digest)) => {
                self.phase = Phase::Done;
                info!("Built {} ({})", session.repo_name, digest);
                Ok(digest)
            }
            Ok(Err(e)) => {
                warn!("Build of {} failed in {}: {}", session.repo_name, self.phase, e);
                self.phase = Phase::Failed;
                Err(e)
            }
            Err(panic) => {
                self.phase = Phase::Failed;
                std::panic::resume_unwind(panic)
            }
        }
    }

    fn enter(&mut self, phase: Phase) {
        info!("Phase {}", phase);
        self.phase = phase;
    }

    async fn run_phases(
        &mut self,
        session: &BuildSession,
        cancel: &CancellationToken,
        created: &mut Vec<String>,
    ) -> KilnResult<String> {
        self.acquire_volumes(session, cancel, created)
            .await
            .map_err(|e| e.in_phase(Phase::Init))?;

        self.enter(Phase::CopyApp);
        self.copy_app(session, cancel)
            .await
            .map_err(|e| e.in_phase(Phase::CopyApp))?;

        self.enter(Phase::Detect);
        let group = self
            .detect(session, cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Detect))?;

        self.enter(Phase::Analyze);
        let previous = self
            .analyze(session, cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Analyze))?;

        self.enter(Phase::Build);
        self.build(session, &group, cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Build))?;

        if !session.publish {
            self.enter(Phase::PullRunImage);
            cancellable(cancel, self.engine.pull_image(&session.run_image))
                .await
                .map_err(|e| e.in_phase(Phase::PullRunImage))?;
        }

        self.enter(Phase::Export);
        self.export(session, &group, previous, cancel)
            .await
            .map_err(|e| e.in_phase(Phase::Export))
    }

    /// Create the session volumes, recording each ephemeral one before it exists
    async fn acquire_volumes(
        &self,
        session: &BuildSession,
        cancel: &CancellationToken,
        created: &mut Vec<String>,
    ) -> KilnResult<()> {
        let volumes = &session.volumes;
        for name in [&volumes.launch, &volumes.workspace] {
            created.push(name.clone());
            cancellable(cancel, self.engine.create_volume(name)).await?;
        }
        cancellable(cancel, self.engine.create_volume(&volumes.cache)).await?;
        debug!(
            "Volumes ready: {}, {}, {}",
            volumes.launch, volumes.workspace, volumes.cache
        );
        Ok(())
    }

    /// Remove ephemeral volumes. Never cancelled; failures are only logged.
    async fn release_volumes(&self, created: &[String]) {
        for name in created {
            match self.engine.remove_volume(name).await {
                Ok(()) => debug!("Removed volume {}", name),
                Err(e) => warn!("Failed to remove volume {}: {}", name, e),
            }
        }
    }

    fn container_name(&self, phase: Phase, session: &BuildSession) -> String {
        format!("kiln-{}-{}", phase.slug(), session.short_id())
    }

    fn launch_bind(session: &BuildSession) -> Bind {
        Bind::new(&session.volumes.launch, LAUNCH_DIR)
    }

    fn workspace_bind(session: &BuildSession) -> Bind {
        Bind::new(&session.volumes.workspace, WORKSPACE_DIR)
    }

    async fn copy_app(&self, session: &BuildSession, cancel: &CancellationToken) -> KilnResult<()> {
        let app_dir = session.app_dir.clone();
        let tar = blocking(move || {
            layer::tar_directory(&app_dir, "app", &LayerOptions { uid: 0, gid: 0 })
        })
        .await?;
        debug!("App archive is {} bytes", tar.len());

        let spec = ContainerSpec::new(self.container_name(Phase::CopyApp, session), &session.build_image)
            .entrypoint(Vec::<String>::new())
            .cmd(["chown", "-R", self.settings.app_owner.as_str(), LAUNCH_DIR])
            .user("0")
            .bind(Self::launch_bind(session));

        let engine = self.engine.as_ref();
        with_container(engine, &spec, cancel, |id| async move {
            cancellable(cancel, engine.upload_tar(&id, tar, LAUNCH_DIR)).await?;
            run_to_completion(engine, &id, Phase::CopyApp, &self.sink, cancel).await
        })
        .await
    }

    async fn detect(
        &self,
        session: &BuildSession,
        cancel: &CancellationToken,
    ) -> KilnResult<BuildpackGroup> {
        let spec = ContainerSpec::new(self.container_name(Phase::Detect, session), &session.build_image)
            .entrypoint([self.settings.detector.as_str()])
            .bind(Self::launch_bind(session))
            .bind(Self::workspace_bind(session));

        let engine = self.engine.as_ref();
        let archive = with_container(engine, &spec, cancel, |id| async move {
            run_to_completion(engine, &id, Phase::Detect, &self.sink, cancel).await?;
            match cancellable(cancel, engine.download_tar(&id, GROUP_PATH)).await {
                Err(KilnError::Cancelled) => Err(KilnError::Cancelled),
                Err(e) => Err(KilnError::DetectionFailed(format!(
                    "detector wrote no {}: {}",
                    GROUP_PATH, e
                ))),
                Ok(archive) => Ok(archive),
            }
        })
        .await?;

        let contents = layer::read_single_file(&archive)
            .map_err(|e| KilnError::DetectionFailed(format!("reading {}: {}", GROUP_PATH, e)))?;
        let group = BuildpackGroup::parse(&contents)?;
        info!(
            "Detected buildpacks: {}",
            group
                .buildpacks
                .iter()
                .map(|bp| bp.id.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(group)
    }

    /// Look up the previous image and, when it carries build metadata, run the analyzer
    async fn analyze(
        &self,
        session: &BuildSession,
        cancel: &CancellationToken,
    ) -> KilnResult<Option<PreviousImage>> {
        let image = match cancellable(cancel, self.store.read_existing(&session.repo_name)).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                info!("No previous image found for {}", session.repo_name);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(label) = image.label(METADATA_LABEL).map(str::to_string) else {
            info!("Previous image is missing label {}", METADATA_LABEL);
            return Ok(None);
        };
        let metadata = match BuildMetadata::from_label(&session.repo_name, &label) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("Ignoring previous image: {}", e);
                return Ok(None);
            }
        };

        cancellable(cancel, self.engine.pull_image(&self.settings.analyzer_image)).await?;

        let metadata_path = format!("{}/metadata.json", ANALYZER_METADATA_DIR);
        let mut spec = ContainerSpec::new(
            self.container_name(Phase::Analyze, session),
            &self.settings.analyzer_image,
        )
        .cmd(["-metadata", metadata_path.as_str(), session.repo_name.as_str()])
        .bind(Self::launch_bind(session))
        .bind(Self::workspace_bind(session));
        if session.publish {
            spec = spec.env("PACK_USE_HELPERS", "true").bind(
                Bind::new(
                    self.settings.docker_config_dir.to_string_lossy(),
                    ANALYZER_DOCKER_CONFIG,
                )
                .read_only(),
            );
        }

        let tar = layer::single_file_tar("metadata.json", label.as_bytes())?;
        let engine = self.engine.as_ref();
        with_container(engine, &spec, cancel, |id| async move {
            cancellable(cancel, engine.upload_tar(&id, tar, ANALYZER_METADATA_DIR)).await?;
            run_to_completion(engine, &id, Phase::Analyze, &self.sink, cancel).await
        })
        .await?;

        Ok(Some(PreviousImage { image, metadata }))
    }

    async fn build(
        &self,
        session: &BuildSession,
        group: &BuildpackGroup,
        cancel: &CancellationToken,
    ) -> KilnResult<()> {
        let spec = ContainerSpec::new(
            self.container_name(Phase::Build, session),
            group.build_image_or(&session.build_image),
        )
        .entrypoint([self.settings.builder.as_str()])
        .bind(Self::launch_bind(session))
        .bind(Self::workspace_bind(session))
        .bind(Bind::new(&session.volumes.cache, CACHE_DIR));

        let engine = self.engine.as_ref();
        with_container(engine, &spec, cancel, |id| async move {
            run_to_completion(engine, &id, Phase::Build, &self.sink, cancel).await
        })
        .await
    }

    async fn export(
        &self,
        session: &BuildSession,
        group: &BuildpackGroup,
        previous: Option<PreviousImage>,
        cancel: &CancellationToken,
    ) -> KilnResult<String> {
        // Never started; it only gives access to the launch volume
        let spec = ContainerSpec::new(
            self.container_name(Phase::Export, session),
            group.build_image_or(&session.build_image),
        )
        .entrypoint(Vec::<String>::new())
        .cmd(["true"])
        .bind(Self::launch_bind(session));

        let engine = self.engine.as_ref();
        let archive = with_container(engine, &spec, cancel, |id| async move {
            cancellable(cancel, engine.download_tar(&id, LAUNCH_DIR)).await
        })
        .await?;

        let staging = tempfile::tempdir().map_err(|e| KilnError::io("creating export staging dir", e))?;
        let staging_path = staging.path().to_path_buf();
        blocking(move || layer::unpack(&archive, &staging_path)).await?;

        let run_image = match cancellable(cancel, self.store.read_existing(&session.run_image)).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                return Err(KilnError::image_access(&session.run_image, "run image not found"))
            }
            Err(e) => return Err(e),
        };

        let launch_dir = staging.path().join("launch");
        let plan_group = group.clone();
        let builder = LayerBuilder::new(self.settings.layer_options);
        let plan = blocking(move || {
            Exporter::new(&plan_group, &launch_dir)
                .with_previous(previous.as_ref())
                .with_builder(builder)
                .plan()
        })
        .await?;
        debug!("Export plan has {} layers", plan.layers.len());

        let image = assemble(
            self.store.as_ref(),
            &run_image,
            &session.repo_name,
            plan,
            session.stack_id.as_deref(),
        )?;

        info!(
            "Writing {} ({} layers) to the {} store",
            image.name,
            image.layers.len(),
            self.store.store_name()
        );
        cancellable(cancel, self.store.write(&image)).await
    }
}

/// Build `session` with the store its publish flag selects
pub async fn run_build(
    engine: Arc<dyn ContainerEngine>,
    config: &Config,
    session: &BuildSession,
    sink: OutputSink,
    cancel: &CancellationToken,
) -> KilnResult<String> {
    let store = select_store(session.publish, Arc::clone(&engine), config);
    let mut lifecycle =
        Lifecycle::new(engine, store, LifecycleSettings::from_config(config)).with_output(sink);
    lifecycle.run(session, cancel).await
}
