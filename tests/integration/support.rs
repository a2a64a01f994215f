//! In-memory engine and image store for driving the lifecycle without a daemon

use async_trait::async_trait;
use kiln::engine::{ContainerEngine, ContainerSpec, ImageInspect, LogStreams};
use kiln::error::{KilnError, KilnResult};
use kiln::image::{Image, ImageConfig, ImageStore, Layer};
use kiln::layer::{self, sha256_digest, LayerOptions};
use kiln::lifecycle::BuildSession;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Runs inside the build phase with the launch and cache volume directories
pub type BuildScript = Arc<dyn Fn(&Path, &Path) + Send + Sync>;

/// Failure injected into the fake engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The nth `create_volume` call (0-based) fails
    CreateVolume(usize),
    /// Creating the container of a phase fails
    Create(&'static str),
    /// A phase container exits with this code
    Exit(&'static str, i64),
    /// Starting a phase container panics
    Panic(&'static str),
    /// Waiting on a phase container cancels the session and never returns
    Hang(&'static str),
    /// Pulling this image fails
    Pull(&'static str),
}

#[derive(Default)]
pub struct EngineState {
    volumes: HashMap<String, TempDir>,
    containers: HashMap<String, ContainerSpec>,
    pub volume_creates: Vec<String>,
    pub volume_removals: Vec<String>,
    pub containers_created: Vec<String>,
    pub containers_removed: Vec<String>,
    pub pulls: Vec<String>,
    pub specs: Vec<ContainerSpec>,
    /// (container, destination, tar)
    pub uploads: Vec<(String, String, Vec<u8>)>,
}

impl EngineState {
    pub fn spec(&self, phase: &str) -> Option<&ContainerSpec> {
        self.specs.iter().rev().find(|s| phase_of(&s.name) == phase)
    }

    fn volume_path(&self, id: &str, path: &str) -> Option<PathBuf> {
        let spec = self.containers.get(id)?;
        spec.binds.iter().find_map(|bind| {
            let rest = if path == bind.target {
                ""
            } else {
                path.strip_prefix(&format!("{}/", bind.target))?
            };
            let dir = self.volumes.get(&bind.source)?.path().join(rest);
            Some(dir)
        })
    }

    fn volume_dir(&self, name: &str) -> Option<PathBuf> {
        self.volumes.get(name).map(|d| d.path().to_path_buf())
    }
}

/// `kiln-<phase>-<session>` -> `<phase>`
fn phase_of(name: &str) -> &str {
    name.strip_prefix("kiln-")
        .and_then(|rest| rest.rsplit_once('-'))
        .map(|(phase, _)| phase)
        .unwrap_or(name)
}

/// Container engine whose volumes are temp dirs and whose phases are scripted
pub struct FakeEngine {
    state: Mutex<EngineState>,
    group_toml: Option<String>,
    build_script: Mutex<BuildScript>,
    faults: Vec<Fault>,
    cancel: CancellationToken,
}

impl FakeEngine {
    pub fn new(cancel: &CancellationToken) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            group_toml: Some(
                "[[buildpacks]]\nid = \"example/bp\"\nversion = \"1.0\"\n".to_string(),
            ),
            build_script: Mutex::new(Arc::new(|_: &Path, _: &Path| {})),
            faults: Vec::new(),
            cancel: cancel.clone(),
        }
    }

    pub fn with_group(mut self, group_toml: Option<&str>) -> Self {
        self.group_toml = group_toml.map(str::to_string);
        self
    }

    pub fn with_build(self, script: impl Fn(&Path, &Path) + Send + Sync + 'static) -> Self {
        self.set_build(script);
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn set_build(&self, script: impl Fn(&Path, &Path) + Send + Sync + 'static) {
        *self.build_script.lock().unwrap_or_else(|e| e.into_inner()) = Arc::new(script);
    }

    pub fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_fault(&self, fault: &Fault) -> bool {
        self.faults.contains(fault)
    }

    fn exit_code(&self, phase: &str) -> i64 {
        self.faults
            .iter()
            .find_map(|f| match f {
                Fault::Exit(p, code) if *p == phase => Some(*code),
                _ => None,
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn ensure_ready(&self) -> KilnResult<()> {
        Ok(())
    }

    async fn pull_image(&self, image: &str) -> KilnResult<()> {
        self.state().pulls.push(image.to_string());
        if self.faults.iter().any(|f| matches!(f, Fault::Pull(name) if *name == image)) {
            return Err(KilnError::engine("pull", format!("pull access denied for {}", image)));
        }
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> KilnResult<String> {
        let phase = phase_of(&spec.name);
        if self.faults.iter().any(|f| matches!(f, Fault::Create(p) if *p == phase)) {
            return Err(KilnError::engine("create", format!("cannot create {}", spec.name)));
        }

        let mut state = self.state();
        state.containers.insert(spec.name.clone(), spec.clone());
        state.containers_created.push(spec.name.clone());
        state.specs.push(spec.clone());
        Ok(spec.name.clone())
    }

    async fn upload_tar(&self, id: &str, tar: Vec<u8>, dest: &str) -> KilnResult<()> {
        let mut state = self.state();
        if let Some(dir) = state.volume_path(id, dest) {
            layer::unpack(&tar, &dir)?;
        }
        state.uploads.push((id.to_string(), dest.to_string(), tar));
        Ok(())
    }

    async fn download_tar(&self, id: &str, path: &str) -> KilnResult<Vec<u8>> {
        let source = self
            .state()
            .volume_path(id, path)
            .ok_or_else(|| KilnError::engine("cp", format!("{} is not mounted", path)))?;
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if source.is_dir() {
            layer::tar_directory(&source, &name, &LayerOptions::default())
        } else if source.is_file() {
            let contents = std::fs::read(&source).map_err(|e| KilnError::io("reading", e))?;
            layer::single_file_tar(&name, &contents)
        } else {
            Err(KilnError::engine("cp", format!("no such file: {}", path)))
        }
    }

    async fn start(&self, id: &str) -> KilnResult<()> {
        let phase = phase_of(id).to_string();
        if self.faults.iter().any(|f| matches!(f, Fault::Panic(p) if *p == phase)) {
            panic!("engine crashed starting {}", id);
        }

        let (workspace, launch, cache) = {
            let state = self.state();
            (
                state.volume_path(id, "/workspace"),
                state.volume_path(id, "/launch"),
                state.volume_path(id, "/cache"),
            )
        };

        match phase.as_str() {
            "detect" => {
                if let (Some(workspace), Some(group)) = (workspace, &self.group_toml) {
                    std::fs::write(workspace.join("group.toml"), group)
                        .map_err(|e| KilnError::io("writing group.toml", e))?;
                }
            }
            "build" => {
                let script = Arc::clone(&*self.build_script.lock().unwrap_or_else(|e| e.into_inner()));
                if let (Some(launch), Some(cache)) = (launch, cache) {
                    script(&launch, &cache);
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn stream_logs(&self, id: &str) -> KilnResult<LogStreams> {
        let phase = phase_of(id);
        let stdout = format!("{} starting\n{} finished\n", phase, phase).into_bytes();
        let stderr = format!("{} warning\n", phase).into_bytes();
        Ok(LogStreams::new(
            Box::pin(Cursor::new(stdout)),
            Box::pin(Cursor::new(stderr)),
        ))
    }

    async fn wait(&self, id: &str) -> KilnResult<i64> {
        let phase = phase_of(id).to_string();
        if self.faults.iter().any(|f| matches!(f, Fault::Hang(p) if *p == phase)) {
            self.cancel.cancel();
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code(&phase))
    }

    async fn remove_container(&self, id: &str) -> KilnResult<()> {
        let mut state = self.state();
        state.containers.remove(id);
        state.containers_removed.push(id.to_string());
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> KilnResult<()> {
        let mut state = self.state();
        let attempt = state.volume_creates.len();
        state.volume_creates.push(name.to_string());
        if self.has_fault(&Fault::CreateVolume(attempt)) {
            return Err(KilnError::engine("volume create", format!("cannot create {}", name)));
        }
        if !state.volumes.contains_key(name) {
            let dir = TempDir::new().map_err(|e| KilnError::io("creating volume dir", e))?;
            state.volumes.insert(name.to_string(), dir);
        }
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> KilnResult<()> {
        let mut state = self.state();
        state.volumes.remove(name);
        state.volume_removals.push(name.to_string());
        Ok(())
    }

    async fn inspect_image(&self, _name: &str) -> KilnResult<Option<ImageInspect>> {
        Ok(None)
    }

    async fn save_image(&self, name: &str) -> KilnResult<Vec<u8>> {
        Err(KilnError::engine("save", format!("no image {}", name)))
    }

    async fn load_image(&self, _archive: Vec<u8>) -> KilnResult<()> {
        Err(KilnError::engine("load", "not supported"))
    }

    fn engine_name(&self) -> &str {
        "fake"
    }
}

/// Path of a volume directory while it exists
pub fn volume_dir(engine: &FakeEngine, name: &str) -> Option<PathBuf> {
    engine.state().volume_dir(name)
}

#[derive(Default)]
pub struct StoreState {
    pub images: HashMap<String, Image>,
    pub writes: Vec<Image>,
    pub fail_writes: bool,
}

/// Image store holding images in a map
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn with_image(self, image: Image) -> Self {
        self.put(image);
        self
    }

    pub fn failing_writes(self) -> Self {
        self.state().fail_writes = true;
        self
    }

    pub fn put(&self, image: Image) {
        self.state().images.insert(image.name.clone(), image);
    }

    pub fn image(&self, name: &str) -> Option<Image> {
        self.state().images.get(name).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes.len()
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn read_existing(&self, name: &str) -> KilnResult<Image> {
        self.image(name)
            .ok_or_else(|| KilnError::ImageNotFound(name.to_string()))
    }

    async fn write(&self, image: &Image) -> KilnResult<String> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(KilnError::image_access(&image.name, "store unavailable"));
        }

        let digest = sha256_digest(&serde_json::to_vec(&image.config.to_file(&image.layers)?)?);
        let mut stored = image.clone();
        stored.digest = Some(digest.clone());
        state.images.insert(stored.name.clone(), stored.clone());
        state.writes.push(stored);
        Ok(digest)
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

/// Run image with two opaque layers
pub fn run_image(name: &str) -> Image {
    Image::new(
        name,
        vec![
            Layer::from_tar(format!("{} os", name).into_bytes(), None),
            Layer::from_tar(format!("{} top", name).into_bytes(), None),
        ],
        ImageConfig {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            ..ImageConfig::default()
        },
    )
}

/// App directory with a single source file
pub fn app_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.js"), "console.log('hi')").unwrap();
    dir
}

pub fn session(app: &TempDir, publish: bool) -> BuildSession {
    BuildSession::new(app.path(), "packs/build", "packs/run", "myapp", publish)
        .unwrap()
        .with_stack("io.buildpacks.stacks.bionic")
}

/// Entry names of a tar blob
pub fn tar_entries(blob: &[u8]) -> Vec<String> {
    let mut archive = tar::Archive::new(blob);
    archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

/// Every ephemeral volume the session created was removed exactly once,
/// the cache volume never, and every container that was created is gone
pub fn assert_cleaned_up(engine: &FakeEngine, session: &BuildSession) {
    let state = engine.state();
    for volume in [&session.volumes.launch, &session.volumes.workspace] {
        let attempted = state.volume_creates.contains(volume);
        let removals = state.volume_removals.iter().filter(|r| *r == volume).count();
        assert_eq!(
            removals,
            usize::from(attempted),
            "volume {} removed {} times",
            volume,
            removals
        );
    }
    assert!(!state.volume_removals.contains(&session.volumes.cache));
    for container in &state.containers_created {
        assert!(
            state.containers_removed.contains(container),
            "container {} left behind",
            container
        );
    }
}
