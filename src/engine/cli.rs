//! Engine adapter over the `docker` / `podman` command line
//!
//! Every child is spawned with `kill_on_drop`, so dropping a cancelled call
//! terminates the process it started.

use super::{ContainerEngine, ContainerSpec, ImageInspect, LogStreams};
use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Container engine driven through its CLI
pub struct CliEngine {
    binary: String,
}

impl CliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.binary, args.join(" "))
    }

    fn spawn_error(&self, args: &[&str], e: std::io::Error) -> KilnError {
        if e.kind() == std::io::ErrorKind::NotFound {
            KilnError::EngineNotFound(self.binary.clone())
        } else {
            KilnError::command_failed(self.describe(args), e)
        }
    }

    /// Execute an engine command and return its output
    async fn exec(&self, args: &[&str]) -> KilnResult<Output> {
        debug!("Executing: {}", self.describe(args));

        self.command(args)
            .output()
            .await
            .map_err(|e| self.spawn_error(args, e))
    }

    /// Execute an engine command feeding `input` on stdin
    async fn exec_with_stdin(&self, args: &[&str], input: Vec<u8>) -> KilnResult<Output> {
        debug!("Executing with {} bytes on stdin: {}", input.len(), self.describe(args));

        let mut child = self
            .command(args)
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(args, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| KilnError::Internal("child stdin not piped".to_string()))?;

        let feed = async move {
            let result = stdin.write_all(&input).await;
            drop(stdin);
            result
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output = output.map_err(|e| KilnError::command_failed(self.describe(args), e))?;
        if let Err(e) = fed {
            // The process exiting early closes the pipe; its stderr says why
            if output.status.success() {
                return Err(KilnError::command_failed(self.describe(args), e));
            }
        }
        Ok(output)
    }

    /// Run a command that must succeed, returning stdout
    async fn checked(&self, operation: &str, args: &[&str]) -> KilnResult<Vec<u8>> {
        let output = self.exec(args).await?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(KilnError::engine(operation, stderr_of(&output)))
        }
    }

    fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        let mut cmd = Vec::new();

        if let Some(ref entrypoint) = spec.entrypoint {
            args.push("--entrypoint".to_string());
            match entrypoint.split_first() {
                Some((first, rest)) => {
                    args.push(first.clone());
                    cmd.extend(rest.iter().cloned());
                }
                None => args.push(String::new()),
            }
        }

        if let Some(ref user) = spec.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }

        if let Some(ref dir) = spec.working_dir {
            args.push("-w".to_string());
            args.push(dir.clone());
        }

        for (k, v) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", k, v));
        }

        for bind in &spec.binds {
            args.push("-v".to_string());
            args.push(bind.arg());
        }

        args.push(spec.image.clone());
        args.extend(cmd);
        args.extend(spec.cmd.iter().cloned());
        args
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such") || stderr.contains("not known") || stderr.contains("not found")
}

#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Config", default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
struct InspectConfig {
    #[serde(rename = "Labels", default)]
    labels: Option<BTreeMap<String, String>>,
}

#[async_trait]
impl ContainerEngine for CliEngine {
    async fn ensure_ready(&self) -> KilnResult<()> {
        let output = self.exec(&["version"]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(KilnError::engine("version", stderr_of(&output)))
        }
    }

    async fn pull_image(&self, image: &str) -> KilnResult<()> {
        info!("Pulling image: {}", image);
        self.checked(&format!("pull {}", image), &["pull", "--quiet", image])
            .await
            .map(|_| ())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> KilnResult<String> {
        let args = Self::create_args(spec);
        let args_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let stdout = self
            .checked(&format!("create {}", spec.name), &args_refs)
            .await?;

        let id = String::from_utf8_lossy(&stdout).trim().to_string();
        debug!("Container created: {} ({})", spec.name, &id[..12.min(id.len())]);
        Ok(id)
    }

    async fn upload_tar(&self, id: &str, tar: Vec<u8>, dest: &str) -> KilnResult<()> {
        let target = format!("{}:{}", id, dest);
        let output = self.exec_with_stdin(&["cp", "-", &target], tar).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(KilnError::engine(format!("copy to {}", target), stderr_of(&output)))
        }
    }

    async fn download_tar(&self, id: &str, path: &str) -> KilnResult<Vec<u8>> {
        let source = format!("{}:{}", id, path);
        self.checked(&format!("copy from {}", source), &["cp", &source, "-"])
            .await
    }

    async fn start(&self, id: &str) -> KilnResult<()> {
        self.checked(&format!("start {}", id), &["start", id])
            .await
            .map(|_| ())
    }

    async fn stream_logs(&self, id: &str) -> KilnResult<LogStreams> {
        let args = ["logs", "--follow", id];
        debug!("Streaming: {}", self.describe(&args));

        let mut child = self
            .command(&args)
            .spawn()
            .map_err(|e| self.spawn_error(&args, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| KilnError::Internal("logs stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| KilnError::Internal("logs stderr not piped".to_string()))?;

        Ok(LogStreams::new(Box::pin(stdout), Box::pin(stderr)).with_guard(child))
    }

    async fn wait(&self, id: &str) -> KilnResult<i64> {
        let stdout = self.checked(&format!("wait {}", id), &["wait", id]).await?;
        let text = String::from_utf8_lossy(&stdout);
        text.trim()
            .lines()
            .last()
            .and_then(|l| l.trim().parse::<i64>().ok())
            .ok_or_else(|| KilnError::engine(format!("wait {}", id), format!("unexpected output: {}", text.trim())))
    }

    async fn remove_container(&self, id: &str) -> KilnResult<()> {
        debug!("Removing container: {}", id);

        let output = self.exec(&["rm", "-f", id]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if is_missing(&stderr) {
            Ok(())
        } else {
            Err(KilnError::command_exec(format!("{} rm", self.binary), stderr))
        }
    }

    async fn create_volume(&self, name: &str) -> KilnResult<()> {
        debug!("Creating volume: {}", name);
        self.checked(&format!("volume create {}", name), &["volume", "create", name])
            .await
            .map(|_| ())
    }

    async fn remove_volume(&self, name: &str) -> KilnResult<()> {
        debug!("Removing volume: {}", name);

        let output = self.exec(&["volume", "rm", "-f", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&output);
        if is_missing(&stderr) {
            Ok(())
        } else {
            Err(KilnError::engine(format!("volume rm {}", name), stderr))
        }
    }

    async fn inspect_image(&self, name: &str) -> KilnResult<Option<ImageInspect>> {
        let output = self.exec(&["image", "inspect", name]).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            return if is_missing(&stderr) {
                Ok(None)
            } else {
                Err(KilnError::engine(format!("image inspect {}", name), stderr))
            };
        }

        let mut parsed: Vec<InspectOutput> = serde_json::from_slice(&output.stdout)?;
        if parsed.is_empty() {
            return Ok(None);
        }
        let first = parsed.swap_remove(0);
        Ok(Some(ImageInspect {
            id: first.id,
            labels: first.config.and_then(|c| c.labels).unwrap_or_default(),
        }))
    }

    async fn save_image(&self, name: &str) -> KilnResult<Vec<u8>> {
        self.checked(&format!("save {}", name), &["save", name]).await
    }

    async fn load_image(&self, archive: Vec<u8>) -> KilnResult<()> {
        let output = self.exec_with_stdin(&["load", "--quiet"], archive).await?;
        if output.status.success() {
            debug!("Loaded: {}", String::from_utf8_lossy(&output.stdout).trim());
            Ok(())
        } else {
            Err(KilnError::engine("load", stderr_of(&output)))
        }
    }

    fn engine_name(&self) -> &str {
        &self.binary
    }
}
