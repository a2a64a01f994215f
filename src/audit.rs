//! Audit trail of builds, rebases and builder images
//!
//! One JSON object per line in `audit.log` under the state directory.
//! Writing is best effort: a failed append is logged and the command
//! carries on.

use crate::config::{schema::Config, ConfigManager};
use crate::lifecycle::{BuildSession, Phase};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Something worth recording after a command finishes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum AuditEvent {
    #[serde(rename = "build.completed")]
    BuildCompleted {
        session_id: String,
        repo: String,
        run_image: String,
        publish: bool,
        digest: String,
    },
    #[serde(rename = "build.failed")]
    BuildFailed {
        session_id: String,
        repo: String,
        phase: Option<String>,
        error: String,
    },
    #[serde(rename = "rebase.completed")]
    RebaseCompleted {
        repo: String,
        run_image: Option<String>,
        publish: bool,
        digest: String,
    },
    #[serde(rename = "builder.created")]
    BuilderCreated {
        repo: String,
        build_image: Option<String>,
        buildpacks: Vec<String>,
        publish: bool,
        digest: String,
    },
}

impl AuditEvent {
    pub fn build_completed(session: &BuildSession, digest: &str) -> Self {
        Self::BuildCompleted {
            session_id: session.id.to_string(),
            repo: session.repo_name.clone(),
            run_image: session.run_image.clone(),
            publish: session.publish,
            digest: digest.to_string(),
        }
    }

    pub fn build_failed(session: &BuildSession, phase: Option<Phase>, error: &str) -> Self {
        Self::BuildFailed {
            session_id: session.id.to_string(),
            repo: session.repo_name.clone(),
            phase: phase.map(|p| p.to_string()),
            error: error.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Entry<'a> {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Log at the configured location, honouring `general.audit_log`
    pub fn new(config: &Config) -> Self {
        Self::at(ConfigManager::audit_log_path(), config.general.audit_log)
    }

    pub fn at(path: PathBuf, enabled: bool) -> Self {
        Self { enabled, path }
    }

    pub async fn record(&self, event: AuditEvent) {
        if !self.enabled {
            return;
        }

        let entry = Entry {
            timestamp: Utc::now(),
            event: &event,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(json) => json + "\n",
            Err(e) => {
                warn!("Skipping audit event: {}", e);
                return;
            }
        };

        if let Err(e) = self.append(line.as_bytes()).await {
            warn!("Cannot append to {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }
}
