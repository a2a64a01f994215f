//! Error types for kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use crate::lifecycle::Phase;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Engine errors
    #[error("Container engine not found: {0}")]
    EngineNotFound(String),

    #[error("Container engine error: {operation}: {reason}")]
    Engine { operation: String, reason: String },

    // Lifecycle errors
    #[error("{phase} phase exited with code {code}")]
    PhaseFailed {
        phase: Phase,
        code: i64,
        output: String,
    },

    #[error("{phase} phase failed: {source}")]
    PhaseAborted {
        phase: Phase,
        #[source]
        source: Box<KilnError>,
    },

    #[error("Detection produced no usable result: {0}")]
    DetectionFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Image errors
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Cannot access image {name}: {reason}")]
    ImageAccess { name: String, reason: String },

    #[error("Malformed image {name}: {reason}")]
    ImageFormat { name: String, reason: String },

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Failed to construct layer from {path}: {reason}")]
    LayerConstruction { path: PathBuf, reason: String },

    // Rebase errors
    #[error("Rebase boundary not found: no layer of {image} has diffID {diff_id}")]
    RebaseBoundaryNotFound { image: String, diff_id: String },

    #[error("Image {0} carries no build metadata label")]
    MissingProvenance(String),

    #[error("Invalid build metadata on {image}: {reason}")]
    MetadataInvalid { image: String, reason: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stack not found: {0}")]
    StackNotFound(String),

    #[error("Stack {stack} declares no {kind} images")]
    StackImagesMissing { stack: String, kind: &'static str },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error (non-zero exit with stderr)
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create an engine error for a failed operation
    pub fn engine(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Engine {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create an image access error
    pub fn image_access(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::ImageAccess {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach the phase an error happened in.
    ///
    /// `PhaseFailed` and `Cancelled` already say everything and pass through.
    pub fn in_phase(self, phase: Phase) -> Self {
        match self {
            Self::PhaseFailed { .. } | Self::Cancelled | Self::PhaseAborted { .. } => self,
            other => Self::PhaseAborted {
                phase,
                source: Box::new(other),
            },
        }
    }

    /// The underlying error, with phase context peeled off
    pub fn root(&self) -> &KilnError {
        match self {
            Self::PhaseAborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Phase the error was raised in, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::PhaseFailed { phase, .. } | Self::PhaseAborted { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Tail of container output captured for a failed phase
    pub fn output_tail(&self) -> Option<&str> {
        match self {
            Self::PhaseFailed { output, .. } if !output.is_empty() => Some(output),
            Self::PhaseAborted { source, .. } => source.output_tail(),
            _ => None,
        }
    }

    /// Whether this is the soft "no such image" condition
    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Self::ImageNotFound(_))
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self.root() {
            Self::EngineNotFound(_) => Some("Install Docker or Podman, or set engine.binary in the config"),
            Self::DetectionFailed(_) => Some("No buildpack in the builder recognised the app"),
            Self::RebaseBoundaryNotFound { .. } => {
                Some("The image's build metadata does not match its layers; rebuild it instead")
            }
            Self::MissingProvenance(_) => Some("Only images built by kiln can be rebased"),
            Self::ImageAccess { .. } => Some("Check registry credentials in ~/.docker/config.json"),
            _ => None,
        }
    }
}
