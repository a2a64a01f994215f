//! Provenance record stored on built images
//!
//! Serialized as JSON into the [`METADATA_LABEL`] label. Every `sha` names one
//! of the image's own layers.

use crate::error::{KilnError, KilnResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label holding [`BuildMetadata`]
pub const METADATA_LABEL: &str = "sh.packs.build";

/// Label holding the stack the image was built on
pub const STACK_LABEL: &str = "io.buildpacks.stack.id";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    #[serde(default)]
    pub run_image: RunImageMetadata,
    #[serde(default)]
    pub app: LayerSha,
    #[serde(default)]
    pub config: LayerSha,
    #[serde(default)]
    pub buildpacks: Vec<BuildpackMetadata>,
}

/// Base image the app layers sit on; `sha` is the diffID of its top layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunImageMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSha {
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildpackMetadata {
    pub key: String,
    #[serde(default)]
    pub layers: BTreeMap<String, LayerMetadata>,
}

/// One buildpack artifact layer and the data its descriptor declared
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerMetadata {
    pub sha: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl BuildMetadata {
    /// Parse the label value of `image`
    pub fn from_label(image: &str, value: &str) -> KilnResult<Self> {
        serde_json::from_str(value).map_err(|e| KilnError::MetadataInvalid {
            image: image.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_label(&self) -> KilnResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Recorded artifact layer `name` of buildpack `key`
    pub fn layer(&self, key: &str, name: &str) -> Option<&LayerMetadata> {
        self.buildpacks
            .iter()
            .find(|bp| bp.key == key)
            .and_then(|bp| bp.layers.get(name))
    }

    /// Every layer sha the record references
    pub fn shas(&self) -> Vec<&str> {
        let mut shas = vec![self.app.sha.as_str(), self.config.sha.as_str()];
        for bp in &self.buildpacks {
            shas.extend(bp.layers.values().map(|l| l.sha.as_str()));
        }
        shas
    }
}
