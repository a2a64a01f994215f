//! Image store backed by the container engine's local image store

use super::{archive, Image, ImageStore};
use crate::engine::ContainerEngine;
use crate::error::{KilnError, KilnResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Reads images with `save` and writes them with `load`
pub struct LocalStore {
    engine: Arc<dyn ContainerEngine>,
}

impl LocalStore {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }
}

fn access_error(name: &str, err: KilnError) -> KilnError {
    match err {
        KilnError::ImageNotFound(_) | KilnError::ImageAccess { .. } | KilnError::ImageFormat { .. } => err,
        other => KilnError::image_access(name, other),
    }
}

#[async_trait]
impl ImageStore for LocalStore {
    async fn read_existing(&self, name: &str) -> KilnResult<Image> {
        // An untagged name would make `save` export every tag of the repository
        let reference = archive::tagged(name).unwrap_or_else(|_| name.to_string());

        let inspect = self
            .engine
            .inspect_image(&reference)
            .await
            .map_err(|e| access_error(name, e))?
            .ok_or_else(|| KilnError::ImageNotFound(name.to_string()))?;
        debug!("Found local image {} ({})", reference, inspect.id);

        let saved = self
            .engine
            .save_image(&reference)
            .await
            .map_err(|e| access_error(name, e))?;
        archive::decode(name, &saved)
    }

    async fn write(&self, image: &Image) -> KilnResult<String> {
        let (archive, image_id) = archive::encode(image)?;
        self.engine
            .load_image(archive)
            .await
            .map_err(|e| access_error(&image.name, e))?;

        info!("Wrote {} to the local image store as {}", image.name, image_id);
        Ok(image_id)
    }

    fn store_name(&self) -> &'static str {
        "local"
    }
}
