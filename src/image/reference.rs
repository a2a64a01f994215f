//! Image reference parsing

use crate::error::{KilnError, KilnResult};
use std::fmt;

/// Registry host Docker Hub references resolve to
pub const DOCKER_HUB: &str = "registry-1.docker.io";

/// A parsed image reference: `[registry/]repository[:tag|@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io")
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    /// Tag or digest (e.g. "latest" or "sha256:abc123")
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference.
    ///
    /// Supported formats:
    /// - `alpine`, `alpine:3.19`
    /// - `ghcr.io/foo/bar:v1`
    /// - `localhost:5000/app`
    /// - `my.registry.io/org/repo@sha256:abc123`
    pub fn parse(raw: &str) -> KilnResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(KilnError::InvalidReference("empty image reference".to_string()));
        }

        let (name_part, reference) = if let Some(at_pos) = raw.find('@') {
            (&raw[..at_pos], raw[at_pos + 1..].to_string())
        } else if let Some(colon_pos) = raw.rfind(':') {
            // A tag colon always comes after the last '/', a port colon before it
            let after_last_slash = raw.rfind('/').map(|p| p + 1).unwrap_or(0);
            if colon_pos > after_last_slash {
                (&raw[..colon_pos], raw[colon_pos + 1..].to_string())
            } else {
                (raw, "latest".to_string())
            }
        } else {
            (raw, "latest".to_string())
        };

        if name_part.is_empty() || reference.is_empty() {
            return Err(KilnError::InvalidReference(raw.to_string()));
        }

        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB.to_string(), name_part.to_string()),
        };

        if repository.is_empty() || repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(KilnError::InvalidReference(raw.to_string()));
        }

        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Whether the reference pins a digest rather than a tag
    pub fn is_digest(&self) -> bool {
        self.reference.starts_with("sha256:")
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

/// Registry host of an image name; unparseable names count as Docker Hub
pub fn registry_of(name: &str) -> String {
    ImageRef::parse(name)
        .map(|r| r.registry)
        .unwrap_or_else(|_| DOCKER_HUB.to_string())
}

/// Localhost and loopback registries speak plain HTTP; everything else HTTPS.
pub fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}
