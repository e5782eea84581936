// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Container registry access: digest pinning and config image retrieval.

pub mod config_image;
pub mod http;
pub mod reference;
pub mod resolver;

pub use config_image::ConfigImage;
pub use self::http::HttpRegistryClient;
pub use reference::{Digest, ImageReference, PinnedImage};
pub use resolver::DigestResolver;

use crate::error::RegistryError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Minimal OCI distribution API surface needed for pinning and config retrieval
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Resolve the manifest digest `image` currently points at
    async fn resolve_digest(&self, image: &ImageReference) -> Result<Digest, RegistryError>;

    /// Raw manifest bytes stored under `digest`
    async fn fetch_manifest(
        &self,
        image: &ImageReference,
        digest: &Digest,
    ) -> Result<Bytes, RegistryError>;

    /// Raw blob bytes stored under `digest`
    async fn fetch_blob(&self, image: &ImageReference, digest: &Digest)
        -> Result<Bytes, RegistryError>;
}

/// Single-platform image manifest
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub media_type: Option<String>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
}

impl Manifest {
    pub fn parse(reference: &str, raw: &[u8]) -> Result<Self, RegistryError> {
        let manifest: Manifest =
            serde_json::from_slice(raw).map_err(|e| RegistryError::InvalidImage {
                reference: reference.to_string(),
                reason: format!("unreadable manifest: {}", e),
            })?;
        if manifest.schema_version != 2 {
            return Err(RegistryError::InvalidImage {
                reference: reference.to_string(),
                reason: format!("unsupported schema version {}", manifest.schema_version),
            });
        }
        Ok(manifest)
    }
}
