// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Digest pinning with bounded retries, and config image resolution.

use super::config_image::{ConfigImage, ImageFiles};
use super::{Digest, ImageReference, Manifest, PinnedImage, RegistryClient};
use crate::constants::defaults;
use crate::error::RegistryError;
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Pins image references to digests at push time. Nothing is cached between calls.
#[derive(Clone)]
pub struct DigestResolver {
    client: Arc<dyn RegistryClient>,
    timeout: Duration,
    attempts: u32,
    interval: Duration,
    max_interval: Duration,
}

impl DigestResolver {
    pub fn new(client: Arc<dyn RegistryClient>, timeout: Duration, attempts: u32) -> Self {
        Self {
            client,
            timeout,
            attempts: attempts.max(1),
            interval: Duration::from_millis(defaults::REGISTRY_RETRY_INTERVAL_MS),
            max_interval: Duration::from_millis(defaults::REGISTRY_RETRY_MAX_INTERVAL_MS),
        }
    }

    /// Override the retry backoff (initial interval, cap)
    pub fn with_backoff(mut self, interval: Duration, max_interval: Duration) -> Self {
        self.interval = interval;
        self.max_interval = max_interval;
        self
    }

    /// Pin `image` to the digest it currently points at; already pinned references are kept
    #[instrument(skip(self), fields(image = %image))]
    pub async fn resolve(&self, image: &ImageReference) -> Result<PinnedImage, RegistryError> {
        if let Some(digest) = &image.digest {
            debug!("{} is already pinned", image);
            return Ok(image.pinned(digest.clone()));
        }

        let digest = self
            .call(image, move || self.client.resolve_digest(image))
            .await?;
        info!("Pinned {} to {}", image, digest);
        Ok(image.pinned(digest))
    }

    /// Pin a config image and read the binary reference and definition it carries.
    ///
    /// The binary digest comes from the config image and is only checked for existence.
    #[instrument(skip(self))]
    pub async fn resolve_config_image(&self, reference: &str) -> Result<ConfigImage, RegistryError> {
        let image: ImageReference = reference.parse()?;
        let config = self.resolve(&image).await?;
        let pinned = &config.reference();
        let name = config.to_string();
        let config_digest = &config.digest;

        let raw_manifest = self
            .call(pinned, move || self.client.fetch_manifest(pinned, config_digest))
            .await?;
        config.digest.verify(&name, &raw_manifest)?;
        let manifest = Manifest::parse(&name, &raw_manifest)?;

        let layers = manifest
            .layers
            .iter()
            .map(|layer| {
                if !layer.media_type.ends_with("gzip") {
                    return Err(RegistryError::InvalidImage {
                        reference: name.clone(),
                        reason: format!("unsupported layer type {}", layer.media_type),
                    });
                }
                layer.digest.parse::<Digest>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let reference = name.as_str();
        let blobs = try_join_all(layers.iter().map(|digest| async move {
            let blob = self
                .call(pinned, move || self.client.fetch_blob(pinned, digest))
                .await?;
            digest.verify(reference, &blob)?;
            Ok::<_, RegistryError>(blob)
        }))
        .await?;

        let files = ImageFiles::unpack(&name, &blobs)?;
        let (index, definition) = files.config(&name)?;
        let binary = index.binary(&name)?;

        let binary_reference = &binary.reference();
        let live = self
            .call(binary_reference, move || {
                self.client.resolve_digest(binary_reference)
            })
            .await?;
        if live != binary.digest {
            return Err(RegistryError::DigestMismatch {
                reference: binary.to_string(),
                expected: binary.digest.to_string(),
                actual: live.to_string(),
            });
        }

        info!("Config image {} pairs with {}", name, binary);
        Ok(ConfigImage {
            config,
            tag: image.tag,
            binary,
            entrypoint: index.config_entrypoint,
            definition,
        })
    }

    /// Run one registry call under the timeout, retrying only `Unreachable` with backoff
    async fn call<T, F, Fut>(
        &self,
        image: &ImageReference,
        operation: F,
    ) -> Result<T, RegistryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RegistryError>>,
    {
        let mut interval = self.interval;
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RegistryError::Timeout {
                    reference: image.to_string(),
                }),
            };

            match result {
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    warn!(
                        "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, self.attempts, image, err, interval
                    );
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(self.max_interval);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakeRegistry;

    const BINARY_DIGEST: &str =
        "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    fn make_resolver(registry: FakeRegistry, attempts: u32) -> DigestResolver {
        DigestResolver::new(Arc::new(registry), Duration::from_secs(5), attempts)
            .with_backoff(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn test_resolve_tag() {
        let registry = FakeRegistry::new();
        let digest = registry.push_manifest("registry.example.com/web", "latest", b"{}");
        let resolver = make_resolver(registry, 1);

        let pinned = resolver
            .resolve(&"registry.example.com/web:latest".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(pinned.digest, digest);
    }

    #[tokio::test]
    async fn test_pinned_reference_is_not_resolved() {
        let registry = FakeRegistry::new();
        let resolver = make_resolver(registry.clone(), 1);

        let image: ImageReference = format!("registry.example.com/web@{}", BINARY_DIGEST)
            .parse()
            .unwrap();
        let pinned = resolver.resolve(&image).await.unwrap();

        assert_eq!(pinned.digest.as_str(), BINARY_DIGEST);
        assert_eq!(registry.calls(), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let registry = FakeRegistry::new();
        let resolver = make_resolver(registry.clone(), 3);

        let err = resolver
            .resolve(&"registry.example.com/missing:1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
        assert_eq!(registry.calls(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_is_retried_then_surfaces() {
        let registry = FakeRegistry::new();
        registry.set_unreachable(true);
        let resolver = make_resolver(registry.clone(), 3);

        let err = resolver
            .resolve(&"registry.example.com/web:latest".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Unreachable { .. }));
        assert_eq!(registry.calls(), 3);
    }

    #[tokio::test]
    async fn test_resolve_config_image() {
        let registry = FakeRegistry::new();
        let binary = registry.push_manifest("registry.example.com/web", "1.0", b"binary");
        registry.push_config_image(
            "registry.example.com/web-config",
            "latest",
            "registry.example.com/web",
            &binary,
            "args: [--serve]\n",
        );
        let resolver = make_resolver(registry, 1);

        let image = resolver
            .resolve_config_image("registry.example.com/web-config:latest")
            .await
            .unwrap();

        assert_eq!(image.binary.digest, binary);
        assert_eq!(image.binary.repository, "web");
        assert_eq!(image.tag.as_deref(), Some("latest"));
        assert_eq!(image.definition, "args: [--serve]\n");
    }

    #[tokio::test]
    async fn test_config_image_with_missing_binary() {
        let registry = FakeRegistry::new();
        let missing: Digest = BINARY_DIGEST.parse().unwrap();
        registry.push_config_image(
            "registry.example.com/web-config",
            "latest",
            "registry.example.com/web",
            &missing,
            "args: []\n",
        );
        let resolver = make_resolver(registry, 1);

        let err = resolver
            .resolve_config_image("registry.example.com/web-config:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_blob_is_rejected() {
        let registry = FakeRegistry::new();
        let binary = registry.push_manifest("registry.example.com/web", "1.0", b"binary");
        registry.push_config_image(
            "registry.example.com/web-config",
            "latest",
            "registry.example.com/web",
            &binary,
            "args: []\n",
        );
        registry.corrupt_blobs();
        let resolver = make_resolver(registry, 1);

        let err = resolver
            .resolve_config_image("registry.example.com/web-config:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }
}
