// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Config image contents: the embedded binary reference and the configuration entrypoint

use super::{Digest, ImageReference, PinnedImage};
use crate::constants::config_image::INDEX_FILE;
use crate::error::RegistryError;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;

/// `index.json` at the root of a config image
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigImageIndex {
    pub binary_image: String,
    pub binary_digest: String,
    pub config_entrypoint: String,
}

/// A config image pinned at push time together with the binary it pairs with
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigImage {
    pub config: PinnedImage,
    /// Tag the config image was requested by, if any
    pub tag: Option<String>,
    pub binary: PinnedImage,
    pub entrypoint: String,
    /// Raw configuration definition read from the entrypoint
    pub definition: String,
}

/// Files of an image after applying its layers in order
#[derive(Debug, Default)]
pub struct ImageFiles {
    files: BTreeMap<String, Vec<u8>>,
}

impl ImageFiles {
    /// Unpack gzipped tar layers, later layers overriding earlier ones
    pub fn unpack(reference: &str, layers: &[impl AsRef<[u8]>]) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidImage {
            reference: reference.to_string(),
            reason,
        };

        let mut files = BTreeMap::new();
        for layer in layers {
            let mut archive = tar::Archive::new(GzDecoder::new(layer.as_ref()));
            let entries = archive
                .entries()
                .map_err(|e| invalid(format!("unreadable layer: {}", e)))?;
            for entry in entries {
                let mut entry = entry.map_err(|e| invalid(format!("unreadable layer: {}", e)))?;
                let path = entry
                    .path()
                    .map_err(|e| invalid(format!("invalid path in layer: {}", e)))?
                    .to_string_lossy()
                    .to_string();
                let path = normalize(&path);

                let (dir, name) = match path.rsplit_once('/') {
                    Some((dir, name)) => (format!("{}/", dir), name),
                    None => (String::new(), path.as_str()),
                };
                if let Some(hidden) = name.strip_prefix(".wh.") {
                    let removed = format!("{}{}", dir, hidden);
                    files.retain(|existing: &String, _| {
                        existing != &removed && !existing.starts_with(&format!("{}/", removed))
                    });
                    continue;
                }
                if !entry.header().entry_type().is_file() {
                    continue;
                }

                let mut content = Vec::new();
                entry
                    .read_to_end(&mut content)
                    .map_err(|e| invalid(format!("unreadable file {}: {}", path, e)))?;
                files.insert(path, content);
            }
        }
        Ok(ImageFiles { files })
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(&normalize(path)).map(Vec::as_slice)
    }

    /// Read the index and the entrypoint definition
    pub fn config(&self, reference: &str) -> Result<(ConfigImageIndex, String), RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidImage {
            reference: reference.to_string(),
            reason,
        };

        let raw_index = self
            .get(INDEX_FILE)
            .ok_or_else(|| invalid(format!("no {} in image", INDEX_FILE)))?;
        let index: ConfigImageIndex = serde_json::from_slice(raw_index)
            .map_err(|e| invalid(format!("invalid {}: {}", INDEX_FILE, e)))?;

        let definition = self
            .get(&index.config_entrypoint)
            .ok_or_else(|| invalid(format!("entrypoint {} not found", index.config_entrypoint)))?;
        let definition = String::from_utf8(definition.to_vec())
            .map_err(|e| invalid(format!("entrypoint is not UTF-8: {}", e)))?;

        Ok((index, definition))
    }
}

impl ConfigImageIndex {
    /// The binary reference pinned to the digest the config image carries
    pub fn binary(&self, reference: &str) -> Result<PinnedImage, RegistryError> {
        let image: ImageReference = self.binary_image.parse()?;
        if image.tag.is_some() || image.digest.is_some() {
            return Err(RegistryError::InvalidImage {
                reference: reference.to_string(),
                reason: format!("binary_image '{}' must be a bare repository", self.binary_image),
            });
        }
        let digest: Digest = self.binary_digest.parse()?;
        Ok(image.pinned(digest))
    }
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}
