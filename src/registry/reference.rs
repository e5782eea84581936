// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Image references and content digests.

use crate::error::RegistryError;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A content digest, always `sha256:<64 hex>`
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Digest(String);

impl Digest {
    pub fn of(content: &[u8]) -> Self {
        let hash = Sha256::digest(content);
        let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
        Digest(format!("sha256:{}", hex))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that `content` hashes to this digest
    pub fn verify(&self, reference: &str, content: &[u8]) -> Result<(), RegistryError> {
        let actual = Digest::of(content);
        if actual == *self {
            Ok(())
        } else {
            Err(RegistryError::DigestMismatch {
                reference: reference.to_string(),
                expected: self.0.clone(),
                actual: actual.0,
            })
        }
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s
            .strip_prefix("sha256:")
            .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if valid {
            Ok(Digest(s.to_ascii_lowercase()))
        } else {
            Err(RegistryError::InvalidReference(format!(
                "'{}' is not a sha256 digest",
                s
            )))
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A parsed image reference: `[registry/]repository[:tag][@digest]`
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// The manifest reference used against the registry: digest when pinned, else tag
    pub fn manifest_reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `registry/repository`, as used in container image fields
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn pinned(&self, digest: Digest) -> PinnedImage {
        PinnedImage {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            digest,
        }
    }
}

impl FromStr for ImageReference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidReference(s.to_string());
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(invalid());
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((name, digest)) => (name, Some(digest.parse::<Digest>()?)),
            None => (s, None),
        };

        // A colon after the last slash separates the tag; earlier colons belong to a registry port
        let (name, tag) = match remainder.rfind(':') {
            Some(idx) if !remainder[idx..].contains('/') => {
                (&remainder[..idx], Some(remainder[idx + 1..].to_string()))
            }
            _ => (remainder, None),
        };
        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(invalid());
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };
        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(invalid());
        }

        Ok(ImageReference {
            registry,
            repository: repository.to_ascii_lowercase(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// An image pinned to an immutable digest
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PinnedImage {
    pub registry: String,
    pub repository: String,
    pub digest: Digest,
}

impl PinnedImage {
    pub fn reference(&self) -> ImageReference {
        ImageReference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(self.digest.clone()),
        }
    }
}

impl fmt::Display for PinnedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.registry, self.repository, self.digest)
    }
}
