// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::types::key::ObjectKey;
use thiserror::Error;

/// Failures while evaluating a configuration definition for one resource.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{slot} has no branch for environment '{environment}'")]
    MissingEnvironmentBranch { environment: String, slot: String },

    #[error("variable '{0}' is referenced but not bound")]
    UnboundVariable(String),

    #[error("binding '{0}' is not referenced by the configuration")]
    UnusedBinding(String),

    #[error("port '{0}' is declared more than once")]
    DuplicatePort(String),

    #[error("port '{name}' has number {number}, expected 1-65535")]
    InvalidPort { name: String, number: u32 },

    #[error("variable '{variable}' is a {expected} but was bound to {actual}")]
    BindingKindMismatch {
        variable: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("service maps port '{0}' which the configuration does not declare")]
    UnknownServicePort(String),

    #[error("malformed configuration: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{reference} not found in registry")]
    NotFound { reference: String },

    #[error("registry unreachable for {reference}: {reason}")]
    Unreachable { reference: String, reason: String },

    #[error("registry request for {reference} timed out")]
    Timeout { reference: String },

    #[error("invalid image reference '{0}'")]
    InvalidReference(String),

    #[error("content of {reference} does not match digest {expected} (got {actual})")]
    DigestMismatch {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("invalid config image {reference}: {reason}")]
    InvalidImage { reference: String, reason: String },
}

impl RegistryError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RegistryError::Unreachable { .. })
    }
}

/// Failures talking to one cluster; always attributed to a cluster or object.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("cluster '{cluster}' unreachable: {reason}")]
    Unreachable { cluster: String, reason: String },

    #[error("operation on cluster '{0}' timed out")]
    Timeout(String),

    #[error("cluster does not serve {kind} in {api_version}")]
    UnknownType { api_version: String, kind: String },

    #[error("Failed to parse kubeconfig: {0}")]
    Kubeconfig(String),

    #[error("Namespace creation failed: {0}")]
    Namespace(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),
}

impl From<kube::Error> for ApiError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => ApiError::Api {
                code: response.code,
                message: response.message,
            },
            other => ApiError::Api {
                code: 0,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("state store database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("state store record for {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("state store operation timed out")]
    Timeout,
}

#[derive(Error, Debug)]
pub enum ConvoyError {
    #[error("{resource}: {source}")]
    Config {
        resource: String,
        #[source]
        source: ConfigError,
    },

    #[error("{resource}: {source}")]
    Registry {
        resource: String,
        #[source]
        source: RegistryError,
    },

    #[error("{key}: {source}")]
    Api {
        key: ObjectKey,
        #[source]
        source: ApiError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid declaration in {path}: {reason}")]
    Declaration { path: String, reason: String },

    #[error("{resource}: {reason}")]
    Render { resource: String, reason: String },

    #[error("cannot import {key}: {reason}")]
    Import { key: ObjectKey, reason: String },

    #[error("{key} is rendered by both {first} and {second}")]
    Conflict {
        key: ObjectKey,
        first: String,
        second: String,
    },
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
