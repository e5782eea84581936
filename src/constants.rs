// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The field manager name used for server-side apply
pub const MANAGER: &str = "convoy";

/// Label and annotation suffixes, prefixed with the configured label namespace
pub mod labels {
    /// Selector label carrying the Deployment name
    pub const APP: &str = "app";
    /// Marks every object rendered by convoy; value is always `MANAGER`
    pub const MANAGED_BY: &str = "managed-by";
    /// Annotation naming the resource declaration that owns the object
    pub const OWNER: &str = "owner";
    /// Annotation recording the pinned config image of a Deployment
    pub const CONFIG_IMAGE: &str = "config-image";
}

/// Secret payload handling
pub mod secrets {
    /// Shown in place of every secret value in plans and forget previews
    pub const REDACTION_MARKER: &str = "<redacted>";
    /// Base64 of `REDACTION_MARKER`; the only value ever stored or sent for Secret data
    pub const PLACEHOLDER: &str = "PHJlZGFjdGVkPg==";
    /// Prefix of the env vars synthesized for secret strings used in args
    pub const ARG_ENV_PREFIX: &str = "CONVOY_SECRET_";
}

/// Declaration layout under the monitored directory
pub mod declarations {
    pub const INDEX_FILE: &str = "index.yaml";
    /// Directory whose resources are unnamespaced and whose objects may name any namespace
    pub const GLOBAL_DIR: &str = "global";
}

/// Config image layout
pub mod config_image {
    pub const INDEX_FILE: &str = "index.json";
}

/// Defaults for operator tunables
pub mod defaults {
    pub const LABEL_NAMESPACE: &str = "convoy.dev";
    pub const APPLY_CONCURRENCY: usize = 4;
    pub const OPERATION_TIMEOUT_SECS: u64 = 30;
    pub const REGISTRY_RETRY_ATTEMPTS: u32 = 3;
    /// Initial registry retry interval in milliseconds
    pub const REGISTRY_RETRY_INTERVAL_MS: u64 = 500;
    /// Maximum registry retry interval in milliseconds (exponential backoff cap)
    pub const REGISTRY_RETRY_MAX_INTERVAL_MS: u64 = 8_000;
}
