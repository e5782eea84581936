// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Persisted last-applied state, one record per object key.

mod sql;

pub use sql::SqlStateStore;

use crate::error::StoreError;
use crate::redaction::RedactedObject;
use crate::types::key::ObjectKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    pub key: ObjectKey,
    /// Identity of the resource that rendered the object
    pub owner: String,
    pub body: RedactedObject,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Insert => "INSERT",
            AuditAction::Update => "UPDATE",
            AuditAction::Delete => "DELETE",
        }
    }
}

impl std::str::FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(AuditAction::Insert),
            "UPDATE" => Ok(AuditAction::Update),
            "DELETE" => Ok(AuditAction::Delete),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state write, recorded in the same transaction as the write itself
#[derive(Clone, Debug, PartialEq)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub old_body: Option<Value>,
    pub new_body: Option<Value>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Every record, ordered by key
    async fn load(&self) -> Result<BTreeMap<ObjectKey, ObjectRecord>, StoreError>;

    async fn get(&self, key: &ObjectKey) -> Result<Option<ObjectRecord>, StoreError>;

    /// Insert or overwrite the record for `key`. Writing an identical record is a no-op.
    async fn put(
        &self,
        key: &ObjectKey,
        owner: &str,
        body: &RedactedObject,
        actor: &str,
    ) -> Result<(), StoreError>;

    /// Drop the record for `key`, returning it if there was one
    async fn remove(&self, key: &ObjectKey, actor: &str)
        -> Result<Option<ObjectRecord>, StoreError>;

    /// Audit entries for `key`, oldest first
    async fn audit_trail(&self, key: &ObjectKey) -> Result<Vec<AuditEntry>, StoreError>;
}
