// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! SQLite state store

use super::{AuditAction, AuditEntry, ObjectRecord, StateStore};
use crate::error::StoreError;
use crate::redaction::RedactedObject;
use crate::types::key::ObjectKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS kubernetes_objects (
        api_version TEXT NOT NULL,
        cluster TEXT NOT NULL,
        kind TEXT NOT NULL,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        owner TEXT NOT NULL,
        body TEXT NOT NULL,
        created TEXT NOT NULL,
        last_updated TEXT NOT NULL,
        PRIMARY KEY (api_version, cluster, kind, namespace, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kubernetes_objects_audit (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        api_version TEXT NOT NULL,
        cluster TEXT NOT NULL,
        kind TEXT NOT NULL,
        namespace TEXT NOT NULL,
        name TEXT NOT NULL,
        action TEXT NOT NULL,
        actor TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        old_body TEXT,
        new_body TEXT
    )
    "#,
];

const KEY_MATCH: &str =
    "api_version = ? AND cluster = ? AND kind = ? AND namespace = ? AND name = ?";

pub struct SqlStateStore {
    pool: SqlitePool,
    timeout: Duration,
}

impl SqlStateStore {
    /// Open the database at `url`, creating the schema when missing
    #[instrument(skip(timeout))]
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // An in-memory database lives and dies with its single connection
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        info!("State store ready");
        Ok(Self { pool, timeout })
    }

    async fn timed<T>(
        &self,
        operation: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout)?
    }

    async fn load_all(&self) -> Result<BTreeMap<ObjectKey, ObjectRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT api_version, cluster, kind, namespace, name, owner, body, created, last_updated \
             FROM kubernetes_objects",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<_, StoreError> {
                let record = decode_record(row)?;
                Ok((record.key.clone(), record))
            })
            .collect()
    }

    async fn get_one(&self, key: &ObjectKey) -> Result<Option<ObjectRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_record(&mut conn, key).await
    }

    async fn put_one(
        &self,
        key: &ObjectKey,
        owner: &str,
        body: &RedactedObject,
        actor: &str,
    ) -> Result<(), StoreError> {
        let new_body = serde_json::to_string(body).map_err(|e| corrupt(key, e))?;
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;
        let existing = bind_key(
            sqlx::query(&format!(
                "SELECT owner, body FROM kubernetes_objects WHERE {}",
                KEY_MATCH
            )),
            key,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let (action, old_body) = match existing {
            None => {
                sqlx::query(
                    "INSERT INTO kubernetes_objects \
                     (api_version, cluster, kind, namespace, name, owner, body, created, last_updated) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(key.api_version.as_str())
                .bind(key.cluster.as_str())
                .bind(key.kind.as_str())
                .bind(key.store_namespace())
                .bind(key.name.as_str())
                .bind(owner)
                .bind(new_body.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                (AuditAction::Insert, None)
            }
            Some(row) => {
                let old_owner: String = row.try_get("owner")?;
                let old_body: String = row.try_get("body")?;
                if old_owner == owner && old_body == new_body {
                    debug!("{} unchanged in store", key);
                    return Ok(());
                }
                bind_key(
                    sqlx::query(&format!(
                        "UPDATE kubernetes_objects SET owner = ?, body = ?, last_updated = ? WHERE {}",
                        KEY_MATCH
                    ))
                    .bind(owner)
                    .bind(new_body.as_str())
                    .bind(now),
                    key,
                )
                .execute(&mut *tx)
                .await?;
                (AuditAction::Update, Some(old_body))
            }
        };

        audit(
            &mut tx,
            key,
            action,
            actor,
            now,
            old_body.as_deref(),
            Some(&new_body),
        )
        .await?;
        tx.commit().await?;
        debug!("Stored {} ({})", key, action);
        Ok(())
    }

    async fn remove_one(
        &self,
        key: &ObjectKey,
        actor: &str,
    ) -> Result<Option<ObjectRecord>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let Some(record) = fetch_record(&mut tx, key).await? else {
            return Ok(None);
        };

        bind_key(
            sqlx::query(&format!("DELETE FROM kubernetes_objects WHERE {}", KEY_MATCH)),
            key,
        )
        .execute(&mut *tx)
        .await?;

        let old_body = serde_json::to_string(&record.body).map_err(|e| corrupt(key, e))?;
        audit(
            &mut tx,
            key,
            AuditAction::Delete,
            actor,
            Utc::now(),
            Some(&old_body),
            None,
        )
        .await?;
        tx.commit().await?;
        debug!("Removed {} from store", key);
        Ok(Some(record))
    }

    async fn audit_for(&self, key: &ObjectKey) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = bind_key(
            sqlx::query(&format!(
                "SELECT action, actor, timestamp, old_body, new_body \
                 FROM kubernetes_objects_audit WHERE {} ORDER BY id",
                KEY_MATCH
            )),
            key,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AuditEntry, StoreError> {
                let action: String = row.try_get("action")?;
                let old_body: Option<String> = row.try_get("old_body")?;
                let new_body: Option<String> = row.try_get("new_body")?;
                let parse = |raw: Option<String>| {
                    raw.map(|raw| serde_json::from_str(&raw))
                        .transpose()
                        .map_err(|e| corrupt(key, e))
                };
                Ok(AuditEntry {
                    action: action.parse().map_err(|e: String| corrupt(key, e))?,
                    actor: row.try_get("actor")?,
                    timestamp: row.try_get("timestamp")?,
                    old_body: parse(old_body)?,
                    new_body: parse(new_body)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl StateStore for SqlStateStore {
    async fn load(&self) -> Result<BTreeMap<ObjectKey, ObjectRecord>, StoreError> {
        self.timed(self.load_all()).await
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<ObjectRecord>, StoreError> {
        self.timed(self.get_one(key)).await
    }

    #[instrument(skip(self, body, actor), fields(key = %key))]
    async fn put(
        &self,
        key: &ObjectKey,
        owner: &str,
        body: &RedactedObject,
        actor: &str,
    ) -> Result<(), StoreError> {
        self.timed(self.put_one(key, owner, body, actor)).await
    }

    #[instrument(skip(self, actor), fields(key = %key))]
    async fn remove(
        &self,
        key: &ObjectKey,
        actor: &str,
    ) -> Result<Option<ObjectRecord>, StoreError> {
        self.timed(self.remove_one(key, actor)).await
    }

    async fn audit_trail(&self, key: &ObjectKey) -> Result<Vec<AuditEntry>, StoreError> {
        self.timed(self.audit_for(key)).await
    }
}

fn bind_key<'q>(query: SqliteQuery<'q>, key: &'q ObjectKey) -> SqliteQuery<'q> {
    query
        .bind(key.api_version.as_str())
        .bind(key.cluster.as_str())
        .bind(key.kind.as_str())
        .bind(key.store_namespace())
        .bind(key.name.as_str())
}

async fn fetch_record(
    conn: &mut SqliteConnection,
    key: &ObjectKey,
) -> Result<Option<ObjectRecord>, StoreError> {
    let row = bind_key(
        sqlx::query(&format!(
            "SELECT api_version, cluster, kind, namespace, name, owner, body, created, last_updated \
             FROM kubernetes_objects WHERE {}",
            KEY_MATCH
        )),
        key,
    )
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(decode_record).transpose()
}

#[allow(clippy::too_many_arguments)]
async fn audit(
    conn: &mut SqliteConnection,
    key: &ObjectKey,
    action: AuditAction,
    actor: &str,
    timestamp: DateTime<Utc>,
    old_body: Option<&str>,
    new_body: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO kubernetes_objects_audit \
         (api_version, cluster, kind, namespace, name, action, actor, timestamp, old_body, new_body) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(key.api_version.as_str())
    .bind(key.cluster.as_str())
    .bind(key.kind.as_str())
    .bind(key.store_namespace())
    .bind(key.name.as_str())
    .bind(action.as_str())
    .bind(actor)
    .bind(timestamp)
    .bind(old_body)
    .bind(new_body)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn decode_record(row: &SqliteRow) -> Result<ObjectRecord, StoreError> {
    let namespace: String = row.try_get("namespace")?;
    let key = ObjectKey::new(
        row.try_get::<String, _>("cluster")?,
        row.try_get::<String, _>("api_version")?,
        row.try_get::<String, _>("kind")?,
        Some(namespace.as_str()),
        row.try_get::<String, _>("name")?,
    );
    let raw: String = row.try_get("body")?;
    let body: RedactedObject = serde_json::from_str(&raw).map_err(|e| corrupt(&key, e))?;

    Ok(ObjectRecord {
        owner: row.try_get("owner")?,
        body,
        created_at: row.try_get("created")?,
        updated_at: row.try_get("last_updated")?,
        key,
    })
}

fn corrupt(key: &ObjectKey, reason: impl ToString) -> StoreError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
