//! Per-plugin durable state with shallow-merge semantics.

use crate::error::{StoreError, StoreResult};
use crate::MAX_JSON_BYTES;
use ductile_db::now_rfc3339;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;

pub struct PluginStateStore {
    pool: SqlitePool,
}

impl PluginStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Current state object for a plugin; `{}` if none stored yet.
    pub async fn get(&self, plugin: &str) -> StoreResult<Map<String, Value>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM plugin_state WHERE plugin_name = ?1")
                .bind(plugin)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            None => Ok(Map::new()),
            Some((raw,)) => parse_object(&raw, "plugin state", plugin),
        }
    }

    /// Shallow-merge `updates` into the plugin's state.
    ///
    /// Top-level keys are replaced wholesale - a nested object in
    /// `updates` does not recurse into the stored one. The merged result
    /// is rejected (and nothing written) if it would serialize past the
    /// 1 MiB cap. The read-merge-write runs in one transaction, so
    /// concurrent merges against the same plugin serialize behind the
    /// row's write lock.
    pub async fn shallow_merge(
        &self,
        plugin: &str,
        updates: &Map<String, Value>,
    ) -> StoreResult<Map<String, Value>> {
        if plugin.trim().is_empty() {
            return Err(StoreError::EmptyPluginName);
        }
        if updates.is_empty() {
            return self.get(plugin).await;
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT state FROM plugin_state WHERE plugin_name = ?1")
                .bind(plugin)
                .fetch_optional(&mut *tx)
                .await?;
        let mut state = match row {
            None => Map::new(),
            Some((raw,)) => parse_object(&raw, "plugin state", plugin)?,
        };

        for (key, value) in updates {
            state.insert(key.clone(), value.clone());
        }

        let serialized = serde_json::to_string(&state).map_err(|_| StoreError::CorruptJson {
            what: "plugin state",
            owner: plugin.to_string(),
        })?;
        if serialized.len() > MAX_JSON_BYTES {
            return Err(StoreError::TooLarge {
                what: "plugin state",
                size: serialized.len(),
                max: MAX_JSON_BYTES,
            });
        }

        sqlx::query(
            r#"
            INSERT INTO plugin_state (plugin_name, state, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (plugin_name) DO UPDATE
            SET state = excluded.state, updated_at = excluded.updated_at
            "#,
        )
        .bind(plugin)
        .bind(&serialized)
        .bind(now_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Merged {} state keys for plugin {}", updates.len(), plugin);
        Ok(state)
    }
}

fn parse_object(raw: &str, what: &'static str, owner: &str) -> StoreResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(StoreError::CorruptJson {
            what,
            owner: owner.to_string(),
        }),
    }
}
