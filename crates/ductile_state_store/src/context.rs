//! Append-only event-context ledger.
//!
//! Each pipeline hop inserts one immutable row whose `accumulated_json`
//! is the shallow merge of its parent's baggage with the hop's updates.
//! Keys prefixed `origin_` are anchors: set once at the root of a
//! lineage, never changed (and never introduced) downstream.

use crate::error::{StoreError, StoreResult};
use crate::models::EventContext;
use crate::MAX_JSON_BYTES;
use ductile_db::now_rfc3339;
use ductile_ids::EventContextId;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tracing::debug;

/// Prefix marking a baggage key as an immutable lineage anchor.
pub const ORIGIN_PREFIX: &str = "origin_";

type ContextRow = (String, Option<String>, String, String, String, String);

pub struct ContextStore {
    pool: SqlitePool,
}

impl ContextStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a context row descending from `parent_id`.
    ///
    /// With no parent this starts a new lineage and may set `origin_*`
    /// anchors freely. With a parent, every `origin_*` key in `updates`
    /// must already exist on the parent with a deep-equal value;
    /// anything else is an [`StoreError::OriginAnchorImmutable`]
    /// violation and nothing is written.
    pub async fn create(
        &self,
        parent_id: Option<&EventContextId>,
        pipeline_name: &str,
        step_id: &str,
        updates: &Map<String, Value>,
    ) -> StoreResult<EventContext> {
        let mut tx = self.pool.begin().await?;

        let mut accumulated = match parent_id {
            None => Map::new(),
            Some(parent) => {
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT accumulated_json FROM event_context WHERE id = ?1")
                        .bind(parent.as_str())
                        .fetch_optional(&mut *tx)
                        .await?;
                let Some((raw,)) = row else {
                    return Err(StoreError::EventContextNotFound(parent.to_string()));
                };
                parse_object(&raw, parent.as_str())?
            }
        };

        if parent_id.is_some() {
            for (key, value) in updates {
                if !key.starts_with(ORIGIN_PREFIX) {
                    continue;
                }
                match accumulated.get(key) {
                    Some(existing) if existing == value => {}
                    _ => {
                        return Err(StoreError::OriginAnchorImmutable { key: key.clone() });
                    }
                }
            }
        }

        for (key, value) in updates {
            accumulated.insert(key.clone(), value.clone());
        }

        let serialized =
            serde_json::to_string(&accumulated).map_err(|_| StoreError::CorruptJson {
                what: "context baggage",
                owner: pipeline_name.to_string(),
            })?;
        if serialized.len() > MAX_JSON_BYTES {
            return Err(StoreError::TooLarge {
                what: "context baggage",
                size: serialized.len(),
                max: MAX_JSON_BYTES,
            });
        }

        let id = EventContextId::new();
        let created_at = now_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO event_context
                (id, parent_id, pipeline_name, step_id, accumulated_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id.as_str())
        .bind(parent_id.map(|p| p.as_str()))
        .bind(pipeline_name)
        .bind(step_id)
        .bind(&serialized)
        .bind(&created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "Created context {} ({}/{}, parent: {:?})",
            id,
            pipeline_name,
            step_id,
            parent_id.map(|p| p.as_str())
        );

        Ok(EventContext {
            id,
            parent_id: parent_id.cloned(),
            pipeline_name: pipeline_name.to_string(),
            step_id: step_id.to_string(),
            accumulated,
            created_at,
        })
    }

    /// Fetch one context row.
    pub async fn get(&self, id: &EventContextId) -> StoreResult<EventContext> {
        let row: Option<ContextRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, pipeline_name, step_id, accumulated_json, created_at
            FROM event_context WHERE id = ?1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Err(StoreError::EventContextNotFound(id.to_string())),
            Some(row) => from_row(row),
        }
    }

    /// Walk parent pointers upward and return the chain root-to-leaf.
    pub async fn lineage(&self, leaf_id: &EventContextId) -> StoreResult<Vec<EventContext>> {
        let rows: Vec<ContextRow> = sqlx::query_as(
            r#"
            WITH RECURSIVE chain(id, parent_id, pipeline_name, step_id,
                                 accumulated_json, created_at, depth) AS (
                SELECT id, parent_id, pipeline_name, step_id,
                       accumulated_json, created_at, 0
                FROM event_context WHERE id = ?1
                UNION ALL
                SELECT ec.id, ec.parent_id, ec.pipeline_name, ec.step_id,
                       ec.accumulated_json, ec.created_at, chain.depth + 1
                FROM event_context ec
                JOIN chain ON ec.id = chain.parent_id
            )
            SELECT id, parent_id, pipeline_name, step_id, accumulated_json, created_at
            FROM chain ORDER BY depth DESC
            "#,
        )
        .bind(leaf_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Err(StoreError::EventContextNotFound(leaf_id.to_string()));
        }
        rows.into_iter().map(from_row).collect()
    }
}

fn from_row(row: ContextRow) -> StoreResult<EventContext> {
    let (id, parent_id, pipeline_name, step_id, accumulated_json, created_at) = row;
    let accumulated = parse_object(&accumulated_json, &id)?;
    Ok(EventContext {
        id: EventContextId::from_string(id),
        parent_id: parent_id.map(EventContextId::from_string),
        pipeline_name,
        step_id,
        accumulated,
        created_at,
    })
}

fn parse_object(raw: &str, owner: &str) -> StoreResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        _ => Err(StoreError::CorruptJson {
            what: "context baggage",
            owner: owner.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductile_db::{init_schema, open_pool};
    use serde_json::json;

    async fn setup() -> (tempfile::TempDir, ContextStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(&dir.path().join("state.db")).await.unwrap();
        init_schema(&pool).await.unwrap();
        (dir, ContextStore::new(pool))
    }

    fn object(value: serde_json::Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn root_sets_origin_anchors_and_children_inherit() {
        let (_dir, store) = setup().await;
        let root = store
            .create(
                None,
                "e2e-chain",
                "processor",
                &object(json!({"origin_user": "matt", "video_url": "https://yt.com/123"})),
            )
            .await
            .unwrap();

        let child = store
            .create(
                Some(&root.id),
                "e2e-chain",
                "notifier",
                &object(json!({"notified": true})),
            )
            .await
            .unwrap();

        assert_eq!(child.accumulated.get("origin_user"), Some(&json!("matt")));
        assert_eq!(child.accumulated.get("notified"), Some(&json!(true)));
        assert_eq!(child.parent_id.as_ref(), Some(&root.id));
    }

    #[tokio::test]
    async fn changing_an_origin_anchor_is_rejected() {
        let (_dir, store) = setup().await;
        let root = store
            .create(None, "p", "s0", &object(json!({"origin_channel_id": "abc"})))
            .await
            .unwrap();

        let err = store
            .create(
                Some(&root.id),
                "p",
                "s1",
                &object(json!({"origin_channel_id": "def"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OriginAnchorImmutable { ref key } if key == "origin_channel_id"));
    }

    #[tokio::test]
    async fn introducing_a_new_origin_key_downstream_is_rejected() {
        let (_dir, store) = setup().await;
        let root = store
            .create(None, "p", "s0", &object(json!({"origin_channel_id": "abc"})))
            .await
            .unwrap();

        let err = store
            .create(
                Some(&root.id),
                "p",
                "s1",
                &object(json!({"origin_user_id": "u-1"})),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OriginAnchorImmutable { ref key } if key == "origin_user_id"));
    }

    #[tokio::test]
    async fn restating_an_equal_origin_anchor_is_allowed() {
        let (_dir, store) = setup().await;
        let root = store
            .create(None, "p", "s0", &object(json!({"origin_user": {"name": "matt"}})))
            .await
            .unwrap();

        // Deep equality, not pointer equality.
        let child = store
            .create(
                Some(&root.id),
                "p",
                "s1",
                &object(json!({"origin_user": {"name": "matt"}})),
            )
            .await
            .unwrap();
        assert_eq!(
            child.accumulated.get("origin_user"),
            Some(&json!({"name": "matt"}))
        );
    }

    #[tokio::test]
    async fn lineage_returns_root_to_leaf() {
        let (_dir, store) = setup().await;
        let root = store
            .create(None, "p", "a", &object(json!({"origin_k": 1})))
            .await
            .unwrap();
        let mid = store
            .create(Some(&root.id), "p", "b", &object(json!({"m": 2})))
            .await
            .unwrap();
        let leaf = store
            .create(Some(&mid.id), "p", "c", &object(json!({"n": 3})))
            .await
            .unwrap();

        let chain = store.lineage(&leaf.id).await.unwrap();
        let steps: Vec<&str> = chain.iter().map(|c| c.step_id.as_str()).collect();
        assert_eq!(steps, ["a", "b", "c"]);

        // Anchors hold at every depth.
        for ctx in &chain {
            assert_eq!(ctx.accumulated.get("origin_k"), Some(&json!(1)));
        }
    }

    #[tokio::test]
    async fn lineage_of_unknown_id_errors() {
        let (_dir, store) = setup().await;
        let err = store.lineage(&EventContextId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::EventContextNotFound(_)));
    }

    #[tokio::test]
    async fn oversize_baggage_is_rejected_without_insert() {
        let (_dir, store) = setup().await;
        let blob = "x".repeat(MAX_JSON_BYTES);
        let err = store
            .create(None, "p", "s0", &object(json!({"huge": blob})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn missing_parent_errors() {
        let (_dir, store) = setup().await;
        let err = store
            .create(Some(&EventContextId::new()), "p", "s", &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EventContextNotFound(_)));
    }
}
