#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **strand-store** – SQLite persistence driver for the Strand graph.
//!
//! One embedded database holds the whole world: typed entities with opaque
//! JSON payloads, projected bonds (mirrored as `relationship` entities so
//! they can be subjects of further bonds), the append-only event log, state
//! snapshots of protocol runs, per-entity embeddings, the archive side table,
//! and an optional FTS5 surface for text search.
//!
//! Writes that touch several rows (bond upsert, archive move, embedding
//! invalidation) run inside one transaction. Entity-save hooks fire after the
//! commit succeeds and are observation-only: a failing hook is logged and
//! never rolls anything back.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use strand_types::{
    Bond, Constellation, Entity, EventClock, EventOp, EventRecord, EventType, JsonMap,
    StateRecord, StateStatus, RELATIONSHIP_TYPE,
};

pub mod vector;

/// Actor name stamped on events the store emits on its own behalf.
const DEFAULT_ACTOR: &str = "kernel";

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Structured storage failures. Backend errors never cross this boundary raw.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store failed (I/O, corruption, serialization).
    #[error("storage operation failed: {0}")]
    Storage(String),
    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("constraint violation: {0}")]
    Constraint(String),
}

fn db_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            use sqlx::error::ErrorKind;
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => StoreError::Constraint(db.message().to_string()),
                _ => StoreError::Storage(err.to_string()),
            }
        }
        _ => StoreError::Storage(err.to_string()),
    }
}

fn json_err(err: serde_json::Error) -> StoreError {
    StoreError::Storage(format!("payload serialization failed: {err}"))
}

//─────────────────────────────
//  Auxiliary records
//─────────────────────────────

/// Hook invoked with `(entity_id, entity_type, data)` after a committed save.
pub type EntityHook = Arc<dyn Fn(&str, &str, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`Store::add_entity_hook`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Result of a confidence update: the value before and after clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfidenceChange {
    /// Confidence stored before the update.
    pub previous: f64,
    /// Confidence stored now (clamped).
    pub new: f64,
}

/// One stored embedding row.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    /// Owning entity id.
    pub entity_id: String,
    /// Model that produced the vector.
    pub model_name: String,
    /// Packed little-endian f32 bytes, `4 * dimension` long.
    pub vector: Vec<u8>,
    /// Element count.
    pub dimension: i64,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// RFC 3339 last-update timestamp.
    pub updated_at: String,
}

/// One archive side-table row.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveRecord {
    /// Archive row id (`archive-*`).
    pub id: String,
    /// Id the row had while live.
    pub original_id: String,
    /// Type the row had while live (`bond` for archived bonds).
    pub original_type: String,
    /// Payload at archive time.
    pub data: Value,
    /// RFC 3339 archive timestamp.
    pub archived_at: Option<String>,
    /// Persona or protocol that initiated the archive.
    pub archived_by: Option<String>,
    /// Why the row was composted.
    pub reason: Option<String>,
    /// Learning distilled from the decomposition, if any.
    pub learning_id: Option<String>,
}

/// One full-text search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Entity id.
    pub id: String,
    /// Entity type tag.
    pub entity_type: String,
    /// Indexed title (falls back to the id on LIKE scans without one).
    pub title: String,
}

pub(crate) fn clamp_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

fn short_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..8].to_string()
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

//─────────────────────────────
//  The store
//─────────────────────────────

/// Handle to one Strand database.
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`. The pool is
/// pinned to a single connection, which keeps writes serialized and makes
/// `:memory:` databases behave as one database rather than one per
/// connection.
pub struct Store {
    pool: SqlitePool,
    path: String,
    actor: String,
    next_seq: AtomicI64,
    fts_enabled: AtomicBool,
    hooks: RwLock<Vec<(HookId, EntityHook)>>,
    next_hook_id: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create a database at `path` and ensure the schema is current.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let display = path.as_ref().display().to_string();
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = Self::pool(options).await?;
        Self::from_pool(pool, display).await
    }

    /// Open an in-memory database. Useful for tests and scratch work.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = Self::pool(options).await?;
        Self::from_pool(pool, ":memory:".to_string()).await
    }

    async fn pool(options: SqliteConnectOptions) -> Result<SqlitePool, StoreError> {
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(db_err)
    }

    async fn from_pool(pool: SqlitePool, path: String) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            path,
            actor: DEFAULT_ACTOR.to_string(),
            next_seq: AtomicI64::new(0),
            fts_enabled: AtomicBool::new(false),
            hooks: RwLock::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        };
        store.migrate().await?;

        let row = sqlx::query("SELECT COALESCE(MAX(clock_seq), 0) AS seq FROM events")
            .fetch_one(&store.pool)
            .await
            .map_err(db_err)?;
        store.next_seq.store(row.get::<i64, _>("seq"), Ordering::SeqCst);

        Ok(store)
    }

    /// Path the store was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the underlying connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        // Append-only event log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                clock_actor TEXT NOT NULL,
                clock_seq INTEGER NOT NULL,
                type TEXT NOT NULL,
                op TEXT NOT NULL,
                persona_id TEXT,
                signature TEXT,
                payload_json TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_events_clock ON events(clock_actor, clock_seq)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // State snapshots for protocol runs
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS states (
                id TEXT PRIMARY KEY,
                protocol_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data_json TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // The entity graph
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                data_json TEXT NOT NULL
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_circle_id \
             ON entities(json_extract(data_json, '$.circle_id'))",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_tags \
             ON entities(json_extract(data_json, '$.tags'))",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Bonds projection table; each row is mirrored as a relationship
        // entity so bonds can be subjects of other bonds.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bonds (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                confidence REAL NOT NULL DEFAULT 1.0,
                data_json TEXT NOT NULL DEFAULT '{}'
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for sql in [
            "CREATE INDEX IF NOT EXISTS idx_bonds_from ON bonds(from_id)",
            "CREATE INDEX IF NOT EXISTS idx_bonds_to ON bonds(to_id)",
            "CREATE INDEX IF NOT EXISTS idx_bonds_type ON bonds(type)",
        ] {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }

        // One canonical embedding per entity, invalidated on entity update.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                entity_id TEXT PRIMARY KEY,
                model_name TEXT NOT NULL,
                vector BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_embeddings_model ON embeddings(model_name)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        // Archive side table: never delete, always compost.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archive (
                id TEXT PRIMARY KEY,
                original_id TEXT NOT NULL,
                original_type TEXT NOT NULL,
                data_json TEXT NOT NULL,
                archived_at TEXT DEFAULT CURRENT_TIMESTAMP,
                archived_by TEXT,
                reason TEXT,
                learning_id TEXT
            ) STRICT
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        for sql in [
            "CREATE INDEX IF NOT EXISTS idx_archive_original_id ON archive(original_id)",
            "CREATE INDEX IF NOT EXISTS idx_archive_original_type ON archive(original_type)",
        ] {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }

        // FTS5 surface. Builds without the module degrade to LIKE scans;
        // the public search contract is unaffected.
        match sqlx::query(
            "CREATE VIRTUAL TABLE IF NOT EXISTS entity_fts USING fts5(id, type, title, body)",
        )
        .execute(&self.pool)
        .await
        {
            Ok(_) => self.fts_enabled.store(true, Ordering::SeqCst),
            Err(err) => {
                debug!(error = %err, "fts5 unavailable; search degrades to LIKE scans");
                self.fts_enabled.store(false, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    //───────────────────── entity hooks ─────────────────────

    /// Register a callback invoked after every committed entity save.
    ///
    /// Hooks receive `(entity_id, entity_type, data)` with the payload that
    /// was committed. They must be short and non-blocking.
    pub fn add_entity_hook(&self, hook: EntityHook) -> HookId {
        let id = HookId(self.next_hook_id.fetch_add(1, Ordering::SeqCst));
        self.hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, hook));
        id
    }

    /// Deregister a hook. Returns `false` if it was not registered.
    pub fn remove_entity_hook(&self, id: HookId) -> bool {
        let mut hooks = self
            .hooks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    fn fire_entity_hooks(&self, entity_id: &str, entity_type: &str, data: &Value) {
        let hooks: Vec<EntityHook> = self
            .hooks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            if let Err(err) = hook(entity_id, entity_type, data) {
                warn!(entity_id, error = %err, "entity hook failed");
            }
        }
    }

    //───────────────────── entities ─────────────────────

    /// Upsert an entity, invalidate its embedding, and fire hooks.
    pub async fn save_entity(
        &self,
        id: &str,
        entity_type: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(data).map_err(json_err)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO entities (id, type, data_json)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                data_json = excluded.data_json
            "#,
        )
        .bind(id)
        .bind(entity_type)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Stale embeddings are never served: any content change drops the row.
        sqlx::query("DELETE FROM embeddings WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        self.index_fts(&mut tx, id, entity_type, data).await?;
        self.emit_event_tx(
            &mut tx,
            EventType::Manifest,
            EventOp::Success,
            json!({ "entity_id": id, "entity_type": entity_type }),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        self.fire_entity_hooks(id, entity_type, data);
        Ok(())
    }

    /// Load an entity by id.
    pub async fn load_entity(&self, id: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query("SELECT id, type, data_json FROM entities WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(entity_from_row).transpose()
    }

    /// All entities carrying the given type tag, in id order.
    pub async fn list_entities_by_type(
        &self,
        entity_type: &str,
    ) -> Result<Vec<Entity>, StoreError> {
        let rows = sqlx::query("SELECT id, type, data_json FROM entities WHERE type = ? ORDER BY id")
            .bind(entity_type)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(entity_from_row).collect()
    }

    /// Entity counts grouped by type tag, in type order.
    pub async fn count_entities_by_type(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let rows = sqlx::query("SELECT type, COUNT(*) AS n FROM entities GROUP BY type ORDER BY type")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("type"), row.get("n")))
            .collect())
    }

    async fn index_fts(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        id: &str,
        entity_type: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        if !self.fts_enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        sqlx::query("DELETE FROM entity_fts WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;

        let Some(title) = data.get("title").and_then(Value::as_str) else {
            return Ok(());
        };
        let body = ["body", "content", "description"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_str))
            .unwrap_or("");

        sqlx::query("INSERT INTO entity_fts (id, type, title, body) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(entity_type)
            .bind(title)
            .bind(body)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    //───────────────────── bonds ─────────────────────

    /// Upsert a bond and its mirrored `relationship` entity.
    ///
    /// Confidence is clamped to `[0, 1]`. The mirror write is a real entity
    /// upsert: it invalidates that id's embedding and fires entity hooks.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_bond(
        &self,
        id: &str,
        bond_type: &str,
        from_id: &str,
        to_id: &str,
        status: &str,
        confidence: f64,
        data: &Value,
    ) -> Result<(), StoreError> {
        let confidence = clamp_confidence(confidence);
        let payload = serde_json::to_string(data).map_err(json_err)?;

        // The bond is also an entity, so it can be the subject of other bonds.
        let mut mirror = JsonMap::new();
        mirror.insert("title".into(), json!(format!("{from_id} --{bond_type}--> {to_id}")));
        mirror.insert("bond_type".into(), json!(bond_type));
        mirror.insert("from_id".into(), json!(from_id));
        mirror.insert("to_id".into(), json!(to_id));
        mirror.insert("status".into(), json!(status));
        mirror.insert("confidence".into(), json!(confidence));
        if let Value::Object(extra) = data {
            for (key, value) in extra {
                mirror.insert(key.clone(), value.clone());
            }
        }
        let mirror = Value::Object(mirror);
        let mirror_payload = serde_json::to_string(&mirror).map_err(json_err)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO bonds (id, type, from_id, to_id, status, confidence, data_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                from_id = excluded.from_id,
                to_id = excluded.to_id,
                status = excluded.status,
                confidence = excluded.confidence,
                data_json = excluded.data_json
            "#,
        )
        .bind(id)
        .bind(bond_type)
        .bind(from_id)
        .bind(to_id)
        .bind(status)
        .bind(confidence)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO entities (id, type, data_json)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                data_json = excluded.data_json
            "#,
        )
        .bind(id)
        .bind(RELATIONSHIP_TYPE)
        .bind(&mirror_payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM embeddings WHERE entity_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        self.index_fts(&mut tx, id, RELATIONSHIP_TYPE, &mirror).await?;
        self.emit_event_tx(
            &mut tx,
            EventType::Bond,
            EventOp::Success,
            json!({ "bond_id": id, "bond_type": bond_type, "from_id": from_id, "to_id": to_id }),
        )
        .await?;

        tx.commit().await.map_err(db_err)?;
        self.fire_entity_hooks(id, RELATIONSHIP_TYPE, &mirror);
        Ok(())
    }

    /// Load a single bond by id.
    pub async fn get_bond(&self, id: &str) -> Result<Option<Bond>, StoreError> {
        let row = sqlx::query("SELECT * FROM bonds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(bond_from_row).transpose()
    }

    /// All bonds originating from an entity.
    pub async fn get_bonds_from(&self, entity_id: &str) -> Result<Vec<Bond>, StoreError> {
        let rows = sqlx::query("SELECT * FROM bonds WHERE from_id = ?")
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(bond_from_row).collect()
    }

    /// All bonds pointing at an entity.
    pub async fn get_bonds_to(&self, entity_id: &str) -> Result<Vec<Bond>, StoreError> {
        let rows = sqlx::query("SELECT * FROM bonds WHERE to_id = ?")
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(bond_from_row).collect()
    }

    /// The full tension network around an entity.
    pub async fn get_constellation(&self, entity_id: &str) -> Result<Constellation, StoreError> {
        Ok(Constellation {
            entity_id: entity_id.to_string(),
            outgoing: self.get_bonds_from(entity_id).await?,
            incoming: self.get_bonds_to(entity_id).await?,
        })
    }

    /// Update a bond's confidence, mirroring into the relationship entity.
    ///
    /// Returns `None` if the bond does not exist.
    pub async fn update_bond_confidence(
        &self,
        id: &str,
        confidence: f64,
    ) -> Result<Option<ConfidenceChange>, StoreError> {
        let row = sqlx::query("SELECT confidence FROM bonds WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let previous: f64 = row.get("confidence");
        let confidence = clamp_confidence(confidence);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("UPDATE bonds SET confidence = ? WHERE id = ?")
            .bind(confidence)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "UPDATE entities SET data_json = json_set(data_json, '$.confidence', ?) WHERE id = ?",
        )
        .bind(confidence)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some(ConfidenceChange { previous, new: confidence }))
    }

    //───────────────────── events ─────────────────────

    /// Next sequence number for this store's actor clock.
    pub fn next_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Append a caller-built event record verbatim.
    pub async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        insert_event(&mut tx, event).await?;
        tx.commit().await.map_err(db_err)
    }

    /// Build an event on this store's actor clock and append it.
    pub async fn emit_event(
        &self,
        event_type: EventType,
        op: EventOp,
        persona_id: Option<&str>,
        payload: Value,
    ) -> Result<EventRecord, StoreError> {
        let event = EventRecord {
            id: format!("event-{}", short_id()),
            clock: EventClock { actor: self.actor.clone(), seq: self.next_seq() },
            event_type,
            op,
            persona_id: persona_id.map(str::to_string),
            signature: None,
            payload,
        };
        self.append_event(&event).await?;
        Ok(event)
    }

    async fn emit_event_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event_type: EventType,
        op: EventOp,
        payload: Value,
    ) -> Result<(), StoreError> {
        let event = EventRecord {
            id: format!("event-{}", short_id()),
            clock: EventClock { actor: self.actor.clone(), seq: self.next_seq() },
            event_type,
            op,
            persona_id: None,
            signature: None,
            payload,
        };
        insert_event(tx, &event).await
    }

    /// All events, ordered by sequence number.
    pub async fn list_events(&self) -> Result<Vec<EventRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM events ORDER BY clock_seq")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter().map(event_from_row).collect()
    }

    //───────────────────── states ─────────────────────

    /// Upsert a protocol run snapshot.
    pub async fn save_state(&self, state: &StateRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&state.data).map_err(json_err)?;
        let status = serde_json::to_value(state.status)
            .map_err(json_err)?
            .as_str()
            .unwrap_or("pending")
            .to_string();
        sqlx::query(
            r#"
            INSERT INTO states (id, protocol_id, status, data_json)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                data_json = excluded.data_json
            "#,
        )
        .bind(&state.id)
        .bind(&state.data.protocol_id)
        .bind(&status)
        .bind(&payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Load a snapshot by state id.
    pub async fn load_state(&self, state_id: &str) -> Result<Option<StateRecord>, StoreError> {
        let row = sqlx::query("SELECT id, status, data_json FROM states WHERE id = ?")
            .bind(state_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let status: StateStatus =
            serde_json::from_value(Value::String(row.get::<String, _>("status"))).map_err(json_err)?;
        let data = serde_json::from_str(&row.get::<String, _>("data_json")).map_err(json_err)?;
        Ok(Some(StateRecord { id: row.get("id"), status, data }))
    }

    //───────────────────── embeddings ─────────────────────

    /// Store the canonical embedding for an entity.
    ///
    /// The entity row must exist (foreign key). `vector` is packed
    /// little-endian f32 bytes; see [`vector::encode`].
    pub async fn save_embedding(
        &self,
        entity_id: &str,
        model_name: &str,
        vector: &[u8],
        dimension: i64,
    ) -> Result<(), StoreError> {
        let timestamp = now();
        sqlx::query(
            r#"
            INSERT INTO embeddings (entity_id, model_name, vector, dimension, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(entity_id) DO UPDATE SET
                model_name = excluded.model_name,
                vector = excluded.vector,
                dimension = excluded.dimension,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(entity_id)
        .bind(model_name)
        .bind(vector)
        .bind(dimension)
        .bind(&timestamp)
        .bind(&timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Fetch the embedding for an entity, if one is stored.
    pub async fn get_embedding(
        &self,
        entity_id: &str,
    ) -> Result<Option<EmbeddingRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM embeddings WHERE entity_id = ?")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(embedding_from_row))
    }

    /// Drop the embedding for an entity. Returns whether a row existed.
    pub async fn delete_embedding(&self, entity_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM embeddings WHERE entity_id = ?")
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether an entity has a stored embedding.
    pub async fn has_embedding(&self, entity_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM embeddings WHERE entity_id = ? LIMIT 1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// All stored embeddings, optionally filtered by model, for batch work.
    pub async fn get_all_embeddings(
        &self,
        model_name: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM embeddings");
        if model_name.is_some() {
            sql.push_str(" WHERE model_name = ?");
        }
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(model) = model_name {
            query = query.bind(model);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.into_iter().map(embedding_from_row).collect())
    }

    //───────────────────── archive ─────────────────────

    /// Move an entity to the archive table. Never delete, always compost.
    ///
    /// Returns `None` if the entity does not exist. The entity's embedding
    /// goes with it (cascade); its FTS row is dropped.
    pub async fn archive_entity(
        &self,
        entity_id: &str,
        reason: &str,
        archived_by: Option<&str>,
        learning_id: Option<&str>,
    ) -> Result<Option<ArchiveRecord>, StoreError> {
        let row = sqlx::query("SELECT id, type, data_json FROM entities WHERE id = ?")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let entity = entity_from_row(row)?;

        let archive_id = format!("archive-{}", short_id());
        let archived_at = now();
        let payload = serde_json::to_string(&entity.data).map_err(json_err)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO archive
                (id, original_id, original_type, data_json, archived_at, archived_by, reason, learning_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&archive_id)
        .bind(&entity.id)
        .bind(&entity.entity_type)
        .bind(&payload)
        .bind(&archived_at)
        .bind(archived_by)
        .bind(reason)
        .bind(learning_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM entities WHERE id = ?")
            .bind(entity_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if self.fts_enabled.load(Ordering::SeqCst) {
            sqlx::query("DELETE FROM entity_fts WHERE id = ?")
                .bind(entity_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        Ok(Some(ArchiveRecord {
            id: archive_id,
            original_id: entity.id,
            original_type: entity.entity_type,
            data: entity.data,
            archived_at: Some(archived_at),
            archived_by: archived_by.map(str::to_string),
            reason: Some(reason.to_string()),
            learning_id: learning_id.map(str::to_string),
        }))
    }

    /// Move a bond to the archive table (original type recorded as `bond`).
    pub async fn archive_bond(
        &self,
        bond_id: &str,
        reason: &str,
        archived_by: Option<&str>,
    ) -> Result<Option<ArchiveRecord>, StoreError> {
        let Some(bond) = self.get_bond(bond_id).await? else {
            return Ok(None);
        };

        let archive_id = format!("archive-bond-{}", short_id());
        let archived_at = now();
        let data = serde_json::to_value(&bond).map_err(json_err)?;
        let payload = serde_json::to_string(&data).map_err(json_err)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO archive
                (id, original_id, original_type, data_json, archived_at, archived_by, reason)
            VALUES (?, ?, 'bond', ?, ?, ?, ?)
            "#,
        )
        .bind(&archive_id)
        .bind(&bond.id)
        .bind(&payload)
        .bind(&archived_at)
        .bind(archived_by)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM bonds WHERE id = ?")
            .bind(bond_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some(ArchiveRecord {
            id: archive_id,
            original_id: bond.id,
            original_type: "bond".to_string(),
            data,
            archived_at: Some(archived_at),
            archived_by: archived_by.map(str::to_string),
            reason: Some(reason.to_string()),
            learning_id: None,
        }))
    }

    /// Restore an archived entity to the live table and drop the archive row.
    ///
    /// Fails with a constraint violation if the original id is live again.
    pub async fn resurrect_entity(&self, archive_id: &str) -> Result<Option<Entity>, StoreError> {
        let row = sqlx::query(
            "SELECT original_id, original_type, data_json FROM archive WHERE id = ?",
        )
        .bind(archive_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Ok(None);
        };

        let original_id: String = row.get("original_id");
        let original_type: String = row.get("original_type");
        let payload: String = row.get("data_json");
        let data: Value = serde_json::from_str(&payload).map_err(json_err)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("INSERT INTO entities (id, type, data_json) VALUES (?, ?, ?)")
            .bind(&original_id)
            .bind(&original_type)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        self.index_fts(&mut tx, &original_id, &original_type, &data).await?;
        sqlx::query("DELETE FROM archive WHERE id = ?")
            .bind(archive_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        Ok(Some(Entity { id: original_id, entity_type: original_type, data }))
    }

    /// Archived records, newest first, optionally filtered.
    pub async fn get_archived(
        &self,
        original_id: Option<&str>,
        original_type: Option<&str>,
    ) -> Result<Vec<ArchiveRecord>, StoreError> {
        let mut sql = String::from("SELECT * FROM archive WHERE 1=1");
        if original_id.is_some() {
            sql.push_str(" AND original_id = ?");
        }
        if original_type.is_some() {
            sql.push_str(" AND original_type = ?");
        }
        sql.push_str(" ORDER BY archived_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(id) = original_id {
            query = query.bind(id);
        }
        if let Some(kind) = original_type {
            query = query.bind(kind);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(archive_from_row).collect()
    }

    //───────────────────── search ─────────────────────

    /// Full-text search over indexed entities.
    ///
    /// Uses the FTS5 table when available and falls back to a LIKE scan over
    /// `entities` otherwise (or when the match expression itself errors).
    pub async fn search_entities(
        &self,
        query: &str,
        entity_type: Option<&str>,
        limit: i64,
    ) -> Result<Vec<SearchHit>, StoreError> {
        if self.fts_enabled.load(Ordering::SeqCst) {
            let mut sql = String::from("SELECT id, type, title FROM entity_fts WHERE entity_fts MATCH ?");
            if entity_type.is_some() {
                sql.push_str(" AND type = ?");
            }
            sql.push_str(" LIMIT ?");

            let mut fts = sqlx::query(&sql).bind(query);
            if let Some(kind) = entity_type {
                fts = fts.bind(kind);
            }
            match fts.bind(limit).fetch_all(&self.pool).await {
                Ok(rows) => {
                    return Ok(rows
                        .into_iter()
                        .map(|row| SearchHit {
                            id: row.get("id"),
                            entity_type: row.get("type"),
                            title: row.get("title"),
                        })
                        .collect());
                }
                Err(err) => {
                    debug!(error = %err, "fts query failed; falling back to LIKE scan");
                }
            }
        }

        let mut sql = String::from(
            "SELECT id, type, COALESCE(json_extract(data_json, '$.title'), id) AS title \
             FROM entities WHERE data_json LIKE ?",
        );
        if entity_type.is_some() {
            sql.push_str(" AND type = ?");
        }
        sql.push_str(" LIMIT ?");

        let pattern = format!("%{query}%");
        let mut like = sqlx::query(&sql).bind(&pattern);
        if let Some(kind) = entity_type {
            like = like.bind(kind);
        }
        let rows = like.bind(limit).fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows
            .into_iter()
            .map(|row| SearchHit {
                id: row.get("id"),
                entity_type: row.get("type"),
                title: row.get("title"),
            })
            .collect())
    }
}

//─────────────────────────────
//  Row mapping
//─────────────────────────────

fn entity_from_row(row: SqliteRow) -> Result<Entity, StoreError> {
    let data = serde_json::from_str(&row.get::<String, _>("data_json")).map_err(json_err)?;
    Ok(Entity { id: row.get("id"), entity_type: row.get("type"), data })
}

fn bond_from_row(row: SqliteRow) -> Result<Bond, StoreError> {
    let data = serde_json::from_str(&row.get::<String, _>("data_json")).map_err(json_err)?;
    Ok(Bond {
        id: row.get("id"),
        bond_type: row.get("type"),
        from_id: row.get("from_id"),
        to_id: row.get("to_id"),
        status: row.get("status"),
        confidence: row.get("confidence"),
        data,
    })
}

fn embedding_from_row(row: SqliteRow) -> EmbeddingRecord {
    EmbeddingRecord {
        entity_id: row.get("entity_id"),
        model_name: row.get("model_name"),
        vector: row.get("vector"),
        dimension: row.get("dimension"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn archive_from_row(row: SqliteRow) -> Result<ArchiveRecord, StoreError> {
    let data = serde_json::from_str(&row.get::<String, _>("data_json")).map_err(json_err)?;
    Ok(ArchiveRecord {
        id: row.get("id"),
        original_id: row.get("original_id"),
        original_type: row.get("original_type"),
        data,
        archived_at: row.get("archived_at"),
        archived_by: row.get("archived_by"),
        reason: row.get("reason"),
        learning_id: row.get("learning_id"),
    })
}

fn event_from_row(row: SqliteRow) -> Result<EventRecord, StoreError> {
    let event_type: EventType =
        serde_json::from_value(Value::String(row.get::<String, _>("type"))).map_err(json_err)?;
    let op: EventOp =
        serde_json::from_value(Value::String(row.get::<String, _>("op"))).map_err(json_err)?;
    let payload = serde_json::from_str(&row.get::<String, _>("payload_json")).map_err(json_err)?;
    Ok(EventRecord {
        id: row.get("id"),
        clock: EventClock { actor: row.get("clock_actor"), seq: row.get("clock_seq") },
        event_type,
        op,
        persona_id: row.get("persona_id"),
        signature: row.get("signature"),
        payload,
    })
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    event: &EventRecord,
) -> Result<(), StoreError> {
    let event_type = serde_json::to_value(event.event_type)
        .map_err(json_err)?
        .as_str()
        .unwrap_or_default()
        .to_string();
    let op = serde_json::to_value(event.op)
        .map_err(json_err)?
        .as_str()
        .unwrap_or_default()
        .to_string();
    let payload = serde_json::to_string(&event.payload).map_err(json_err)?;

    sqlx::query(
        r#"
        INSERT INTO events
            (id, clock_actor, clock_seq, type, op, persona_id, signature, payload_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.clock.actor)
    .bind(event.clock.seq)
    .bind(&event_type)
    .bind(&op)
    .bind(&event.persona_id)
    .bind(&event.signature)
    .bind(&payload)
    .execute(&mut **tx)
    .await
    .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    async fn store() -> Store {
        Store::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn entity_save_is_an_idempotent_upsert() {
        let store = store().await;
        let data = json!({"title": "F", "status": "active"});

        store.save_entity("focus-1", "focus", &data).await.unwrap();
        store.save_entity("focus-1", "focus", &data).await.unwrap();

        let loaded = store.load_entity("focus-1").await.unwrap().unwrap();
        assert_eq!(loaded.entity_type, "focus");
        assert_eq!(loaded.data, data);
        assert_eq!(store.list_entities_by_type("focus").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hooks_fire_once_per_save_after_commit() {
        let store = store().await;
        let (tx, rx) = mpsc::channel::<(String, Value)>();
        let hook: EntityHook = Arc::new(move |id, _kind, data| {
            tx.send((id.to_string(), data.clone())).unwrap();
            Ok(())
        });
        store.add_entity_hook(hook);

        let data = json!({"v": 1});
        store.save_entity("e1", "x", &data).await.unwrap();
        store.save_entity("e1", "x", &data).await.unwrap();

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, data);

        // The hook observed the payload that is now durably readable.
        let live = store.load_entity("e1").await.unwrap().unwrap();
        assert_eq!(live.data, seen[1].1);
    }

    #[tokio::test]
    async fn failing_hook_does_not_block_others_or_the_save() {
        let store = store().await;
        let counter = Arc::new(AtomicUsize::new(0));

        let failing: EntityHook = Arc::new(|_, _, _| anyhow::bail!("observer down"));
        let counting = {
            let counter = Arc::clone(&counter);
            let hook: EntityHook = Arc::new(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            hook
        };
        store.add_entity_hook(failing);
        store.add_entity_hook(counting);

        store.save_entity("e1", "x", &json!({"v": 1})).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(store.load_entity("e1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn removed_hooks_stop_firing() {
        let store = store().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let hook: EntityHook = {
            let counter = Arc::clone(&counter);
            Arc::new(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let id = store.add_entity_hook(hook);
        store.save_entity("e1", "x", &json!({})).await.unwrap();
        assert!(store.remove_entity_hook(id));
        assert!(!store.remove_entity_hook(id));
        store.save_entity("e1", "x", &json!({})).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn entity_save_invalidates_embedding() {
        let store = store().await;
        store.save_entity("e1", "x", &json!({"v": 1})).await.unwrap();
        store
            .save_embedding("e1", "m", &[0u8; 8], 2)
            .await
            .unwrap();
        assert!(store.get_embedding("e1").await.unwrap().is_some());

        store.save_entity("e1", "x", &json!({"v": 2})).await.unwrap();
        assert!(store.get_embedding("e1").await.unwrap().is_none());
        assert!(!store.has_embedding("e1").await.unwrap());
    }

    #[tokio::test]
    async fn embedding_requires_live_entity() {
        let store = store().await;
        let err = store
            .save_embedding("ghost", "m", &[0u8; 4], 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn embedding_round_trip_and_listing() {
        let store = store().await;
        store.save_entity("e1", "x", &json!({})).await.unwrap();
        store.save_entity("e2", "x", &json!({})).await.unwrap();

        let bytes = vector::encode(&[0.5f32, -1.0, 2.25]);
        store.save_embedding("e1", "model-a", &bytes, 3).await.unwrap();
        store.save_embedding("e2", "model-b", &[0u8; 4], 1).await.unwrap();

        let record = store.get_embedding("e1").await.unwrap().unwrap();
        assert_eq!(record.dimension, 3);
        assert_eq!(vector::decode(&record.vector).unwrap(), vec![0.5f32, -1.0, 2.25]);

        let only_a = store.get_all_embeddings(Some("model-a"), None).await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].entity_id, "e1");
        assert_eq!(store.get_all_embeddings(None, Some(1)).await.unwrap().len(), 1);

        assert!(store.delete_embedding("e1").await.unwrap());
        assert!(!store.delete_embedding("e1").await.unwrap());
    }

    #[tokio::test]
    async fn bond_confidence_is_clamped_and_mirrored() {
        let store = store().await;
        store
            .save_bond("bond-1", "verifies", "a", "b", "active", 1.7, &json!({}))
            .await
            .unwrap();

        let bond = store.get_bond("bond-1").await.unwrap().unwrap();
        assert_eq!(bond.confidence, 1.0);

        let mirror = store.load_entity("bond-1").await.unwrap().unwrap();
        assert_eq!(mirror.entity_type, RELATIONSHIP_TYPE);
        assert_eq!(mirror.data["confidence"], json!(1.0));
        assert_eq!(mirror.data["bond_type"], json!("verifies"));
        assert_eq!(mirror.data["from_id"], json!("a"));
    }

    #[tokio::test]
    async fn update_bond_confidence_reports_previous_value() {
        let store = store().await;
        store
            .save_bond("bond-1", "verifies", "a", "b", "active", 0.8, &json!({}))
            .await
            .unwrap();

        let change = store.update_bond_confidence("bond-1", -0.5).await.unwrap().unwrap();
        assert_eq!(change.previous, 0.8);
        assert_eq!(change.new, 0.0);

        let mirror = store.load_entity("bond-1").await.unwrap().unwrap();
        assert_eq!(mirror.data["confidence"], json!(0.0));

        assert!(store.update_bond_confidence("missing", 0.5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn constellation_unions_both_directions() {
        let store = store().await;
        store
            .save_bond("b1", "surfaces", "center", "x", "active", 1.0, &json!({}))
            .await
            .unwrap();
        store
            .save_bond("b2", "verifies", "y", "center", "active", 1.0, &json!({}))
            .await
            .unwrap();

        let constellation = store.get_constellation("center").await.unwrap();
        assert_eq!(constellation.outgoing.len(), 1);
        assert_eq!(constellation.outgoing[0].id, "b1");
        assert_eq!(constellation.incoming.len(), 1);
        assert_eq!(constellation.incoming[0].id, "b2");
    }

    #[tokio::test]
    async fn archive_then_resurrect_round_trips() {
        let store = store().await;
        let data = json!({"title": "Old", "v": 3});
        store.save_entity("e1", "note", &data).await.unwrap();
        store.save_embedding("e1", "m", &[0u8; 4], 1).await.unwrap();

        let record = store
            .archive_entity("e1", "stale", Some("persona-1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.original_id, "e1");
        assert!(store.load_entity("e1").await.unwrap().is_none());
        // Embedding goes with the entity via cascade.
        assert!(store.get_embedding("e1").await.unwrap().is_none());

        let listed = store.get_archived(Some("e1"), None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].reason.as_deref(), Some("stale"));

        let revived = store.resurrect_entity(&record.id).await.unwrap().unwrap();
        assert_eq!(revived.id, "e1");
        assert_eq!(revived.entity_type, "note");
        assert_eq!(revived.data, data);
        assert!(store.get_archived(Some("e1"), None).await.unwrap().is_empty());
        assert!(store.resurrect_entity(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn archive_bond_removes_projection_row() {
        let store = store().await;
        store
            .save_bond("b1", "surfaces", "a", "b", "active", 0.5, &json!({}))
            .await
            .unwrap();

        let record = store.archive_bond("b1", "dissolved", None).await.unwrap().unwrap();
        assert_eq!(record.original_type, "bond");
        assert!(store.get_bond("b1").await.unwrap().is_none());

        let listed = store.get_archived(None, Some("bond")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].data["confidence"], json!(0.5));
    }

    #[tokio::test]
    async fn saves_emit_events_with_monotonic_clocks() {
        let store = store().await;
        store.save_entity("e1", "x", &json!({})).await.unwrap();
        store
            .save_bond("b1", "surfaces", "e1", "e1", "active", 1.0, &json!({}))
            .await
            .unwrap();
        store
            .emit_event(EventType::Signal, EventOp::Success, Some("persona-1"), json!({"k": 1}))
            .await
            .unwrap();

        let events = store.list_events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].event_type, EventType::Manifest);
        assert_eq!(events[1].event_type, EventType::Bond);
        assert_eq!(events[2].event_type, EventType::Signal);
        assert_eq!(events[2].persona_id.as_deref(), Some("persona-1"));
        let seqs: Vec<i64> = events.iter().map(|e| e.clock.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn state_snapshots_round_trip() {
        use strand_types::{StateData, StateStatus};

        let store = store().await;
        let state = StateRecord {
            id: "state-1".into(),
            status: StateStatus::Fulfilled,
            data: StateData {
                protocol_id: "protocol-x".into(),
                protocol_version: 1,
                parent_state_id: None,
                cursor: None,
                exit_node: Some("done".into()),
                memory: JsonMap::new(),
                error: None,
            },
        };
        store.save_state(&state).await.unwrap();
        let loaded = store.load_state("state-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn search_matches_titles_and_respects_type_filter() {
        let store = store().await;
        store
            .save_entity("s1", "story", &json!({"title": "Weaving the graph", "body": "bonds"}))
            .await
            .unwrap();
        store
            .save_entity("p1", "pattern", &json!({"title": "Graph traversal", "content": "walk"}))
            .await
            .unwrap();
        store.save_entity("x1", "misc", &json!({"v": 1})).await.unwrap();

        let hits = store.search_entities("graph", None, 10).await.unwrap();
        assert_eq!(hits.len(), 2);

        let stories = store.search_entities("graph", Some("story"), 10).await.unwrap();
        assert_eq!(stories.len(), 1);
        assert_eq!(stories[0].id, "s1");
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strand.db");

        {
            let store = Store::open(&path).await.unwrap();
            store.save_entity("e1", "x", &json!({"v": 1})).await.unwrap();
            store.close().await;
        }
        {
            let store = Store::open(&path).await.unwrap();
            let loaded = store.load_entity("e1").await.unwrap().unwrap();
            assert_eq!(loaded.data, json!({"v": 1}));
            // The actor clock resumes past what is already on disk.
            store.save_entity("e2", "x", &json!({})).await.unwrap();
            let events = store.list_events().await.unwrap();
            assert_eq!(events.last().unwrap().clock.seq, 2);
        }
    }

    mod clamping {
        use super::super::clamp_confidence;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn clamp_stays_in_unit_interval(c in proptest::num::f64::NORMAL) {
                let clamped = clamp_confidence(c);
                prop_assert!((0.0..=1.0).contains(&clamped));
                if (0.0..=1.0).contains(&c) {
                    prop_assert_eq!(clamped, c);
                }
            }
        }
    }
}
