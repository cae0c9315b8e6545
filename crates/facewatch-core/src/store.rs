//! SQLite-backed identity store.
//!
//! Holds identities, their embeddings and face snapshots. Every operation is
//! serialized through one connection lock. After each mutation the Confirmed
//! gallery is rebuilt and swapped in, so matching reads a point-in-time
//! snapshot without touching SQLite.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::matcher::{EuclideanMatcher, GalleryEntry, Matcher};
use crate::types::{
    Embedding, Fingerprint, Identity, IdentityId, IdentityKind, MatchResult, Snapshot,
    EMBEDDING_DIM,
};

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity not found: {0}")]
    NotFound(IdentityId),
    #[error("identity {id} is {actual}, expected {expected}")]
    KindMismatch {
        id: IdentityId,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("cannot merge identity {0} into itself")]
    SelfMerge(IdentityId),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("embedding {0} is already stored")]
    DuplicateEmbedding(Fingerprint),
    #[error("identity {label}/{} already exists", .secondary_id.as_deref().unwrap_or("-"))]
    DuplicateIdentity {
        label: String,
        secondary_id: Option<String>,
    },
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}

/// Fields for a new identity row.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub label: String,
    pub secondary_id: Option<String>,
    pub kind: IdentityKind,
    pub important: bool,
}

impl NewIdentity {
    pub fn confirmed(label: impl Into<String>, secondary_id: Option<String>) -> Self {
        Self {
            label: label.into(),
            secondary_id,
            kind: IdentityKind::Confirmed,
            important: false,
        }
    }

    pub fn temporary(label: impl Into<String>, secondary_id: Option<String>) -> Self {
        Self {
            label: label.into(),
            secondary_id,
            kind: IdentityKind::Temporary,
            important: false,
        }
    }
}

/// A Temporary identity removed by a purge, with the fingerprints it owned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PurgedIdentity {
    pub id: IdentityId,
    pub fingerprints: Vec<Fingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub identities: u64,
    pub temporary: u64,
    pub confirmed: u64,
    pub important: u64,
    pub embeddings: u64,
    pub snapshots: u64,
}

/// How [`IdentityStore::settle`] resolved a placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The placeholder itself became Confirmed.
    Promoted(Identity),
    /// The placeholder was absorbed into an existing Confirmed identity.
    Merged { target: IdentityId, moved: usize },
}

/// Persistent repository of identities.
pub struct IdentityStore {
    conn: Mutex<Connection>,
    gallery: RwLock<Arc<Vec<GalleryEntry>>>,
    clock: Arc<dyn Clock>,
}

impl IdentityStore {
    /// Open or create the store at the given SQLite path.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, clock)?;
        tracing::info!(path = %path.display(), "identity store opened");
        Ok(store)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        let gallery = load_gallery(&conn)?;
        tracing::debug!(entries = gallery.len(), "confirmed gallery loaded");
        Ok(Self {
            conn: Mutex::new(conn),
            gallery: RwLock::new(Arc::new(gallery)),
            clock,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    /// Rebuild the gallery after a committed change. On failure the previous
    /// gallery stays in place and the change is still reported as done.
    fn refresh_gallery(&self, conn: &Connection) {
        match load_gallery(conn) {
            Ok(entries) => {
                *self.gallery.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(entries);
            }
            Err(e) => tracing::warn!(error = %e, "gallery refresh failed, keeping previous gallery"),
        }
    }

    /// Point-in-time copy of every Confirmed embedding.
    pub fn gallery(&self) -> Arc<Vec<GalleryEntry>> {
        self.gallery
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Insert a new identity without embeddings.
    pub fn add_identity(&self, new: NewIdentity) -> Result<Identity> {
        let conn = self.lock();
        let id = insert_identity(&conn, &new, self.now_ms())?;
        self.refresh_gallery(&conn);
        load_identity(&conn, id)?.ok_or(StoreError::NotFound(id))
    }

    /// Attach an embedding to an existing identity. Returns the embedding row id.
    pub fn add_embedding(&self, identity_id: IdentityId, embedding: &Embedding) -> Result<i64> {
        validate_embedding(embedding)?;
        let conn = self.lock();
        if load_identity(&conn, identity_id)?.is_none() {
            return Err(StoreError::NotFound(identity_id));
        }
        let row_id = insert_embedding(&conn, identity_id, embedding, self.now_ms())?;
        self.refresh_gallery(&conn);
        Ok(row_id)
    }

    /// Attach a face snapshot to an existing identity. Returns the snapshot row id.
    pub fn add_snapshot(&self, identity_id: IdentityId, snapshot: &Snapshot) -> Result<i64> {
        let conn = self.lock();
        if load_identity(&conn, identity_id)?.is_none() {
            return Err(StoreError::NotFound(identity_id));
        }
        insert_snapshot(&conn, identity_id, snapshot, self.now_ms())
    }

    /// Persist a Temporary identity with its embedding and snapshot in one
    /// transaction. Nothing is written if any part fails.
    pub fn create_temporary(
        &self,
        label: &str,
        secondary_id: &str,
        embedding: &Embedding,
        snapshot: &Snapshot,
    ) -> Result<Identity> {
        validate_embedding(embedding)?;
        let now = self.now_ms();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let new = NewIdentity::temporary(label, Some(secondary_id.to_string()));
        let id = insert_identity(&tx, &new, now)?;
        insert_embedding(&tx, id, embedding, now)?;
        insert_snapshot(&tx, id, snapshot, now)?;
        let identity = load_identity(&tx, id)?.ok_or(StoreError::NotFound(id))?;
        tx.commit()?;
        self.refresh_gallery(&conn);
        tracing::debug!(identity_id = %id, label, "temporary identity stored");
        Ok(identity)
    }

    pub fn get(&self, id: IdentityId) -> Result<Option<Identity>> {
        let conn = self.lock();
        load_identity(&conn, id)
    }

    /// Look up an identity by label and secondary id. A Confirmed identity is
    /// preferred when both kinds carry the same pair.
    pub fn find_by_label(&self, label: &str, secondary_id: Option<&str>) -> Result<Option<Identity>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities
             WHERE label = ?1 AND secondary_id IS ?2
             ORDER BY CASE kind WHEN 'confirmed' THEN 0 ELSE 1 END, created_at, id
             LIMIT 1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![label, secondary_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_identity(row)?)),
            None => Ok(None),
        }
    }

    /// Closest Confirmed identity strictly within `threshold`.
    pub fn find_nearest(&self, embedding: &Embedding, threshold: f32) -> Option<MatchResult> {
        let gallery = self.gallery();
        EuclideanMatcher.best_match(embedding, &gallery, threshold)
    }

    /// Move every embedding and snapshot of `source` onto `target`, then delete
    /// `source`. `target` must be Confirmed. Returns the number of embeddings moved.
    pub fn merge(&self, source: IdentityId, target: IdentityId) -> Result<usize> {
        if source == target {
            return Err(StoreError::SelfMerge(source));
        }
        let now = self.now_ms();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        if load_identity(&tx, source)?.is_none() {
            return Err(StoreError::NotFound(source));
        }
        let dst = load_identity(&tx, target)?.ok_or(StoreError::NotFound(target))?;
        if dst.kind != IdentityKind::Confirmed {
            return Err(StoreError::KindMismatch {
                id: target,
                expected: IdentityKind::Confirmed.as_str(),
                actual: dst.kind.as_str(),
            });
        }
        let moved = absorb(&tx, source, target, now)?;
        tx.commit()?;
        self.refresh_gallery(&conn);

        tracing::info!(source = %source, target = %target, moved, "identities merged");
        Ok(moved)
    }

    /// Turn a Temporary identity into a Confirmed one in place.
    pub fn promote(&self, id: IdentityId, label: &str, secondary_id: Option<&str>) -> Result<Identity> {
        let now = self.now_ms();
        let conn = self.lock();
        let current = load_identity(&conn, id)?.ok_or(StoreError::NotFound(id))?;
        ensure_temporary(&current)?;
        confirm_in_place(&conn, id, label, secondary_id, now)?;
        self.refresh_gallery(&conn);

        tracing::info!(identity_id = %id, label, "identity promoted");
        load_identity(&conn, id)?.ok_or(StoreError::NotFound(id))
    }

    /// Give a Temporary identity the name the recognition service reported.
    ///
    /// If a Confirmed identity already carries `label`/`secondary_id` the
    /// placeholder is merged into it, otherwise it is promoted in place. The
    /// lookup and the write run in one transaction under the connection lock,
    /// so two placeholders of the same person settle as one promote and one
    /// merge.
    pub fn settle(
        &self,
        temp_id: IdentityId,
        label: &str,
        secondary_id: Option<&str>,
    ) -> Result<Settlement> {
        let now = self.now_ms();
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current = load_identity(&tx, temp_id)?.ok_or(StoreError::NotFound(temp_id))?;
        ensure_temporary(&current)?;

        let settlement = match find_confirmed(&tx, label, secondary_id)? {
            Some(target) => Settlement::Merged {
                target,
                moved: absorb(&tx, temp_id, target, now)?,
            },
            None => {
                confirm_in_place(&tx, temp_id, label, secondary_id, now)?;
                let identity =
                    load_identity(&tx, temp_id)?.ok_or(StoreError::NotFound(temp_id))?;
                Settlement::Promoted(identity)
            }
        };
        tx.commit()?;
        self.refresh_gallery(&conn);
        Ok(settlement)
    }

    /// Delete an identity with its embeddings and snapshots.
    /// Returns false if it did not exist.
    pub fn delete(&self, id: IdentityId) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM identities WHERE id = ?1", params![id.0])?;
        self.refresh_gallery(&conn);
        Ok(n > 0)
    }

    /// Set or clear the operator "important" flag. Returns false if missing.
    pub fn set_important(&self, id: IdentityId, important: bool) -> Result<bool> {
        let now = self.now_ms();
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE identities SET important = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.0, important, now],
        )?;
        self.refresh_gallery(&conn);
        Ok(n > 0)
    }

    pub fn list_important(&self) -> Result<Vec<Identity>> {
        let conn = self.lock();
        query_identities(&conn, "WHERE important = 1", params![])
    }

    pub fn list(&self, include_temporary: bool) -> Result<Vec<Identity>> {
        let conn = self.lock();
        if include_temporary {
            query_identities(&conn, "", params![])
        } else {
            query_identities(&conn, "WHERE kind = 'confirmed'", params![])
        }
    }

    /// Delete every Temporary identity created strictly before `now - max_age`.
    pub fn purge_temporary_older_than(&self, max_age: Duration) -> Result<Vec<PurgedIdentity>> {
        // A cutoff before the representable range means nothing is old enough.
        let Some(cutoff) = self.clock.now().checked_sub_signed(max_age) else {
            return Ok(Vec::new());
        };
        self.purge_temporary(Some(cutoff))
    }

    /// Delete every Temporary identity regardless of age.
    pub fn purge_all_temporary(&self) -> Result<Vec<PurgedIdentity>> {
        self.purge_temporary(None)
    }

    fn purge_temporary(&self, cutoff: Option<DateTime<Utc>>) -> Result<Vec<PurgedIdentity>> {
        let cutoff_ms = cutoff.map_or(i64::MAX, |c| c.timestamp_millis());
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let ids: Vec<IdentityId> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM identities WHERE kind = 'temporary' AND created_at < ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![cutoff_ms], |row| row.get::<_, i64>(0))?;
            rows.map(|r| r.map(IdentityId)).collect::<rusqlite::Result<_>>()?
        };

        let mut purged = Vec::with_capacity(ids.len());
        for id in ids {
            let fingerprints = fingerprints_of(&tx, id)?;
            tx.execute("DELETE FROM identities WHERE id = ?1", params![id.0])?;
            purged.push(PurgedIdentity { id, fingerprints });
        }
        tx.commit()?;
        self.refresh_gallery(&conn);

        if !purged.is_empty() {
            tracing::info!(count = purged.len(), "temporary identities purged");
        }
        Ok(purged)
    }

    /// Every fingerprint currently stored, across all identities.
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT fingerprint FROM embeddings ORDER BY id")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(parse_fingerprint(&row.get::<_, String>(0)?)?);
        }
        Ok(out)
    }

    pub fn embeddings_of(&self, id: IdentityId) -> Result<Vec<Embedding>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT vector FROM embeddings WHERE identity_id = ?1 ORDER BY id")?;
        let mut rows = stmt.query(params![id.0])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(decode_vector(&row.get::<_, Vec<u8>>(0)?)?);
        }
        Ok(out)
    }

    pub fn latest_snapshot(&self, id: IdentityId) -> Result<Option<Snapshot>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT image, format FROM snapshots WHERE identity_id = ?1
                 ORDER BY id DESC LIMIT 1",
                params![id.0],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(data, format)| Snapshot { data, format }))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        let count = |sql: &str| -> Result<u64> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            u64::try_from(n).map_err(|_| StoreError::InvalidDbValue(format!("negative count: {n}")))
        };
        Ok(StoreStats {
            identities: count("SELECT COUNT(*) FROM identities")?,
            temporary: count("SELECT COUNT(*) FROM identities WHERE kind = 'temporary'")?,
            confirmed: count("SELECT COUNT(*) FROM identities WHERE kind = 'confirmed'")?,
            important: count("SELECT COUNT(*) FROM identities WHERE important = 1")?,
            embeddings: count("SELECT COUNT(*) FROM embeddings")?,
            snapshots: count("SELECT COUNT(*) FROM snapshots")?,
        })
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT NOT NULL,
    secondary_id TEXT,
    kind TEXT NOT NULL CHECK (kind IN ('temporary', 'confirmed')),
    important INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    UNIQUE (label, secondary_id)
);
CREATE INDEX IF NOT EXISTS idx_identities_kind_created ON identities(kind, created_at);

CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    vector BLOB NOT NULL,
    fingerprint TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_embeddings_identity ON embeddings(identity_id);

CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    format TEXT NOT NULL,
    image BLOB NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_identity ON snapshots(identity_id);
"#;

const IDENTITY_COLUMNS: &str = "id, label, secondary_id, kind, important, created_at, updated_at";

fn validate_embedding(embedding: &Embedding) -> Result<()> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbedding(format!(
            "expected {EMBEDDING_DIM} dimensions, got {}",
            embedding.len()
        )));
    }
    if embedding.values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbedding("non-finite value".into()));
    }
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn ensure_temporary(identity: &Identity) -> Result<()> {
    if identity.kind != IdentityKind::Temporary {
        return Err(StoreError::KindMismatch {
            id: identity.id,
            expected: IdentityKind::Temporary.as_str(),
            actual: identity.kind.as_str(),
        });
    }
    Ok(())
}

fn find_confirmed(
    conn: &Connection,
    label: &str,
    secondary_id: Option<&str>,
) -> Result<Option<IdentityId>> {
    let id = conn
        .query_row(
            "SELECT id FROM identities
             WHERE kind = 'confirmed' AND label = ?1 AND secondary_id IS ?2
             ORDER BY created_at, id LIMIT 1",
            params![label, secondary_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(id.map(IdentityId))
}

/// Re-home the embeddings and snapshots of `source` onto `target` and delete `source`.
fn absorb(conn: &Connection, source: IdentityId, target: IdentityId, now: i64) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE embeddings SET identity_id = ?2 WHERE identity_id = ?1",
        params![source.0, target.0],
    )?;
    conn.execute(
        "UPDATE snapshots SET identity_id = ?2 WHERE identity_id = ?1",
        params![source.0, target.0],
    )?;
    conn.execute(
        "UPDATE identities SET updated_at = ?2 WHERE id = ?1",
        params![target.0, now],
    )?;
    conn.execute("DELETE FROM identities WHERE id = ?1", params![source.0])?;
    Ok(moved)
}

fn confirm_in_place(
    conn: &Connection,
    id: IdentityId,
    label: &str,
    secondary_id: Option<&str>,
    now: i64,
) -> Result<()> {
    conn.execute(
        "UPDATE identities
         SET kind = 'confirmed', label = ?2, secondary_id = ?3, updated_at = ?4
         WHERE id = ?1",
        params![id.0, label, secondary_id, now],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::DuplicateIdentity {
                label: label.to_string(),
                secondary_id: secondary_id.map(str::to_string),
            }
        } else {
            e.into()
        }
    })?;
    Ok(())
}

fn insert_identity(conn: &Connection, new: &NewIdentity, now: i64) -> Result<IdentityId> {
    conn.execute(
        "INSERT INTO identities (label, secondary_id, kind, important, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        params![
            new.label,
            new.secondary_id,
            new.kind.as_str(),
            new.important,
            now
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::DuplicateIdentity {
                label: new.label.clone(),
                secondary_id: new.secondary_id.clone(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(IdentityId(conn.last_insert_rowid()))
}

fn insert_embedding(
    conn: &Connection,
    identity_id: IdentityId,
    embedding: &Embedding,
    now: i64,
) -> Result<i64> {
    let fingerprint = embedding.fingerprint();
    conn.execute(
        "INSERT INTO embeddings (identity_id, vector, fingerprint, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![identity_id.0, embedding.to_bytes(), fingerprint.to_string(), now],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            StoreError::DuplicateEmbedding(fingerprint)
        } else {
            e.into()
        }
    })?;
    Ok(conn.last_insert_rowid())
}

fn insert_snapshot(
    conn: &Connection,
    identity_id: IdentityId,
    snapshot: &Snapshot,
    now: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO snapshots (identity_id, format, image, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![identity_id.0, snapshot.format, snapshot.data, now],
    )?;
    Ok(conn.last_insert_rowid())
}

fn to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::InvalidDbValue(format!("timestamp out of range: {ms}")))
}

fn parse_fingerprint(value: &str) -> Result<Fingerprint> {
    value
        .parse()
        .map_err(|e| StoreError::InvalidDbValue(format!("{e}")))
}

fn decode_vector(bytes: &[u8]) -> Result<Embedding> {
    Embedding::from_bytes(bytes)
        .ok_or_else(|| StoreError::InvalidDbValue(format!("ragged vector blob of {} bytes", bytes.len())))
}

fn read_identity(row: &Row<'_>) -> Result<Identity> {
    let kind: String = row.get(3)?;
    Ok(Identity {
        id: IdentityId(row.get(0)?),
        label: row.get(1)?,
        secondary_id: row.get(2)?,
        kind: IdentityKind::parse(&kind)
            .ok_or_else(|| StoreError::InvalidDbValue(format!("unknown identity kind: {kind}")))?,
        important: row.get(4)?,
        created_at: to_datetime(row.get(5)?)?,
        updated_at: to_datetime(row.get(6)?)?,
    })
}

fn load_identity(conn: &Connection, id: IdentityId) -> Result<Option<Identity>> {
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id.0])?;
    match rows.next()? {
        Some(row) => Ok(Some(read_identity(row)?)),
        None => Ok(None),
    }
}

fn query_identities(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Identity>> {
    let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities {filter} ORDER BY created_at, id");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(args)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(read_identity(row)?);
    }
    Ok(out)
}

fn fingerprints_of(conn: &Connection, id: IdentityId) -> Result<Vec<Fingerprint>> {
    let mut stmt = conn.prepare("SELECT fingerprint FROM embeddings WHERE identity_id = ?1")?;
    let mut rows = stmt.query(params![id.0])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(parse_fingerprint(&row.get::<_, String>(0)?)?);
    }
    Ok(out)
}

fn load_gallery(conn: &Connection) -> Result<Vec<GalleryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT e.identity_id, e.vector, i.label, i.secondary_id, i.important, i.created_at
         FROM embeddings e JOIN identities i ON e.identity_id = i.id
         WHERE i.kind = 'confirmed'
         ORDER BY i.created_at, i.id, e.id",
    )?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(GalleryEntry {
            identity_id: IdentityId(row.get(0)?),
            embedding: decode_vector(&row.get::<_, Vec<u8>>(1)?)?,
            label: row.get(2)?,
            secondary_id: row.get(3)?,
            important: row.get(4)?,
            created_at: to_datetime(row.get(5)?)?,
        });
    }
    Ok(out)
}
