//! SQLite-backed face gallery.

use crate::schema::SCHEMA;
use crate::StoreError;
use chrono::{DateTime, Utc};
use facematch_core::{Embedding, Gallery, GalleryEntry, GalleryError, GallerySnapshot};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Gallery persisted to a SQLite database.
///
/// The same connection also carries the recognition log (see [`crate::log`]).
pub struct SqliteGallery {
    conn: Mutex<Connection>,
}

impl SqliteGallery {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::info!(path = %path.display(), "opened gallery database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Insert an entry. A duplicate id surfaces as the raw constraint error.
    pub fn insert(&self, entry: &GalleryEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO faces (id, identity, embedding, embedding_dim, model_version, image_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.identity,
                embedding_to_bytes(&entry.embedding.values),
                entry.embedding.dim() as i64,
                entry.embedding.model_version,
                entry.image_path,
                entry.created_at.to_rfc3339(),
            ],
        )?;
        tracing::debug!(id = %entry.id, identity = %entry.identity, "gallery entry stored");
        Ok(())
    }

    /// All well-formed entries in insertion order. Corrupt rows are skipped,
    /// so `len` and `identities` only count entries matching can see.
    pub fn entries(&self) -> Result<Vec<GalleryEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity, embedding, embedding_dim, model_version, image_path, created_at
             FROM faces ORDER BY rowid",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RawEntry {
                    id: row.get(0)?,
                    identity: row.get(1)?,
                    embedding: row.get(2)?,
                    embedding_dim: row.get(3)?,
                    model_version: row.get(4)?,
                    image_path: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id.clone();
            match raw.into_entry() {
                Ok(entry) => entries.push(entry),
                Err(reason) => tracing::warn!(id = %id, reason = %reason, "skipping corrupt gallery row"),
            }
        }
        Ok(entries)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM faces WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    /// Remove every entry enrolled under `identity`. Returns the number removed.
    pub fn delete_identity(&self, identity: &str) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute("DELETE FROM faces WHERE identity = ?1", params![identity])?;
        Ok(removed)
    }
}

impl Gallery for SqliteGallery {
    fn snapshot(&self) -> Result<GallerySnapshot, GalleryError> {
        Ok(Arc::new(self.entries()?))
    }

    fn add(&self, entry: GalleryEntry) -> Result<(), GalleryError> {
        match self.insert(&entry) {
            Ok(()) => Ok(()),
            Err(StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(GalleryError::DuplicateId(entry.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, id: &str) -> Result<bool, GalleryError> {
        Ok(self.delete(id)?)
    }
}

struct RawEntry {
    id: String,
    identity: String,
    embedding: Vec<u8>,
    embedding_dim: i64,
    model_version: Option<String>,
    image_path: Option<String>,
    created_at: String,
}

impl RawEntry {
    fn into_entry(self) -> Result<GalleryEntry, String> {
        let values = bytes_to_embedding(&self.embedding)
            .ok_or_else(|| format!("embedding blob of {} bytes", self.embedding.len()))?;
        if values.len() as i64 != self.embedding_dim {
            return Err(format!(
                "embedding has {} values, row says {}",
                values.len(),
                self.embedding_dim
            ));
        }
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| format!("created_at: {e}"))?
            .with_timezone(&Utc);

        Ok(GalleryEntry {
            id: self.id,
            identity: self.identity,
            embedding: Embedding {
                values,
                model_version: self.model_version,
            },
            image_path: self.image_path,
            created_at,
        })
    }
}

/// Serialize an embedding as little-endian f32 bytes.
fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of [`embedding_to_bytes`]. `None` for empty or misaligned blobs.
fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
