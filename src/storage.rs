//! Clip persistence.
//!
//! One clip is written per completed recording session with non-empty
//! video data. Clips are never mutated and are removed only by an explicit
//! delete.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::capture::CaptureBlob;

pub type ClipId = i64;

/// Stored clip with its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Clip {
    pub id: ClipId,
    pub data: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
    pub mime_type: String,
    pub timestamp_s: u64,
    pub size_bytes: u64,
    /// Hex SHA-256 of `data`.
    pub sha256: String,
}

impl Clip {
    pub fn summary(&self) -> ClipSummary {
        ClipSummary {
            id: self.id,
            mime_type: self.mime_type.clone(),
            timestamp_s: self.timestamp_s,
            size_bytes: self.size_bytes,
            has_thumbnail: self.thumbnail.is_some(),
            sha256: self.sha256.clone(),
        }
    }

    /// True when the payload still matches its recorded digest.
    pub fn verify_digest(&self) -> bool {
        digest_hex(&self.data) == self.sha256
    }
}

/// Clip metadata without the payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClipSummary {
    pub id: ClipId,
    pub mime_type: String,
    pub timestamp_s: u64,
    pub size_bytes: u64,
    pub has_thumbnail: bool,
    pub sha256: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ClipStats {
    pub count: u64,
    pub total_bytes: u64,
}

pub trait ClipStore: Send {
    /// Persist a capture. Empty payloads are rejected.
    fn save(&mut self, blob: &CaptureBlob, thumbnail: Option<&[u8]>) -> Result<ClipId>;

    /// All clips, newest first.
    fn list(&self) -> Result<Vec<ClipSummary>>;

    fn get(&self, id: ClipId) -> Result<Option<Clip>>;

    /// Returns false when no clip had that id.
    fn delete(&mut self, id: ClipId) -> Result<bool>;

    fn stats(&self) -> Result<ClipStats>;
}

pub(crate) fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs())
}

fn reject_empty(blob: &CaptureBlob) -> Result<()> {
    if blob.is_empty() {
        return Err(anyhow!("refusing to save an empty capture"));
    }
    Ok(())
}

pub struct SqliteClipStore {
    conn: Connection,
}

impl SqliteClipStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS clips (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at INTEGER NOT NULL,
              mime_type TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              sha256 TEXT NOT NULL,
              video BLOB NOT NULL,
              thumbnail BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_clips_created ON clips(created_at);
            "#,
        )?;
        Ok(())
    }

    fn insert(
        &mut self,
        blob: &CaptureBlob,
        thumbnail: Option<&[u8]>,
        created_at: u64,
    ) -> Result<ClipId> {
        reject_empty(blob)?;
        let created_at = i64::try_from(created_at)
            .map_err(|_| anyhow!("clip timestamp exceeds i64 range"))?;
        let size_bytes = i64::try_from(blob.data.len())
            .map_err(|_| anyhow!("clip size exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO clips(created_at, mime_type, size_bytes, sha256, video, thumbnail)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                created_at,
                blob.mime_type,
                size_bytes,
                digest_hex(&blob.data),
                blob.data,
                thumbnail
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Save with an explicit creation time (seconds since epoch).
    pub fn save_at(
        &mut self,
        blob: &CaptureBlob,
        thumbnail: Option<&[u8]>,
        timestamp_s: u64,
    ) -> Result<ClipId> {
        self.insert(blob, thumbnail, timestamp_s)
    }
}

impl ClipStore for SqliteClipStore {
    fn save(&mut self, blob: &CaptureBlob, thumbnail: Option<&[u8]>) -> Result<ClipId> {
        let created_at = now_s()?;
        self.insert(blob, thumbnail, created_at)
    }

    fn list(&self) -> Result<Vec<ClipSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, created_at, mime_type, size_bytes, sha256, thumbnail IS NOT NULL
            FROM clips ORDER BY created_at DESC, id DESC
            "#,
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let created_at: i64 = row.get(1)?;
            let size_bytes: i64 = row.get(3)?;
            out.push(ClipSummary {
                id: row.get(0)?,
                timestamp_s: created_at as u64,
                mime_type: row.get(2)?,
                size_bytes: size_bytes as u64,
                sha256: row.get(4)?,
                has_thumbnail: row.get(5)?,
            });
        }
        Ok(out)
    }

    fn get(&self, id: ClipId) -> Result<Option<Clip>> {
        let clip = self
            .conn
            .query_row(
                r#"
                SELECT id, created_at, mime_type, size_bytes, sha256, video, thumbnail
                FROM clips WHERE id = ?1
                "#,
                params![id],
                |row| {
                    let created_at: i64 = row.get(1)?;
                    let size_bytes: i64 = row.get(3)?;
                    Ok(Clip {
                        id: row.get(0)?,
                        timestamp_s: created_at as u64,
                        mime_type: row.get(2)?,
                        size_bytes: size_bytes as u64,
                        sha256: row.get(4)?,
                        data: row.get(5)?,
                        thumbnail: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(clip)
    }

    fn delete(&mut self, id: ClipId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM clips WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn stats(&self) -> Result<ClipStats> {
        let (count, total): (i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM clips",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ClipStats {
            count: count as u64,
            total_bytes: total as u64,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryClipStore {
    clips: Vec<Clip>,
    next_id: ClipId,
    fail_saves: Option<String>,
}

impl InMemoryClipStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `save` fail with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_saves: Some(message.to_string()),
            ..Self::default()
        }
    }
}

impl ClipStore for InMemoryClipStore {
    fn save(&mut self, blob: &CaptureBlob, thumbnail: Option<&[u8]>) -> Result<ClipId> {
        if let Some(message) = &self.fail_saves {
            return Err(anyhow!("{}", message));
        }
        reject_empty(blob)?;
        self.next_id += 1;
        self.clips.push(Clip {
            id: self.next_id,
            data: blob.data.clone(),
            thumbnail: thumbnail.map(<[u8]>::to_vec),
            mime_type: blob.mime_type.clone(),
            timestamp_s: now_s()?,
            size_bytes: blob.data.len() as u64,
            sha256: digest_hex(&blob.data),
        });
        Ok(self.next_id)
    }

    fn list(&self) -> Result<Vec<ClipSummary>> {
        let mut out: Vec<ClipSummary> = self.clips.iter().map(Clip::summary).collect();
        out.sort_by(|a, b| b.timestamp_s.cmp(&a.timestamp_s).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    fn get(&self, id: ClipId) -> Result<Option<Clip>> {
        Ok(self.clips.iter().find(|clip| clip.id == id).cloned())
    }

    fn delete(&mut self, id: ClipId) -> Result<bool> {
        let before = self.clips.len();
        self.clips.retain(|clip| clip.id != id);
        Ok(self.clips.len() != before)
    }

    fn stats(&self) -> Result<ClipStats> {
        Ok(ClipStats {
            count: self.clips.len() as u64,
            total_bytes: self.clips.iter().map(|clip| clip.size_bytes).sum(),
        })
    }
}
