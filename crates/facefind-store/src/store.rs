use crate::schema::SCHEMA_SQL;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use facefind_core::codec::{self, Encoding};
use facefind_core::{CorpusSource, Embedding, EmbeddingRecord, EncodedRecord, PhotoRef};
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("photo not found: {0}")]
    PhotoNotFound(String),
}

/// A stored photo with its upload metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhotoRecord {
    pub photo: PhotoRef,
    pub photographer: String,
    pub uploaded_at: DateTime<Utc>,
    /// Number of face embeddings stored for this photo.
    pub faces: usize,
}

/// Outcome of rewriting legacy text encodings as binary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub converted: usize,
    /// Text rows that did not decode; left untouched.
    pub skipped: usize,
}

/// Photo metadata and face embeddings in one SQLite database.
pub struct FaceStore {
    conn: Connection,
}

impl FaceStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened face store");
        Self::init(conn)
    }

    /// Throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Register a photo with no faces yet.
    pub fn insert_photo(&self, image_url: &str, photographer: &str) -> Result<PhotoRecord> {
        insert_photo_row(&self.conn, image_url, photographer, now())
    }

    /// Store one face embedding for an existing photo. Returns the row id.
    pub fn persist_embedding_record(&self, record: &EmbeddingRecord) -> Result<i64> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM photos WHERE id = ?1", params![record.photo.photo_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::PhotoNotFound(record.photo.photo_id.clone()));
        }

        insert_embedding_row(&self.conn, &record.photo.photo_id, &record.embedding)
    }

    /// Store a photo and one embedding per detected face atomically.
    pub fn index_photo(&mut self, image_url: &str, photographer: &str, embeddings: &[Embedding]) -> Result<PhotoRecord> {
        let tx = self.conn.transaction()?;
        let mut photo = insert_photo_row(&tx, image_url, photographer, now())?;
        for embedding in embeddings {
            insert_embedding_row(&tx, &photo.photo.photo_id, embedding)?;
        }
        tx.commit()?;

        photo.faces = embeddings.len();
        tracing::info!(photo_id = %photo.photo.photo_id, photographer, faces = photo.faces, "photo indexed");
        Ok(photo)
    }

    /// Every stored embedding with its photo, in insertion order.
    pub fn get_all_embedding_records(&self) -> Result<Vec<EncodedRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.encoding, p.id, p.image_url
             FROM embeddings e
             JOIN photos p ON e.photo_id = p.id
             ORDER BY e.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(EncodedRecord {
                encoded: raw_bytes(row.get_ref(0)?),
                photo: PhotoRef { photo_id: row.get(1)?, url: row.get(2)? },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Photos newest first, optionally only one photographer's.
    pub fn list_photos(&self, photographer: Option<&str>) -> Result<Vec<PhotoRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.image_url, p.photographer, p.uploaded_at, COUNT(e.id)
             FROM photos p
             LEFT JOIN embeddings e ON e.photo_id = p.id
             WHERE ?1 IS NULL OR p.photographer = ?1
             GROUP BY p.id
             ORDER BY p.uploaded_at DESC, p.rowid DESC",
        )?;
        let rows = stmt.query_map(params![photographer], |row| {
            Ok(PhotoRecord {
                photo: PhotoRef { photo_id: row.get(0)?, url: row.get(1)? },
                photographer: row.get(2)?,
                uploaded_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
                faces: row.get::<_, i64>(4)? as usize,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete one photo and its embeddings. Returns whether it existed.
    pub fn delete_photo(&self, photo_id: &str) -> Result<bool> {
        let deleted = self.conn.execute("DELETE FROM photos WHERE id = ?1", params![photo_id])?;
        Ok(deleted > 0)
    }

    /// Delete every photo uploaded by `photographer`. Returns the photo count.
    pub fn delete_user_photos(&self, photographer: &str) -> Result<usize> {
        let deleted = self
            .conn
            .execute("DELETE FROM photos WHERE photographer = ?1", params![photographer])?;
        tracing::info!(photographer, deleted, "deleted photographer's photos");
        Ok(deleted)
    }

    /// Delete all photos and embeddings. Returns the photo count.
    pub fn delete_all_photos(&self) -> Result<usize> {
        let deleted = self.conn.execute("DELETE FROM photos", [])?;
        tracing::info!(deleted, "deleted all photos");
        Ok(deleted)
    }

    pub fn count_embeddings(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Rewrite legacy text-encoded embeddings in the canonical binary form.
    ///
    /// Runs in one transaction. Rows that fail to decode are left as they are
    /// and counted in [`MigrationReport::skipped`].
    pub fn migrate_legacy_encodings(&mut self) -> Result<MigrationReport> {
        let tx = self.conn.transaction()?;
        let mut report = MigrationReport::default();

        let mut stmt = tx.prepare("SELECT id, encoding FROM embeddings ORDER BY id")?;
        let legacy: Vec<(i64, Vec<u8>)> = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, raw_bytes(row.get_ref(1)?))))?
            .filter(|r| !matches!(r, Ok((_, raw)) if codec::detect(raw) == Encoding::Binary))
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        for (id, raw) in legacy {
            match codec::decode_vector(&raw) {
                Ok(values) => {
                    tx.execute(
                        "UPDATE embeddings SET encoding = ?1 WHERE id = ?2",
                        params![codec::encode_vector(&values), id],
                    )?;
                    report.converted += 1;
                }
                Err(e) => {
                    tracing::warn!(embedding_id = id, error = %e, "legacy embedding not migrated");
                    report.skipped += 1;
                }
            }
        }

        tx.commit()?;
        tracing::info!(converted = report.converted, skipped = report.skipped, "legacy encodings migrated");
        Ok(report)
    }

    /// Copy photos and face encodings out of a database written by the old
    /// upload service (`photos` and `encodings` tables, text encodings).
    ///
    /// Runs in one transaction. Every imported photo gets a fresh id; its
    /// encodings are stored in binary form. Encodings that fail to decode are
    /// dropped and counted in [`MigrationReport::skipped`].
    pub fn import_legacy_database(&mut self, path: impl AsRef<Path>) -> Result<MigrationReport> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("legacy database not found: {}", path.display()),
            )));
        }

        self.conn
            .execute("ATTACH DATABASE ?1 AS legacy", params![path.to_string_lossy()])?;
        let imported = import_attached(&mut self.conn);
        let detached = self.conn.execute_batch("DETACH DATABASE legacy");
        let report = imported?;
        detached?;

        tracing::info!(
            source = %path.display(),
            converted = report.converted,
            skipped = report.skipped,
            "legacy database imported"
        );
        Ok(report)
    }
}

/// Import from the database attached as `legacy`.
fn import_attached(conn: &mut Connection) -> Result<MigrationReport> {
    let tx = conn.transaction()?;
    let mut report = MigrationReport::default();

    let mut stmt = tx.prepare(
        "SELECT id, COALESCE(cloudinary_url, image_id, ''), COALESCE(photographer_email, ''), timestamp
         FROM legacy.photos
         ORDER BY id",
    )?;
    let photos: Vec<(i64, String, String, Option<String>)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?
        .collect::<rusqlite::Result<_>>()?;
    drop(stmt);

    let mut encodings = tx.prepare("SELECT id, encoding FROM legacy.encodings WHERE photo_id = ?1 ORDER BY id")?;
    for (legacy_id, image_url, photographer, timestamp) in photos {
        let uploaded_at = timestamp.as_deref().and_then(parse_legacy_timestamp).unwrap_or_else(|| {
            tracing::debug!(legacy_id, ?timestamp, "legacy photo has no usable timestamp");
            now()
        });
        let photo = insert_photo_row(&tx, &image_url, &photographer, uploaded_at)?;

        let rows: Vec<(i64, Vec<u8>)> = encodings
            .query_map(params![legacy_id], |row| Ok((row.get::<_, i64>(0)?, raw_bytes(row.get_ref(1)?))))?
            .collect::<rusqlite::Result<_>>()?;
        for (encoding_id, raw) in rows {
            match codec::decode_vector(&raw) {
                Ok(values) => {
                    insert_embedding_row(&tx, &photo.photo.photo_id, &Embedding::new(values))?;
                    report.converted += 1;
                }
                Err(e) => {
                    tracing::warn!(legacy_id, encoding_id, error = %e, "legacy encoding not imported");
                    report.skipped += 1;
                }
            }
        }
    }
    drop(encodings);

    tx.commit()?;
    Ok(report)
}

impl CorpusSource for FaceStore {
    type Error = StoreError;

    fn embedding_records(&self) -> Result<Vec<EncodedRecord>> {
        self.get_all_embedding_records()
    }
}

/// Stored with microsecond precision; keep the in-memory value identical.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn insert_photo_row(
    conn: &Connection,
    image_url: &str,
    photographer: &str,
    uploaded_at: DateTime<Utc>,
) -> Result<PhotoRecord> {
    let photo_id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO photos (id, image_url, photographer, uploaded_at) VALUES (?1, ?2, ?3, ?4)",
        params![photo_id, image_url, photographer, format_timestamp(&uploaded_at)],
    )?;

    Ok(PhotoRecord {
        photo: PhotoRef { photo_id, url: image_url.to_string() },
        photographer: photographer.to_string(),
        uploaded_at,
        faces: 0,
    })
}

fn insert_embedding_row(conn: &Connection, photo_id: &str, embedding: &Embedding) -> Result<i64> {
    conn.execute(
        "INSERT INTO embeddings (photo_id, encoding) VALUES (?1, ?2)",
        params![photo_id, codec::encode_vector(&embedding.values)],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Encoding bytes whatever the column's storage class. NULL and numbers yield
/// an empty buffer, which the decoder rejects.
fn raw_bytes(value: ValueRef<'_>) -> Vec<u8> {
    match value {
        ValueRef::Blob(b) | ValueRef::Text(b) => b.to_vec(),
        ValueRef::Null | ValueRef::Integer(_) | ValueRef::Real(_) => Vec::new(),
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so lexical order in SQL equals time order.
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(col: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(col, Type::Text, Box::new(e)))
}

/// Timestamps as the old service wrote them: RFC 3339, or a naive ISO form taken as UTC.
fn parse_legacy_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc).trunc_subsecs(6));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value.trim(), fmt).ok())
        .map(|naive| naive.and_utc().trunc_subsecs(6))
}
