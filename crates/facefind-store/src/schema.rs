/// Photos and one embedding row per detected face.
///
/// `embeddings.encoding` holds either the canonical binary form (BLOB) or the
/// legacy comma-joined text form (TEXT) written by older versions.
pub(crate) const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS photos (
    id           TEXT PRIMARY KEY,
    image_url    TEXT NOT NULL,
    photographer TEXT NOT NULL,
    uploaded_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS embeddings (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id TEXT NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
    encoding BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_embeddings_photo ON embeddings(photo_id);
CREATE INDEX IF NOT EXISTS idx_photos_photographer ON photos(photographer);
";
