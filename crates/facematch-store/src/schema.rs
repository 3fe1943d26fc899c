pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS faces (
    id              TEXT PRIMARY KEY,
    identity        TEXT NOT NULL,
    embedding       BLOB NOT NULL,
    embedding_dim   INTEGER NOT NULL,
    model_version   TEXT,
    image_path      TEXT,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_identity ON faces(identity);

CREATE TABLE IF NOT EXISTS recognition_logs (
    id              TEXT PRIMARY KEY,
    request_id      TEXT NOT NULL,
    method          TEXT NOT NULL,
    identity        TEXT,
    confidence      REAL,
    faces_detected  INTEGER NOT NULL,
    timestamp       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON recognition_logs(timestamp);
"#;
