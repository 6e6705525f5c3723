pub const SCHEMA: &str = r#"
-- Photos table: owned by the ingestion collaborator, read-mostly here
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    directory TEXT NOT NULL,
    taken_at TEXT,
    width INTEGER,
    height INTEGER,

    -- Opaque collaborator blobs (JSON), only searched as text
    exif_json TEXT,
    location_json TEXT,

    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_photos_directory ON photos(directory);
CREATE INDEX IF NOT EXISTS idx_photos_taken_at ON photos(taken_at);

-- Persons: named identities for face grouping
CREATE TABLE IF NOT EXISTS persons (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    face_count INTEGER NOT NULL DEFAULT 0,
    is_manual INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_persons_name ON persons(name);

-- Detected faces: bounding boxes in detector input space (416x416) plus
-- up to three vector slots. vector_version tracks which slots are populated:
-- 0 = none, 1 = face only, 2 = face + semantic.
CREATE TABLE IF NOT EXISTS detected_faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL,
    embedding BLOB,           -- legacy slot, unspecified origin
    face_embedding BLOB,      -- 128-dim identity descriptor
    semantic_embedding BLOB,  -- 512-dim content vector
    vector_version INTEGER NOT NULL DEFAULT 0,
    person_id INTEGER,        -- NULL until assigned
    is_manual INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES persons(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_detected_faces_photo ON detected_faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_detected_faces_person ON detected_faces(person_id);
CREATE INDEX IF NOT EXISTS idx_detected_faces_version ON detected_faces(vector_version);

-- Track which photos have been scanned for faces (even if 0 faces found)
CREATE TABLE IF NOT EXISTS face_scans (
    photo_id INTEGER PRIMARY KEY,
    scanned_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    faces_found INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

-- Long-running scan jobs. At most one non-terminal row at a time,
-- enforced by the supervisor rather than the schema.
CREATE TABLE IF NOT EXISTS scan_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    status TEXT NOT NULL DEFAULT 'detecting',  -- detecting/completed/failed/cancelled
    total_photos INTEGER NOT NULL DEFAULT 0,
    processed_photos INTEGER NOT NULL DEFAULT 0,
    failed_photos INTEGER NOT NULL DEFAULT 0,
    last_processed_id INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    last_heartbeat TEXT NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_scan_jobs_status ON scan_jobs(status);
"#;

/// Additive migrations applied after the base schema. Each statement must be
/// safe to re-run; failures are ignored (column already exists).
pub const MIGRATIONS: &[&str] = &[
    "ALTER TABLE detected_faces ADD COLUMN is_manual INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE persons ADD COLUMN is_manual INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE scan_jobs ADD COLUMN error_message TEXT",
];
