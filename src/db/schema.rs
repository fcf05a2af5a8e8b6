pub const SCHEMA: &str = r#"
-- Users: organizers own events, students search by access code
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'student',  -- 'organizer', 'admin', 'student'
    created_at TEXT NOT NULL
);

-- Events: a bounded corpus of photos behind one access code
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',  -- 'draft', 'published'
    access_code TEXT NOT NULL UNIQUE,      -- 8 chars, uppercase
    storage_bytes_used INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (owner_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_events_owner ON events(owner_id);

-- Photos: one uploaded original, driven through the processing states
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    storage_ref TEXT NOT NULL,
    filename TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',  -- 'queued', 'processing', 'completed', 'failed'
    failure_reason TEXT,
    face_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (event_id) REFERENCES events(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_photos_event ON photos(event_id);
CREATE INDEX IF NOT EXISTS idx_photos_status ON photos(status);

-- Faces: per-face embeddings, written only together with status 'completed'
CREATE TABLE IF NOT EXISTS faces (
    photo_id INTEGER NOT NULL,
    face_index INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    embedding BLOB NOT NULL,         -- float32 array stored as bytes
    embedding_dim INTEGER NOT NULL,
    backend TEXT NOT NULL,
    confidence REAL NOT NULL,
    PRIMARY KEY (photo_id, face_index),
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

-- Registered faces: one reusable probe per user
CREATE TABLE IF NOT EXISTS registered_faces (
    user_id INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    registered_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;
