//! SQLite schema creation and migration.

use crate::error::{CatalogError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Current schema version. Increment when adding migrations.
pub const CURRENT_VERSION: i32 = 2;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS titles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    title_key TEXT NOT NULL,
    language TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('movie', 'tv_show')),
    external_id INTEGER,
    details_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    file_id TEXT,
    file_name TEXT,
    media TEXT NOT NULL DEFAULT 'document',
    uploaded_at TEXT,
    channel_message_id INTEGER,
    permanent_link TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS titles_kind_external_id
    ON titles (kind, external_id) WHERE external_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS titles_kind_title_language
    ON titles (kind, title_key, language);
CREATE INDEX IF NOT EXISTS titles_language_kind
    ON titles (language, kind);

CREATE TABLE IF NOT EXISTS seasons (
    title_id INTEGER NOT NULL REFERENCES titles (id) ON DELETE CASCADE,
    season_number INTEGER NOT NULL CHECK (season_number >= 1),
    name TEXT,
    episode_count INTEGER,
    PRIMARY KEY (title_id, season_number)
);

CREATE TABLE IF NOT EXISTS episodes (
    title_id INTEGER NOT NULL,
    season_number INTEGER NOT NULL,
    episode_number INTEGER NOT NULL CHECK (episode_number >= 1),
    file_id TEXT NOT NULL,
    file_name TEXT,
    media TEXT NOT NULL DEFAULT 'document',
    uploaded_at TEXT NOT NULL,
    channel_message_id INTEGER,
    permanent_link TEXT,
    PRIMARY KEY (title_id, season_number, episode_number),
    FOREIGN KEY (title_id, season_number)
        REFERENCES seasons (title_id, season_number) ON DELETE CASCADE
);
"#;

/// Create all tables and indexes if they don't exist.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    set_schema_version(conn, CURRENT_VERSION)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Bring an older catalog up to [`CURRENT_VERSION`].
fn migrate(conn: &Connection, from_version: i32) -> Result<()> {
    if from_version > CURRENT_VERSION {
        return Err(CatalogError::InvalidInput(format!(
            "catalog schema version {from_version} is newer than supported version {CURRENT_VERSION}"
        )));
    }
    let mut version = from_version;
    while version < CURRENT_VERSION {
        if version == 1 {
            conn.execute_batch(
                "ALTER TABLE titles ADD COLUMN media TEXT NOT NULL DEFAULT 'document';
                 ALTER TABLE episodes ADD COLUMN media TEXT NOT NULL DEFAULT 'document';",
            )?;
        }
        version += 1;
        set_schema_version(conn, version)?;
        tracing::info!(version, "catalog schema migrated");
    }
    Ok(())
}

/// Open or create a catalog database at the given path.
pub fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::CatalogError::InvalidInput(format!(
                    "create catalog directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    match schema_version(&conn)? {
        0 => create_schema(&conn)?,
        version if version != CURRENT_VERSION => migrate(&conn, version)?,
        _ => {}
    }
    tracing::debug!(path = %path.display(), version = CURRENT_VERSION, "catalog database ready");
    Ok(conn)
}

/// Open an in-memory database with the full schema. Useful for testing.
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    create_schema(&conn)?;
    Ok(conn)
}

/// Recorded schema version, or 0 for an empty database.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let version = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
        row.get::<_, Option<i32>>(0)
    })?;
    Ok(version.unwrap_or(0))
}
