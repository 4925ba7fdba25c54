use rusqlite::Connection;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 2;

/// Migration steps applied to databases recorded below their version.
/// Each step must tolerate a schema that already has its change.
const MIGRATIONS: &[(i64, fn(&Connection) -> Result<()>)] = &[(2, add_kernel_status)];

fn configure(conn: &Connection) -> Result<()> {
    // in-memory databases stay in "memory" mode
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))?;
    tracing::debug!(journal_mode = %mode, "sqlite connection configured");
    // kernel deletion cascades to chunks, tensions and graph rows
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_kernel_status(conn: &Connection) -> Result<()> {
    if !has_column(conn, "kernels", "status")? {
        conn.execute_batch(
            "ALTER TABLE kernels ADD COLUMN status TEXT NOT NULL DEFAULT 'empty';",
        )?;
    }
    Ok(())
}

pub fn initialize(conn: &Connection) -> Result<()> {
    configure(conn)?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS metadata (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kernels (
            id         TEXT PRIMARY KEY,
            name       TEXT NOT NULL,
            bio        TEXT NOT NULL DEFAULT '',
            era        TEXT NOT NULL DEFAULT '',
            status     TEXT NOT NULL DEFAULT 'empty',
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS chunks (
            id           TEXT PRIMARY KEY,
            kernel_id    TEXT NOT NULL REFERENCES kernels(id) ON DELETE CASCADE,
            seq          INTEGER NOT NULL,
            text         TEXT NOT NULL,
            source_label TEXT NOT NULL DEFAULT '',
            tags         TEXT NOT NULL DEFAULT '[]',
            life_phase   TEXT,
            embedding    BLOB
        );

        CREATE TABLE IF NOT EXISTS tensions (
            id                 TEXT PRIMARY KEY,
            kernel_id          TEXT NOT NULL REFERENCES kernels(id) ON DELETE CASCADE,
            seq                INTEGER NOT NULL,
            pole_a             TEXT NOT NULL,
            pole_b             TEXT NOT NULL,
            context_snippet    TEXT NOT NULL DEFAULT '',
            source_label       TEXT NOT NULL DEFAULT '',
            collapse_direction TEXT NOT NULL DEFAULT 'unknown',
            scar_valence       REAL NOT NULL DEFAULT 0.5,
            refusal            INTEGER NOT NULL DEFAULT 0,
            refusal_count      INTEGER NOT NULL DEFAULT 0,
            life_phase         TEXT NOT NULL DEFAULT 'unknown',
            life_phase_weight  REAL NOT NULL DEFAULT 0.5,
            mask_inner         TEXT,
            mask_outer         TEXT,
            summary            TEXT,
            embedding          BLOB
        );

        CREATE TABLE IF NOT EXISTS graph_edges (
            kernel_id TEXT NOT NULL REFERENCES kernels(id) ON DELETE CASCADE,
            source    TEXT NOT NULL,
            target    TEXT NOT NULL,
            frequency INTEGER NOT NULL,
            direction_bias  REAL NOT NULL,
            scar_sum  REAL NOT NULL,
            refusal_present INTEGER NOT NULL,
            detail    TEXT NOT NULL,
            PRIMARY KEY (kernel_id, source, target)
        );

        CREATE TABLE IF NOT EXISTS graph_nodes (
            kernel_id   TEXT NOT NULL REFERENCES kernels(id) ON DELETE CASCADE,
            id          TEXT NOT NULL,
            label       TEXT NOT NULL,
            frequency   INTEGER NOT NULL,
            scar        REAL NOT NULL,
            refusal     INTEGER NOT NULL,
            connections INTEGER NOT NULL,
            PRIMARY KEY (kernel_id, id)
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_kernel ON chunks(kernel_id, seq);
        CREATE INDEX IF NOT EXISTS idx_tensions_kernel ON tensions(kernel_id, seq);
        ",
    )?;

    let recorded = get_schema_version(conn)?.unwrap_or(1);
    if recorded > SCHEMA_VERSION {
        return Err(StoreError::InvalidData(format!(
            "database schema v{recorded} is newer than supported v{SCHEMA_VERSION}"
        )));
    }
    for (version, step) in MIGRATIONS {
        if *version > recorded {
            step(conn)?;
            tracing::debug!(from = recorded, to = *version, "schema migration step applied");
        }
    }

    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i64>> {
    let mut stmt = conn.prepare("SELECT value FROM metadata WHERE key = 'schema_version'")?;
    let version = stmt
        .query_row([], |row| row.get::<_, String>(0))
        .ok()
        .and_then(|v| v.parse().ok());
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_sets_version() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('kernels', 'chunks', 'tensions', 'graph_edges', 'graph_nodes')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn test_migrates_kernels_without_status() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE kernels (id TEXT PRIMARY KEY, name TEXT NOT NULL, bio TEXT NOT NULL DEFAULT '',
             era TEXT NOT NULL DEFAULT '', created_at TEXT NOT NULL DEFAULT (datetime('now')));
             INSERT INTO kernels (id, name) VALUES ('abc', 'old');",
        )
        .unwrap();
        initialize(&conn).unwrap();
        let status: String = conn
            .query_row("SELECT status FROM kernels WHERE id = 'abc'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "empty");
        assert_eq!(get_schema_version(&conn).unwrap(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_rejects_newer_schema() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute(
            "UPDATE metadata SET value = ?1 WHERE key = 'schema_version'",
            [(SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();
        assert!(matches!(initialize(&conn), Err(StoreError::InvalidData(_))));
    }

    #[test]
    fn test_kernel_delete_cascades() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO kernels (id, name) VALUES ('k', 'Marcus');
             INSERT INTO chunks (id, kernel_id, seq, text) VALUES ('c', 'k', 0, 'duty');
             DELETE FROM kernels WHERE id = 'k';",
        )
        .unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
