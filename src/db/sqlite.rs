use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use super::DatabaseError;

/// How long a connection waits on a locked database before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a SQLite connection to the given path and run migrations
pub fn open_database(path: &Path) -> Result<Connection, DatabaseError> {
    let conn = open_connection(path)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// Open a connection without running migrations (for pooled siblings).
pub fn open_connection(path: &Path) -> Result<Connection, DatabaseError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let conn = Connection::open(path)?;
    configure_pragmas(&conn, true)?;
    Ok(conn)
}

/// Open an in-memory database (for testing)
pub fn open_memory_database() -> Result<Connection, DatabaseError> {
    let conn = Connection::open_in_memory()?;
    configure_pragmas(&conn, false)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure_pragmas(conn: &Connection, on_disk: bool) -> Result<(), DatabaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if on_disk {
        // WAL lets readers proceed while a pooled sibling holds the write lock.
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
    }
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_current_version(conn);

    let migrations: Vec<(i64, &str)> = vec![
        (1, include_str!("../../resources/migrations/001_moderation_case.sql")),
        (2, include_str!("../../resources/migrations/002_dispatch_audit.sql")),
    ];

    for (version, sql) in migrations {
        if version > current_version {
            tracing::info!("Running migration v{version}");
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql).map_err(|e| DatabaseError::MigrationFailed {
                version,
                reason: e.to_string(),
            })?;
            tx.commit()?;
        }
    }

    Ok(())
}

/// Get the current schema version (0 if no schema exists yet)
fn get_current_version(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT MAX(version) FROM schema_version",
        [],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
}

/// Count tables in the database (for verification)
pub fn count_tables(conn: &Connection) -> Result<i64, DatabaseError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_initializes_all_tables() {
        let conn = open_memory_database().unwrap();
        // schema_version + moderation_case + case_occurrence + dispatch_attempt
        let count = count_tables(&conn).unwrap();
        assert_eq!(count, 4, "Expected 4 tables, got {count}");
    }

    #[test]
    fn schema_version_is_current() {
        let conn = open_memory_database().unwrap();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn migration_idempotent() {
        let conn = open_memory_database().unwrap();
        // Run migrations again, should not error
        let result = run_migrations(&conn);
        assert!(result.is_ok());
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = open_memory_database().unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn event_id_unique_constraint() {
        let conn = open_memory_database().unwrap();
        let insert = "INSERT INTO moderation_case (event_id, fingerprint, verdict, rationale, degraded, created_at)
                      VALUES (?1, ?2, 'clean', 'ok', 0, '2026-01-01 00:00:00')";
        conn.execute(insert, rusqlite::params!["evt-1", "fp-a"]).unwrap();
        let dup = conn.execute(insert, rusqlite::params!["evt-1", "fp-b"]);
        assert!(dup.is_err());
    }

    #[test]
    fn fingerprint_unique_only_for_content_verdicts() {
        let conn = open_memory_database().unwrap();
        let insert = "INSERT INTO moderation_case (event_id, fingerprint, verdict, rationale, degraded, created_at)
                      VALUES (?1, 'fp-a', 'clean', 'r', ?2, '2026-01-01 00:00:00')";
        conn.execute(insert, rusqlite::params!["evt-1", 0]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["evt-2", 0]).is_err());
        // Degraded rows are keyed per event, not per content
        assert!(conn.execute(insert, rusqlite::params!["evt-3", 1]).is_ok());
        assert!(conn.execute(insert, rusqlite::params!["evt-4", 1]).is_ok());
    }

    #[test]
    fn verdict_check_constraint() {
        let conn = open_memory_database().unwrap();
        let result = conn.execute(
            "INSERT INTO moderation_case (event_id, fingerprint, verdict, rationale, created_at)
             VALUES ('evt-1', 'fp', 'banned', 'r', '2026-01-01 00:00:00')",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn database_opens_from_disk_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("redactado.db");
        let conn = open_database(&path).unwrap();
        assert_eq!(count_tables(&conn).unwrap(), 4);
        drop(conn);

        let conn2 = open_database(&path).unwrap();
        assert_eq!(count_tables(&conn2).unwrap(), 4);
    }
}
