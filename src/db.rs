use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::ffi::ErrorCode;
use rusqlite::{Connection, Error as SqliteError, OpenFlags};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub struct DatabaseBootstrap {
    pub context: DatabaseContext,
    pub recovered: bool,
    pub purged_entries: usize,
}

/// Opens (or creates) the geocode cache database. The cache holds nothing that
/// cannot be re-fetched, so an unreadable file is discarded and rebuilt.
pub fn open_cache_database<P: AsRef<Path>>(
    data_dir: P,
    database_file: &str,
) -> AppResult<DatabaseBootstrap> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join(database_file);

    let (context, recovered) = match establish_context(&db_path) {
        Ok(context) => (context, false),
        Err(AppError::Database(err)) if should_attempt_recovery(&err, &db_path) => {
            warn!(
                target: "geocode_cache",
                path = %db_path.display(),
                error = %err,
                "cache database failed to open, rebuilding"
            );
            discard_store(&db_path)?;
            (establish_context(&db_path)?, true)
        }
        Err(err) => return Err(err),
    };

    let purged_entries = purge_expired(&context.connection)?;
    info!(
        target: "geocode_cache",
        path = %db_path.display(),
        recovered,
        purged_entries,
        "geocode cache ready"
    );
    Ok(DatabaseBootstrap {
        context,
        recovered,
        purged_entries,
    })
}

fn establish_context(db_path: &Path) -> AppResult<DatabaseContext> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    run_migrations(&connection)?;

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS geocode_cache (
            address_key TEXT PRIMARY KEY,
            lat REAL NOT NULL,
            lon REAL NOT NULL,
            resolved_at TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        "#,
    )?;

    ensure_column(
        connection,
        "geocode_cache",
        "provider TEXT NOT NULL DEFAULT 'open'",
    )?;
    connection.execute(
        "CREATE INDEX IF NOT EXISTS idx_geocode_cache_expires ON geocode_cache(expires_at)",
        [],
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn purge_expired(connection: &Connection) -> AppResult<usize> {
    let now = Utc::now().timestamp_millis();
    Ok(connection.execute(
        "DELETE FROM geocode_cache WHERE expires_at <= ?1",
        [now],
    )?)
}

fn should_attempt_recovery(err: &SqliteError, db_path: &Path) -> bool {
    if !db_path.exists() {
        return false;
    }

    match err {
        SqliteError::SqliteFailure(code, message) => {
            matches!(
                code.code,
                ErrorCode::NotADatabase | ErrorCode::DatabaseCorrupt
            ) || message
                .as_deref()
                .map(|msg| {
                    msg.contains("not a database") || msg.contains("database disk image is malformed")
                })
                .unwrap_or(false)
        }
        _ => false,
    }
}

fn discard_store(db_path: &Path) -> AppResult<()> {
    remove_if_exists(db_path)?;
    remove_if_exists(&sibling_path(db_path, "-wal"))?;
    remove_if_exists(&sibling_path(db_path, "-shm"))?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> AppResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(AppError::Io(err)),
    }
}

fn sibling_path(db_path: &Path, suffix: &str) -> PathBuf {
    let file_name = db_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    db_path.with_file_name(format!("{file_name}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn runs_migrations_and_creates_cache_table() {
        let dir = tempdir().unwrap();
        let bootstrap = open_cache_database(dir.path(), "cache.db").unwrap();
        let ctx = bootstrap.context;

        let tables: i64 = ctx
            .connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'geocode_cache'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
        assert!(column_exists(&ctx.connection, "geocode_cache", "provider").unwrap());
        assert!(ctx.path.ends_with("cache.db"));
        assert!(!bootstrap.recovered);
    }

    #[test]
    fn rebuilds_unreadable_cache_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("broken.db"), vec![0x42_u8; 4096]).unwrap();

        let bootstrap = open_cache_database(dir.path(), "broken.db").unwrap();
        assert!(bootstrap.recovered);
        assert!(bootstrap.context.path.exists());
    }

    #[test]
    fn purges_expired_rows_on_open() {
        let dir = tempdir().unwrap();
        {
            let bootstrap = open_cache_database(dir.path(), "purge.db").unwrap();
            bootstrap
                .context
                .connection
                .execute(
                    "INSERT INTO geocode_cache (address_key, lat, lon, provider, resolved_at, expires_at)
                     VALUES ('old', 1.0, 2.0, 'open', '2020-01-01T00:00:00Z', 0)",
                    [],
                )
                .unwrap();
        }

        let reopened = open_cache_database(dir.path(), "purge.db").unwrap();
        assert_eq!(reopened.purged_entries, 1);
    }
}
