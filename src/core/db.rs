use crate::core::error::CodewardError;
use rusqlite::Connection;

pub fn db_connect(db_path: &str) -> Result<Connection, CodewardError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(CodewardError::RusqliteError)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))
        .map_err(CodewardError::RusqliteError)?;
    conn.execute("PRAGMA foreign_keys=ON;", [])
        .map_err(CodewardError::RusqliteError)?;
    Ok(conn)
}

// Subsystems own their schemas and initialization; this module only hands out
// configured connections.
