//! Shared SQLite connection tuning
//!
//! Every connection opened against the statistics database goes through
//! `apply_optimized_pragmas` so that concurrent pipeline workers and the
//! aggregator see the same journal mode and foreign-key enforcement.

use rusqlite::Connection;
use std::time::Duration;

/// Apply the PRAGMAs used by all imgqc connections
///
/// - WAL journal (readers never block the single writer)
/// - synchronous = NORMAL (safe with WAL)
/// - temp_store = MEMORY
/// - foreign_keys = ON (image_catalog rows must reference image_statistics)
/// - wal_autocheckpoint = 1000 pages
/// - busy timeout of 5s for writers racing on the same file
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        // In-memory databases report "memory"; nothing else to do there
        log::debug!("SQLite journal_mode is {} (WAL not available)", mode);
    }

    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_secs(5))?;

    Ok(())
}
