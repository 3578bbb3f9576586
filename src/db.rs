use crate::s1_index::Episode;
use crate::schema::MIGRATIONS;
use crate::GmemError;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;

#[cfg(unix)]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
        // Only set permissions on dirs we created
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    if db_path.exists() {
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_secure_permissions(db_path: &Path) -> std::io::Result<()> {
    if let Some(dir) = db_path.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

fn apply_pragmas(conn: &Connection) -> Result<(), GmemError> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

pub fn open_db(db_path: &Path) -> Result<Connection, GmemError> {
    ensure_secure_permissions(db_path)?;
    let mut conn = Connection::open(db_path)?;
    apply_pragmas(&conn)?;
    MIGRATIONS.to_latest(&mut conn)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(db_path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection, GmemError> {
    let mut conn = Connection::open_in_memory()?;
    MIGRATIONS.to_latest(&mut conn)?;
    Ok(conn)
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

// --- Offsets ---

/// Durable committed offset for a log; 0 if never seen.
pub fn committed_offset(conn: &Connection, path: &str) -> Result<u64, GmemError> {
    let v: Option<i64> = conn
        .query_row(
            "SELECT committed_offset FROM log_offsets WHERE path = ?1",
            params![path],
            |r| r.get(0),
        )
        .optional()?;
    Ok(v.unwrap_or(0).max(0) as u64)
}

/// Record a committed offset. Never moves an existing offset backwards.
pub fn commit_offset(conn: &Connection, path: &str, offset: u64) -> Result<u64, GmemError> {
    conn.execute(
        "INSERT INTO log_offsets (path, committed_offset, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(path) DO UPDATE SET
            committed_offset = MAX(committed_offset, excluded.committed_offset),
            updated_at = excluded.updated_at",
        params![path, offset as i64, now_secs()],
    )?;
    committed_offset(conn, path)
}

// --- Failed episodes ---

#[derive(Debug, Clone, Serialize)]
pub struct FailedEpisode {
    pub id: i64,
    pub idempotency_key: String,
    pub session_id: Option<String>,
    pub group_id: String,
    pub episode: Episode,
    pub error_kind: String,
    pub error: String,
    pub attempts: u32,
    pub failed_at: i64,
}

/// Park an episode that exhausted its retries. Re-parking the same
/// episode bumps its attempt count instead of duplicating it.
pub fn park_failed(
    conn: &Connection,
    episode: &Episode,
    error_kind: &str,
    error: &str,
    attempts: u32,
) -> Result<i64, GmemError> {
    let payload = serde_json::to_string(episode)?;
    let session_id = episode.metadata.get("session_id").and_then(|v| v.as_str());
    conn.execute(
        "INSERT INTO failed_episodes
            (idempotency_key, session_id, group_id, payload, error_kind, error, attempts, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(idempotency_key) DO UPDATE SET
            error_kind = excluded.error_kind,
            error = excluded.error,
            attempts = attempts + excluded.attempts,
            failed_at = excluded.failed_at",
        params![
            episode.idempotency_key,
            session_id,
            episode.group_id,
            payload,
            error_kind,
            error,
            attempts,
            now_secs()
        ],
    )?;
    let id = conn.query_row(
        "SELECT id FROM failed_episodes WHERE idempotency_key = ?1",
        params![episode.idempotency_key],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn row_to_failed(row: &rusqlite::Row<'_>) -> rusqlite::Result<(FailedEpisode, String)> {
    let payload: String = row.get(4)?;
    Ok((
        FailedEpisode {
            id: row.get(0)?,
            idempotency_key: row.get(1)?,
            session_id: row.get(2)?,
            group_id: row.get(3)?,
            episode: Episode::default(),
            error_kind: row.get(5)?,
            error: row.get(6)?,
            attempts: row.get(7)?,
            failed_at: row.get(8)?,
        },
        payload,
    ))
}

fn decode_failed((mut f, payload): (FailedEpisode, String)) -> Result<FailedEpisode, GmemError> {
    f.episode = serde_json::from_str(&payload)?;
    Ok(f)
}

const FAILED_COLUMNS: &str =
    "id, idempotency_key, session_id, group_id, payload, error_kind, error, attempts, failed_at";

pub fn list_failed(conn: &Connection, limit: usize) -> Result<Vec<FailedEpisode>, GmemError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FAILED_COLUMNS} FROM failed_episodes ORDER BY failed_at DESC, id DESC LIMIT ?1"
    ))?;
    let rows = stmt
        .query_map(params![limit as i64], row_to_failed)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(decode_failed).collect()
}

pub fn get_failed(conn: &Connection, id: i64) -> Result<Option<FailedEpisode>, GmemError> {
    let row = conn
        .query_row(
            &format!("SELECT {FAILED_COLUMNS} FROM failed_episodes WHERE id = ?1"),
            params![id],
            row_to_failed,
        )
        .optional()?;
    row.map(decode_failed).transpose()
}

pub fn remove_failed(conn: &Connection, idempotency_key: &str) -> Result<bool, GmemError> {
    let n = conn.execute(
        "DELETE FROM failed_episodes WHERE idempotency_key = ?1",
        params![idempotency_key],
    )?;
    Ok(n > 0)
}

pub fn count_failed(conn: &Connection) -> Result<u64, GmemError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM failed_episodes", [], |r| r.get(0))?;
    Ok(n as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn episode(key: &str) -> Episode {
        Episode {
            name: "turn".into(),
            body: "User: hi".into(),
            group_id: "project_x".into(),
            metadata: json!({"session_id": "s1"}),
            idempotency_key: key.into(),
            ..Default::default()
        }
    }

    #[test]
    fn offsets_never_regress() {
        let conn = open_in_memory().unwrap();
        assert_eq!(committed_offset(&conn, "/a.jsonl").unwrap(), 0);
        assert_eq!(commit_offset(&conn, "/a.jsonl", 100).unwrap(), 100);
        assert_eq!(commit_offset(&conn, "/a.jsonl", 40).unwrap(), 100);
        assert_eq!(commit_offset(&conn, "/a.jsonl", 250).unwrap(), 250);
        assert_eq!(committed_offset(&conn, "/b.jsonl").unwrap(), 0);
    }

    #[test]
    fn park_list_and_remove() {
        let conn = open_in_memory().unwrap();
        let id = park_failed(&conn, &episode("k1"), "store_transient", "HTTP 503", 4).unwrap();
        let again = park_failed(&conn, &episode("k1"), "store_transient", "HTTP 502", 4).unwrap();
        assert_eq!(id, again);
        park_failed(&conn, &episode("k2"), "store_rejected", "HTTP 422", 1).unwrap();

        assert_eq!(count_failed(&conn).unwrap(), 2);
        let f = get_failed(&conn, id).unwrap().unwrap();
        assert_eq!(f.attempts, 8);
        assert_eq!(f.error, "HTTP 502");
        assert_eq!(f.session_id.as_deref(), Some("s1"));
        assert_eq!(f.episode.body, "User: hi");
        assert_eq!(list_failed(&conn, 10).unwrap().len(), 2);

        assert!(remove_failed(&conn, "k1").unwrap());
        assert!(!remove_failed(&conn, "k1").unwrap());
        assert!(get_failed(&conn, id).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn db_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sub").join("gmem.db");
        open_db(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
