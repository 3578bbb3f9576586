use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE log_offsets (
    path             TEXT PRIMARY KEY,
    committed_offset INTEGER NOT NULL DEFAULT 0,
    updated_at       INTEGER NOT NULL
);

CREATE TABLE failed_episodes (
    id              INTEGER PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    session_id      TEXT,
    group_id        TEXT NOT NULL,
    payload         TEXT NOT NULL,
    error_kind      TEXT NOT NULL,
    error           TEXT NOT NULL,
    attempts        INTEGER NOT NULL DEFAULT 1,
    failed_at       INTEGER NOT NULL
);
",
        ),
        M::up("CREATE INDEX idx_failed_group ON failed_episodes(group_id, failed_at);"),
    ])
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_valid() {
        assert!(MIGRATIONS.validate().is_ok());
    }

    #[test]
    fn migrations_apply_to_memory_db() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        MIGRATIONS.to_latest(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(tables.contains(&"log_offsets".into()));
        assert!(tables.contains(&"failed_episodes".into()));
    }
}
