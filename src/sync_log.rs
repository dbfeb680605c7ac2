//! C4 — Sync Log: per-peer forward/backward cursors and last contact
//! outcome. Cursors only ever advance forward / retreat backward (never in
//! the opposite direction) and are written in the same transaction as the
//! round's report inserts by the caller in `scheduler.rs`.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::error::CoreError;
use crate::time::now_ms;

#[derive(Debug, Clone, PartialEq)]
pub struct PeerSyncState {
    pub peer_id: String,
    pub forward_cursor_ms: i64,
    pub backward_cursor_ms: i64,
    pub last_contact_ms: i64,
    pub last_outcome: String,
}

#[derive(Debug, Serialize)]
pub struct PeerDiagnostics {
    pub peer_id: String,
    pub forward_cursor_ms: i64,
    pub backward_cursor_ms: i64,
    pub age_forward_ms: i64,
    pub age_backward_ms: i64,
    pub last_outcome: String,
    pub report_count: i64,
}

#[derive(Clone)]
pub struct SyncLog {
    pool: SqlitePool,
}

impl SyncLog {
    /// Share the same connection pool the location store opened — cursor
    /// writes and report inserts for one round must commit atomically.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS peer_sync_state (
                peer_id           TEXT PRIMARY KEY,
                forward_cursor_ms INTEGER NOT NULL,
                backward_cursor_ms INTEGER NOT NULL,
                last_contact_ms   INTEGER NOT NULL,
                last_outcome      TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, peer_id: &str) -> Result<Option<PeerSyncState>, CoreError> {
        let row = sqlx::query(
            "SELECT peer_id, forward_cursor_ms, backward_cursor_ms, last_contact_ms, last_outcome \
             FROM peer_sync_state WHERE peer_id = ?",
        )
        .bind(peer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(PeerSyncState {
                peer_id: r.try_get("peer_id")?,
                forward_cursor_ms: r.try_get("forward_cursor_ms")?,
                backward_cursor_ms: r.try_get("backward_cursor_ms")?,
                last_contact_ms: r.try_get("last_contact_ms")?,
                last_outcome: r.try_get("last_outcome")?,
            }),
            None => None,
        })
    }

    /// First-contact defaults per spec §4.5: forward cursor starts at 0,
    /// backward cursor starts at local `now`.
    pub async fn get_or_init(&self, peer_id: &str) -> Result<PeerSyncState, CoreError> {
        if let Some(state) = self.get(peer_id).await? {
            return Ok(state);
        }
        let state = PeerSyncState {
            peer_id: peer_id.to_string(),
            forward_cursor_ms: 0,
            backward_cursor_ms: now_ms(),
            last_contact_ms: 0,
            last_outcome: "never-contacted".to_string(),
        };
        self.put(
            &state.peer_id,
            state.forward_cursor_ms,
            state.backward_cursor_ms,
            &state.last_outcome,
        )
        .await?;
        Ok(state)
    }

    /// Upsert the cursor pair and outcome for a peer. Callers must run this
    /// inside the same transaction as the round's report inserts; this
    /// method accepts a plain pool handle since `sqlx::SqlitePool` executors
    /// and `Transaction` executors share the same trait, so callers may also
    /// pass `&mut *tx` via [`SyncLog::put_tx`].
    pub async fn put(
        &self,
        peer_id: &str,
        forward_cursor_ms: i64,
        backward_cursor_ms: i64,
        outcome: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO peer_sync_state (peer_id, forward_cursor_ms, backward_cursor_ms, last_contact_ms, last_outcome)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(peer_id) DO UPDATE SET
                   forward_cursor_ms = excluded.forward_cursor_ms,
                   backward_cursor_ms = excluded.backward_cursor_ms,
                   last_contact_ms = excluded.last_contact_ms,
                   last_outcome = excluded.last_outcome"#,
        )
        .bind(peer_id)
        .bind(forward_cursor_ms)
        .bind(backward_cursor_ms)
        .bind(now_ms())
        .bind(outcome)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Same upsert, executed against an open transaction so it commits
    /// atomically with the round's report inserts (spec §4.4).
    pub async fn put_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        peer_id: &str,
        forward_cursor_ms: i64,
        backward_cursor_ms: i64,
        outcome: &str,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO peer_sync_state (peer_id, forward_cursor_ms, backward_cursor_ms, last_contact_ms, last_outcome)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(peer_id) DO UPDATE SET
                   forward_cursor_ms = excluded.forward_cursor_ms,
                   backward_cursor_ms = excluded.backward_cursor_ms,
                   last_contact_ms = excluded.last_contact_ms,
                   last_outcome = excluded.last_outcome"#,
        )
        .bind(peer_id)
        .bind(forward_cursor_ms)
        .bind(backward_cursor_ms)
        .bind(now_ms())
        .bind(outcome)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn all(&self, report_counts_by_node: &std::collections::HashMap<String, i64>) -> Result<Vec<PeerDiagnostics>, CoreError> {
        let rows = sqlx::query(
            "SELECT peer_id, forward_cursor_ms, backward_cursor_ms, last_contact_ms, last_outcome FROM peer_sync_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = now_ms();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let peer_id: String = row.try_get("peer_id")?;
            let forward_cursor_ms: i64 = row.try_get("forward_cursor_ms")?;
            let backward_cursor_ms: i64 = row.try_get("backward_cursor_ms")?;
            let last_outcome: String = row.try_get("last_outcome")?;
            let report_count = report_counts_by_node.get(&peer_id).copied().unwrap_or(0);
            out.push(PeerDiagnostics {
                age_forward_ms: (now - forward_cursor_ms).max(0),
                age_backward_ms: backward_cursor_ms.max(0),
                peer_id,
                forward_cursor_ms,
                backward_cursor_ms,
                last_outcome,
                report_count,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_contact_defaults() {
        let log = SyncLog::new(test_pool().await);
        log.run_migrations().await.unwrap();
        let state = log.get_or_init("169.254.1.2").await.unwrap();
        assert_eq!(state.forward_cursor_ms, 0);
        assert!(state.backward_cursor_ms > 0);
    }

    #[tokio::test]
    async fn put_upserts() {
        let log = SyncLog::new(test_pool().await);
        log.run_migrations().await.unwrap();
        log.put("p1", 100, 5000, "ok").await.unwrap();
        log.put("p1", 200, 4000, "ok").await.unwrap();
        let state = log.get("p1").await.unwrap().unwrap();
        assert_eq!(state.forward_cursor_ms, 200);
        assert_eq!(state.backward_cursor_ms, 4000);
    }
}
