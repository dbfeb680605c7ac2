//! C2 — Location Store.
//!
//! Durable, append-mostly storage of [`LocationReport`]s with the indices
//! named in the design (`id`, `entity_id`, `entity_type`, `created_at`,
//! `node_id`, compound `(entity_id, created_at)`) and a denormalized
//! latest-per-entity cache kept consistent at insert time.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::error::CoreError;
use crate::time::now_ms;

// ─── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Responder,
    Civilian,
    Incident,
    Resource,
    Hazard,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Responder => "responder",
            EntityType::Civilian => "civilian",
            EntityType::Incident => "incident",
            EntityType::Resource => "resource",
            EntityType::Hazard => "hazard",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "responder" => Ok(EntityType::Responder),
            "civilian" => Ok(EntityType::Civilian),
            "incident" => Ok(EntityType::Incident),
            "resource" => Ok(EntityType::Resource),
            "hazard" => Ok(EntityType::Hazard),
            other => Err(CoreError::InvalidParameter(format!(
                "unknown entity_type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl Position {
    pub fn validate(&self) -> Result<(), CoreError> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(CoreError::InvalidParameter(format!(
                "lat {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(CoreError::InvalidParameter(format!(
                "lon {} out of range [-180, 180]",
                self.lon
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub id: String,
    pub node_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub position: Position,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

impl LocationReport {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.created_at <= 0 {
            return Err(CoreError::InvalidParameter(
                "created_at must be > 0".to_string(),
            ));
        }
        if self.id.is_empty() || self.entity_id.is_empty() || self.node_id.is_empty() {
            return Err(CoreError::InvalidParameter(
                "id, node_id and entity_id must be non-empty".to_string(),
            ));
        }
        self.position.validate()
    }

    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let entity_type_str: String = row.try_get("entity_type")?;
        let metadata_str: String = row.try_get("metadata")?;
        let entity_type = EntityType::parse(&entity_type_str)
            .map_err(|e| sqlx::Error::Decode(Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))))?;
        let metadata = serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null);
        Ok(LocationReport {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            entity_id: row.try_get("entity_id")?,
            entity_type,
            position: Position {
                lat: row.try_get("lat")?,
                lon: row.try_get("lon")?,
                alt: row.try_get("alt")?,
                accuracy: row.try_get("accuracy")?,
            },
            metadata,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Debug, Serialize)]
pub struct BatchError {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Serialize, Default)]
pub struct BatchResult {
    pub created: usize,
    pub failed: usize,
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub per_type: HashMap<String, i64>,
    pub per_node: HashMap<String, i64>,
}

// ─── Store ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LocationStore {
    pool: SqlitePool,
}

impl LocationStore {
    pub async fn connect(database_path: &str) -> Result<Self, CoreError> {
        let url = format!("sqlite://{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS reports (
                id          TEXT PRIMARY KEY,
                node_id     TEXT NOT NULL,
                entity_id   TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                lat         REAL NOT NULL,
                lon         REAL NOT NULL,
                alt         REAL,
                accuracy    REAL,
                metadata    TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reports_entity_id ON reports(entity_id);
            CREATE INDEX IF NOT EXISTS idx_reports_entity_type ON reports(entity_type);
            CREATE INDEX IF NOT EXISTS idx_reports_created_at ON reports(created_at);
            CREATE INDEX IF NOT EXISTS idx_reports_node_id ON reports(node_id);
            CREATE INDEX IF NOT EXISTS idx_reports_entity_created ON reports(entity_id, created_at);

            CREATE TABLE IF NOT EXISTS latest_per_entity (
                entity_id   TEXT PRIMARY KEY,
                report_id   TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS refresh_counter (
                id    INTEGER PRIMARY KEY CHECK (id = 0),
                count INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("INSERT OR IGNORE INTO refresh_counter (id, count) VALUES (0, 0)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Insert one report. Idempotent by `id`: an identical re-insert returns
    /// `AlreadyPresent`; a differing re-insert is rejected with
    /// `ReportConflict` and the original row is left untouched.
    pub async fn insert(&self, report: &LocationReport) -> Result<InsertOutcome, CoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_tx(&mut tx, report).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Same contract as [`Self::insert`], but runs against an already-open
    /// transaction so a caller (the Pull Scheduler's commit step) can insert
    /// many reports and upsert the peer's sync-log cursors in one atomic
    /// unit (spec §4.4/§4.5).
    pub async fn insert_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        report: &LocationReport,
    ) -> Result<InsertOutcome, CoreError> {
        report.validate()?;

        let existing_row = sqlx::query(
            "SELECT id, node_id, entity_id, entity_type, lat, lon, alt, accuracy, metadata, created_at \
             FROM reports WHERE id = ?",
        )
        .bind(&report.id)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(row) = existing_row {
            let existing = LocationReport::from_row(&row)?;
            if &existing == report {
                return Ok(InsertOutcome::AlreadyPresent);
            }
            return Err(CoreError::ReportConflict {
                id: report.id.clone(),
            });
        }

        let metadata_str = serde_json::to_string(&report.metadata).unwrap_or_else(|_| "null".to_string());

        sqlx::query(
            r#"INSERT INTO reports (id, node_id, entity_id, entity_type, lat, lon, alt, accuracy, metadata, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&report.id)
        .bind(&report.node_id)
        .bind(&report.entity_id)
        .bind(report.entity_type.as_str())
        .bind(report.position.lat)
        .bind(report.position.lon)
        .bind(report.position.alt)
        .bind(report.position.accuracy)
        .bind(&metadata_str)
        .bind(report.created_at)
        .execute(&mut **tx)
        .await?;

        let current_latest: Option<i64> = sqlx::query_scalar(
            "SELECT created_at FROM latest_per_entity WHERE entity_id = ?",
        )
        .bind(&report.entity_id)
        .fetch_optional(&mut **tx)
        .await?;

        if current_latest.map(|c| report.created_at > c).unwrap_or(true) {
            sqlx::query(
                r#"INSERT INTO latest_per_entity (entity_id, report_id, created_at, updated_at)
                   VALUES (?, ?, ?, ?)
                   ON CONFLICT(entity_id) DO UPDATE SET
                       report_id = excluded.report_id,
                       created_at = excluded.created_at,
                       updated_at = excluded.updated_at"#,
            )
            .bind(&report.entity_id)
            .bind(&report.id)
            .bind(report.created_at)
            .bind(now_ms())
            .execute(&mut **tx)
            .await?;
        }

        sqlx::query("UPDATE refresh_counter SET count = count + 1 WHERE id = 0")
            .execute(&mut **tx)
            .await?;

        Ok(InsertOutcome::Inserted)
    }

    /// Insert each report via the single-insert contract. Not atomic across
    /// elements; each element is atomic.
    pub async fn insert_batch(&self, reports: &[LocationReport]) -> BatchResult {
        let mut result = BatchResult::default();
        for (index, report) in reports.iter().enumerate() {
            match self.insert(report).await {
                Ok(_) => result.created += 1,
                Err(e) => {
                    result.failed += 1;
                    result.errors.push(BatchError {
                        index,
                        reason: e.to_string(),
                    });
                }
            }
        }
        result
    }

    pub async fn list_between(
        &self,
        node_id: Option<&str>,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<LocationReport>, CoreError> {
        let rows = match node_id {
            Some(nid) => {
                sqlx::query(
                    "SELECT * FROM reports WHERE node_id = ? AND created_at >= ? AND created_at <= ? ORDER BY created_at ASC",
                )
                .bind(nid)
                .bind(from_ms)
                .bind(to_ms)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM reports WHERE created_at >= ? AND created_at <= ? ORDER BY created_at ASC",
                )
                .bind(from_ms)
                .bind(to_ms)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(LocationReport::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    /// `since` is treated exclusively: only reports strictly newer than
    /// `since_ms` are returned (the chosen resolution of the spec's
    /// documented `>` vs `>=` ambiguity, applied uniformly).
    pub async fn list_since(
        &self,
        node_id: Option<&str>,
        since_ms: i64,
    ) -> Result<Vec<LocationReport>, CoreError> {
        let rows = match node_id {
            Some(nid) => {
                sqlx::query(
                    "SELECT * FROM reports WHERE node_id = ? AND created_at > ? ORDER BY created_at ASC",
                )
                .bind(nid)
                .bind(since_ms)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM reports WHERE created_at > ? ORDER BY created_at ASC")
                    .bind(since_ms)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(LocationReport::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    pub async fn latest_for(
        &self,
        entity_types: Option<&[EntityType]>,
    ) -> Result<Vec<LocationReport>, CoreError> {
        let rows = match entity_types {
            None => {
                sqlx::query(
                    "SELECT r.* FROM reports r \
                     JOIN latest_per_entity l ON l.report_id = r.id \
                     ORDER BY r.entity_id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
            Some(types) => {
                let placeholders = types.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
                let sql = format!(
                    "SELECT r.* FROM reports r \
                     JOIN latest_per_entity l ON l.report_id = r.id \
                     WHERE r.entity_type IN ({placeholders}) \
                     ORDER BY r.entity_id ASC"
                );
                let mut q = sqlx::query(&sql);
                for t in types {
                    q = q.bind(t.as_str());
                }
                q.fetch_all(&self.pool).await?
            }
        };
        rows.iter()
            .map(LocationReport::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    pub async fn history_for(
        &self,
        entity_id: &str,
        since_ms: Option<i64>,
        limit: i64,
    ) -> Result<Vec<LocationReport>, CoreError> {
        let rows = match since_ms {
            Some(since) => {
                sqlx::query(
                    "SELECT * FROM reports WHERE entity_id = ? AND created_at > ? \
                     ORDER BY created_at DESC LIMIT ?",
                )
                .bind(entity_id)
                .bind(since)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM reports WHERE entity_id = ? ORDER BY created_at DESC LIMIT ?",
                )
                .bind(entity_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter()
            .map(LocationReport::from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CoreError::from)
    }

    pub async fn stats(&self) -> Result<StoreStats, CoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reports")
            .fetch_one(&self.pool)
            .await?;

        let per_type_rows = sqlx::query("SELECT entity_type, COUNT(*) as cnt FROM reports GROUP BY entity_type")
            .fetch_all(&self.pool)
            .await?;
        let mut per_type = HashMap::new();
        for row in per_type_rows {
            let key: String = row.try_get("entity_type")?;
            let cnt: i64 = row.try_get("cnt")?;
            per_type.insert(key, cnt);
        }

        let per_node_rows = sqlx::query("SELECT node_id, COUNT(*) as cnt FROM reports GROUP BY node_id")
            .fetch_all(&self.pool)
            .await?;
        let mut per_node = HashMap::new();
        for row in per_node_rows {
            let key: String = row.try_get("node_id")?;
            let cnt: i64 = row.try_get("cnt")?;
            per_node.insert(key, cnt);
        }

        Ok(StoreStats {
            total,
            per_type,
            per_node,
        })
    }

    pub async fn refresh_counter(&self) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT count FROM refresh_counter WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, entity_id: &str, created_at: i64) -> LocationReport {
        LocationReport {
            id: id.to_string(),
            node_id: "169.254.1.1".to_string(),
            entity_id: entity_id.to_string(),
            entity_type: EntityType::Civilian,
            position: Position {
                lat: 52.52,
                lon: 13.405,
                alt: None,
                accuracy: None,
            },
            metadata: serde_json::json!({}),
            created_at,
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        let r = sample("r1", "e1", 1000);

        assert_eq!(store.insert(&r).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            store.insert(&r).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(store.refresh_counter().await.unwrap(), 1);

        let all = store.list_between(None, 0, 2000).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn conflicting_content_is_rejected() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        let r1 = sample("r1", "e1", 1000);
        let mut r2 = sample("r1", "e2", 2000);
        r2.id = "r1".to_string();

        store.insert(&r1).await.unwrap();
        let err = store.insert(&r2).await.unwrap_err();
        assert!(matches!(err, CoreError::ReportConflict { .. }));

        let stored = store.list_between(None, 0, 5000).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].entity_id, "e1");
    }

    #[tokio::test]
    async fn latest_cache_tracks_max_created_at() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        store.insert(&sample("r1", "e1", 1000)).await.unwrap();
        store.insert(&sample("r2", "e1", 500)).await.unwrap();
        store.insert(&sample("r3", "e1", 2000)).await.unwrap();

        let latest = store.latest_for(None).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, "r3");
    }

    #[tokio::test]
    async fn list_since_is_exclusive() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        store.insert(&sample("r1", "e1", 1000)).await.unwrap();
        let after = store.list_since(None, 1000).await.unwrap();
        assert!(after.is_empty());
        let inclusive_from_before = store.list_since(None, 999).await.unwrap();
        assert_eq!(inclusive_from_before.len(), 1);
    }

    #[tokio::test]
    async fn history_for_is_newest_first_and_limited() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        for i in 0..5 {
            store
                .insert(&sample(&format!("r{i}"), "e1", 1000 + i))
                .await
                .unwrap();
        }
        let hist = store.history_for("e1", None, 3).await.unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].created_at, 1004);
        assert_eq!(hist[2].created_at, 1002);
    }

    #[tokio::test]
    async fn stats_group_by_type_and_node() {
        let store = LocationStore::connect_in_memory().await.unwrap();
        store.insert(&sample("r1", "e1", 1000)).await.unwrap();
        store.insert(&sample("r2", "e2", 1001)).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.per_type.get("civilian"), Some(&2));
        assert_eq!(stats.per_node.get("169.254.1.1"), Some(&2));
    }
}
