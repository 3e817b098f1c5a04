//! SQLite order store.
//!
//! A self-hosted stand-in for the hosted backend: the same order queries and
//! sync control record, served from a local rusqlite database in WAL mode.
//! Rows are kept as the JSON they were imported as, plus the few columns the
//! queries filter and sort on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{OrderBackend, OrderQuery};
use crate::error::{DashboardError, Result};
use crate::normalize::{format_iso, parse_timestamp};
use crate::value_text;

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

pub struct SqliteBackend {
    conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Open (or create) `{data_dir}/dashboard.db` and run pending migrations.
///
/// On open failure the file is deleted and the open retried once; the
/// database only mirrors backend data.
pub fn init(data_dir: &Path) -> Result<SqliteBackend> {
    fs::create_dir_all(data_dir)
        .map_err(|e| DashboardError::Storage(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("dashboard.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), deleting and retrying once");
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };
    run_migrations(&conn)?;

    Ok(SqliteBackend {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database with the full schema.
pub fn open_in_memory() -> Result<SqliteBackend> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
    run_migrations(&conn)?;
    Ok(SqliteBackend {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// Migration v1: orders and the sync control record.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            company TEXT,
            created_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            imported_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sync_control (
            task_name TEXT PRIMARY KEY,
            last_run TEXT,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_orders_created_at ON orders(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        DashboardError::from(e)
    })
}

/// Migration v2: company filter index.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_orders_company_created
            ON orders(company, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        DashboardError::from(e)
    })
}

fn decode_payloads(raw: Vec<(String, String)>) -> Vec<Value> {
    raw.into_iter()
        .filter_map(|(id, payload)| match serde_json::from_str::<Value>(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(order_id = %id, error = %e, "skipping unreadable stored order");
                None
            }
        })
        .collect()
}

impl SqliteBackend {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DashboardError::Storage(format!("connection lock poisoned: {e}")))
    }

    /// Insert or replace an order row. Returns the stored id.
    pub fn upsert_order(&self, row: &Value) -> Result<String> {
        if !row.is_object() {
            return Err(DashboardError::UnexpectedPayload(
                "order rows must be JSON objects".into(),
            ));
        }
        let id = value_text(row, &["id_pedido", "id", "order_id"])
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let company = value_text(row, &["tienda", "empresa", "store", "company"]);
        let created_at = value_text(row, &["fecha_creacion", "created_at"])
            .and_then(|raw| parse_timestamp(&raw))
            .unwrap_or_else(Utc::now);

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO orders (id, company, created_at, payload)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                company = excluded.company,
                created_at = excluded.created_at,
                payload = excluded.payload,
                imported_at = datetime('now')",
            params![id, company, format_iso(created_at), row.to_string()],
        )?;
        Ok(id)
    }

    pub fn set_control_time(&self, task_name: &str, time_of_day: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_control (task_name, last_run, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(task_name) DO UPDATE SET
                last_run = excluded.last_run,
                updated_at = excluded.updated_at",
            params![task_name, time_of_day],
        )?;
        Ok(())
    }

    pub fn order_count(&self) -> Result<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))?)
    }
}

#[async_trait]
impl OrderBackend for SqliteBackend {
    async fn fetch_orders_between(
        &self,
        query: &OrderQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let raw = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, payload FROM orders
                 WHERE (?1 IS NULL OR company = ?1)
                   AND created_at >= ?2
                   AND created_at < ?3
                 ORDER BY created_at DESC, id",
            )?;
            let rows = stmt.query_map(
                params![query.company, format_iso(from), format_iso(to)],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            collected
        };
        Ok(decode_payloads(raw))
    }

    async fn fetch_orders_page(
        &self,
        query: &OrderQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let raw = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT id, payload FROM orders
                 WHERE (?1 IS NULL OR company = ?1)
                 ORDER BY created_at DESC, id
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                params![query.company, limit as i64, offset as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;
            let collected = rows.collect::<std::result::Result<Vec<_>, _>>()?;
            collected
        };
        Ok(decode_payloads(raw))
    }

    async fn fetch_control_time(&self, task_name: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let last_run = conn
            .query_row(
                "SELECT last_run FROM sync_control WHERE task_name = ?1",
                params![task_name],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(last_run.flatten())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn seeded() -> SqliteBackend {
        let db = open_in_memory().unwrap();
        for (i, day) in [(1, 8), (2, 9), (3, 10), (4, 10)] {
            let store = if i % 2 == 0 { "Norte" } else { "Sur" };
            db.upsert_order(&json!({
                "id_pedido": format!("P-{i}"),
                "tienda": store,
                "fecha_creacion": format!("2025-03-{day:02}T12:00:00Z"),
                "valor_total": i * 1000,
            }))
            .unwrap();
        }
        db
    }

    fn ids(rows: &[Value]) -> Vec<String> {
        rows.iter()
            .map(|r| r["id_pedido"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_init_creates_file() {
        let dir = std::env::temp_dir().join(format!("dashboard_db_{}", Uuid::new_v4()));
        let db = init(&dir).unwrap();
        assert!(db.db_path.exists());
        assert_eq!(db.order_count().unwrap(), 0);
        drop(db);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_upsert_replaces_existing_row() {
        let db = seeded();
        db.upsert_order(&json!({"id_pedido": "P-1", "tienda": "Sur", "valor_total": 1})).unwrap();
        assert_eq!(db.order_count().unwrap(), 4);
        assert!(matches!(
            db.upsert_order(&json!(["not", "a", "row"])),
            Err(DashboardError::UnexpectedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_pages_are_newest_first() {
        let db = seeded();
        let query = OrderQuery::default();
        let first = db.fetch_orders_page(&query, 0, 3).await.unwrap();
        let second = db.fetch_orders_page(&query, 3, 3).await.unwrap();
        assert_eq!(ids(&first), vec!["P-3", "P-4", "P-2"]);
        assert_eq!(ids(&second), vec!["P-1"]);
    }

    #[tokio::test]
    async fn test_company_and_range_filters() {
        let db = seeded();
        let from = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2025, 3, 11, 0, 0, 0).unwrap();

        let all_today = db
            .fetch_orders_between(&OrderQuery::default(), from, to)
            .await
            .unwrap();
        assert_eq!(ids(&all_today), vec!["P-3", "P-4"]);

        let north = db
            .fetch_orders_between(&OrderQuery::for_company(Some("Norte")), from, to)
            .await
            .unwrap();
        assert_eq!(ids(&north), vec!["P-4"]);
    }

    #[tokio::test]
    async fn test_control_time_roundtrip() {
        let db = open_in_memory().unwrap();
        assert_eq!(db.fetch_control_time("sync_registros").await.unwrap(), None);
        db.set_control_time("sync_registros", "08:15:00").unwrap();
        db.set_control_time("sync_registros", "09:30:00").unwrap();
        assert_eq!(
            db.fetch_control_time("sync_registros").await.unwrap(),
            Some("09:30:00".to_string())
        );
    }
}
