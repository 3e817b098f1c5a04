//! Runtime configuration, read from the environment (and `.env`).

use std::path::PathBuf;
use tracing::debug;

use crate::error::{DashboardError, Result};
use crate::storage;

pub const ENV_BACKEND: &str = "DASHBOARD_BACKEND";
pub const ENV_SUPABASE_URL: &str = "DASHBOARD_SUPABASE_URL";
pub const ENV_SUPABASE_KEY: &str = "DASHBOARD_SUPABASE_KEY";
pub const ENV_DB_PATH: &str = "DASHBOARD_DB_PATH";
pub const ENV_SYNC_URL: &str = "DASHBOARD_SYNC_URL";
pub const ENV_COMPANY: &str = "DASHBOARD_COMPANY";
pub const ENV_ORDERS_TABLE: &str = "DASHBOARD_ORDERS_TABLE";
pub const ENV_CONTROL_TABLE: &str = "DASHBOARD_CONTROL_TABLE";
pub const ENV_SYNC_TASK: &str = "DASHBOARD_SYNC_TASK";

pub const DEFAULT_SYNC_TASK: &str = "sync_registros";

/// Table and column names on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    pub orders_table: String,
    pub company_column: String,
    pub created_column: String,
    pub control_table: String,
    pub control_key_column: String,
    pub control_time_column: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            orders_table: "pedidos".into(),
            company_column: "tienda".into(),
            created_column: "fecha_creacion".into(),
            control_table: "sync_control".into(),
            control_key_column: "task_name".into(),
            control_time_column: "last_run".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    Supabase { url: String, api_key: String },
    Sqlite { data_dir: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub backend: BackendKind,
    /// Sync trigger endpoint; syncing is unavailable without one.
    pub sync_url: Option<String>,
    pub company: Option<String>,
    pub sync_task: String,
    pub tables: TableConfig,
}

impl DashboardConfig {
    /// Load `.env` if present, then read the process environment. The
    /// backend key falls back to the OS keyring.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| {
            std::env::var(key).ok().or_else(|| {
                if key == ENV_SUPABASE_KEY {
                    storage::get_credential(storage::KEY_BACKEND_KEY)
                } else {
                    None
                }
            })
        })
    }

    /// Build a config from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let backend = match get(ENV_BACKEND)
            .map(|v| v.to_lowercase())
            .as_deref()
            .unwrap_or("supabase")
        {
            "supabase" => BackendKind::Supabase {
                url: get(ENV_SUPABASE_URL).ok_or_else(|| {
                    DashboardError::Config(format!("{ENV_SUPABASE_URL} is not set"))
                })?,
                api_key: get(ENV_SUPABASE_KEY).ok_or_else(|| {
                    DashboardError::Config(format!("{ENV_SUPABASE_KEY} is not set"))
                })?,
            },
            "sqlite" => BackendKind::Sqlite {
                data_dir: get(ENV_DB_PATH)
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data")),
            },
            other => {
                return Err(DashboardError::Config(format!(
                    "unknown {ENV_BACKEND} value: {other}"
                )))
            }
        };

        let defaults = TableConfig::default();
        Ok(Self {
            backend,
            sync_url: get(ENV_SYNC_URL),
            company: get(ENV_COMPANY),
            sync_task: get(ENV_SYNC_TASK).unwrap_or_else(|| DEFAULT_SYNC_TASK.to_string()),
            tables: TableConfig {
                orders_table: get(ENV_ORDERS_TABLE).unwrap_or(defaults.orders_table),
                control_table: get(ENV_CONTROL_TABLE).unwrap_or(defaults.control_table),
                ..defaults
            },
        })
    }
}
