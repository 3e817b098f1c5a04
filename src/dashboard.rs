//! The dashboard as a whole: one backend, the load pipeline, and the sync
//! gate whose successful syncs reload the pipeline.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::api::{HttpSyncEndpoint, SupabaseBackend};
use crate::backend::{OrderBackend, SyncEndpoint};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, DashboardConfig};
use crate::db;
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineOutcome, ORDER_PAGE_SIZE};
use crate::sync_gate::SyncGate;

pub struct Dashboard {
    company: Option<String>,
    pipeline: Pipeline,
    sync: SyncGate,
}

impl Dashboard {
    pub fn new(
        backend: Arc<dyn OrderBackend>,
        endpoint: Option<Arc<dyn SyncEndpoint>>,
        clock: Arc<dyn Clock>,
        company: Option<String>,
        sync_task: &str,
    ) -> Self {
        Self {
            company,
            pipeline: Pipeline::new(backend.clone(), clock.clone()),
            sync: SyncGate::new(backend, endpoint, clock, sync_task),
        }
    }

    /// Wire the configured backend and sync endpoint.
    pub fn from_config(config: &DashboardConfig) -> Result<Self> {
        let (backend, endpoint): (Arc<dyn OrderBackend>, Option<Arc<dyn SyncEndpoint>>) =
            match &config.backend {
                BackendKind::Supabase { url, api_key } => {
                    let backend = SupabaseBackend::new(url, api_key, config.tables.clone())?;
                    let endpoint = config
                        .sync_url
                        .as_deref()
                        .map(|url| HttpSyncEndpoint::new(url, Some(api_key)))
                        .transpose()?;
                    (
                        Arc::new(backend),
                        endpoint.map(|e| Arc::new(e) as Arc<dyn SyncEndpoint>),
                    )
                }
                BackendKind::Sqlite { data_dir } => {
                    let backend = db::init(data_dir)?;
                    let endpoint = config
                        .sync_url
                        .as_deref()
                        .map(|url| HttpSyncEndpoint::new(url, None))
                        .transpose()?;
                    (
                        Arc::new(backend),
                        endpoint.map(|e| Arc::new(e) as Arc<dyn SyncEndpoint>),
                    )
                }
            };
        info!(
            company = ?config.company,
            sync_enabled = endpoint.is_some(),
            "dashboard configured"
        );
        Ok(Self::new(
            backend,
            endpoint,
            Arc::new(SystemClock),
            config.company.clone(),
            &config.sync_task,
        ))
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn sync_gate(&self) -> &SyncGate {
        &self.sync
    }

    /// Load the last sync time, then run the pipeline.
    pub async fn initialize(&self) -> PipelineOutcome {
        self.sync.refresh_timestamp().await;
        self.refresh().await
    }

    pub async fn refresh(&self) -> PipelineOutcome {
        self.pipeline.run(self.company.as_deref()).await
    }

    /// Trigger a backend sync and reload once it is recorded. The outcome
    /// is that of the reload.
    pub async fn sync_registries(&self) -> Result<PipelineOutcome> {
        self.sync.sync_registries(|| self.refresh()).await
    }

    pub fn shutdown(&self) {
        self.sync.shutdown();
    }

    pub fn summary_json(&self) -> Value {
        let data = self.pipeline.snapshot();
        let sync = self.sync.state();
        json!({
            "company": self.company,
            "stats": data.stats,
            "todayStats": data.today_stats,
            "messengers": data.messengers,
            "advisors": data.advisors,
            "orders": {
                "page": data.current_page,
                "pageSize": ORDER_PAGE_SIZE,
                "totalPages": self.pipeline.total_pages(),
                "items": self.pipeline.page(data.current_page),
            },
            "sync": {
                "lastSyncTimestamp": sync.last_sync_timestamp,
                "syncing": sync.syncing,
                "syncMessage": sync.sync_message,
                "canSync": self.sync.can_sync(),
                "timeUntilNextSync": self.sync.time_until_next_sync(),
                "enabled": self.sync.has_endpoint(),
            },
            "pipeline": self.pipeline.state(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{facility_local_to_utc, ManualClock};
    use crate::backend::OrderQuery;
    use crate::config::TableConfig;
    use crate::db::SqliteBackend;
    use crate::error::DashboardError;
    use crate::pipeline::StepId;
    use async_trait::async_trait;
    use chrono::{DateTime, NaiveDate, Utc};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TASK: &str = "sync_registros";

    fn facility(h: u32, m: u32) -> DateTime<Utc> {
        facility_local_to_utc(
            NaiveDate::from_ymd_opt(2025, 3, 10)
                .unwrap()
                .and_hms_opt(h, m, 0)
                .unwrap(),
        )
    }

    /// Behaves like the real sync job: imports a new order, then stamps the
    /// control record.
    struct LocalSyncJob {
        db: Arc<SqliteBackend>,
        stamp: &'static str,
    }

    #[async_trait]
    impl SyncEndpoint for LocalSyncJob {
        async fn trigger(&self) -> Result<()> {
            self.db.upsert_order(&json!({
                "id_pedido": "NEW-1",
                "estado_pedido": "Entregado",
                "mensajero_concretado": "María José",
                "tienda": "Sur",
                "valor_total": "2500",
                "fecha_creacion": "2025-03-10 11:00:00",
            }))?;
            self.db.set_control_time(TASK, self.stamp)
        }
    }

    fn seeded() -> Arc<SqliteBackend> {
        let db = db::open_in_memory().unwrap();
        db.upsert_order(&json!({
            "id_pedido": "OLD-1",
            "estado_pedido": "pendiente",
            "mensajero_asignado": "Alex",
            "tienda": "Sur",
            "valor_total": 1000,
            "fecha_creacion": "2025-03-09 09:00:00",
        }))
        .unwrap();
        db.set_control_time(TASK, "08:00:00").unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn test_initialize_loads_sync_time_and_data() {
        let db = seeded();
        let dashboard = Dashboard::new(
            db,
            None,
            Arc::new(ManualClock::new(facility(12, 0))),
            None,
            TASK,
        );

        assert_eq!(dashboard.initialize().await, PipelineOutcome::Completed);
        assert_eq!(
            dashboard.sync_gate().state().last_sync_timestamp,
            Some(facility(8, 0).timestamp_millis())
        );

        let summary = dashboard.summary_json();
        assert_eq!(summary["stats"]["totalOrders"], 1);
        assert_eq!(summary["stats"]["pendingOrders"], 1);
        assert_eq!(summary["todayStats"]["totalOrders"], 0);
        assert_eq!(summary["messengers"][0]["name"], "Alex");
        assert_eq!(summary["orders"]["totalPages"], 1);
        assert_eq!(summary["orders"]["items"][0]["id"], "OLD-1");
        assert_eq!(summary["sync"]["canSync"], true);
        assert_eq!(summary["sync"]["enabled"], false);
        assert_eq!(summary["pipeline"]["progress"], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_reloads_pipeline() {
        let db = seeded();
        let endpoint = Arc::new(LocalSyncJob {
            db: db.clone(),
            stamp: "11:59:00",
        });
        let dashboard = Dashboard::new(
            db,
            Some(endpoint),
            Arc::new(ManualClock::new(facility(12, 0))),
            Some("Sur".into()),
            TASK,
        );
        dashboard.initialize().await;
        assert_eq!(dashboard.pipeline().snapshot().orders.len(), 1);

        let reloaded = dashboard.sync_registries().await.unwrap();
        assert_eq!(reloaded, PipelineOutcome::Completed);

        let data = dashboard.pipeline().snapshot();
        assert_eq!(data.orders.len(), 2);
        assert_eq!(data.today_orders.len(), 1);
        assert_eq!(data.stats.delivered_orders, 1);
        assert_eq!(data.stats.total_amount, 3500.0);
        assert!(data.messengers.iter().any(|m| m.name == "María José"));

        let state = dashboard.sync_gate().state();
        assert_eq!(state.last_sync_timestamp, Some(facility(11, 59).timestamp_millis()));
        assert!(!state.syncing);

        // Cooldown now runs from the recorded sync.
        let summary = dashboard.summary_json();
        assert_eq!(summary["sync"]["canSync"], false);
        assert_eq!(summary["sync"]["timeUntilNextSync"], "4:00");
        dashboard.shutdown();
    }

    /// Local store whose history query starts failing once `broken` is set.
    struct FlakyBackend {
        db: Arc<SqliteBackend>,
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl OrderBackend for FlakyBackend {
        async fn fetch_orders_between(
            &self,
            query: &OrderQuery,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
        ) -> Result<Vec<serde_json::Value>> {
            self.db.fetch_orders_between(query, from, to).await
        }

        async fn fetch_orders_page(
            &self,
            query: &OrderQuery,
            offset: usize,
            limit: usize,
        ) -> Result<Vec<serde_json::Value>> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DashboardError::Http {
                    status: 503,
                    message: "Backend unavailable".into(),
                });
            }
            self.db.fetch_orders_page(query, offset, limit).await
        }

        async fn fetch_control_time(&self, task_name: &str) -> Result<Option<String>> {
            self.db.fetch_control_time(task_name).await
        }
    }

    struct BreakingSyncJob {
        db: Arc<SqliteBackend>,
        broken: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SyncEndpoint for BreakingSyncJob {
        async fn trigger(&self) -> Result<()> {
            self.broken.store(true, Ordering::SeqCst);
            self.db.set_control_time(TASK, "11:59:00")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_reports_failed_reload() {
        let db = seeded();
        let broken = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(FlakyBackend {
            db: db.clone(),
            broken: broken.clone(),
        });
        let endpoint = Arc::new(BreakingSyncJob {
            db,
            broken: broken.clone(),
        });
        let dashboard = Dashboard::new(
            backend,
            Some(endpoint),
            Arc::new(ManualClock::new(facility(12, 0))),
            None,
            TASK,
        );
        assert_eq!(dashboard.initialize().await, PipelineOutcome::Completed);

        let reloaded = dashboard.sync_registries().await.unwrap();

        assert!(matches!(
            reloaded,
            PipelineOutcome::Failed { step: StepId::FetchAll, .. }
        ));
        assert!(dashboard.pipeline().state().has_error);
        assert!(!dashboard.sync_gate().state().syncing);
        dashboard.shutdown();
    }

    #[test]
    fn test_from_config_sqlite() {
        let dir = std::env::temp_dir().join(format!("dashboard-cfg-{}", uuid::Uuid::new_v4()));
        let config = DashboardConfig {
            backend: BackendKind::Sqlite {
                data_dir: PathBuf::from(&dir),
            },
            sync_url: None,
            company: None,
            sync_task: TASK.into(),
            tables: TableConfig::default(),
        };
        let dashboard = Dashboard::from_config(&config).unwrap();
        assert!(!dashboard.sync_gate().has_endpoint());
        assert!(dir.join("dashboard.db").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_from_config_supabase_with_sync() {
        let config = DashboardConfig {
            backend: BackendKind::Supabase {
                url: "demo.supabase.co".into(),
                api_key: "anon".into(),
            },
            sync_url: Some("https://demo.supabase.co/functions/v1/sync".into()),
            company: Some("Sur".into()),
            sync_task: TASK.into(),
            tables: TableConfig::default(),
        };
        let dashboard = Dashboard::from_config(&config).unwrap();
        assert!(dashboard.sync_gate().has_endpoint());
    }
}
