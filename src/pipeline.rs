//! The dashboard load pipeline.
//!
//! A fixed sequence of stages (today's orders, full history, normalisation,
//! statistics, finalize) whose progress is published through a `watch`
//! channel. A failing stage halts the run and leaves the panel visible until
//! dismissed; data loaded by earlier stages stays in place.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{OrderBackend, OrderQuery, BACKEND_PAGE_SIZE};
use crate::clock::{facility_day_bounds, Clock};
use crate::entities::{derive_users_and_metrics_at, Entity};
use crate::error::{DashboardError, Result};
use crate::orders::{transform_order_at, NormalizedOrder, RawOrderRecord};
use crate::stats::{compute_stats, Stats};

/// Orders per page of the order list.
pub const ORDER_PAGE_SIZE: usize = 10;

/// Delay between the last stage completing and the panel hiding itself.
pub const AUTO_HIDE_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepId {
    FetchToday,
    FetchAll,
    TransformOrders,
    ComputeStats,
    Finalize,
}

impl StepId {
    /// Execution order. Never reordered.
    pub const ALL: [StepId; 5] = [
        StepId::FetchToday,
        StepId::FetchAll,
        StepId::TransformOrders,
        StepId::ComputeStats,
        StepId::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepId::FetchToday => "fetch-today",
            StepId::FetchAll => "fetch-all",
            StepId::TransformOrders => "transform-orders",
            StepId::ComputeStats => "compute-stats",
            StepId::Finalize => "finalize",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepId::FetchToday => "Pedidos de hoy",
            StepId::FetchAll => "Historial de pedidos",
            StepId::TransformOrders => "Normalización",
            StepId::ComputeStats => "Estadísticas",
            StepId::Finalize => "Finalizar",
        }
    }

    fn initial_description(self) -> &'static str {
        match self {
            StepId::FetchToday => "Consultando los pedidos de hoy...",
            StepId::FetchAll => "Consultando el historial completo...",
            StepId::TransformOrders => "Normalizando pedidos...",
            StepId::ComputeStats => "Calculando estadísticas y métricas...",
            StepId::Finalize => "Preparando el panel...",
        }
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Loading,
    Completed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStep {
    pub id: StepId,
    pub label: String,
    pub status: StepStatus,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineState {
    pub steps: Vec<PipelineStep>,
    pub current_step: Option<StepId>,
    /// Completed stages as a percentage of all stages.
    pub progress: u8,
    pub visible: bool,
    pub has_error: bool,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self {
            steps: StepId::ALL
                .iter()
                .map(|&id| PipelineStep {
                    id,
                    label: id.label().to_string(),
                    status: StepStatus::Pending,
                    description: String::new(),
                })
                .collect(),
            current_step: None,
            progress: 0,
            visible: false,
            has_error: false,
        }
    }
}

impl PipelineState {
    pub fn step(&self, id: StepId) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    fn update(&mut self, id: StepId, status: StepStatus, description: String) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.status = status;
            step.description = description;
        }
        self.current_step = Some(id);
        let completed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        self.progress = (completed * 100 / self.steps.len().max(1)) as u8;
        self.has_error = self.steps.iter().any(|s| s.status == StepStatus::Error);
        if status == StepStatus::Loading {
            self.visible = true;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum PipelineOutcome {
    Completed,
    Failed { step: StepId, message: String },
}

/// Everything the pipeline loads.
#[derive(Debug, Clone, Default)]
pub struct DashboardData {
    pub today_orders: Vec<NormalizedOrder>,
    pub today_stats: Stats,
    pub raw_orders: Vec<RawOrderRecord>,
    pub orders: Vec<NormalizedOrder>,
    pub stats: Stats,
    pub messengers: Vec<Entity>,
    pub advisors: Vec<Entity>,
    /// 1-based page of the order list.
    pub current_page: usize,
}

/// Rows fetched during one run, handed from stage to stage.
#[derive(Default)]
struct RunContext {
    query: OrderQuery,
    rows: Vec<Value>,
}

/// Slice `[(page-1)*size, page*size)` of `orders`. Page 0 is treated as page 1;
/// pages past the end are empty.
pub fn page_slice(orders: &[NormalizedOrder], page: usize, size: usize) -> &[NormalizedOrder] {
    let page = page.max(1);
    let start = (page - 1).saturating_mul(size).min(orders.len());
    let end = start.saturating_add(size).min(orders.len());
    &orders[start..end]
}

pub fn page_count(len: usize, size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    len.div_ceil(size)
}

/// Decode backend rows. A row that is not an object means the backend
/// answered with something other than table rows.
fn decode_rows(rows: &[Value]) -> Result<Vec<RawOrderRecord>> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            RawOrderRecord::from_row(row).ok_or_else(|| {
                DashboardError::UnexpectedPayload(format!("row {i} is not an order object"))
            })
        })
        .collect()
}

fn failure_description(err: &DashboardError) -> String {
    format!("{err}. Intenta recargar el panel.")
}

pub struct Pipeline {
    backend: Arc<dyn OrderBackend>,
    clock: Arc<dyn Clock>,
    state: Arc<watch::Sender<PipelineState>>,
    data: Mutex<DashboardData>,
    run_lock: tokio::sync::Mutex<()>,
    run_seq: Arc<AtomicU64>,
    backend_page_size: usize,
    hide_delay: Duration,
}

impl Pipeline {
    pub fn new(backend: Arc<dyn OrderBackend>, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(PipelineState::default());
        Self {
            backend,
            clock,
            state: Arc::new(state),
            data: Mutex::new(DashboardData {
                current_page: 1,
                ..DashboardData::default()
            }),
            run_lock: tokio::sync::Mutex::new(()),
            run_seq: Arc::new(AtomicU64::new(0)),
            backend_page_size: BACKEND_PAGE_SIZE,
            hide_delay: AUTO_HIDE_DELAY,
        }
    }

    pub fn with_backend_page_size(mut self, size: usize) -> Self {
        self.backend_page_size = size.max(1);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().clone()
    }

    fn data(&self) -> MutexGuard<'_, DashboardData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the loaded data.
    pub fn snapshot(&self) -> DashboardData {
        self.data().clone()
    }

    /// Hide the progress panel. The only way to hide it after a failure.
    pub fn dismiss(&self) {
        self.state.send_modify(|s| s.visible = false);
    }

    /// Run every stage in order, optionally restricted to one company.
    /// Concurrent calls are serialized.
    pub async fn run(&self, company: Option<&str>) -> PipelineOutcome {
        let _running = self.run_lock.lock().await;
        let run_id = self.run_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(PipelineState::default());

        let mut ctx = RunContext {
            query: OrderQuery::for_company(company),
            ..RunContext::default()
        };
        info!(run_id, company = ?ctx.query.company, "dashboard pipeline started");

        for step in StepId::ALL {
            self.set_step(step, StepStatus::Loading, step.initial_description().to_string());
            debug!(step = %step, "stage started");

            match self.run_step(step, &mut ctx).await {
                Ok(summary) => {
                    debug!(step = %step, summary = %summary, "stage completed");
                    self.set_step(step, StepStatus::Completed, summary);
                }
                Err(e) => {
                    warn!(
                        step = %step,
                        error = %e,
                        backend = e.is_backend_failure(),
                        "stage failed, pipeline halted"
                    );
                    self.set_step(step, StepStatus::Error, failure_description(&e));
                    return PipelineOutcome::Failed {
                        step,
                        message: e.to_string(),
                    };
                }
            }
        }

        info!(run_id, "dashboard pipeline completed");
        self.schedule_hide(run_id);
        PipelineOutcome::Completed
    }

    fn set_step(&self, step: StepId, status: StepStatus, description: String) {
        self.state
            .send_modify(|s| s.update(step, status, description));
    }

    /// Hide after the delay, unless another run started meanwhile.
    fn schedule_hide(&self, run_id: u64) {
        let state = self.state.clone();
        let run_seq = self.run_seq.clone();
        let delay = self.hide_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if run_seq.load(Ordering::SeqCst) == run_id {
                state.send_modify(|s| s.visible = false);
            }
        });
    }

    async fn run_step(&self, step: StepId, ctx: &mut RunContext) -> Result<String> {
        match step {
            StepId::FetchToday => self.fetch_today(ctx).await,
            StepId::FetchAll => self.fetch_all(ctx).await,
            StepId::TransformOrders => self.transform_orders(ctx),
            StepId::ComputeStats => self.compute_stats(),
            StepId::Finalize => Ok(self.finalize()),
        }
    }

    async fn fetch_today(&self, ctx: &RunContext) -> Result<String> {
        let now = self.clock.now();
        let (start, end) = facility_day_bounds(now);
        let rows = self
            .backend
            .fetch_orders_between(&ctx.query, start, end)
            .await?;
        let today_orders: Vec<NormalizedOrder> = decode_rows(&rows)?
            .iter()
            .map(|raw| transform_order_at(raw, now))
            .collect();
        let today_stats = compute_stats(&today_orders);

        let summary = format!("{} pedidos hoy", today_orders.len());
        let mut data = self.data();
        data.today_orders = today_orders;
        data.today_stats = today_stats;
        Ok(summary)
    }

    async fn fetch_all(&self, ctx: &mut RunContext) -> Result<String> {
        let limit = self.backend_page_size;
        let mut rows = Vec::new();
        let mut page = 0usize;
        loop {
            let batch = self
                .backend
                .fetch_orders_page(&ctx.query, rows.len(), limit)
                .await?;
            page += 1;
            let batch_len = batch.len();
            rows.extend(batch);
            debug!(page, batch = batch_len, total = rows.len(), "history page fetched");
            self.set_step(
                StepId::FetchAll,
                StepStatus::Loading,
                format!("Página {page}: {} pedidos cargados", rows.len()),
            );
            if batch_len < limit {
                break;
            }
        }
        ctx.rows = rows;
        Ok(format!("{} pedidos en {page} páginas", ctx.rows.len()))
    }

    fn transform_orders(&self, ctx: &mut RunContext) -> Result<String> {
        let now = self.clock.now();
        let raw_orders = decode_rows(&ctx.rows)?;
        let orders: Vec<NormalizedOrder> = raw_orders
            .iter()
            .map(|raw| transform_order_at(raw, now))
            .collect();
        ctx.rows.clear();

        let summary = format!("{} pedidos normalizados", orders.len());
        let mut data = self.data();
        data.raw_orders = raw_orders;
        data.orders = orders;
        Ok(summary)
    }

    fn compute_stats(&self) -> Result<String> {
        let now = self.clock.now();
        let mut data = self.data();
        let stats = compute_stats(&data.orders);
        let entities = derive_users_and_metrics_at(&data.raw_orders, now);
        let summary = format!(
            "{} mensajeros, {} asesores, {}% entregado",
            entities.messengers.len(),
            entities.advisors.len(),
            stats.delivery_rate
        );
        data.stats = stats;
        data.messengers = entities.messengers;
        data.advisors = entities.advisors;
        Ok(summary)
    }

    fn finalize(&self) -> String {
        let mut data = self.data();
        data.current_page = 1;
        format!("{} páginas de pedidos", page_count(data.orders.len(), ORDER_PAGE_SIZE))
    }

    // -- order list pagination ---------------------------------------------

    pub fn total_pages(&self) -> usize {
        page_count(self.data().orders.len(), ORDER_PAGE_SIZE)
    }

    pub fn current_page(&self) -> usize {
        self.data().current_page
    }

    /// Orders on `page` (1-based).
    pub fn page(&self, page: usize) -> Vec<NormalizedOrder> {
        page_slice(&self.data().orders, page, ORDER_PAGE_SIZE).to_vec()
    }

    /// Move to `page` and return its orders.
    pub fn set_page(&self, page: usize) -> Vec<NormalizedOrder> {
        let mut data = self.data();
        data.current_page = page.max(1);
        page_slice(&data.orders, data.current_page, ORDER_PAGE_SIZE).to_vec()
    }
}
