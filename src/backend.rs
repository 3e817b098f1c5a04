//! Seams to the hosted backend: order queries, the sync control record and
//! the sync trigger endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// Rows per request when walking the full order history.
pub const BACKEND_PAGE_SIZE: usize = 1000;

/// Filters shared by every order query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderQuery {
    /// Restrict to one company/store (exact match on the store column).
    pub company: Option<String>,
}

impl OrderQuery {
    pub fn for_company(company: Option<&str>) -> Self {
        Self {
            company: company
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        }
    }
}

#[async_trait]
pub trait OrderBackend: Send + Sync {
    /// Orders created in `[from, to)`, newest first.
    async fn fetch_orders_between(
        &self,
        query: &OrderQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>>;

    /// One page of the full history, newest first.
    async fn fetch_orders_page(
        &self,
        query: &OrderQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>>;

    /// Raw time-of-day string of the control record for `task_name`, if the
    /// record exists.
    async fn fetch_control_time(&self, task_name: &str) -> Result<Option<String>>;
}

/// The external endpoint that starts a backend sync.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    async fn trigger(&self) -> Result<()>;
}
