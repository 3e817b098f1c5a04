//! HTTP adapters for the hosted backend.
//!
//! Order rows and the sync control record are read through the backend's
//! PostgREST interface; the sync itself is started by POSTing to a separate
//! endpoint that only answers with a status code.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::{OrderBackend, OrderQuery, SyncEndpoint};
use crate::config::TableConfig;
use crate::error::{DashboardError, Result};
use crate::value_text;

/// Default timeout for row queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(20);

/// The sync endpoint does real work before answering.
const SYNC_TRIGGER_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise a backend base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
pub(crate) fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "Backend key is invalid or expired".to_string(),
        403 => "Backend key is not allowed to read this table".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => "Backend server error".to_string(),
        _ => "Unexpected response from backend".to_string(),
    }
}

async fn error_for_response(resp: reqwest::Response) -> DashboardError {
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body_text)
        .ok()
        .and_then(|json| value_text(&json, &["message", "error", "hint"]))
        .unwrap_or_else(|| status_error(status));
    DashboardError::Http {
        status: status.as_u16(),
        message,
    }
}

fn iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ---------------------------------------------------------------------------
// PostgREST order backend
// ---------------------------------------------------------------------------

pub struct SupabaseBackend {
    client: Client,
    base_url: String,
    api_key: String,
    tables: TableConfig,
}

impl SupabaseBackend {
    pub fn new(base_url: &str, api_key: &str, tables: TableConfig) -> Result<Self> {
        let base_url = normalize_base_url(base_url);
        if base_url.is_empty() {
            return Err(DashboardError::Config("missing backend URL".into()));
        }
        if api_key.trim().is_empty() {
            return Err(DashboardError::Config("missing backend key".into()));
        }
        let client = Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| DashboardError::Config(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: api_key.trim().to_string(),
            tables,
        })
    }

    fn rows_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/rest/v1/{table}", self.base_url))
            .map_err(|e| DashboardError::Config(format!("Invalid backend URL: {e}")))?;
        {
            let mut qp = url.query_pairs_mut();
            for (k, v) in params {
                qp.append_pair(k, v);
            }
        }
        Ok(url)
    }

    fn order_params(&self, query: &OrderQuery) -> Vec<(&str, String)> {
        let mut params = vec![
            ("select", "*".to_string()),
            ("order", format!("{}.desc", self.tables.created_column)),
        ];
        if let Some(company) = &query.company {
            params.push((self.tables.company_column.as_str(), format!("eq.{company}")));
        }
        params
    }

    async fn get_rows(&self, url: Url) -> Result<Vec<Value>> {
        debug!(url = %url, "backend query");
        let resp = self
            .client
            .get(url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for_response(resp).await);
        }
        match resp.json::<Value>().await? {
            Value::Array(rows) => Ok(rows),
            other => Err(DashboardError::UnexpectedPayload(format!(
                "expected a list of rows, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl OrderBackend for SupabaseBackend {
    async fn fetch_orders_between(
        &self,
        query: &OrderQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Value>> {
        let created = self.tables.created_column.as_str();
        let mut params = self.order_params(query);
        params.push((created, format!("gte.{}", iso(from))));
        params.push((created, format!("lt.{}", iso(to))));
        let url = self.rows_url(&self.tables.orders_table, &params)?;
        self.get_rows(url).await
    }

    async fn fetch_orders_page(
        &self,
        query: &OrderQuery,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let mut params = self.order_params(query);
        params.push(("offset", offset.to_string()));
        params.push(("limit", limit.to_string()));
        let url = self.rows_url(&self.tables.orders_table, &params)?;
        self.get_rows(url).await
    }

    async fn fetch_control_time(&self, task_name: &str) -> Result<Option<String>> {
        let params = [
            ("select", self.tables.control_time_column.clone()),
            (self.tables.control_key_column.as_str(), format!("eq.{task_name}")),
            ("limit", "1".to_string()),
        ];
        let url = self.rows_url(&self.tables.control_table, &params)?;
        let rows = self.get_rows(url).await?;
        Ok(rows
            .first()
            .and_then(|row| value_text(row, &[self.tables.control_time_column.as_str()])))
    }
}

// ---------------------------------------------------------------------------
// Sync trigger
// ---------------------------------------------------------------------------

pub struct HttpSyncEndpoint {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSyncEndpoint {
    pub fn new(url: &str, api_key: Option<&str>) -> Result<Self> {
        let url = normalize_base_url(url);
        if url.is_empty() {
            return Err(DashboardError::Config("missing sync endpoint URL".into()));
        }
        let client = Client::builder()
            .timeout(SYNC_TRIGGER_TIMEOUT)
            .build()
            .map_err(|e| DashboardError::Config(format!("HTTP client error: {e}")))?;
        Ok(Self {
            client,
            url,
            api_key: api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
        })
    }
}

#[async_trait]
impl SyncEndpoint for HttpSyncEndpoint {
    async fn trigger(&self) -> Result<()> {
        info!(url = %self.url, "triggering backend sync");
        let mut req = self.client.post(&self.url);
        if let Some(key) = &self.api_key {
            req = req
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "sync endpoint rejected trigger");
            return Err(DashboardError::SyncTrigger(format!(
                "{} (HTTP {})",
                status_error(status),
                status.as_u16()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn backend() -> SupabaseBackend {
        SupabaseBackend::new("demo.supabase.co/", "anon-key", TableConfig::default()).unwrap()
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("demo.supabase.co"), "https://demo.supabase.co");
        assert_eq!(normalize_base_url("localhost:54321/rest/v1/"), "http://localhost:54321");
        assert_eq!(normalize_base_url(" https://x.io// "), "https://x.io");
        assert_eq!(normalize_base_url("   "), "");
    }

    #[test]
    fn test_status_error_messages() {
        assert!(status_error(StatusCode::UNAUTHORIZED).contains("invalid"));
        assert_eq!(status_error(StatusCode::BAD_GATEWAY), "Backend server error");
        assert_eq!(status_error(StatusCode::IM_A_TEAPOT), "Unexpected response from backend");
    }

    #[test]
    fn test_new_rejects_missing_settings() {
        assert!(matches!(
            SupabaseBackend::new("", "key", TableConfig::default()),
            Err(DashboardError::Config(_))
        ));
        assert!(matches!(
            SupabaseBackend::new("demo.supabase.co", " ", TableConfig::default()),
            Err(DashboardError::Config(_))
        ));
        assert!(HttpSyncEndpoint::new("", None).is_err());
    }

    #[test]
    fn test_page_query_url() {
        let backend = backend();
        let query = OrderQuery::for_company(Some("Tienda Sol"));
        let mut params = backend.order_params(&query);
        params.push(("offset", "2000".to_string()));
        params.push(("limit", "1000".to_string()));
        let url = backend.rows_url("pedidos", &params).unwrap();

        assert_eq!(url.path(), "/rest/v1/pedidos");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("order".into(), "fecha_creacion.desc".into())));
        assert!(pairs.contains(&("tienda".into(), "eq.Tienda Sol".into())));
        assert!(pairs.contains(&("offset".into(), "2000".into())));
        assert!(pairs.contains(&("limit".into(), "1000".into())));
    }

    #[test]
    fn test_iso_bounds_use_millis_and_z() {
        let instant = Utc.with_ymd_and_hms(2025, 3, 10, 6, 0, 0).unwrap();
        assert_eq!(iso(instant), "2025-03-10T06:00:00.000Z");
    }
}
