//! Couriers ("mensajeros") and stores ("asesores") rebuilt from order rows,
//! with per-entity order metrics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::normalize::{fold_diacritics, parse_entity_name, parse_timestamp, EntityName};
use crate::orders::{parse_amount, resolve_status, OrderStatus, RawOrderRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityRole {
    Mensajero,
    Asesor,
}

impl EntityRole {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityRole::Mensajero => "mensajero",
            EntityRole::Asesor => "asesor",
        }
    }
}

/// Order counts for one entity. Every order lands in exactly one status
/// bucket, so the four buckets always add up to `total_orders`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetrics {
    pub total_orders: u32,
    pub delivered_orders: u32,
    pub pending_orders: u32,
    pub returned_orders: u32,
    pub rescheduled_orders: u32,
    pub total_amount: f64,
}

impl EntityMetrics {
    fn record(&mut self, status: OrderStatus, amount: f64) {
        self.total_orders += 1;
        self.total_amount += amount;
        match status {
            OrderStatus::Entregado => self.delivered_orders += 1,
            OrderStatus::Devolucion => self.returned_orders += 1,
            OrderStatus::Reagendado => self.rescheduled_orders += 1,
            OrderStatus::Pendiente | OrderStatus::EnRuta => self.pending_orders += 1,
        }
    }

    pub fn bucket_sum(&self) -> u32 {
        self.delivered_orders + self.pending_orders + self.returned_orders + self.rescheduled_orders
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub key: String,
    pub name: String,
    pub email: String,
    pub role: EntityRole,
    /// Date of the earliest order naming this entity. Not a registration
    /// date; upstream has none.
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: EntityMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedEntities {
    pub messengers: Vec<Entity>,
    pub advisors: Vec<Entity>,
}

struct EntityIndex {
    role: EntityRole,
    by_key: HashMap<String, Entity>,
}

impl EntityIndex {
    fn new(role: EntityRole) -> Self {
        Self {
            role,
            by_key: HashMap::new(),
        }
    }

    fn record(&mut self, name: EntityName, seen_at: DateTime<Utc>, status: OrderStatus, amount: f64) {
        let ordinal = self.by_key.len() + 1;
        let role = self.role;
        let entity = self.by_key.entry(name.key.clone()).or_insert_with(|| {
            let id = if name.slug.is_empty() {
                format!("{}-{ordinal}", role.as_str())
            } else {
                format!("{}-{}", role.as_str(), name.slug)
            };
            let local_part = if name.slug.is_empty() { id.clone() } else { name.slug.clone() };
            Entity {
                email: format!("{local_part}@{}.local", role.as_str()),
                id,
                key: name.key,
                name: name.display,
                role,
                created_at: seen_at,
                metrics: EntityMetrics::default(),
            }
        });
        if seen_at < entity.created_at {
            entity.created_at = seen_at;
        }
        entity.metrics.record(status, amount);
    }

    fn into_sorted(self) -> Vec<Entity> {
        let mut entities: Vec<Entity> = self.by_key.into_values().collect();
        entities.sort_by(|a, b| {
            spanish_sort_key(&a.name)
                .cmp(&spanish_sort_key(&b.name))
                .then_with(|| a.key.cmp(&b.key))
        });
        entities
    }
}

/// Case- and accent-insensitive ordering with "ñ" sorted after "n".
fn spanish_sort_key(name: &str) -> String {
    let lowered = name.to_lowercase().replace('ñ', "n{");
    fold_diacritics(&lowered)
}

/// Build the courier and store lists from raw rows, using `now` for rows
/// without a usable creation date.
///
/// The courier is the assigned one, or the completing one when nobody is
/// assigned. Each order's effective status (see
/// [`resolve_status`](crate::orders::resolve_status)) picks its bucket.
pub fn derive_users_and_metrics_at(raw_orders: &[RawOrderRecord], now: DateTime<Utc>) -> DerivedEntities {
    let mut messengers = EntityIndex::new(EntityRole::Mensajero);
    let mut advisors = EntityIndex::new(EntityRole::Asesor);

    for raw in raw_orders {
        let seen_at = raw
            .created_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(now);
        let status = resolve_status(raw);
        let amount = parse_amount(raw.total.as_ref());

        let courier = parse_entity_name(raw.assigned_courier.as_deref())
            .or_else(|| parse_entity_name(raw.completed_courier.as_deref()));
        if let Some(name) = courier {
            messengers.record(name, seen_at, status, amount);
        }
        if let Some(name) = parse_entity_name(raw.store.as_deref()) {
            advisors.record(name, seen_at, status, amount);
        }
    }

    DerivedEntities {
        messengers: messengers.into_sorted(),
        advisors: advisors.into_sorted(),
    }
}

pub fn derive_users_and_metrics(raw_orders: &[RawOrderRecord]) -> DerivedEntities {
    derive_users_and_metrics_at(raw_orders, Utc::now())
}
