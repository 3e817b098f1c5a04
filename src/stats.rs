//! Global order counts and rates for the dashboard header.

use serde::Serialize;

use crate::orders::{NormalizedOrder, OrderStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub total_orders: u32,
    pub delivered_orders: u32,
    /// Every order that is not delivered, returned or rescheduled.
    pub pending_orders: u32,
    pub returned_orders: u32,
    pub rescheduled_orders: u32,
    /// Pending orders already on the way (`en_ruta`).
    pub in_route_orders: u32,
    /// Pending orders with no courier assigned or completing them.
    pub unassigned_orders: u32,
    pub total_amount: f64,
    pub delivery_rate: u32,
    pub return_rate: u32,
    pub reschedule_rate: u32,
}

/// `part / whole` as a whole percentage, rounded half up. Zero when `whole`
/// is zero.
pub fn percentage(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        return 0;
    }
    let (part, whole) = (u64::from(part), u64::from(whole));
    ((200 * part + whole) / (2 * whole)) as u32
}

pub fn compute_stats(orders: &[NormalizedOrder]) -> Stats {
    let mut stats = Stats {
        total_orders: orders.len() as u32,
        ..Stats::default()
    };

    for order in orders {
        stats.total_amount += order.total_amount;
        match order.status {
            OrderStatus::Entregado => stats.delivered_orders += 1,
            OrderStatus::Devolucion => stats.returned_orders += 1,
            OrderStatus::Reagendado => stats.rescheduled_orders += 1,
            OrderStatus::Pendiente | OrderStatus::EnRuta => {
                stats.pending_orders += 1;
                if order.status == OrderStatus::EnRuta {
                    stats.in_route_orders += 1;
                }
                if order.assigned_courier.is_none() && order.completed_courier.is_none() {
                    stats.unassigned_orders += 1;
                }
            }
        }
    }

    stats.delivery_rate = percentage(stats.delivered_orders, stats.total_orders);
    stats.return_rate = percentage(stats.returned_orders, stats.total_orders);
    stats.reschedule_rate = percentage(stats.rescheduled_orders, stats.total_orders);
    stats
}
