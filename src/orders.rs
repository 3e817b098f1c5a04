//! Order rows as they come from the backend and the normalised orders the
//! dashboard works with.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::normalize::{normalize_status, parse_entity_name, to_iso_string_at, StatusKey};
use crate::value_text;

// ---------------------------------------------------------------------------
// Raw rows
// ---------------------------------------------------------------------------

/// One order row, read leniently. Every field is optional and every text
/// field accepts strings, numbers or booleans.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawOrderRecord {
    pub id: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_address: Option<String>,
    pub province: Option<String>,
    pub canton: Option<String>,
    pub district: Option<String>,
    pub assigned_courier: Option<String>,
    pub completed_courier: Option<String>,
    pub store: Option<String>,
    pub status: Option<String>,
    /// Number or numeric string; anything else counts as zero.
    pub total: Option<Value>,
    pub payment_method: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub notes: Option<String>,
}

impl RawOrderRecord {
    /// Read a backend row. Returns `None` when the row is not a JSON object.
    pub fn from_row(row: &Value) -> Option<Self> {
        if !row.is_object() {
            return None;
        }
        Some(Self {
            id: value_text(row, &["id_pedido", "id", "order_id", "orderId"]),
            customer_name: value_text(row, &["cliente_nombre", "cliente", "customer_name", "customerName"]),
            customer_phone: value_text(
                row,
                &["cliente_telefono", "telefono", "customer_phone", "customerPhone"],
            ),
            customer_address: value_text(
                row,
                &["direccion", "direccion_entrega", "customer_address", "address"],
            ),
            province: value_text(row, &["provincia", "province"]),
            canton: value_text(row, &["canton", "cantón"]),
            district: value_text(row, &["distrito", "district"]),
            assigned_courier: value_text(
                row,
                &["mensajero_asignado", "assigned_courier", "assignedCourier"],
            ),
            completed_courier: value_text(
                row,
                &["mensajero_concretado", "completed_courier", "completedCourier"],
            ),
            store: value_text(row, &["tienda", "empresa", "store", "company"]),
            status: value_text(row, &["estado_pedido", "estado", "status"]),
            total: ["valor_total", "total", "monto", "total_amount", "totalAmount"]
                .iter()
                .find_map(|k| row.get(*k).filter(|v| !v.is_null()).cloned()),
            payment_method: value_text(row, &["metodo_pago", "payment_method", "paymentMethod"]),
            created_at: value_text(row, &["fecha_creacion", "created_at", "createdAt"]),
            updated_at: value_text(row, &["fecha_actualizacion", "updated_at", "updatedAt"]),
            notes: value_text(row, &["notas", "notes", "observaciones"]),
        })
    }

    pub fn has_assigned_courier(&self) -> bool {
        parse_entity_name(self.assigned_courier.as_deref()).is_some()
    }

    pub fn has_completed_courier(&self) -> bool {
        parse_entity_name(self.completed_courier.as_deref()).is_some()
    }
}

// ---------------------------------------------------------------------------
// Normalised values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pendiente,
    EnRuta,
    Entregado,
    Devolucion,
    Reagendado,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pendiente => "pendiente",
            OrderStatus::EnRuta => "en_ruta",
            OrderStatus::Entregado => "entregado",
            OrderStatus::Devolucion => "devolucion",
            OrderStatus::Reagendado => "reagendado",
        }
    }

    /// Delivered, returned and rescheduled orders are settled for the day.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Entregado | OrderStatus::Devolucion | OrderStatus::Reagendado
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentMethod {
    Efectivo,
    Sinpe,
    Tarjeta,
    Transferencia,
    Other(String),
}

impl PaymentMethod {
    pub fn parse(raw: Option<&str>) -> Self {
        let lowered = match raw.map(|s| s.trim().to_lowercase()) {
            Some(s) if !s.is_empty() => s,
            _ => return PaymentMethod::Efectivo,
        };
        match lowered.as_str() {
            "efectivo" | "cash" | "contado" => PaymentMethod::Efectivo,
            "tarjeta" | "card" => PaymentMethod::Tarjeta,
            "transferencia" | "transfer" => PaymentMethod::Transferencia,
            s if s.contains("sinpe") => PaymentMethod::Sinpe,
            _ => PaymentMethod::Other(lowered),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::Efectivo => "efectivo",
            PaymentMethod::Sinpe => "sinpe",
            PaymentMethod::Tarjeta => "tarjeta",
            PaymentMethod::Transferencia => "transferencia",
            PaymentMethod::Other(raw) => raw.as_str(),
        }
    }
}

impl Serialize for PaymentMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A courier named on an order, by identity key and display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CourierRef {
    pub key: String,
    pub name: String,
}

impl CourierRef {
    fn from_raw(raw: Option<&str>) -> Option<Self> {
        parse_entity_name(raw).map(|n| CourierRef {
            key: n.key,
            name: n.display,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOrder {
    pub id: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,
    pub province: Option<String>,
    pub canton: Option<String>,
    pub district: Option<String>,
    /// Whole currency units.
    pub total_amount: f64,
    pub status: OrderStatus,
    pub payment_method: PaymentMethod,
    pub assigned_courier: Option<CourierRef>,
    pub completed_courier: Option<CourierRef>,
    pub store: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ---------------------------------------------------------------------------
// Transformation
// ---------------------------------------------------------------------------

/// Effective status of a raw order.
///
/// An explicit delivered/returned/rescheduled status always wins. Without
/// one, a completing courier means delivered, an assigned courier means on
/// the way, and nothing at all means pending.
pub fn resolve_status(raw: &RawOrderRecord) -> OrderStatus {
    match normalize_status(raw.status.as_deref()) {
        StatusKey::Entregado => OrderStatus::Entregado,
        StatusKey::Devolucion => OrderStatus::Devolucion,
        StatusKey::Reagendado => OrderStatus::Reagendado,
        _ if raw.has_completed_courier() => OrderStatus::Entregado,
        _ if raw.has_assigned_courier() => OrderStatus::EnRuta,
        _ => OrderStatus::Pendiente,
    }
}

/// Parse a monetary total. Non-numeric, negative and non-finite values
/// become zero.
pub fn parse_amount(raw: Option<&Value>) -> f64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_leading_number(s),
        _ => None,
    };
    match parsed {
        Some(amount) if amount.is_finite() && amount >= 0.0 => amount,
        Some(amount) => {
            debug!(amount, "discarding out-of-range order total");
            0.0
        }
        None => {
            if raw.is_some() {
                debug!(raw = ?raw, "unparseable order total, defaulting to 0");
            }
            0.0
        }
    }
}

/// Parse the numeric prefix of `text` ("15000", "15000.50 CRC").
fn parse_leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        return Some(n);
    }
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in trimmed.char_indices() {
        match c {
            '0'..='9' => end = i + 1,
            '-' | '+' if i == 0 => {}
            '.' if !seen_dot => seen_dot = true,
            _ => break,
        }
    }
    trimmed[..end].parse::<f64>().ok()
}

/// Normalise one raw order, using `now` for missing timestamps.
pub fn transform_order_at(raw: &RawOrderRecord, now: DateTime<Utc>) -> NormalizedOrder {
    let id = raw.id.clone().unwrap_or_else(|| {
        let generated = Uuid::new_v4().to_string();
        debug!(id = %generated, "order row without id, generated one");
        generated
    });
    let created_at = to_iso_string_at(raw.created_at.as_deref(), now);
    let updated_at = match raw.updated_at.as_deref() {
        Some(value) => to_iso_string_at(Some(value), now),
        None => created_at.clone(),
    };

    NormalizedOrder {
        id,
        customer_name: raw.customer_name.clone().unwrap_or_default(),
        customer_phone: raw.customer_phone.clone().unwrap_or_default(),
        customer_address: raw.customer_address.clone().unwrap_or_default(),
        province: raw.province.clone(),
        canton: raw.canton.clone(),
        district: raw.district.clone(),
        total_amount: parse_amount(raw.total.as_ref()),
        status: resolve_status(raw),
        payment_method: PaymentMethod::parse(raw.payment_method.as_deref()),
        assigned_courier: CourierRef::from_raw(raw.assigned_courier.as_deref()),
        completed_courier: CourierRef::from_raw(raw.completed_courier.as_deref()),
        store: parse_entity_name(raw.store.as_deref()).map(|n| n.display),
        notes: raw.notes.clone(),
        created_at,
        updated_at,
    }
}

pub fn transform_order(raw: &RawOrderRecord) -> NormalizedOrder {
    transform_order_at(raw, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(status: Option<&str>, assigned: Option<&str>, completed: Option<&str>) -> RawOrderRecord {
        RawOrderRecord {
            status: status.map(str::to_string),
            assigned_courier: assigned.map(str::to_string),
            completed_courier: completed.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_priority() {
        assert_eq!(resolve_status(&raw(None, Some("Alex"), Some("Alex"))), OrderStatus::Entregado);
        assert_eq!(resolve_status(&raw(None, Some("Alex"), None)), OrderStatus::EnRuta);
        assert_eq!(resolve_status(&raw(None, None, None)), OrderStatus::Pendiente);
        assert_eq!(OrderStatus::EnRuta.as_str(), "en_ruta");
        assert!(!OrderStatus::EnRuta.is_terminal());
        // Explicit exception statuses beat courier progress.
        assert_eq!(
            resolve_status(&raw(Some("Devolución"), Some("Alex"), Some("Alex"))),
            OrderStatus::Devolucion
        );
        assert_eq!(resolve_status(&raw(Some("reagendo"), None, None)), OrderStatus::Reagendado);
        // Placeholders do not count as an assignment.
        assert_eq!(
            resolve_status(&raw(Some("pendiente"), Some("SIN ASIGNAR"), None)),
            OrderStatus::Pendiente
        );
    }

    #[test]
    fn test_amount_parsing() {
        assert_eq!(parse_amount(Some(&json!(15000))), 15000.0);
        assert_eq!(parse_amount(Some(&json!("15000"))), 15000.0);
        assert_eq!(parse_amount(Some(&json!(" 12500.5 "))), 12500.5);
        assert_eq!(parse_amount(Some(&json!("15000 CRC"))), 15000.0);
        assert_eq!(parse_amount(Some(&json!("abc"))), 0.0);
        assert_eq!(parse_amount(Some(&json!("-300"))), 0.0);
        assert_eq!(parse_amount(Some(&json!(true))), 0.0);
        assert_eq!(parse_amount(None), 0.0);
    }

    #[test]
    fn test_payment_method_defaults_and_aliases() {
        assert_eq!(PaymentMethod::parse(None), PaymentMethod::Efectivo);
        assert_eq!(PaymentMethod::parse(Some("  ")), PaymentMethod::Efectivo);
        assert_eq!(PaymentMethod::parse(Some("SINPE Móvil")), PaymentMethod::Sinpe);
        assert_eq!(PaymentMethod::parse(Some("Tarjeta")), PaymentMethod::Tarjeta);
        assert_eq!(
            PaymentMethod::parse(Some("Cupón")),
            PaymentMethod::Other("cupón".to_string())
        );
        assert_eq!(serde_json::to_value(PaymentMethod::Sinpe).unwrap(), json!("sinpe"));
    }

    #[test]
    fn test_from_row_reads_spanish_columns_and_numbers() {
        let row = json!({
            "id_pedido": 4411,
            "cliente_nombre": "Ana",
            "cliente_telefono": 88887777,
            "mensajero_asignado": "  alex ",
            "tienda": "tienda central",
            "estado_pedido": null,
            "valor_total": "9900",
            "metodo_pago": "SINPE",
            "fecha_creacion": "2025-03-10T14:05:09Z"
        });
        let record = RawOrderRecord::from_row(&row).unwrap();
        assert_eq!(record.id.as_deref(), Some("4411"));
        assert_eq!(record.customer_phone.as_deref(), Some("88887777"));
        assert_eq!(record.status, None);
        assert_eq!(record.total, Some(json!("9900")));

        assert_eq!(RawOrderRecord::from_row(&json!([1, 2])), None);
        assert_eq!(RawOrderRecord::from_row(&json!("row")), None);
    }

    #[test]
    fn test_transform_order_fills_defaults() {
        let now = DateTime::parse_from_rfc3339("2025-03-10T20:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = RawOrderRecord::from_row(&json!({
            "id": "A-1",
            "mensajero_asignado": "alex mora",
            "tienda": "sin asignar",
            "valor_total": "abc"
        }))
        .unwrap();

        let order = transform_order_at(&record, now);
        assert_eq!(order.id, "A-1");
        assert_eq!(order.status, OrderStatus::EnRuta);
        assert_eq!(order.total_amount, 0.0);
        assert_eq!(order.payment_method, PaymentMethod::Efectivo);
        assert_eq!(order.store, None);
        assert_eq!(
            order.assigned_courier,
            Some(CourierRef {
                key: "ALEX MORA".into(),
                name: "Alex Mora".into()
            })
        );
        assert_eq!(order.created_at, "2025-03-10T20:00:00.000Z");
        assert_eq!(order.updated_at, order.created_at);

        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], json!("en_ruta"));
        assert_eq!(json["totalAmount"], json!(0.0));
    }

    #[test]
    fn test_transform_generates_id_when_missing() {
        let order = transform_order(&RawOrderRecord::default());
        assert!(!order.id.is_empty());
        assert_eq!(order.status, OrderStatus::Pendiente);
    }
}
