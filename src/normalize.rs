//! Canonicalisation of the free-text fields found on order rows.
//!
//! Couriers and stores have no table of their own upstream; they only exist
//! as names typed into each order. Identity is rebuilt here from that text:
//! the same name written with different case, spacing or accents resolves to
//! the same key, and placeholder values ("SIN ASIGNAR", "N/A", "-") resolve
//! to no entity at all.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::clock::facility_local_to_utc;

/// Values that mean "nobody" when typed into a courier or store column.
/// Compared after diacritic folding and upper-casing.
pub const EMPTY_ENTITY_PLACEHOLDERS: &[&str] = &[
    "SIN ASIGNAR",
    "NO ASIGNADO",
    "SIN MENSAJERO",
    "SIN TIENDA",
    "SIN NOMBRE",
    "NINGUNO",
    "N/A",
    "NA",
    "-",
    "--",
    "NULL",
    "NONE",
    "UNDEFINED",
    "0",
];

/// Canonical forms of a courier/store name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityName {
    /// Identity used for de-duplication (folded, upper-cased).
    pub key: String,
    /// Title-cased name for display.
    pub display: String,
    /// URL/id safe form.
    pub slug: String,
}

/// Resolve a free-text name to its canonical forms, or `None` when the value
/// is blank or a placeholder.
pub fn parse_entity_name(raw: Option<&str>) -> Option<EntityName> {
    let collapsed = collapse_whitespace(raw?);
    if collapsed.is_empty() {
        return None;
    }

    let key = fold_diacritics(&collapsed).to_uppercase();
    if EMPTY_ENTITY_PLACEHOLDERS.contains(&key.as_str()) {
        return None;
    }

    Some(EntityName {
        display: title_case(&collapsed),
        slug: slugify(&collapsed),
        key,
    })
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Capitalise words longer than two characters; upper-case short ones so
/// initials and abbreviations ("JR", "SA") stay upper-case.
fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|segment| {
            if segment.chars().count() <= 2 {
                return segment.to_uppercase();
            }
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) => {
                    let mut word: String = first.to_uppercase().collect();
                    word.push_str(&chars.as_str().to_lowercase());
                    word
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lower-case, accent-free, hyphen-separated form of `text`.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_hyphen = false;
    for c in fold_diacritics(text).to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(c);
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Strip the accents that show up in Spanish names and statuses.
pub fn fold_diacritics(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' | 'ã' => 'a',
            'Á' | 'À' | 'Ä' | 'Â' | 'Ã' => 'A',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'É' | 'È' | 'Ë' | 'Ê' => 'E',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'Í' | 'Ì' | 'Ï' | 'Î' => 'I',
            'ó' | 'ò' | 'ö' | 'ô' | 'õ' => 'o',
            'Ó' | 'Ò' | 'Ö' | 'Ô' | 'Õ' => 'O',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'Ú' | 'Ù' | 'Ü' | 'Û' => 'U',
            'ñ' => 'n',
            'Ñ' => 'N',
            'ç' => 'c',
            'Ç' => 'C',
            other => other,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Loosely matched status text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusKey {
    Pendiente,
    Entregado,
    Devolucion,
    Reagendado,
    Cancelado,
    /// Anything unrecognised, lower-cased and trimmed.
    Other(String),
}

impl StatusKey {
    pub fn as_str(&self) -> &str {
        match self {
            StatusKey::Pendiente => "pendiente",
            StatusKey::Entregado => "entregado",
            StatusKey::Devolucion => "devolucion",
            StatusKey::Reagendado => "reagendado",
            StatusKey::Cancelado => "cancelado",
            StatusKey::Other(raw) => raw.as_str(),
        }
    }
}

/// Match a raw status by substring so spelling variants ("Reagendo",
/// "Devolución", "ENTREGADA") land on the same key.
pub fn normalize_status(raw: Option<&str>) -> StatusKey {
    let lowered = match raw.map(|s| s.trim().to_lowercase()) {
        Some(s) if !s.is_empty() => s,
        _ => return StatusKey::Pendiente,
    };
    let folded = fold_diacritics(&lowered);

    if folded.contains("entreg") {
        StatusKey::Entregado
    } else if folded.contains("devol") {
        StatusKey::Devolucion
    } else if folded.contains("reagen") {
        StatusKey::Reagendado
    } else if folded.contains("cancel") {
        StatusKey::Cancelado
    } else if folded == "pendiente" {
        StatusKey::Pendiente
    } else {
        StatusKey::Other(lowered)
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
];

fn parse_complete(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // Postgres text output: "2025-03-10 14:05:09.123+00"
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(facility_local_to_utc)
}

/// Parse an order timestamp. Zone-less values are read as facility time;
/// date-only values are retried with a midnight time component.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    parse_complete(trimmed)
        .or_else(|| parse_complete(&format!("{trimmed}T00:00:00")))
        .or_else(|| parse_complete(&format!("{trimmed} 00:00:00")))
}

pub fn format_iso(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Like [`to_iso_string`] with an explicit fallback instant.
pub fn to_iso_string_at(raw: Option<&str>, now: DateTime<Utc>) -> String {
    format_iso(raw.and_then(parse_timestamp).unwrap_or(now))
}

/// Render a raw timestamp as ISO-8601. Missing or unparseable input yields
/// the current instant; this never fails.
pub fn to_iso_string(raw: Option<&str>) -> String {
    to_iso_string_at(raw, Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_entity_name_is_case_and_whitespace_insensitive() {
        let a = parse_entity_name(Some("  alex   MORA ")).unwrap();
        let b = parse_entity_name(Some("Alex Mora")).unwrap();
        let c = parse_entity_name(Some("ALEX\tmora")).unwrap();
        assert_eq!(a.key, "ALEX MORA");
        assert_eq!(a.key, b.key);
        assert_eq!(b.key, c.key);
        assert_eq!(a.slug, "alex-mora");
    }

    #[test]
    fn test_entity_name_is_diacritic_insensitive() {
        let accented = parse_entity_name(Some("José Núñez")).unwrap();
        let plain = parse_entity_name(Some("jose nunez")).unwrap();
        assert_eq!(accented.key, plain.key);
        assert_eq!(accented.slug, "jose-nunez");
        assert_eq!(accented.display, "José Núñez");
    }

    #[test]
    fn test_placeholders_are_absent() {
        for raw in ["SIN ASIGNAR", "sin asignar", "N/A", "n/a", "-", "", "   ", "No Asignado"] {
            assert_eq!(parse_entity_name(Some(raw)), None, "{raw:?} should be absent");
        }
        assert_eq!(parse_entity_name(None), None);
    }

    #[test]
    fn test_display_keeps_short_segments_upper() {
        let name = parse_entity_name(Some("tienda la esquina sa")).unwrap();
        assert_eq!(name.display, "Tienda LA Esquina SA");
        let initials = parse_entity_name(Some("j. p. rojas")).unwrap();
        assert_eq!(initials.display, "J. P. Rojas");
    }

    #[test]
    fn test_slug_collapses_symbol_runs() {
        assert_eq!(slugify("--Moto & Envíos #3--"), "moto-envios-3");
        assert_eq!(slugify("???"), "");
    }

    #[test]
    fn test_status_substring_matching() {
        assert_eq!(normalize_status(None), StatusKey::Pendiente);
        assert_eq!(normalize_status(Some("  ")), StatusKey::Pendiente);
        assert_eq!(normalize_status(Some("Entregado")), StatusKey::Entregado);
        assert_eq!(normalize_status(Some("ENTREGADA")), StatusKey::Entregado);
        assert_eq!(normalize_status(Some("Devolución")), StatusKey::Devolucion);
        assert_eq!(normalize_status(Some("reagendo")), StatusKey::Reagendado);
        assert_eq!(normalize_status(Some("reagendo")).as_str(), "reagendado");
        assert_eq!(normalize_status(Some("Cancelado por cliente")), StatusKey::Cancelado);
        assert_eq!(
            normalize_status(Some(" En Ruta ")),
            StatusKey::Other("en ruta".to_string())
        );
    }

    #[test]
    fn test_iso_string_parses_common_shapes() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            to_iso_string_at(Some("2025-03-10T14:05:09Z"), now),
            "2025-03-10T14:05:09.000Z"
        );
        assert_eq!(
            to_iso_string_at(Some("2025-03-10 14:05:09+00"), now),
            "2025-03-10T14:05:09.000Z"
        );
        // Zone-less values are facility time (UTC-6).
        assert_eq!(
            to_iso_string_at(Some("2025-03-10 08:00:00"), now),
            "2025-03-10T14:00:00.000Z"
        );
        assert_eq!(
            to_iso_string_at(Some("2025-03-10"), now),
            "2025-03-10T06:00:00.000Z"
        );
    }

    #[test]
    fn test_iso_string_falls_back_to_now() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(to_iso_string_at(None, now), "2025-01-01T12:00:00.000Z");
        assert_eq!(to_iso_string_at(Some("ayer"), now), "2025-01-01T12:00:00.000Z");
        assert!(DateTime::parse_from_rfc3339(&to_iso_string(Some("garbage"))).is_ok());
    }
}
