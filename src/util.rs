//! Small helpers shared by the store layer and the engine.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

/// Format a timestamp for storage.
///
/// Fixed-width UTC RFC 3339 with microseconds, so lexicographic order in
/// SQLite equals chronological order.
pub fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
}

/// Encode a string set as a JSON array column.
pub fn encode_set(set: &BTreeSet<String>) -> String {
    serde_json::to_string(set).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON array column; anything unreadable decodes as empty.
pub fn decode_set(raw: &str) -> BTreeSet<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Normalize an email address for comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Extract bare email from a header value like "Name <email@example.com>".
pub fn extract_email_address(from_field: &str) -> String {
    if let Some(start) = from_field.find('<') {
        if let Some(end) = from_field.find('>') {
            if end > start {
                return normalize_email(&from_field[start + 1..end]);
            }
        }
    }
    normalize_email(from_field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ts_is_fixed_width_and_sortable() {
        let a = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert_eq!(ts(a).len(), ts(b).len());
        assert!(ts(a) < ts(b));
        assert_eq!(parse_ts(&ts(b)).unwrap(), b);
    }

    #[test]
    fn test_extract_email_address_angle_brackets() {
        assert_eq!(
            extract_email_address("Ana Broker <Ana@Corredora.com>"),
            "ana@corredora.com"
        );
        assert_eq!(extract_email_address("  BROKER@X.COM "), "broker@x.com");
    }

    #[test]
    fn test_set_columns() {
        let set: BTreeSet<String> = ["ramo".to_string()].into_iter().collect();
        assert_eq!(decode_set(&encode_set(&set)), set);
        assert!(decode_set("garbage").is_empty());
    }
}
