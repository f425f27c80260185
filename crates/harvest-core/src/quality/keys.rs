use chrono::{DateTime, NaiveDate};

use crate::models::{DedupKey, Fields, NormalizedRecord, compute_hash};

fn collapse(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn text_field<'a>(fields: &'a Fields, name: &str) -> Option<&'a str> {
    fields
        .get(name)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

/// Calendar day a listing starts on, in the listing's own offset.
///
/// Falls back to `end` when `start` is absent.
pub fn start_day(fields: &Fields) -> Option<NaiveDate> {
    let raw = text_field(fields, "start").or_else(|| text_field(fields, "end"))?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    raw.get(..10)
        .and_then(|day| NaiveDate::parse_from_str(day, "%Y-%m-%d").ok())
}

/// Deterministic fingerprint: source, title, start day and location.
pub fn dedup_key(record: &NormalizedRecord) -> DedupKey {
    let fields = &record.fields;
    let title = collapse(text_field(fields, "title").unwrap_or_default());
    let day = start_day(fields)
        .map(|d| d.to_string())
        .unwrap_or_else(|| "1970-01-01".to_string());
    let venue = collapse(
        text_field(fields, "venue_name")
            .or_else(|| text_field(fields, "address"))
            .unwrap_or_default(),
    );
    let city = collapse(text_field(fields, "city").unwrap_or_default());

    let payload = [
        record.source_id.as_str(),
        title.as_str(),
        day.as_str(),
        venue.as_str(),
        city.as_str(),
    ]
    .join("|");
    DedupKey(compute_hash(&payload))
}
