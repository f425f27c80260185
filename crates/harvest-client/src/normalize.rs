use std::collections::BTreeSet;

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, TimeZone, Utc,
};
use harvest_core::error::AppError;
use harvest_core::models::{Fields, NormalizedRecord, RawRecord, SourceKind};
use harvest_core::traits::Normalizer;
use regex::Regex;
use serde_json::{Value, json};

const EMAIL_PATTERN: &str = r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}";
const PHONE_PATTERN: &str = r"\+?\d[\d\-().\s]{5,}\d";
const PRICE_PATTERN: &str = r"(\d+)(?:[.,](\d{2}))?";

/// Fields scanned for e-mail addresses and phone numbers.
const CONTACT_FIELDS: &[&str] = &["price_text", "organizer", "address", "title"];

/// Title keywords and the taxonomy label each implies.
const CATEGORY_MAP: &[(&str, &str)] = &[
    ("jazz", "music"),
    ("art", "art"),
    ("football", "football"),
    ("running", "running"),
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Field-level cleanup applied to every extracted record.
///
/// - whitespace collapsed, empty values dropped
/// - `start`/`end` as RFC 3339 in the listing's offset (from the value itself
///   or a `UTC±HH:MM` timezone hint), UTC when neither is known
/// - `country` upper-cased, `status` reduced to its bare keyword
/// - `price_value` derived from `price_text`
/// - `emails`/`phones` pulled from free text, `images` deduplicated
/// - `taxonomy` labels from title keywords and, for sports, `sport_type`
/// - `discovered_at` stamped when missing
#[derive(Debug, Clone)]
pub struct FieldNormalizer {
    email: Regex,
    phone: Regex,
    price: Regex,
}

impl FieldNormalizer {
    pub fn new() -> Result<Self, AppError> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| AppError::ConfigError(format!("Bad pattern: {e}")))
        };
        Ok(Self {
            email: compile(EMAIL_PATTERN)?,
            phone: compile(PHONE_PATTERN)?,
            price: compile(PRICE_PATTERN)?,
        })
    }

    fn price_value(&self, text: &str) -> Option<f64> {
        let captures = self.price.captures(text)?;
        let major: f64 = captures.get(1)?.as_str().parse().ok()?;
        let minor: f64 = captures
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0.0);
        Some(major + minor / 100.0)
    }

    fn contacts(&self, fields: &Fields) -> (BTreeSet<String>, BTreeSet<String>) {
        let pool = CONTACT_FIELDS
            .iter()
            .filter_map(|name| fields.get(*name).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let emails = self
            .email
            .find_iter(&pool)
            .map(|m| m.as_str().to_lowercase())
            .collect();
        let phones = self
            .phone
            .find_iter(&pool)
            .map(|m| {
                m.as_str()
                    .chars()
                    .filter(|c| *c == '+' || c.is_ascii_digit())
                    .collect::<String>()
            })
            .filter(|digits| digits.trim_start_matches('+').len() >= 7)
            .collect();
        (emails, phones)
    }
}

impl Normalizer for FieldNormalizer {
    fn normalize(&self, raw: RawRecord) -> Result<NormalizedRecord, AppError> {
        let RawRecord {
            source_id,
            kind,
            url,
            fields: raw_fields,
        } = raw;

        let mut fields: Fields = raw_fields
            .into_iter()
            .filter_map(|(name, value)| clean_value(value).map(|v| (name, v)))
            .collect();

        let hint = fields
            .get("timezone")
            .and_then(Value::as_str)
            .and_then(parse_offset);
        let mut listing_offset = None;
        for name in ["start", "end"] {
            let Some(text) = fields.get(name).and_then(Value::as_str) else {
                continue;
            };
            let (normalized, offset) = normalize_datetime(text, hint).ok_or_else(|| {
                AppError::NormalizationError(format!("Unparseable {name}: {text}"))
            })?;
            if name == "start" {
                listing_offset = offset;
            }
            fields.insert(name.to_string(), Value::String(normalized));
        }
        if !fields.contains_key("timezone")
            && let Some(offset) = listing_offset
        {
            fields.insert("timezone".to_string(), Value::String(offset_label(offset)));
        }

        if let Some(Value::String(country)) = fields.get_mut("country") {
            *country = country.to_uppercase();
        }
        if let Some(Value::String(status)) = fields.get_mut("status") {
            *status = bare_status(status);
        }

        if let Some(price) = fields
            .get("price_text")
            .and_then(Value::as_str)
            .and_then(|text| self.price_value(text))
        {
            fields.insert("price_value".to_string(), json!(price));
        }

        let (emails, phones) = self.contacts(&fields);
        if !emails.is_empty() {
            fields.insert("emails".to_string(), json!(emails));
        }
        if !phones.is_empty() {
            fields.insert("phones".to_string(), json!(phones));
        }

        if let Some(Value::Array(images)) = fields.get_mut("images") {
            let mut seen = BTreeSet::new();
            images.retain(|image| seen.insert(image.to_string()));
        }

        let labels = taxonomy(&kind, &fields);
        if !labels.is_empty() {
            fields.insert("taxonomy".to_string(), json!(labels));
        }

        fields
            .entry("discovered_at")
            .or_insert_with(|| Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));

        Ok(NormalizedRecord {
            source_id,
            kind,
            url: url.trim().to_string(),
            fields,
        })
    }
}

/// Collapse whitespace; `None` for values that carry nothing.
fn clean_value(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(text) => {
            let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
            (!collapsed.is_empty()).then_some(Value::String(collapsed))
        }
        Value::Array(items) => {
            let items: Vec<Value> = items.into_iter().filter_map(clean_value).collect();
            (!items.is_empty()).then_some(Value::Array(items))
        }
        Value::Object(map) => (!map.is_empty()).then_some(Value::Object(map)),
        other => Some(other),
    }
}

/// Parse a datetime and render it as RFC 3339.
///
/// Returns the offset the value ended up in, or `None` for date-only values.
fn normalize_datetime(text: &str, hint: Option<FixedOffset>) -> Option<(String, Option<FixedOffset>)> {
    let aware = DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z"))
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M%z"));
    if let Ok(dt) = aware {
        let dt = match hint {
            Some(offset) => dt.with_timezone(&offset),
            None => dt,
        };
        return Some((render(&dt), Some(*dt.offset())));
    }

    if let Some(naive) = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
    {
        let offset = hint.unwrap_or_else(utc_offset);
        let dt = offset.from_local_datetime(&naive).single()?;
        return Some((render(&dt), Some(offset)));
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|day| (day.to_string(), None))
}

fn render(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn utc_offset() -> FixedOffset {
    Utc.fix()
}

/// `UTC`, `GMT`, `Z`, `UTC+02:00`, `+0530`, `GMT-3`. Named zones are not resolved.
fn parse_offset(name: &str) -> Option<FixedOffset> {
    let name = name.trim();
    let rest = name
        .strip_prefix("UTC")
        .or_else(|| name.strip_prefix("GMT"))
        .unwrap_or(name);
    if rest.is_empty() || rest == "Z" {
        return Some(utc_offset());
    }

    let (sign, digits) = match rest.split_at_checked(1)? {
        ("+", digits) => (1, digits),
        ("-", digits) => (-1, digits),
        _ => return None,
    };
    let (hours, minutes) = match digits.split_once(':') {
        Some((h, m)) => (h, m),
        None if digits.len() == 4 => digits.split_at_checked(2)?,
        None => (digits, "0"),
    };
    let hours: i32 = hours.parse().ok()?;
    let minutes: i32 = minutes.parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

fn offset_label(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let minutes = seconds.abs() / 60;
    format!("UTC{sign}{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Source labels first, then canonical ones, without repeats.
fn taxonomy(kind: &SourceKind, fields: &Fields) -> Vec<String> {
    let mut labels: Vec<String> = match fields.get("taxonomy") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(label)) => vec![label.clone()],
        _ => Vec::new(),
    };

    let title = fields
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let mut found: Vec<String> = CATEGORY_MAP
        .iter()
        .filter(|(keyword, _)| title.contains(keyword))
        .map(|(_, label)| label.to_string())
        .collect();
    if matches!(kind, SourceKind::Sports)
        && let Some(sport) = fields.get("sport_type").and_then(Value::as_str)
    {
        found.push(sport.to_lowercase());
    }

    for label in found {
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    labels
}

/// `https://schema.org/EventCancelled` → `cancelled`.
fn bare_status(status: &str) -> String {
    let tail = status.rsplit('/').next().unwrap_or(status);
    let tail = tail.strip_prefix("Event").unwrap_or(tail);
    tail.to_lowercase()
}
