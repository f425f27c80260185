use std::path::Path;

use harvest_core::error::AppError;
use harvest_core::models::{Fields, RawRecord, Source, SourceKind};
use harvest_core::traits::{ExtractedPage, Extractor, ExtractorFactory};
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::rules::{CompiledRules, RuleSet};

/// Rule field names accepted as aliases of the canonical ones.
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("venue", "venue_name"),
    ("addr", "address"),
    ("detail_url", "url"),
];

/// Extracts listings from schema.org JSON-LD blocks, then from CSS rules.
///
/// JSON-LD nodes are kept only when their `@type` maps to the source's kind.
/// Rule items always belong to the source's kind.
#[derive(Debug, Clone)]
pub struct RuleExtractor {
    source_id: String,
    kind: SourceKind,
    rules: Option<CompiledRules>,
}

impl RuleExtractor {
    pub fn new(source_id: impl Into<String>, kind: SourceKind, rules: Option<CompiledRules>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            rules,
        }
    }

    fn record(&self, url: &str, fields: Fields) -> RawRecord {
        RawRecord {
            source_id: self.source_id.clone(),
            kind: self.kind,
            url: url.to_string(),
            fields,
        }
    }

    fn rule_fields(&self, rules: &CompiledRules, mut item: Fields, page_url: Option<&Url>) -> Fields {
        for (alias, canonical) in FIELD_ALIASES {
            if let Some(value) = item.remove(*alias) {
                item.entry(canonical.to_string()).or_insert(value);
            }
        }
        if let Some(base) = page_url {
            if let Some(Value::String(link)) = item.get_mut("url") {
                *link = absolutize(base, link);
            }
            if let Some(Value::Array(images)) = item.get_mut("images") {
                for image in images.iter_mut() {
                    if let Value::String(link) = image {
                        *link = absolutize(base, link);
                    }
                }
            }
        }
        if let Some(tz) = &rules.timezone {
            item.entry("timezone")
                .or_insert_with(|| Value::String(tz.clone()));
        }
        item
    }
}

impl Extractor for RuleExtractor {
    fn extract(&self, url: &str, html: &str) -> Result<ExtractedPage, AppError> {
        let document = Html::parse_document(html);
        let page_url = Url::parse(url).ok();

        let mut records: Vec<RawRecord> = json_ld_nodes(&document)
            .into_iter()
            .filter(|node| node_kind(node.get("@type")) == Some(self.kind))
            .map(|node| self.record(url, json_ld_fields(&node, self.kind)))
            .filter(|record| !record.fields.is_empty())
            .collect();

        let mut next_page = None;
        if let Some(rules) = &self.rules {
            for item in rules.items(&document) {
                let fields = self.rule_fields(rules, item, page_url.as_ref());
                records.push(self.record(url, fields));
            }
            next_page = page_url
                .as_ref()
                .and_then(|page| rules.next_page(&document, page));
        }

        debug!(
            source_id = %self.source_id,
            url,
            records = records.len(),
            next_page = next_page.as_deref().unwrap_or("-"),
            "Extracted page"
        );
        Ok(ExtractedPage { records, next_page })
    }

    fn max_pages(&self) -> Option<u32> {
        self.rules.as_ref().and_then(|rules| rules.max_pages)
    }
}

fn absolutize(base: &Url, link: &str) -> String {
    base.join(link.trim())
        .map(|u| u.to_string())
        .unwrap_or_else(|_| link.to_string())
}

/// Builds a [`RuleExtractor`] from the source's `rules_path`.
///
/// Sources without a rule file get JSON-LD extraction only.
#[derive(Debug, Clone, Default)]
pub struct RuleExtractorFactory;

impl RuleExtractorFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ExtractorFactory for RuleExtractorFactory {
    type Extractor = RuleExtractor;

    fn create(&self, source: &Source) -> Result<RuleExtractor, AppError> {
        let rules = source
            .rules_path
            .as_deref()
            .map(|path| RuleSet::load(Path::new(path))?.compile())
            .transpose()?;
        Ok(RuleExtractor::new(source.source_id.clone(), source.kind, rules))
    }
}

// ---- JSON-LD ----

fn json_ld_nodes(document: &Html) -> Vec<Map<String, Value>> {
    let mut nodes = Vec::new();
    if let Ok(selector) = Selector::parse("script[type='application/ld+json']") {
        for script in document.select(&selector) {
            let json_text = script.text().collect::<String>();
            match serde_json::from_str::<Value>(&json_text) {
                Ok(value) => flatten_graph(value, &mut nodes),
                Err(e) => debug!(error = %e, "Skipping malformed JSON-LD block"),
            }
        }
    }
    nodes
}

/// Unwrap `@graph` containers, `@list` values and top-level arrays.
fn flatten_graph(value: Value, out: &mut Vec<Map<String, Value>>) {
    match value {
        Value::Object(map) => {
            let container = ["@graph", "@list"]
                .into_iter()
                .find_map(|key| map.get(key).and_then(Value::as_array));
            match container {
                Some(items) => {
                    for item in items.clone() {
                        flatten_graph(item, out);
                    }
                }
                None => out.push(map),
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_graph(item, out);
            }
        }
        _ => {}
    }
}

fn node_kind(type_value: Option<&Value>) -> Option<SourceKind> {
    match type_value? {
        Value::Array(types) => types.iter().find_map(|t| node_kind(Some(t))),
        Value::String(name) => match name.to_lowercase().as_str() {
            "event" | "musicevent" | "music event" | "theaterevent" | "eventseries" => {
                Some(SourceKind::Events)
            }
            "festival" => Some(SourceKind::Festivals),
            "sportsevent" | "sports event" => Some(SourceKind::Sports),
            _ => None,
        },
        _ => None,
    }
}

/// Best text for a JSON-LD value: strings, numbers, or an object's name/url.
fn text_of(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => items.iter().find_map(|item| text_of(Some(item))),
        Value::Object(map) => text_of(map.get("name")).or_else(|| text_of(map.get("url"))),
        _ => None,
    }
}

fn first_object(value: Option<&Value>) -> Option<&Map<String, Value>> {
    match value? {
        Value::Object(map) => Some(map),
        Value::Array(items) => items.iter().find_map(|item| item.as_object()),
        _ => None,
    }
}

fn images_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|item| text_of(Some(item))).collect(),
        Some(_) => text_of(value).into_iter().collect(),
        None => Vec::new(),
    }
}

fn offers_price(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Object(offer) => text_of(offer.get("price")),
        Value::Array(offers) => offers
            .iter()
            .filter_map(Value::as_object)
            .find_map(|offer| text_of(offer.get("price"))),
        _ => None,
    }
}

fn json_ld_fields(node: &Map<String, Value>, kind: SourceKind) -> Fields {
    let mut fields = Fields::new();
    let mut put = |name: &str, value: Option<String>| {
        if let Some(value) = value {
            fields.insert(name.to_string(), Value::String(value));
        }
    };

    put("title", text_of(node.get("name")));
    put("start", text_of(node.get("startDate")));
    put("end", text_of(node.get("endDate")));
    put("timezone", text_of(node.get("eventTimeZone")));
    put("description", text_of(node.get("description")));
    put("price_text", offers_price(node.get("offers")));
    put("organizer", text_of(node.get("organizer")));
    put("url", text_of(node.get("url")));

    match node.get("location") {
        Some(place @ Value::String(_)) => put("venue_name", text_of(Some(place))),
        location => {
            if let Some(place) = first_object(location) {
                put("venue_name", text_of(place.get("name")));
                match place.get("address") {
                    Some(Value::Object(address)) => {
                        put(
                            "address",
                            text_of(address.get("streetAddress"))
                                .or_else(|| text_of(address.get("street"))),
                        );
                        put(
                            "city",
                            text_of(address.get("addressLocality"))
                                .or_else(|| text_of(address.get("city"))),
                        );
                        put("country", text_of(address.get("addressCountry")));
                    }
                    other => put("address", text_of(other)),
                }
            }
        }
    }

    if kind == SourceKind::Sports {
        put(
            "sport_type",
            text_of(node.get("sport")).or_else(|| text_of(node.get("sportType"))),
        );
        put("home_team", text_of(node.get("homeTeam")));
        put("away_team", text_of(node.get("awayTeam")));
    }

    let images = images_of(node.get("image"));
    if !images.is_empty() {
        fields.insert("images".to_string(), Value::from(images));
    }
    fields
}
