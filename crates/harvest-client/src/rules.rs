//! Declarative CSS rule files.
//!
//! ```json
//! {
//!   "list_item": "article.event",
//!   "fields": {
//!     "title": "h2",
//!     "start": "time@datetime",
//!     "images": "img@src[]",
//!     "detail_url": "a.more@href"
//!   },
//!   "pagination": {"next_selector": "a.next", "max_pages": 5},
//!   "timezone": "UTC+02:00"
//! }
//! ```
//!
//! A field expression is a CSS selector, optionally followed by `@attr` (or
//! `::attr(attr)`), `|text` to fall back to element text when the attribute is
//! missing, and `[]` to collect every match instead of the first.

use std::collections::BTreeMap;
use std::path::Path;

use harvest_core::error::AppError;
use harvest_core::models::Fields;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

fn default_list_item() -> String {
    "body".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaginationRule {
    #[serde(default)]
    pub next_selector: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

/// Rule file as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSet {
    #[serde(default = "default_list_item")]
    pub list_item: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub pagination: PaginationRule,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl RuleSet {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read rules {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
            .map_err(|e| AppError::ConfigError(format!("Invalid rules {}: {e}", path.display())))
    }

    pub fn from_json(text: &str) -> Result<Self, AppError> {
        serde_json::from_str(text).map_err(|e| AppError::ConfigError(e.to_string()))
    }

    /// Parse every selector up front so a bad rule file fails the job once.
    pub fn compile(&self) -> Result<CompiledRules, AppError> {
        let fields = self
            .fields
            .iter()
            .map(|(name, expr)| Ok((name.clone(), FieldExpr::parse(expr)?)))
            .collect::<Result<Vec<_>, AppError>>()?;
        let next_page = self
            .pagination
            .next_selector
            .as_deref()
            .map(FieldExpr::parse)
            .transpose()?;

        Ok(CompiledRules {
            list_item: parse_selector(&self.list_item)?,
            fields,
            next_page,
            max_pages: self.pagination.max_pages,
            timezone: self.timezone.clone(),
        })
    }
}

fn parse_selector(css: &str) -> Result<Selector, AppError> {
    Selector::parse(css)
        .map_err(|e| AppError::ConfigError(format!("Invalid selector '{css}': {e}")))
}

/// One compiled field expression.
#[derive(Debug, Clone)]
pub struct FieldExpr {
    selector: Selector,
    attr: Option<String>,
    multi: bool,
    text_fallback: bool,
}

impl FieldExpr {
    pub fn parse(expression: &str) -> Result<Self, AppError> {
        let mut expr = expression.trim();
        let multi = match expr.strip_suffix("[]") {
            Some(rest) => {
                expr = rest;
                true
            }
            None => false,
        };
        let text_fallback = match expr.strip_suffix("|text") {
            Some(rest) => {
                expr = rest;
                true
            }
            None => false,
        };

        let (css, attr) = if let Some((css, attr)) = expr.split_once('@') {
            (css, Some(attr.trim()))
        } else if let Some((css, attr)) = expr.split_once("::attr(") {
            (css, Some(attr.trim_end_matches(')').trim()))
        } else {
            (expr, None)
        };

        Ok(Self {
            selector: parse_selector(css.trim())?,
            attr: attr.filter(|a| !a.is_empty()).map(str::to_string),
            multi,
            text_fallback,
        })
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    fn value(&self, element: ElementRef<'_>) -> Option<String> {
        if let Some(attr) = &self.attr {
            let raw = element.value().attr(attr).map(str::trim).unwrap_or_default();
            if !raw.is_empty() {
                return Some(raw.to_string());
            }
            if !self.text_fallback {
                return None;
            }
        }
        let text = element_text(element);
        (!text.is_empty()).then_some(text)
    }

    /// First non-empty match under `scope`.
    pub fn first(&self, scope: ElementRef<'_>) -> Option<String> {
        scope
            .select(&self.selector)
            .find_map(|element| self.value(element))
    }

    pub fn all(&self, scope: ElementRef<'_>) -> Vec<String> {
        scope
            .select(&self.selector)
            .filter_map(|element| self.value(element))
            .collect()
    }

    /// Link target for pagination, defaulting to `href`.
    fn link(&self, document: &Html) -> Option<String> {
        document.select(&self.selector).find_map(|element| {
            let attr = self.attr.as_deref().unwrap_or("href");
            element
                .value()
                .attr(attr)
                .map(str::trim)
                .filter(|href| !href.is_empty())
                .map(str::to_string)
        })
    }
}

/// Text content with runs of whitespace collapsed.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A rule file ready to run against documents.
#[derive(Debug, Clone)]
pub struct CompiledRules {
    list_item: Selector,
    fields: Vec<(String, FieldExpr)>,
    next_page: Option<FieldExpr>,
    pub max_pages: Option<u32>,
    pub timezone: Option<String>,
}

impl CompiledRules {
    /// One field map per `list_item` match. Items with no values are dropped.
    pub fn items(&self, document: &Html) -> Vec<Fields> {
        document
            .select(&self.list_item)
            .filter_map(|item| {
                let mut fields = Fields::new();
                for (name, expr) in &self.fields {
                    if expr.is_multi() {
                        let values = expr.all(item);
                        if !values.is_empty() {
                            fields.insert(name.clone(), Value::from(values));
                        }
                    } else if let Some(value) = expr.first(item) {
                        fields.insert(name.clone(), Value::String(value));
                    }
                }
                (!fields.is_empty()).then_some(fields)
            })
            .collect()
    }

    /// Absolute URL of the next page, if the document links one.
    pub fn next_page(&self, document: &Html, page_url: &Url) -> Option<String> {
        if self.max_pages.is_some_and(|max| max <= 1) {
            return None;
        }
        let href = self.next_page.as_ref()?.link(document)?;
        let next = page_url.join(&href).ok()?;
        (next != *page_url).then(|| next.to_string())
    }
}
