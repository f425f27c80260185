use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use tracing::debug;

use crate::error::AppError;
use crate::models::SourceKind;

/// JSON Schemas per listing type.
///
/// Starts from the built-in schemas; a schema directory may override any of
/// them with `<type>.schema.json` (singular, e.g. `event.schema.json`).
#[derive(Debug, Clone)]
pub struct SchemaSet {
    schemas: HashMap<SourceKind, Value>,
}

impl Default for SchemaSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaSet {
    pub fn builtin() -> Self {
        let schemas = SourceKind::ALL
            .into_iter()
            .map(|kind| (kind, builtin_schema(kind)))
            .collect();
        Self { schemas }
    }

    /// Built-in schemas, overridden by any matching file in `dir`.
    pub fn load_dir(dir: impl Into<PathBuf>) -> Result<Self, AppError> {
        let dir = dir.into();
        let mut set = Self::builtin();
        for kind in SourceKind::ALL {
            let path = schema_path(&dir, kind);
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| {
                AppError::ConfigError(format!(
                    "Failed to read schema file {}: {e}",
                    path.display()
                ))
            })?;
            let schema: Value = serde_json::from_str(&raw).map_err(|e| {
                AppError::ConfigError(format!(
                    "Invalid JSON in schema file {}: {e}",
                    path.display()
                ))
            })?;
            debug!(kind = %kind, path = %path.display(), "Loaded schema override");
            set.schemas.insert(kind, schema);
        }
        Ok(set)
    }

    pub fn get(&self, kind: SourceKind) -> Option<&Value> {
        self.schemas.get(&kind)
    }
}

fn schema_path(dir: &Path, kind: SourceKind) -> PathBuf {
    let singular = kind.as_str().trim_end_matches('s');
    dir.join(format!("{singular}.schema.json"))
}

fn builtin_schema(kind: SourceKind) -> Value {
    let mut schema = json!({
        "type": "object",
        "required": ["title", "start", "city", "country"],
        "additionalProperties": false,
        "properties": {
            "title": {"type": "string", "minLength": 1},
            "start": {"type": "string", "pattern": "^\\d{4}-\\d{2}-\\d{2}"},
            "end": {"type": "string", "pattern": "^\\d{4}-\\d{2}-\\d{2}"},
            "timezone": {"type": "string"},
            "venue_name": {"type": "string"},
            "address": {"type": "string"},
            "city": {"type": "string", "minLength": 1},
            "country": {"type": "string", "pattern": "^[A-Z]{2}$"},
            "status": {
                "type": "string",
                "enum": ["scheduled", "cancelled", "postponed", "rescheduled"]
            },
            "price_text": {"type": "string"},
            "price_value": {"type": "number", "minimum": 0},
            "organizer": {"type": "string"},
            "url": {"type": "string"},
            "description": {"type": "string"},
            "emails": {"type": "array", "items": {"type": "string"}},
            "phones": {"type": "array", "items": {"type": "string"}},
            "images": {"type": "array", "items": {"type": "string"}},
            "taxonomy": {"type": "array", "items": {"type": "string"}},
            "discovered_at": {"type": "string"}
        }
    });

    if kind == SourceKind::Sports {
        schema["required"] = json!(["title", "start", "city", "country", "sport_type"]);
        schema["properties"]["sport_type"] = json!({"type": "string", "minLength": 1});
        schema["properties"]["home_team"] = json!({"type": "string"});
        schema["properties"]["away_team"] = json!({"type": "string"});
    }
    if kind == SourceKind::Festivals {
        schema["properties"]["lineup"] = json!({"type": "array", "items": {"type": "string"}});
    }
    schema
}
