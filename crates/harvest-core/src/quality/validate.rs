use std::collections::{BTreeMap, HashMap};

use jsonschema::Validator;
use serde_json::Value;

use crate::error::AppError;
use crate::models::{Fields, SourceKind};
use crate::quality::schema::SchemaSet;

struct PropertyRule {
    types: Vec<String>,
    enum_values: Option<Vec<Value>>,
    validator: Validator,
}

struct CompiledSchema {
    required: Vec<String>,
    properties: BTreeMap<String, PropertyRule>,
    additional_allowed: bool,
    whole: Validator,
}

/// Validates normalized fields against per-type schemas, yielding one reason
/// code per violated rule.
pub struct RecordValidator {
    compiled: HashMap<SourceKind, CompiledSchema>,
}

impl RecordValidator {
    pub fn new(schemas: &SchemaSet) -> Result<Self, AppError> {
        let mut compiled = HashMap::new();
        for kind in SourceKind::ALL {
            if let Some(schema) = schemas.get(kind) {
                compiled.insert(kind, compile(kind, schema)?);
            }
        }
        Ok(Self { compiled })
    }

    /// Reason codes for `fields`; empty when the record is valid.
    pub fn violations(&self, kind: SourceKind, fields: &Fields) -> Vec<String> {
        let Some(schema) = self.compiled.get(&kind) else {
            return vec![format!("schema_violation:no_schema_for_{kind}")];
        };

        let mut reasons = Vec::new();
        for name in &schema.required {
            if fields.get(name).is_none_or(Value::is_null) {
                reasons.push(format!("missing_required_field:{name}"));
            }
        }

        for (name, value) in fields {
            let Some(rule) = schema.properties.get(name) else {
                if !schema.additional_allowed {
                    reasons.push(format!("unexpected_field:{name}"));
                }
                continue;
            };
            if value.is_null() {
                continue;
            }
            if !rule.types.is_empty() && !rule.types.iter().any(|t| matches_type(t, value)) {
                reasons.push(format!("invalid_type:{name}"));
                continue;
            }
            if let Some(allowed) = &rule.enum_values {
                if !allowed.contains(value) {
                    reasons.push(format!("invalid_enum_value:{name}"));
                    continue;
                }
            }
            if !rule.validator.is_valid(value) {
                reasons.push(format!("invalid_value:{name}"));
            }
        }

        if reasons.is_empty() {
            let instance = Value::Object(without_nulls(fields));
            if !schema.whole.is_valid(&instance) {
                reasons.push("schema_violation".to_string());
            }
        }
        reasons
    }
}

fn without_nulls(fields: &Fields) -> Fields {
    fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn compile(kind: SourceKind, schema: &Value) -> Result<CompiledSchema, AppError> {
    let invalid = |e: String| AppError::ConfigError(format!("Invalid {kind} schema: {e}"));

    let whole = jsonschema::validator_for(schema).map_err(|e| invalid(e.to_string()))?;

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let additional_allowed = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    let mut properties = BTreeMap::new();
    if let Some(props) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let types = match prop.get("type") {
                Some(Value::String(t)) => vec![t.clone()],
                Some(Value::Array(ts)) => ts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };
            let enum_values = prop.get("enum").and_then(Value::as_array).cloned();
            let validator = jsonschema::validator_for(prop)
                .map_err(|e| invalid(format!("property {name}: {e}")))?;
            properties.insert(
                name.clone(),
                PropertyRule {
                    types,
                    enum_values,
                    validator,
                },
            );
        }
    }

    Ok(CompiledSchema {
        required,
        properties,
        additional_allowed,
        whole,
    })
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fields(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn validator() -> RecordValidator {
        RecordValidator::new(&SchemaSet::builtin()).unwrap()
    }

    fn valid_event() -> Fields {
        fields(json!({
            "title": "Jazz Night",
            "start": "2026-07-01T19:00:00+02:00",
            "venue_name": "Blue Room",
            "city": "Lyon",
            "country": "FR",
        }))
    }

    #[test]
    fn test_valid_record_has_no_violations() {
        assert!(validator().violations(SourceKind::Events, &valid_event()).is_empty());
    }

    #[test]
    fn test_missing_required_country() {
        let mut record = valid_event();
        record.remove("country");
        assert_eq!(
            validator().violations(SourceKind::Events, &record),
            vec!["missing_required_field:country".to_string()]
        );
    }

    #[test]
    fn test_null_counts_as_missing() {
        let mut record = valid_event();
        record.insert("country".into(), Value::Null);
        assert_eq!(
            validator().violations(SourceKind::Events, &record),
            vec!["missing_required_field:country".to_string()]
        );
    }

    #[test]
    fn test_one_reason_per_violated_rule() {
        let mut record = valid_event();
        record.insert("price_value".into(), json!("twelve"));
        record.insert("status".into(), json!("maybe"));
        record.insert("country".into(), json!("france"));
        record.insert("mood".into(), json!("festive"));

        let reasons = validator().violations(SourceKind::Events, &record);
        assert!(reasons.contains(&"invalid_type:price_value".to_string()));
        assert!(reasons.contains(&"invalid_enum_value:status".to_string()));
        assert!(reasons.contains(&"invalid_value:country".to_string()));
        assert!(reasons.contains(&"unexpected_field:mood".to_string()));
        assert_eq!(reasons.len(), 4);
    }

    #[test]
    fn test_sports_require_sport_type() {
        let reasons = validator().violations(SourceKind::Sports, &valid_event());
        assert_eq!(reasons, vec!["missing_required_field:sport_type".to_string()]);
    }
}
