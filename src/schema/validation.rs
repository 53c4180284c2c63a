//! Field validation gate
//!
//! Values always arrive as a list. Scalar fields validate the first element;
//! list fields apply every non-required rule to each element. An empty value
//! (missing, `null`, blank string) only fails `Required`.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::{EntityType, FieldRule, FieldSpec};

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

pub const MSG_REQUIRED: &str = "This field is required";
pub const MSG_NUMBER: &str = "The value must be a number";
pub const MSG_INTEGER: &str = "The value must be an integer";
pub const MSG_EMAIL: &str = "The value must be an email address";
pub const MSG_BOOLEAN: &str = "The value must be a boolean";
pub const MSG_DATETIME: &str = "The value must be a date (RFC 3339)";
pub const MSG_ONE_OF: &str = "The value is not one of the allowed choices";

/// Why a field value was refused
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown field '{field}' for {entity_type}")]
    UnknownField {
        entity_type: EntityType,
        field: String,
    },

    #[error("{field}: {message}")]
    Invalid { field: String, message: String },
}

impl ValidationError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::UnknownField { field, .. } | Self::Invalid { field, .. } => field,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::UnknownField { .. } => self.to_string(),
            Self::Invalid { message, .. } => message.clone(),
        }
    }
}

/// Validate one field of one entity type, independent of every other field
pub fn validate_field(
    entity_type: EntityType,
    field: &str,
    values: &[Value],
) -> Result<(), ValidationError> {
    let spec = entity_type
        .schema()
        .field(field)
        .ok_or_else(|| ValidationError::UnknownField {
            entity_type,
            field: field.to_string(),
        })?;

    check_spec(spec, values)
}

/// Validate a full creation input: every key known, every required field set
pub fn validate_entity(
    entity_type: EntityType,
    input: &Map<String, Value>,
) -> Result<(), ValidationError> {
    for (key, value) in input {
        validate_field(entity_type, key, &as_values(value))?;
    }

    for spec in entity_type.schema().required_fields() {
        if !input.contains_key(spec.name) {
            return Err(ValidationError::invalid(spec.name, MSG_REQUIRED));
        }
    }

    Ok(())
}

/// Stored shape of a value list: scalar fields keep the first element (or
/// `null`), list fields keep the non-empty elements
pub fn normalize_values(spec: &FieldSpec, values: &[Value]) -> Value {
    if spec.multiple {
        Value::Array(values.iter().filter(|v| !is_empty(v)).cloned().collect())
    } else {
        match values.first() {
            Some(v) if !is_empty(v) => v.clone(),
            _ => Value::Null,
        }
    }
}

/// Spread a JSON value into the uniform list form
pub fn as_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn check_spec(spec: &FieldSpec, values: &[Value]) -> Result<(), ValidationError> {
    if spec.multiple {
        let present: Vec<&Value> = values.iter().filter(|v| !is_empty(v)).collect();
        if present.is_empty() {
            return if spec.is_required() {
                Err(ValidationError::invalid(spec.name, MSG_REQUIRED))
            } else {
                Ok(())
            };
        }
        for value in present {
            check_rules(spec, value)?;
        }
        return Ok(());
    }

    match values.first() {
        Some(value) if !is_empty(value) => check_rules(spec, value),
        _ if spec.is_required() => Err(ValidationError::invalid(spec.name, MSG_REQUIRED)),
        _ => Ok(()),
    }
}

fn check_rules(spec: &FieldSpec, value: &Value) -> Result<(), ValidationError> {
    for rule in spec.rules {
        if let Some(message) = violation(rule, value) {
            return Err(ValidationError::invalid(spec.name, message));
        }
    }
    Ok(())
}

fn violation(rule: &FieldRule, value: &Value) -> Option<String> {
    match rule {
        FieldRule::Required => None,
        FieldRule::MinLength(min) => {
            let len = text_len(value);
            (len < *min).then(|| format!("The value is too short (min {})", min))
        }
        FieldRule::MaxLength(max) => {
            let len = text_len(value);
            (len > *max).then(|| format!("The value is too long (max {})", max))
        }
        FieldRule::Number => (!is_number(value)).then(|| MSG_NUMBER.to_string()),
        FieldRule::Integer => (!is_integer(value)).then(|| MSG_INTEGER.to_string()),
        FieldRule::Email => {
            let ok = value.as_str().is_some_and(|s| EMAIL_RE.is_match(s.trim()));
            (!ok).then(|| MSG_EMAIL.to_string())
        }
        FieldRule::OneOf(choices) => {
            let ok = value.as_str().is_some_and(|s| choices.iter().any(|c| *c == s));
            (!ok).then(|| MSG_ONE_OF.to_string())
        }
        FieldRule::Boolean => {
            let ok = match value {
                Value::Bool(_) => true,
                Value::String(s) => s == "true" || s == "false",
                _ => false,
            };
            (!ok).then(|| MSG_BOOLEAN.to_string())
        }
        FieldRule::DateTime => {
            let ok = value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok());
            (!ok).then(|| MSG_DATETIME.to_string())
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn text_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

fn is_number(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok_and(f64::is_finite),
        _ => false,
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0),
        Value::String(s) => s.trim().parse::<i64>().is_ok(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_name_rejects_blank() {
        let err = validate_field(EntityType::Campaign, "name", &[json!("   ")]).unwrap_err();
        assert_eq!(err.field(), "name");
        assert_eq!(err.message(), MSG_REQUIRED);

        assert!(validate_field(EntityType::Campaign, "name", &[]).is_err());
        assert!(validate_field(EntityType::Campaign, "name", &[Value::Null]).is_err());
        assert!(validate_field(EntityType::Campaign, "name", &[json!("APT42")]).is_ok());
    }

    #[test]
    fn test_optional_field_accepts_empty() {
        assert!(validate_field(EntityType::Campaign, "description", &[json!("")]).is_ok());
        assert!(validate_field(EntityType::Campaign, "first_seen", &[]).is_ok());
    }

    #[test]
    fn test_unknown_field() {
        let err = validate_field(EntityType::Group, "color", &[json!("red")]).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownField { .. }));
    }

    #[test]
    fn test_country_description_length() {
        assert!(validate_field(EntityType::Country, "description", &[json!("ab")]).is_err());
        assert!(validate_field(EntityType::Country, "description", &[json!("abc")]).is_ok());
        let long = "x".repeat(5001);
        assert!(validate_field(EntityType::Country, "description", &[json!(long)]).is_err());
    }

    #[test]
    fn test_email_rule() {
        assert!(validate_field(EntityType::User, "user_email", &[json!("jane@example.org")]).is_ok());
        let err = validate_field(EntityType::User, "user_email", &[json!("jane")]).unwrap_err();
        assert_eq!(err.message(), MSG_EMAIL);
    }

    #[test]
    fn test_integer_rule() {
        assert!(validate_field(EntityType::KillChainPhase, "phase_order", &[json!(3)]).is_ok());
        assert!(validate_field(EntityType::KillChainPhase, "phase_order", &[json!("7")]).is_ok());
        assert!(validate_field(EntityType::KillChainPhase, "phase_order", &[json!("seven")]).is_err());
        assert!(validate_field(EntityType::KillChainPhase, "phase_order", &[json!(2.5)]).is_err());
    }

    #[test]
    fn test_one_of_and_datetime() {
        assert!(validate_field(EntityType::IntrusionSet, "sophistication", &[json!("expert")]).is_ok());
        assert!(validate_field(EntityType::IntrusionSet, "sophistication", &[json!("godlike")]).is_err());
        assert!(validate_field(
            EntityType::Campaign,
            "first_seen",
            &[json!("2020-03-24T10:51:20+00:00")]
        )
        .is_ok());
        assert!(validate_field(EntityType::Campaign, "first_seen", &[json!("yesterday")]).is_err());
    }

    #[test]
    fn test_list_field_checks_each_element() {
        assert!(validate_field(EntityType::Campaign, "alias", &[json!("a"), json!("b")]).is_ok());
        assert!(validate_field(EntityType::Campaign, "alias", &[]).is_ok());
    }

    #[test]
    fn test_validate_entity_requires_all_required_fields() {
        let input = json!({ "kill_chain_name": "mitre-attack", "phase_name": "persistence" });
        let err = validate_entity(EntityType::KillChainPhase, input.as_object().unwrap()).unwrap_err();
        assert_eq!(err.field(), "phase_order");

        let input = json!({ "kill_chain_name": "mitre-attack", "phase_name": "persistence", "phase_order": 5 });
        assert!(validate_entity(EntityType::KillChainPhase, input.as_object().unwrap()).is_ok());
    }

    #[test]
    fn test_normalize_values() {
        let name = EntityType::Campaign.schema().field("name").unwrap();
        assert_eq!(normalize_values(name, &[json!("a"), json!("b")]), json!("a"));
        assert_eq!(normalize_values(name, &[]), Value::Null);

        let alias = EntityType::Campaign.schema().field("alias").unwrap();
        assert_eq!(normalize_values(alias, &[json!("a"), json!("")]), json!(["a"]));
    }
}
