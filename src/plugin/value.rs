//! Untyped values crossing the script boundary
//!
//! Script authors return whatever their code happens to produce, so the
//! accessors coerce leniently instead of failing: `"12"` reads as an int,
//! `"true"` as a boolean, `3` as the string `"3"`. Strict validation happens
//! once, when results are lifted into domain types.

use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ScriptValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ScriptValue>),
    Object(BTreeMap<String, ScriptValue>),
    /// Engine object with no data representation, tagged with its `typeof`
    Opaque(String),
}

impl ScriptValue {
    pub fn type_name(&self) -> &str {
        match self {
            ScriptValue::Null => "null",
            ScriptValue::Bool(_) => "boolean",
            ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::List(_) => "list",
            ScriptValue::Object(_) => "object",
            ScriptValue::Opaque(kind) => kind,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }

    /// Text form of scalars; `None` for null and containers
    pub fn as_string(&self) -> Option<String> {
        match self {
            ScriptValue::String(s) => Some(s.clone()),
            ScriptValue::Number(n) => Some(format_number(*n)),
            ScriptValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Like [`as_string`](Self::as_string) but treating blank text as absent
    pub fn as_non_empty_string(&self) -> Option<String> {
        self.as_string()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Number(n) if n.is_finite() => Some(n.trunc() as i64),
            ScriptValue::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            }
            ScriptValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ScriptValue::Number(n) => Some(*n),
            ScriptValue::String(s) => s.trim().parse().ok(),
            ScriptValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            ScriptValue::Bool(b) => Some(*b),
            ScriptValue::Number(n) => Some(*n != 0.0),
            ScriptValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ScriptValue>> {
        match self {
            ScriptValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Items of a list; a lone scalar or object reads as a one-item list
    pub fn as_list(&self) -> Option<Vec<ScriptValue>> {
        match self {
            ScriptValue::List(items) => Some(items.clone()),
            ScriptValue::Null | ScriptValue::Opaque(_) => None,
            other => Some(vec![other.clone()]),
        }
    }

    /// Field of an object, `None` for anything else
    pub fn get(&self, key: &str) -> Option<&ScriptValue> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Field of an object that is present and not null
    pub fn field(&self, key: &str) -> Option<&ScriptValue> {
        self.get(key).filter(|v| !v.is_null())
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            ScriptValue::Null | ScriptValue::Opaque(_) => JsonValue::Null,
            ScriptValue::Bool(b) => JsonValue::Bool(*b),
            ScriptValue::Number(n) if n.fract() == 0.0 && n.abs() < 9e15 => JsonValue::from(*n as i64),
            ScriptValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            ScriptValue::String(s) => JsonValue::String(s.clone()),
            ScriptValue::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            ScriptValue::Object(map) => JsonValue::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<JsonValue> for ScriptValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => ScriptValue::Null,
            JsonValue::Bool(b) => ScriptValue::Bool(b),
            JsonValue::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(0.0)),
            JsonValue::String(s) => ScriptValue::String(s),
            JsonValue::Array(items) => ScriptValue::List(items.into_iter().map(Into::into).collect()),
            JsonValue::Object(map) => {
                ScriptValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(value: &str) -> Self {
        ScriptValue::String(value.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        ScriptValue::String(value)
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        ScriptValue::Number(value as f64)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        ScriptValue::Bool(value)
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Opaque(kind) => write!(f, "[{}]", kind),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lenient_int() {
        assert_eq!(ScriptValue::from("42").as_int(), Some(42));
        assert_eq!(ScriptValue::from(" 7.9 ").as_int(), Some(7));
        assert_eq!(ScriptValue::Number(3.0).as_int(), Some(3));
        assert_eq!(ScriptValue::Bool(true).as_int(), Some(1));
        assert_eq!(ScriptValue::from("abc").as_int(), None);
        assert_eq!(ScriptValue::Null.as_int(), None);
    }

    #[test]
    fn test_lenient_boolean() {
        assert_eq!(ScriptValue::from("true").as_boolean(), Some(true));
        assert_eq!(ScriptValue::from("FALSE").as_boolean(), Some(false));
        assert_eq!(ScriptValue::from("1").as_boolean(), Some(true));
        assert_eq!(ScriptValue::Number(0.0).as_boolean(), Some(false));
        assert_eq!(ScriptValue::from("maybe").as_boolean(), None);
    }

    #[test]
    fn test_lenient_string() {
        assert_eq!(ScriptValue::Number(12.0).as_string().as_deref(), Some("12"));
        assert_eq!(ScriptValue::Number(1.5).as_string().as_deref(), Some("1.5"));
        assert_eq!(ScriptValue::Bool(false).as_string().as_deref(), Some("false"));
        assert_eq!(ScriptValue::from("  ").as_non_empty_string(), None);
        assert_eq!(ScriptValue::Null.as_string(), None);
    }

    #[test]
    fn test_list_and_map_access() {
        let value = ScriptValue::from(json!({
            "title": "Solo",
            "genres": ["action", "drama"],
            "author": null,
        }));

        assert_eq!(value.get("title").and_then(|v| v.as_string()).as_deref(), Some("Solo"));
        assert_eq!(value.field("genres").and_then(|v| v.as_list()).map(|l| l.len()), Some(2));
        assert!(value.get("author").is_some());
        assert!(value.field("author").is_none());

        // a single value is a one-element list
        assert_eq!(ScriptValue::from("x").as_list(), Some(vec![ScriptValue::from("x")]));
        assert_eq!(ScriptValue::Null.as_list(), None);
    }

    #[test]
    fn test_json_conversion() {
        let original = json!({"a": [1, "two", true, null], "b": {"c": 2.5}});
        let value = ScriptValue::from(original.clone());
        assert_eq!(value.to_json(), original.clone());
        assert_eq!(ScriptValue::Opaque("function".into()).to_json(), JsonValue::Null);
    }
}
