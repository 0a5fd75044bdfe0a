use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Classification of a default value, used to pick its serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeTag {
    Any,
    Set,
    Map,
    Date,
    Boolean,
    String,
    Object,
    Number,
}

impl ShapeTag {
    pub const ALL: [ShapeTag; 8] = [
        ShapeTag::Any,
        ShapeTag::Set,
        ShapeTag::Map,
        ShapeTag::Date,
        ShapeTag::Boolean,
        ShapeTag::String,
        ShapeTag::Object,
        ShapeTag::Number,
    ];

    /// Infer the tag for an initial value.
    ///
    /// Checks run most-specific first: sets, maps and dates would otherwise
    /// all count as generic objects.
    pub fn infer(value: &Value) -> ShapeTag {
        match value {
            Value::Null => ShapeTag::Any,
            Value::Set(_) => ShapeTag::Set,
            Value::Map(_) => ShapeTag::Map,
            Value::Date(_) => ShapeTag::Date,
            Value::Bool(_) => ShapeTag::Boolean,
            Value::String(_) => ShapeTag::String,
            Value::Object(_) | Value::Array(_) => ShapeTag::Object,
            Value::Number(n) if n.is_nan() => ShapeTag::Any,
            Value::Number(_) => ShapeTag::Number,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeTag::Any => "any",
            ShapeTag::Set => "set",
            ShapeTag::Map => "map",
            ShapeTag::Date => "date",
            ShapeTag::Boolean => "boolean",
            ShapeTag::String => "string",
            ShapeTag::Object => "object",
            ShapeTag::Number => "number",
        }
    }
}

impl fmt::Display for ShapeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    #[test]
    fn test_infer_each_shape() {
        assert_eq!(ShapeTag::infer(&Value::Null), ShapeTag::Any);
        assert_eq!(ShapeTag::infer(&Value::set_from([1, 2])), ShapeTag::Set);
        assert_eq!(ShapeTag::infer(&Value::map_from([("k", 1)])), ShapeTag::Map);
        assert_eq!(ShapeTag::infer(&Value::Date(Utc::now())), ShapeTag::Date);
        assert_eq!(ShapeTag::infer(&Value::Bool(false)), ShapeTag::Boolean);
        assert_eq!(ShapeTag::infer(&Value::from("")), ShapeTag::String);
        assert_eq!(
            ShapeTag::infer(&Value::Object(BTreeMap::new())),
            ShapeTag::Object
        );
        assert_eq!(ShapeTag::infer(&Value::from(vec![1, 2])), ShapeTag::Object);
        assert_eq!(ShapeTag::infer(&Value::Number(0.0)), ShapeTag::Number);
    }

    #[test]
    fn test_nan_is_any() {
        assert_eq!(ShapeTag::infer(&Value::Number(f64::NAN)), ShapeTag::Any);
        assert_eq!(
            ShapeTag::infer(&Value::Number(f64::INFINITY)),
            ShapeTag::Number
        );
    }

    #[test]
    fn test_empty_collections_keep_their_shape() {
        assert_eq!(ShapeTag::infer(&Value::Set(vec![])), ShapeTag::Set);
        assert_eq!(ShapeTag::infer(&Value::Map(vec![])), ShapeTag::Map);
        assert_eq!(ShapeTag::infer(&Value::Array(vec![])), ShapeTag::Object);
    }

    #[test]
    fn test_tag_names() {
        let names: Vec<_> = ShapeTag::ALL.iter().map(|t| t.to_string()).collect();
        assert_eq!(
            names,
            ["any", "set", "map", "date", "boolean", "string", "object", "number"]
        );
    }
}
