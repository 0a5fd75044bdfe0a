//! Serializer registry: one string codec per shape tag.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::CodecError;
use crate::shape::ShapeTag;
use crate::value::{format_number, iso_string, Value};

/// Encodes cell values to the strings a storage area holds, and back.
///
/// `decode` must accept everything `encode` produces for the same codec.
pub trait Serializer: Send + Sync {
    fn encode(&self, value: &Value) -> Result<String, CodecError>;

    fn decode(&self, raw: &str) -> Result<Value, CodecError>;

    /// Shape this codec was registered for, `None` for caller-supplied codecs.
    fn tag(&self) -> Option<ShapeTag> {
        None
    }
}

impl fmt::Debug for dyn Serializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            Some(tag) => write!(f, "Serializer({})", tag),
            None => f.write_str("Serializer(custom)"),
        }
    }
}

/// Look up the built-in codec for a tag.
pub fn serializer_for(tag: ShapeTag) -> &'static dyn Serializer {
    match tag {
        ShapeTag::Any => &AnySerializer,
        ShapeTag::Set => &SetSerializer,
        ShapeTag::Map => &MapSerializer,
        ShapeTag::Date => &DateSerializer,
        ShapeTag::Boolean => &BooleanSerializer,
        ShapeTag::String => &StringSerializer,
        ShapeTag::Object => &ObjectSerializer,
        ShapeTag::Number => &NumberSerializer,
    }
}

fn mismatch(expected: &str, got: &Value) -> CodecError {
    CodecError::new(format!("expected {}, got {:?}", expected, got))
}

fn parse_json(raw: &str) -> Result<serde_json::Value, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::new(format!("invalid JSON: {}", e)))
}

fn json_array(raw: &str, what: &str) -> Result<Vec<serde_json::Value>, CodecError> {
    match parse_json(raw)? {
        serde_json::Value::Array(items) => Ok(items),
        other => Err(CodecError::new(format!(
            "expected a JSON array of {}, got {}",
            what, other
        ))),
    }
}

/// Passes stored strings through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnySerializer;

impl Serializer for AnySerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        Ok(value.to_string())
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        Ok(Value::String(raw.to_string()))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Any)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanSerializer;

impl Serializer for BooleanSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(mismatch("a boolean", other)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        match raw {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            other => Err(CodecError::new(format!("'{}' is not a boolean", other))),
        }
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Boolean)
    }
}

/// Decimal or exponent notation; rules out `inf`, `nan` and friends that
/// `f64::from_str` also takes.
fn is_decimal(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NumberSerializer;

impl Serializer for NumberSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Number(n) => Ok(format_number(*n)),
            other => Err(mismatch("a number", other)),
        }
    }

    /// Surrounding whitespace is ignored, as `Number()` does. Besides
    /// decimal and exponent notation only `NaN` and `Infinity` spellings
    /// are accepted.
    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        let trimmed = raw.trim();
        let n = match trimmed {
            "Infinity" | "+Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            "NaN" => f64::NAN,
            _ if !is_decimal(trimmed) => {
                return Err(CodecError::new(format!("'{}' is not a number", raw)));
            }
            _ => trimmed
                .parse::<f64>()
                .map_err(|e| CodecError::new(format!("'{}' is not a number: {}", raw, e)))?,
        };
        Ok(Value::Number(n))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Number)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl Serializer for StringSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            other => Err(mismatch("a string", other)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        Ok(Value::String(raw.to_string()))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::String)
    }
}

/// JSON text for objects and sequences.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectSerializer;

impl Serializer for ObjectSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        serde_json::to_string(&value.to_json())
            .map_err(|e| CodecError::new(format!("JSON encoding failed: {}", e)))
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        parse_json(raw).map(Value::from_json)
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Object)
    }
}

/// JSON array of members.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetSerializer;

impl Serializer for SetSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Set(_) => ObjectSerializer.encode(value),
            other => Err(mismatch("a set", other)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        let items = json_array(raw, "set members")?;
        Ok(Value::set_from(items.into_iter().map(Value::from_json)))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Set)
    }
}

/// JSON array of `[key, value]` pairs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MapSerializer;

impl Serializer for MapSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Map(_) => ObjectSerializer.encode(value),
            other => Err(mismatch("a map", other)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        let mut entries = Vec::new();
        for item in json_array(raw, "map entries")? {
            let pair = match item {
                serde_json::Value::Array(pair) => <[serde_json::Value; 2]>::try_from(pair)
                    .map_err(serde_json::Value::Array),
                other => Err(other),
            };
            match pair {
                Ok([k, v]) => entries.push((Value::from_json(k), Value::from_json(v))),
                Err(other) => {
                    return Err(CodecError::new(format!(
                        "map entry must be a [key, value] pair, got {}",
                        other
                    )))
                }
            }
        }
        Ok(Value::map_from(entries))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Map)
    }
}

/// ISO-8601 UTC with millisecond precision.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateSerializer;

impl Serializer for DateSerializer {
    fn encode(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Date(date) => Ok(iso_string(date)),
            other => Err(mismatch("a date", other)),
        }
    }

    fn decode(&self, raw: &str) -> Result<Value, CodecError> {
        DateTime::parse_from_rfc3339(raw.trim())
            .map(|d| Value::date(d.with_timezone(&Utc)))
            .map_err(|e| CodecError::new(format!("'{}' is not an ISO-8601 date: {}", raw, e)))
    }

    fn tag(&self) -> Option<ShapeTag> {
        Some(ShapeTag::Date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn round_trip(value: Value) {
        let tag = ShapeTag::infer(&value);
        let codec = serializer_for(tag);
        let encoded = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&encoded).unwrap(), value, "tag {}", tag);
    }

    #[test]
    fn test_round_trip_representative_values() {
        round_trip(Value::from("Storage Demo"));
        round_trip(Value::from(""));
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::from(42));
        round_trip(Value::Number(-0.125));
        round_trip(Value::Number(f64::INFINITY));
        round_trip(Value::from(json!({ "theme": "dark", "size": 3, "tags": ["a"] })));
        round_trip(Value::from(json!([1, "two", null, { "three": 3 }])));
        round_trip(Value::set_from(["a", "b"]));
        round_trip(Value::map_from([("a", 1), ("b", 2)]));
        round_trip(Value::Date(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        ));
    }

    #[test]
    fn test_number_encoding_matches_browser_strings() {
        assert_eq!(NumberSerializer.encode(&Value::from(0)).unwrap(), "0");
        assert_eq!(NumberSerializer.encode(&Value::from(5)).unwrap(), "5");
        assert_eq!(NumberSerializer.encode(&Value::Number(1.5)).unwrap(), "1.5");
        assert_eq!(NumberSerializer.decode("9").unwrap(), Value::from(9));
        assert_eq!(NumberSerializer.decode(" 9 ").unwrap(), Value::from(9));
        assert!(NumberSerializer.decode("nine").is_err());
        assert_eq!(NumberSerializer.decode("1e21").unwrap(), Value::Number(1e21));
    }

    #[test]
    fn test_number_rejects_foreign_special_spellings() {
        for raw in ["inf", "infinity", "+inf", "-inf", "nan", "+nan", "INFINITY", ""] {
            assert!(NumberSerializer.decode(raw).is_err(), "{:?} decoded", raw);
        }
        assert!(NumberSerializer.decode("-Infinity").is_ok());
        assert!(NumberSerializer.decode("NaN").is_ok());
    }

    #[test]
    fn test_boolean_rejects_other_strings() {
        assert!(BooleanSerializer.decode("yes").is_err());
        assert!(BooleanSerializer.encode(&Value::from(1)).is_err());
    }

    #[test]
    fn test_date_encoding() {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            DateSerializer.encode(&Value::Date(date)).unwrap(),
            "2024-01-02T03:04:05.000Z"
        );
        assert_eq!(
            DateSerializer.decode("2024-01-02T04:04:05+01:00").unwrap(),
            Value::Date(date)
        );
    }

    #[test]
    fn test_current_time_round_trips() {
        let now = Value::from(Utc::now());
        let encoded = DateSerializer.encode(&now).unwrap();
        assert_eq!(DateSerializer.decode(&encoded).unwrap(), now);

        // Sub-millisecond input is truncated on decode as well
        let decoded = DateSerializer.decode("2024-01-02T03:04:05.123456Z").unwrap();
        assert_eq!(
            DateSerializer.encode(&decoded).unwrap(),
            "2024-01-02T03:04:05.123Z"
        );
    }

    #[test]
    fn test_set_and_map_wire_format() {
        assert_eq!(
            SetSerializer.encode(&Value::set_from([1, 2])).unwrap(),
            "[1,2]"
        );
        assert_eq!(
            SetSerializer.decode("[1,1,2]").unwrap(),
            Value::set_from([1, 2])
        );
        assert_eq!(
            MapSerializer.encode(&Value::map_from([("k", true)])).unwrap(),
            r#"[["k",true]]"#
        );
        assert!(MapSerializer.decode(r#"[["k"]]"#).is_err());
        assert!(MapSerializer.decode(r#"{"k":1}"#).is_err());
    }

    #[test]
    fn test_any_passes_strings_through() {
        assert_eq!(AnySerializer.decode("{}").unwrap(), Value::from("{}"));
        assert_eq!(AnySerializer.encode(&Value::from("raw")).unwrap(), "raw");
        assert_eq!(AnySerializer.encode(&Value::from(3)).unwrap(), "3");
    }

    #[test]
    fn test_object_rejects_malformed_json() {
        let err = ObjectSerializer.decode("{not json").unwrap_err();
        assert!(err.message.contains("invalid JSON"));
    }

    #[test]
    fn test_registry_covers_every_tag() {
        for tag in ShapeTag::ALL {
            assert_eq!(serializer_for(tag).tag(), Some(tag));
        }
    }
}
