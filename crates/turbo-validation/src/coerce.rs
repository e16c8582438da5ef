//! Scalar coercion
//!
//! Raw request inputs arrive as strings (path, query, header, cookie, form) or
//! as loosely typed JSON. Coercion turns them into the target scalar type or
//! returns the short reason reported to the client ("invalid integer", ...).

use crate::config::CoercionMode;
use crate::types::{TypeDescriptor, Value};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const TRUE_WORDS: [&str; 5] = ["true", "1", "yes", "on", "t"];
const FALSE_WORDS: [&str; 5] = ["false", "0", "no", "off", "f"];

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Coerce a scalar value to `target`.
///
/// Containers (`List`, `Model`, `Optional`) are handled by the validator;
/// passing one here returns the value unchanged.
pub fn coerce_scalar(
    value: Value,
    target: &TypeDescriptor,
    mode: CoercionMode,
) -> Result<Value, &'static str> {
    let lax = mode == CoercionMode::Lax;
    match target {
        TypeDescriptor::Int => match value {
            Value::Int(_) => Ok(value),
            Value::Float(f) if lax && f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Ok(Value::Int(f as i64))
            }
            Value::String(ref s) if lax => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| "invalid integer"),
            _ => Err("invalid integer"),
        },
        TypeDescriptor::Float => match value {
            Value::Float(_) => Ok(value),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::String(ref s) if lax => match s.trim().parse::<f64>() {
                Ok(f) if f.is_finite() => Ok(Value::Float(f)),
                _ => Err("invalid float"),
            },
            _ => Err("invalid float"),
        },
        TypeDescriptor::Bool => match value {
            Value::Bool(_) => Ok(value),
            Value::Int(0) if lax => Ok(Value::Bool(false)),
            Value::Int(1) if lax => Ok(Value::Bool(true)),
            Value::String(ref s) if lax => {
                let word = s.trim().to_ascii_lowercase();
                if TRUE_WORDS.contains(&word.as_str()) {
                    Ok(Value::Bool(true))
                } else if FALSE_WORDS.contains(&word.as_str()) {
                    Ok(Value::Bool(false))
                } else {
                    Err("invalid boolean")
                }
            }
            _ => Err("invalid boolean"),
        },
        TypeDescriptor::String => match value {
            Value::String(_) => Ok(value),
            _ => Err("invalid string"),
        },
        TypeDescriptor::Bytes => match value {
            Value::Bytes(_) => Ok(value),
            Value::String(s) => Ok(Value::Bytes(s.into_bytes())),
            _ => Err("invalid bytes"),
        },
        TypeDescriptor::DateTime => match value {
            Value::DateTime(_) => Ok(value),
            Value::String(ref s) => parse_datetime(s.trim()).ok_or("invalid datetime"),
            Value::Int(ts) if lax => Utc
                .timestamp_opt(ts, 0)
                .single()
                .map(Value::from)
                .ok_or("invalid datetime"),
            _ => Err("invalid datetime"),
        },
        TypeDescriptor::List(_)
        | TypeDescriptor::Model(_)
        | TypeDescriptor::Optional(_)
        | TypeDescriptor::Any => Ok(value),
    }
}

/// RFC 3339 first, then naive ISO forms interpreted as UTC.
pub fn parse_datetime(s: &str) -> Option<Value> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(Value::DateTime(dt));
    }
    NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| Value::from(naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lax(value: Value, target: TypeDescriptor) -> Result<Value, &'static str> {
        coerce_scalar(value, &target, CoercionMode::Lax)
    }

    #[test]
    fn test_int_from_string() {
        assert_eq!(lax(Value::from("42"), TypeDescriptor::Int), Ok(Value::Int(42)));
        assert_eq!(lax(Value::from(" -7 "), TypeDescriptor::Int), Ok(Value::Int(-7)));
        assert_eq!(lax(Value::from("abc"), TypeDescriptor::Int), Err("invalid integer"));
        assert_eq!(lax(Value::from("4.2"), TypeDescriptor::Int), Err("invalid integer"));
    }

    #[test]
    fn test_int_from_float() {
        assert_eq!(lax(Value::Float(3.0), TypeDescriptor::Int), Ok(Value::Int(3)));
        assert_eq!(lax(Value::Float(3.5), TypeDescriptor::Int), Err("invalid integer"));
    }

    #[test]
    fn test_strict_rejects_strings() {
        let result = coerce_scalar(Value::from("42"), &TypeDescriptor::Int, CoercionMode::Strict);
        assert_eq!(result, Err("invalid integer"));
        // Widening is still fine in strict mode
        let result = coerce_scalar(Value::Int(2), &TypeDescriptor::Float, CoercionMode::Strict);
        assert_eq!(result, Ok(Value::Float(2.0)));
    }

    #[test]
    fn test_float() {
        assert_eq!(lax(Value::from("2.5"), TypeDescriptor::Float), Ok(Value::Float(2.5)));
        assert_eq!(lax(Value::from("inf"), TypeDescriptor::Float), Err("invalid float"));
        assert_eq!(lax(Value::Bool(true), TypeDescriptor::Float), Err("invalid float"));
    }

    #[test]
    fn test_bool_words() {
        assert_eq!(lax(Value::from("Yes"), TypeDescriptor::Bool), Ok(Value::Bool(true)));
        assert_eq!(lax(Value::from("off"), TypeDescriptor::Bool), Ok(Value::Bool(false)));
        assert_eq!(lax(Value::Int(1), TypeDescriptor::Bool), Ok(Value::Bool(true)));
        assert_eq!(lax(Value::from("maybe"), TypeDescriptor::Bool), Err("invalid boolean"));
    }

    #[test]
    fn test_string_does_not_stringify_numbers() {
        assert_eq!(lax(Value::Int(1), TypeDescriptor::String), Err("invalid string"));
    }

    #[test]
    fn test_datetime_forms() {
        let aware = lax(Value::from("2024-01-19T12:00:00+08:00"), TypeDescriptor::DateTime).unwrap();
        assert_eq!(aware.to_json(), serde_json::json!("2024-01-19T12:00:00+08:00"));

        let naive = lax(Value::from("2024-01-19T12:00:00"), TypeDescriptor::DateTime).unwrap();
        assert_eq!(naive.to_json(), serde_json::json!("2024-01-19T12:00:00Z"));

        let ts = lax(Value::Int(0), TypeDescriptor::DateTime).unwrap();
        assert_eq!(ts.to_json(), serde_json::json!("1970-01-01T00:00:00Z"));

        assert_eq!(
            lax(Value::from("yesterday"), TypeDescriptor::DateTime),
            Err("invalid datetime")
        );
    }
}
