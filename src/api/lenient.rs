//! Tolerant numeric deserializers. The upstream API serializes large
//! counters as JSON strings in some deployments and as numbers in
//! others, and has shipped the occasional garbage field. A bad field
//! falls back to its default instead of rejecting the whole record.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

fn number<T>(value: &Value) -> Option<T>
where
    T: std::str::FromStr + TryFrom<u64>,
{
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| T::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn u64_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number(&value).unwrap_or_default())
}

pub fn u128_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number(&value).unwrap_or_default())
}

pub fn u128_opt<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_null() {
        return Ok(None);
    }
    Ok(number(&value))
}

pub fn i64_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or_default())
}

pub fn f64_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "super::u64_or_default", default)]
        n: u64,
        #[serde(deserialize_with = "super::f64_or_default", default)]
        f: f64,
    }

    #[test]
    fn test_accepts_string_and_number_forms() {
        let a: Probe = serde_json::from_str(r#"{"n": 17, "f": "2.5"}"#).expect("number form");
        assert_eq!(a.n, 17);
        assert_eq!(a.f, 2.5);

        let b: Probe = serde_json::from_str(r#"{"n": " 17 ", "f": 2.5}"#).expect("string form");
        assert_eq!(b.n, 17);
    }

    #[test]
    fn test_garbage_falls_back_to_default() {
        let p: Probe = serde_json::from_str(r#"{"n": [1], "f": {}}"#).expect("still decodes");
        assert_eq!(p.n, 0);
        assert_eq!(p.f, 0.0);
    }
}
