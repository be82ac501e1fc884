use anyhow::Context;
use serde_json::Value;

/// Convert a raw environment string into the JSON type of `current`.
///
/// Lists are comma separated and take the type of their first element.
/// A `null` current value (an unset `Option`) takes a JSON object or array
/// literal and otherwise stays a string, so `HTTPS_KEY=1234` names a file.
pub fn coerce(raw: &str, current: &Value) -> anyhow::Result<Value> {
    let raw = raw.trim();
    Ok(match current {
        Value::Bool(_) => Value::Bool(parse_bool(raw)?),
        Value::Number(n) if n.is_u64() || n.is_i64() => match raw.parse::<u64>() {
            Ok(v) => Value::from(v),
            Err(_) => Value::from(
                raw.parse::<i64>()
                    .with_context(|| format!("'{raw}' is not an integer"))?,
            ),
        },
        Value::Number(_) => Value::from(
            raw.parse::<f64>()
                .with_context(|| format!("'{raw}' is not a number"))?,
        ),
        Value::Array(items) => {
            let element = items.first().cloned().unwrap_or(Value::String(String::new()));
            Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|item| coerce(item, &element))
                    .collect::<anyhow::Result<Vec<_>>>()?,
            )
        }
        Value::Object(_) => {
            let parsed: Value =
                serde_json::from_str(raw).with_context(|| format!("'{raw}' is not valid JSON"))?;
            anyhow::ensure!(parsed.is_object(), "'{raw}' is not a JSON object");
            parsed
        }
        Value::Null => match serde_json::from_str::<Value>(raw) {
            Ok(v @ (Value::Object(_) | Value::Array(_))) => v,
            _ => Value::String(raw.to_string()),
        },
        Value::String(_) => Value::String(raw.to_string()),
    })
}

fn parse_bool(raw: &str) -> anyhow::Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("'{raw}' is not a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_follow_current_type() {
        assert_eq!(coerce("true", &json!(false)).unwrap(), json!(true));
        assert_eq!(coerce("0", &json!(true)).unwrap(), json!(false));
        assert_eq!(coerce("42", &json!(1)).unwrap(), json!(42));
        assert_eq!(coerce("-3", &json!(-1)).unwrap(), json!(-3));
        assert_eq!(coerce("0.25", &json!(1.0)).unwrap(), json!(0.25));
        assert_eq!(coerce("30s", &json!("5s")).unwrap(), json!("30s"));
    }

    #[test]
    fn lists_split_on_commas() {
        assert_eq!(
            coerce("a, b,c", &json!(["x"])).unwrap(),
            json!(["a", "b", "c"])
        );
        assert_eq!(coerce("1,2", &json!([0])).unwrap(), json!([1, 2]));
        assert_eq!(coerce("solo", &json!([])).unwrap(), json!(["solo"]));
    }

    #[test]
    fn objects_are_json() {
        assert_eq!(
            coerce(r#"{"console_level":"warn"}"#, &json!({})).unwrap(),
            json!({"console_level": "warn"})
        );
        assert!(coerce("[1]", &json!({})).is_err());
        assert!(coerce("not json", &json!({})).is_err());
    }

    #[test]
    fn null_keeps_scalars_as_strings() {
        assert_eq!(coerce("1234", &Value::Null).unwrap(), json!("1234"));
        assert_eq!(coerce("true", &Value::Null).unwrap(), json!("true"));
        assert_eq!(coerce("cert.pem", &Value::Null).unwrap(), json!("cert.pem"));
        assert_eq!(coerce("[1,2]", &Value::Null).unwrap(), json!([1, 2]));
        assert_eq!(coerce(r#"{"a":1}"#, &Value::Null).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn bad_values_are_errors() {
        assert!(coerce("maybe", &json!(true)).is_err());
        assert!(coerce("1.5", &json!(1)).is_err());
        assert!(coerce("ten", &json!(10)).is_err());
    }
}
