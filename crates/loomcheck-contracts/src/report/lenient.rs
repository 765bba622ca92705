use std::fmt;

use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;

/// Accepts `3`, `3.0` and `"3"`; null reads as zero.
pub fn u32_from_any<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(CountVisitor)
}

pub fn u32_opt_from_any<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => count_from_value(&value).map(Some).map_err(de::Error::custom),
    }
}

pub fn f64_from_any<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(0.0),
        Value::Number(number) => number
            .as_f64()
            .ok_or_else(|| de::Error::custom("number out of range")),
        Value::String(text) => parse_numeric_text(text)
            .ok_or_else(|| de::Error::custom(format!("expected a number, got \"{text}\""))),
        other => Err(de::Error::custom(format!("expected a number, got {other}"))),
    }
}

/// Numbers and `{"label": ..}` objects are rendered as text.
pub fn string_from_any<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(text_of(&value))
}

/// Like `string_from_any`, but null and blank text read as `None`.
pub fn string_opt_from_any<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .map(|value| text_of(&value))
        .filter(|text| !text.trim().is_empty()))
}

/// Accepts `true`, `"false"`, `"yes"`, `1` and friends; null reads as false.
pub fn bool_from_any<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match &value {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(*flag),
        Value::Number(number) => Ok(number.as_f64().map(|raw| raw != 0.0).unwrap_or(false)),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(true),
            "false" | "no" | "n" | "0" | "" | "none" => Ok(false),
            _ => Err(de::Error::custom(format!("expected a boolean, got \"{text}\""))),
        },
        other => Err(de::Error::custom(format!("expected a boolean, got {other}"))),
    }
}

pub fn string_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(StringListVisitor)
}

fn count_from_value(value: &Value) -> Result<u32, String> {
    match value {
        Value::Number(number) => {
            if let Some(raw) = number.as_u64() {
                return u32::try_from(raw).map_err(|_| format!("count {raw} out of range"));
            }
            match number.as_f64() {
                Some(raw) if raw >= 0.0 && raw <= f64::from(u32::MAX) => Ok(raw.round() as u32),
                _ => Err(format!("expected a non-negative count, got {number}")),
            }
        }
        Value::String(text) => parse_numeric_text(text)
            .filter(|raw| *raw >= 0.0 && *raw <= f64::from(u32::MAX))
            .map(|raw| raw.round() as u32)
            .ok_or_else(|| format!("expected a count, got \"{text}\"")),
        other => Err(format!("expected a count, got {other}")),
    }
}

fn parse_numeric_text(text: &str) -> Option<f64> {
    let trimmed = text.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Object(map) => ["label", "name", "item", "text"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    }
}

struct CountVisitor;

impl<'de> Visitor<'de> for CountVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a non-negative count")
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<u32, E> {
        u32::try_from(value).map_err(|_| E::custom(format!("count {value} out of range")))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<u32, E> {
        u32::try_from(value).map_err(|_| E::custom(format!("count {value} out of range")))
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<u32, E> {
        count_from_value(&Value::from(value)).map_err(E::custom)
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<u32, E> {
        count_from_value(&Value::String(value.to_string())).map_err(E::custom)
    }

    fn visit_unit<E: de::Error>(self) -> Result<u32, E> {
        Ok(0)
    }
}

struct StringListVisitor;

impl<'de> Visitor<'de> for StringListVisitor {
    type Value = Vec<String>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a list of labels")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<String>, A::Error> {
        let mut out = Vec::new();
        while let Some(value) = seq.next_element::<Value>()? {
            let text = text_of(&value);
            if !text.trim().is_empty() {
                out.push(text);
            }
        }
        Ok(out)
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Vec<String>, E> {
        Ok(value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn visit_map<A: MapAccess<'de>>(self, map: A) -> Result<Vec<String>, A::Error> {
        let value = Value::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(vec![text_of(&value)])
    }

    fn visit_unit<E: de::Error>(self) -> Result<Vec<String>, E> {
        Ok(Vec::new())
    }
}
