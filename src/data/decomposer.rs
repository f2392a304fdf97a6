//! Decomposition of the raw feed into a snapshot and per-city records
//!
//! The feed is a JSON object with a `gasprices` array. Each element of that
//! array becomes one [`CityRecord`], keyed by its `city_id`. A single bad
//! element fails the whole decomposition, so a partial snapshot is never
//! produced.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{ser::PrettyFormatter, Map, Value};
use thiserror::Error;

use super::{CityId, CityRecord, RawPayload, Snapshot};

/// Name of the top-level array holding the city entries
const GAS_PRICES_FIELD: &str = "gasprices";

/// Name of the identifier field in each city entry
const CITY_ID_FIELD: &str = "city_id";

/// Name of the display name field in each city entry
const CITY_NAME_FIELD: &str = "name";

/// Indent used when pretty-printing the stored snapshot
const SNAPSHOT_INDENT: &[u8] = b"   ";

/// Errors that can occur when decomposing the feed
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The payload is not the shape the feed is documented to have
    #[error("Malformed feed: {0}")]
    Malformed(String),
}

/// Parses the payload and splits it into one record per city
///
/// # Returns
/// * `Ok(Snapshot)` - the pretty-printed payload and its city records
/// * `Err(DecodeError::Malformed)` - if the payload is not an object, has no
///   `gasprices` array, or any element lacks a usable `city_id`
pub fn decompose(payload: &RawPayload) -> Result<Snapshot, DecodeError> {
    let value: Value = serde_json::from_str(&payload.body)
        .map_err(|e| DecodeError::Malformed(format!("Invalid JSON: {}", e)))?;

    let root = value
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("Top-level value is not an object".to_string()))?;

    let entries = root
        .get(GAS_PRICES_FIELD)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            DecodeError::Malformed(format!("Missing \"{}\" array", GAS_PRICES_FIELD))
        })?;

    let mut cities = BTreeMap::new();
    // Reverse order so that the first occurrence of a duplicated id wins.
    for (index, entry) in entries.iter().enumerate().rev() {
        let record = decompose_entry(index, entry)?;
        cities.insert(record.city_id, record);
    }

    Ok(Snapshot {
        retrieved_at: payload.retrieved_at,
        raw: to_pretty_string(&value)?,
        cities,
    })
}

/// Turns one element of the `gasprices` array into a record
fn decompose_entry(index: usize, entry: &Value) -> Result<CityRecord, DecodeError> {
    let fields = entry.as_object().ok_or_else(|| {
        DecodeError::Malformed(format!("Entry {} of \"{}\" is not an object", index, GAS_PRICES_FIELD))
    })?;

    let city_id = fields
        .get(CITY_ID_FIELD)
        .ok_or_else(|| {
            DecodeError::Malformed(format!("Entry {} is missing \"{}\"", index, CITY_ID_FIELD))
        })
        .and_then(|value| parse_city_id(index, value))?;

    let name = fields
        .get(CITY_NAME_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);

    let payload = serde_json::to_string(entry)
        .map_err(|e| DecodeError::Malformed(format!("Cannot serialize entry {}: {}", index, e)))?;

    Ok(CityRecord {
        city_id,
        name,
        fields: fields.clone(),
        payload,
    })
}

/// Reads a city id from a number or a string holding an integer
fn parse_city_id(index: usize, value: &Value) -> Result<CityId, DecodeError> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<CityId>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        DecodeError::Malformed(format!(
            "Entry {} has a non-integer \"{}\": {}",
            index, CITY_ID_FIELD, value
        ))
    })
}

/// Serializes a value with the snapshot indent
fn to_pretty_string(value: &Value) -> Result<String, DecodeError> {
    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(SNAPSHOT_INDENT));
    value
        .serialize(&mut serializer)
        .map_err(|e| DecodeError::Malformed(format!("Cannot serialize snapshot: {}", e)))?;
    String::from_utf8(buf).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Parses a stored city payload back into its fields
pub fn parse_city_payload(payload: &str) -> Result<Map<String, Value>, DecodeError> {
    match serde_json::from_str(payload) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(_) => Err(DecodeError::Malformed("City payload is not an object".to_string())),
        Err(e) => Err(DecodeError::Malformed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(body: &str) -> RawPayload {
        RawPayload::new(body)
    }

    #[test]
    fn test_decompose_yields_one_record_per_city() {
        let feed = json!({
            "gasprices": [
                {"city_id": 1, "name": "Toronto", "regular": 128.9},
                {"city_id": 2, "name": "Ottawa", "regular": 131.4},
                {"city_id": 3, "name": "Hamilton", "regular": 127.5}
            ]
        });
        let snapshot = decompose(&payload(&feed.to_string())).unwrap();

        assert_eq!(snapshot.city_count(), 3);
        assert_eq!(snapshot.cities.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(snapshot.cities[&2].name.as_deref(), Some("Ottawa"));
    }

    #[test]
    fn test_city_payload_matches_original_element() {
        let elements = vec![
            json!({"city_id": 5, "name": "A", "regular": 120.1, "tomorrow": "+1"}),
            json!({"city_id": 7, "name": "B", "regular": 119.0, "tomorrow": "-2"}),
        ];
        let feed = json!({ "gasprices": elements.clone() });
        let snapshot = decompose(&payload(&feed.to_string())).unwrap();

        for element in elements {
            let id = element["city_id"].as_i64().unwrap();
            let record = &snapshot.cities[&id];
            let reparsed = parse_city_payload(&record.payload).unwrap();
            assert_eq!(Value::Object(reparsed), element);
            assert_eq!(Value::Object(record.fields.clone()), element);
        }
    }

    #[test]
    fn test_city_payload_is_compact() {
        let snapshot = decompose(&payload(r#"{"gasprices":[{"city_id":5,"name":"A"}]}"#)).unwrap();
        assert_eq!(snapshot.cities[&5].payload, r#"{"city_id":5,"name":"A"}"#);
    }

    #[test]
    fn test_raw_snapshot_uses_three_space_indent() {
        let snapshot = decompose(&payload(r#"{"gasprices":[{"city_id":5}]}"#)).unwrap();
        let expected = "{\n   \"gasprices\": [\n      {\n         \"city_id\": 5\n      }\n   ]\n}";
        assert_eq!(snapshot.raw, expected);
    }

    #[test]
    fn test_snapshot_keeps_retrieval_time() {
        let raw = payload(r#"{"gasprices":[]}"#);
        let snapshot = decompose(&raw).unwrap();
        assert_eq!(snapshot.retrieved_at, raw.retrieved_at);
        assert_eq!(snapshot.city_count(), 0);
    }

    #[test]
    fn test_missing_gasprices_is_malformed() {
        let result = decompose(&payload(r#"{"prices":[]}"#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
        assert!(result.unwrap_err().to_string().contains("gasprices"));
    }

    #[test]
    fn test_gasprices_not_array_is_malformed() {
        let result = decompose(&payload(r#"{"gasprices":{"city_id":1}}"#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_top_level_array_is_malformed() {
        let result = decompose(&payload(r#"[{"city_id":1}]"#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let result = decompose(&payload(r#"{"gasprices": ["#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_missing_city_id_aborts_whole_decomposition() {
        let result = decompose(&payload(
            r#"{"gasprices":[{"city_id":1,"name":"A"},{"name":"no id"},{"city_id":3}]}"#,
        ));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("city_id"));
    }

    #[test]
    fn test_non_object_entry_is_malformed() {
        let result = decompose(&payload(r#"{"gasprices":[{"city_id":1}, 42]}"#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_string_city_id_is_accepted() {
        let snapshot = decompose(&payload(r#"{"gasprices":[{"city_id":"12"}]}"#)).unwrap();
        assert!(snapshot.cities.contains_key(&12));
    }

    #[test]
    fn test_fractional_city_id_is_malformed() {
        let result = decompose(&payload(r#"{"gasprices":[{"city_id":1.5}]}"#));
        assert!(matches!(result, Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_duplicate_city_id_keeps_first_occurrence() {
        let snapshot = decompose(&payload(
            r#"{"gasprices":[{"city_id":4,"name":"first"},{"city_id":4,"name":"second"}]}"#,
        ))
        .unwrap();
        assert_eq!(snapshot.city_count(), 1);
        assert_eq!(snapshot.cities[&4].name.as_deref(), Some("first"));
    }

    #[test]
    fn test_parse_city_payload_rejects_non_object() {
        assert!(parse_city_payload("[1,2]").is_err());
        assert!(parse_city_payload("not json").is_err());
    }
}
