//! Telemetry batch decoding and record enrichment.
//!
//! Every record pushed by the Telemetry API is flattened into a single JSON
//! object before it reaches a writer. The enrichment fields are written first,
//! so keys supplied by the record itself win on collision.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Environment variable holding the function's region.
pub const REGION_ENV: &str = "AWS_REGION";
/// Environment variable holding the function's name.
pub const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// A single entry of a pushed batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryRecord {
    /// Event type, e.g. `function` or `platform.start`.
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    pub record_type: String,
    /// RFC 3339 timestamp.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub time: String,
    /// Event payload.
    #[serde(default)]
    pub record: RecordBody,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Payload of a telemetry record.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Value")]
pub enum RecordBody {
    /// A log line, which may itself hold JSON.
    Text(String),
    /// A structured platform record.
    Object(Map<String, Value>),
    /// Anything else.
    Other(Value),
}

impl Default for RecordBody {
    fn default() -> Self {
        RecordBody::Other(Value::Null)
    }
}

impl From<Value> for RecordBody {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => RecordBody::Text(text),
            Value::Object(map) => RecordBody::Object(map),
            other => RecordBody::Other(other),
        }
    }
}

/// Failure to decode a pushed batch.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode telemetry batch")]
pub struct DecodeError(#[from] serde_json::Error);

/// Decodes the body of a Telemetry API push.
///
/// # Errors
///
/// Returns [`DecodeError`] if the body is not a JSON array of records.
pub fn decode_batch(body: &[u8]) -> Result<Vec<TelemetryRecord>, DecodeError> {
    Ok(serde_json::from_slice(body)?)
}

/// Function metadata added to every record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Enrichment {
    /// Region the function runs in.
    pub region: String,
    /// Name of the function.
    pub function_name: String,
}

impl Enrichment {
    /// Reads `AWS_REGION` and `AWS_LAMBDA_FUNCTION_NAME`, defaulting to empty.
    pub fn from_env() -> Self {
        Self {
            region: std::env::var(REGION_ENV).unwrap_or_default(),
            function_name: std::env::var(FUNCTION_NAME_ENV).unwrap_or_default(),
        }
    }
}

/// A flattened record as handed to writers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct EnrichedRecord(Map<String, Value>);

impl EnrichedRecord {
    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the fields of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the record as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Consumes the record, returning its fields.
    pub fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for EnrichedRecord {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Flattens `record` and adds `enrichment`.
///
/// - an object payload has its keys merged in
/// - a string payload holding a JSON object has that object's keys merged in
/// - any other string payload is stored under `message`
/// - any other payload is stored under `raw`
pub fn enrich(record: TelemetryRecord, enrichment: &Enrichment) -> EnrichedRecord {
    let mut fields = Map::new();
    fields.insert("time".to_string(), Value::String(record.time));
    fields.insert("record_type".to_string(), Value::String(record.record_type));
    fields.insert(
        "region".to_string(),
        Value::String(enrichment.region.clone()),
    );
    fields.insert(
        "function_name".to_string(),
        Value::String(enrichment.function_name.clone()),
    );

    match record.record {
        RecordBody::Object(map) => fields.extend(map),
        // A literal `null` string decodes to no object and adds nothing.
        RecordBody::Text(text) => match serde_json::from_str::<Option<Map<String, Value>>>(&text) {
            Ok(Some(map)) => fields.extend(map),
            Ok(None) => {}
            Err(_) => {
                fields.insert("message".to_string(), Value::String(text));
            }
        },
        RecordBody::Other(value) => {
            fields.insert("raw".to_string(), value);
        }
    }

    EnrichedRecord(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    fn enrichment() -> Enrichment {
        Enrichment {
            region: "us-east-1".to_string(),
            function_name: "fn".to_string(),
        }
    }

    fn enrich_one(batch: &str) -> Value {
        let mut records = decode_batch(batch.as_bytes()).unwrap();
        assert_eq!(records.len(), 1);
        enrich(records.remove(0), &enrichment()).to_value()
    }

    #[test]
    fn test_object_record() {
        let enriched = enrich_one(
            r#"[{"type":"function","time":"2024-01-01T00:00:00Z","record":{"msg":"hi","lvl":"info"}}]"#,
        );

        assert_eq!(
            enriched,
            json!({
                "time": "2024-01-01T00:00:00Z",
                "record_type": "function",
                "region": "us-east-1",
                "function_name": "fn",
                "msg": "hi",
                "lvl": "info"
            })
        );
    }

    #[test]
    fn test_string_record_holding_json() {
        let enriched = enrich_one(
            r#"[{"type":"function","time":"2024-01-01T00:00:00Z","record":"{\"k\":1}"}]"#,
        );

        assert_eq!(enriched["k"], json!(1));
        assert!(enriched.get("message").is_none());
        assert_eq!(enriched["record_type"], json!("function"));
    }

    #[test]
    fn test_string_record_matches_object_record() {
        let from_string = enrich_one(
            r#"[{"type":"function","time":"t","record":"{\"a\":[1,2],\"b\":{\"c\":true}}"}]"#,
        );
        let from_object =
            enrich_one(r#"[{"type":"function","time":"t","record":{"a":[1,2],"b":{"c":true}}}]"#);

        assert_eq!(from_string, from_object);
    }

    #[test]
    fn test_plain_text_record() {
        let enriched =
            enrich_one(r#"[{"type":"function","time":"2024-01-01T00:00:00Z","record":"oops"}]"#);

        assert_eq!(enriched["message"], json!("oops"));
        assert_eq!(enriched["function_name"], json!("fn"));
    }

    #[test]
    fn test_json_array_string_is_a_message() {
        let enriched = enrich_one(r#"[{"type":"function","time":"t","record":"[1,2]"}]"#);
        assert_eq!(enriched["message"], json!("[1,2]"));
    }

    #[test]
    fn test_unknown_record_shape() {
        let enriched = enrich_one(r#"[{"type":"platform.x","time":"t","record":42}]"#);

        assert_eq!(enriched["raw"], json!(42));
        assert_eq!(enriched["record_type"], json!("platform.x"));
    }

    #[test]
    fn test_missing_record_is_raw_null() {
        let enriched = enrich_one(r#"[{"type":"function","time":"t"}]"#);
        assert_eq!(enriched["raw"], Value::Null);
    }

    #[test]
    fn test_null_string_adds_nothing() {
        let enriched = enrich_one(r#"[{"type":"function","time":"t","record":"null"}]"#);

        assert_eq!(enriched.as_object().unwrap().len(), 4);
        assert!(enriched.get("message").is_none());
    }

    #[test]
    fn test_record_keys_override_enrichment() {
        let enriched = enrich_one(
            r#"[{"type":"function","time":"t","record":{"region":"eu-west-1","time":"override"}}]"#,
        );

        assert_eq!(enriched["region"], json!("eu-west-1"));
        assert_eq!(enriched["time"], json!("override"));
        assert_eq!(enriched["function_name"], json!("fn"));
    }

    #[test]
    fn test_decode_batch_preserves_order() {
        let records = decode_batch(
            br#"[
                {"type":"platform.start","time":"t1","record":{"requestId":"r"}},
                {"type":"function","time":"t2","record":"line"}
            ]"#,
        )
        .unwrap();

        assert_eq!(records[0].record_type, "platform.start");
        assert!(matches!(records[0].record, RecordBody::Object(_)));
        assert_eq!(records[1].time, "t2");
        assert_eq!(records[1].record, RecordBody::Text("line".to_string()));
    }

    #[test]
    fn test_null_type_and_time_do_not_drop_the_batch() {
        let records = decode_batch(
            br#"[
                {"type":null,"time":null,"record":"first"},
                {"type":"function","time":"t2","record":"second"}
            ]"#,
        )
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, "");
        assert_eq!(records[0].time, "");
        assert_eq!(records[1].record_type, "function");

        let enriched = enrich(records[0].clone(), &enrichment()).to_value();
        assert_eq!(enriched["record_type"], json!(""));
        assert_eq!(enriched["message"], json!("first"));
    }

    #[test]
    fn test_decode_batch_rejects_non_array() {
        assert!(decode_batch(b"{\"type\":\"function\"}").is_err());
        assert!(decode_batch(b"not json").is_err());
    }

    #[test]
    #[serial]
    fn test_enrichment_from_env() {
        temp_env::with_vars(
            [
                (REGION_ENV, Some("ap-southeast-2")),
                (FUNCTION_NAME_ENV, None::<&str>),
            ],
            || {
                let enrichment = Enrichment::from_env();
                assert_eq!(enrichment.region, "ap-southeast-2");
                assert_eq!(enrichment.function_name, "");
            },
        );
    }
}
