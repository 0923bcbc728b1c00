use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::CodecError;

/// Application payload carried by a data connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    List(Vec<DataValue>),
    Map(BTreeMap<String, DataValue>),
}

impl DataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            DataValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DataValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// JSON view; byte buffers become arrays of numbers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            DataValue::Null => JsonValue::Null,
            DataValue::Bool(value) => JsonValue::Bool(*value),
            DataValue::Int(value) => JsonValue::from(*value),
            DataValue::Float(value) => serde_json::Number::from_f64(*value)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            DataValue::Text(text) => JsonValue::String(text.clone()),
            DataValue::Bytes(bytes) => {
                JsonValue::Array(bytes.iter().map(|b| JsonValue::from(*b)).collect())
            }
            DataValue::List(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            DataValue::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
        }
    }
}

impl From<JsonValue> for DataValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => DataValue::Null,
            JsonValue::Bool(value) => DataValue::Bool(value),
            JsonValue::Number(number) => match number.as_i64() {
                Some(int) => DataValue::Int(int),
                None => DataValue::Float(number.as_f64().unwrap_or_default()),
            },
            JsonValue::String(text) => DataValue::Text(text),
            JsonValue::Array(items) => DataValue::List(items.into_iter().map(Into::into).collect()),
            JsonValue::Object(map) => DataValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, value.into()))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Text(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Text(value)
    }
}

impl From<Vec<u8>> for DataValue {
    fn from(value: Vec<u8>) -> Self {
        DataValue::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for DataValue {
    fn from(value: Bytes) -> Self {
        DataValue::Bytes(value)
    }
}

impl From<i64> for DataValue {
    fn from(value: i64) -> Self {
        DataValue::Int(value)
    }
}

impl From<bool> for DataValue {
    fn from(value: bool) -> Self {
        DataValue::Bool(value)
    }
}

/// Binary object serialization used by the binary data-connection modes.
pub trait Codec: Send + Sync {
    fn pack(&self, value: &DataValue) -> Result<Bytes, CodecError>;
    fn unpack(&self, bytes: &[u8]) -> Result<DataValue, CodecError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn pack(&self, value: &DataValue) -> Result<Bytes, CodecError> {
        bincode::serialize(value)
            .map(Bytes::from)
            .map_err(|err| CodecError::Encode(err.to_string()))
    }

    fn unpack(&self, bytes: &[u8]) -> Result<DataValue, CodecError> {
        bincode::deserialize(bytes).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bincode_handles_nested_values() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), DataValue::from("bob"));
        map.insert("blob".to_string(), DataValue::from(vec![0u8, 255, 7]));
        map.insert(
            "list".to_string(),
            DataValue::List(vec![DataValue::Int(-3), DataValue::Float(0.5), DataValue::Null]),
        );
        let value = DataValue::Map(map);
        let codec = BincodeCodec;
        let packed = codec.pack(&value).expect("pack");
        assert_eq!(codec.unpack(&packed).expect("unpack"), value);
    }

    #[test]
    fn garbage_fails_to_unpack() {
        let err = BincodeCodec.unpack(&[0xff, 0xff, 0xff, 0xff]).expect_err("garbage");
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn json_conversion_keeps_structure() {
        let json = json!({"a": [1, 2.5, "x", null, true]});
        let value = DataValue::from(json.clone());
        assert_eq!(value.get("a").map(|v| matches!(v, DataValue::List(_))), Some(true));
        assert_eq!(value.to_json(), json);
        assert_eq!(DataValue::from(vec![1u8, 2]).to_json(), json!([1, 2]));
    }
}
