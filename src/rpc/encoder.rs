//! Payload encoders.
//!
//! An encoder turns `(action, args)` and `(code, result)` envelopes into
//! payload bytes and back. Named arguments travel as a string-keyed map.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::error::ApiError;

/// Named call arguments.
pub type Args = Map<String, Value>;

/// Arguments from a JSON object; anything else yields no arguments.
pub fn into_args(value: Value) -> Args {
    match value {
        Value::Object(map) => map,
        _ => Args::new(),
    }
}

pub trait Encoder: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode_request(&self, action: &str, args: &Args) -> Result<Vec<u8>, ApiError>;

    fn encode_response(&self, code: i32, result: &Value) -> Result<Vec<u8>, ApiError>;

    /// Decode a payload into a structured dictionary.
    fn decode(&self, payload: &[u8]) -> Option<Args>;

    fn try_get_request(&self, dict: &Args) -> Option<(String, Args)>;

    fn try_get_response(&self, dict: &Args) -> Option<(i32, Value)>;
}

impl<'a> dyn Encoder + 'a {
    /// Type-directed conversion of a decoded value.
    pub fn convert<T: DeserializeOwned>(&self, value: Value) -> Result<T, ApiError> {
        serde_json::from_value(value).map_err(ApiError::from)
    }
}

/// JSON envelopes: `{"action","args"}` and `{"code","result"}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, action: &str, args: &Args) -> Result<Vec<u8>, ApiError> {
        Ok(serde_json::to_vec(&json!({ "action": action, "args": args }))?)
    }

    fn encode_response(&self, code: i32, result: &Value) -> Result<Vec<u8>, ApiError> {
        Ok(serde_json::to_vec(&json!({ "code": code, "result": result }))?)
    }

    fn decode(&self, payload: &[u8]) -> Option<Args> {
        match serde_json::from_slice::<Value>(payload).ok()? {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    fn try_get_request(&self, dict: &Args) -> Option<(String, Args)> {
        let action = dict.get("action")?.as_str()?;
        if action.is_empty() {
            return None;
        }
        let args = match dict.get("args") {
            Some(Value::Object(args)) => args.clone(),
            None | Some(Value::Null) => Args::new(),
            Some(_) => return None,
        };
        Some((action.to_string(), args))
    }

    fn try_get_response(&self, dict: &Args) -> Option<(i32, Value)> {
        let code = i32::try_from(dict.get("code")?.as_i64()?).ok()?;
        let result = dict.get("result").cloned().unwrap_or(Value::Null);
        Some((code, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_envelope() {
        let encoder = JsonEncoder;
        let mut args = Args::new();
        args.insert("a".into(), json!(1));
        let payload = encoder.encode_request("Demo/Add", &args).unwrap();

        let dict = encoder.decode(&payload).unwrap();
        let (action, decoded) = encoder.try_get_request(&dict).unwrap();
        assert_eq!(action, "Demo/Add");
        assert_eq!(decoded["a"], json!(1));
        assert!(encoder.try_get_response(&dict).is_none());
    }

    #[test]
    fn non_envelopes_are_rejected() {
        let encoder = JsonEncoder;
        assert!(encoder.decode(b"[1,2]").is_none());
        assert!(encoder.decode(b"not json").is_none());
        let dict = encoder.decode(br#"{"action":""}"#).unwrap();
        assert!(encoder.try_get_request(&dict).is_none());
    }

    #[test]
    fn convert_through_trait_object() {
        let encoder: &dyn Encoder = &JsonEncoder;
        let value: Vec<u32> = encoder.convert(json!([1, 2])).unwrap();
        assert_eq!(value, vec![1, 2]);
        assert!(encoder.convert::<u32>(json!("x")).is_err());
    }
}
