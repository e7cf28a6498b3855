//! The wire value: a dynamically-typed tagged tuple capable of holding null,
//! booleans, integers, byte strings, ordered sequences, and unordered keyed
//! maps, nested arbitrarily. Backed by `rmpv::Value` (MessagePack's dynamic
//! value type), which already matches this shape exactly.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use rmpv::Value;

#[derive(Debug, Error)]
pub enum ValueError {
    #[error("failed to decode value: {0}")]
    Decode(String),
    #[error("failed to encode value: {0}")]
    Encode(String),
}

pub fn encode(value: &Value) -> Result<Bytes, ValueError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| ValueError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

pub fn decode(bytes: &[u8]) -> Result<Value, ValueError> {
    let mut cursor = bytes;
    rmpv::decode::read_value(&mut cursor).map_err(|e| ValueError::Decode(e.to_string()))
}

/// Helper for building argument tuples the way handlers receive them:
/// `(args: array, kwargs: map)`.
pub fn encode_args_kwargs(args: &[Value], kwargs: &[(Value, Value)]) -> Value {
    Value::Array(vec![
        Value::Array(args.to_vec()),
        Value::Map(kwargs.to_vec()),
    ])
}

pub fn split_args_kwargs(value: Value) -> Option<(Vec<Value>, Vec<(Value, Value)>)> {
    let Value::Array(mut outer) = value else {
        return None;
    };
    if outer.len() != 2 {
        return None;
    }
    let kwargs = match outer.pop()? {
        Value::Map(m) => m,
        _ => return None,
    };
    let args = match outer.pop()? {
        Value::Array(a) => a,
        _ => return None,
    };
    Some((args, kwargs))
}

/// Encode a whole frame body into a fresh buffer — small convenience over
/// `encode` for call sites that immediately hand the result to the codec.
pub fn encode_into(value: &Value, out: &mut BytesMut) -> Result<(), ValueError> {
    let encoded = encode(value)?;
    out.extend_from_slice(&encoded);
    Ok(())
}

const LOST_CONNECTION_TAG: &str = "__junction_lost_connection__";

/// Sentinel item delivered as the final chunk of a stream whose sender
/// connection dropped mid-transmission, in place of a raised exception.
pub fn lost_connection() -> Value {
    Value::Map(vec![(Value::from(LOST_CONNECTION_TAG), Value::from(true))])
}

/// Whether `value` is the sentinel produced by [`lost_connection`].
pub fn is_lost_connection(value: &Value) -> bool {
    matches!(value, Value::Map(entries) if entries.len() == 1 && entries[0].0 == Value::from(LOST_CONNECTION_TAG))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nested_composite() {
        let value = Value::Map(vec![
            (Value::from("a"), Value::Array(vec![Value::from(1), Value::from(2)])),
            (Value::from("b"), Value::Nil),
            (Value::from("c"), Value::from(Bytes::from_static(b"raw").to_vec())),
        ]);
        let encoded = encode(&value).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn args_kwargs_round_trip() {
        let args = vec![Value::from(3)];
        let kwargs = vec![(Value::from("x"), Value::from(true))];
        let combined = encode_args_kwargs(&args, &kwargs);
        let (a, k) = split_args_kwargs(combined).unwrap();
        assert_eq!(a, args);
        assert_eq!(k, kwargs);
    }
}
