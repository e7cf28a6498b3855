//! The ten wire message types and their `(msg_type: u8, payload)` encoding.

use crate::value::{self, Value, ValueError};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Announce = 0,
    Unsubscribe = 1,
    Publish = 2,
    PublishIsChunked = 3,
    PublishChunk = 4,
    PublishEnd = 5,
    RpcRequest = 6,
    RpcResponse = 7,
    ProxyPublish = 8,
    ProxyRequest = 9,
    ProxyResponseCount = 10,
    ProxyResponse = 11,
    ProxyQueryCount = 12,
}

impl MsgType {
    pub fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            0 => Self::Announce,
            1 => Self::Unsubscribe,
            2 => Self::Publish,
            3 => Self::PublishIsChunked,
            4 => Self::PublishChunk,
            5 => Self::PublishEnd,
            6 => Self::RpcRequest,
            7 => Self::RpcResponse,
            8 => Self::ProxyPublish,
            9 => Self::ProxyRequest,
            10 => Self::ProxyResponseCount,
            11 => Self::ProxyResponse,
            12 => Self::ProxyQueryCount,
            _ => return None,
        })
    }
}

/// Result codes carried inside `RPC_RESPONSE` and `PROXY_RESPONSE`.
pub mod rc {
    pub const OK: i32 = 0;
    pub const NOHANDLER: i32 = 1;
    pub const NOMETHOD: i32 = 2;
    pub const KNOWN: i32 = 3;
    pub const UNKNOWN: i32 = 4;
    pub const UNSER_RESP: i32 = 5;
    pub const LOST_CONN: i32 = 6;
}

/// A decoded wire message. Payload shapes mirror §4.4/§6 of the
/// specification exactly.
#[derive(Debug, Clone)]
pub enum Message {
    Announce {
        target_type: u8,
        service: Value,
        mask: u64,
        value: u64,
    },
    Unsubscribe {
        target_type: u8,
        service: Value,
        mask: u64,
        value: u64,
    },
    Publish {
        service: Value,
        routing_id: u64,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    },
    PublishIsChunked {
        service: Value,
        routing_id: u64,
        method: String,
        counter: u64,
        kwargs: Vec<(Value, Value)>,
    },
    PublishChunk {
        counter: u64,
        item: Value,
    },
    PublishEnd {
        counter: u64,
    },
    RpcRequest {
        counter: u64,
        service: Value,
        routing_id: u64,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    },
    RpcResponse {
        counter: u64,
        rc: i32,
        result: Value,
    },
    ProxyPublish {
        service: Value,
        routing_id: u64,
        method: String,
        singular: bool,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    },
    ProxyRequest {
        client_counter: u64,
        service: Value,
        routing_id: u64,
        method: String,
        singular: bool,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    },
    ProxyResponseCount {
        client_counter: u64,
        total: i64,
    },
    ProxyResponse {
        client_counter: u64,
        rc: i32,
        result: Value,
    },
    ProxyQueryCount {
        service: Value,
        routing_id: u64,
        method: String,
    },
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("malformed payload for message type {0:?}")]
    Malformed(MsgType),
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Announce { .. } => MsgType::Announce,
            Self::Unsubscribe { .. } => MsgType::Unsubscribe,
            Self::Publish { .. } => MsgType::Publish,
            Self::PublishIsChunked { .. } => MsgType::PublishIsChunked,
            Self::PublishChunk { .. } => MsgType::PublishChunk,
            Self::PublishEnd { .. } => MsgType::PublishEnd,
            Self::RpcRequest { .. } => MsgType::RpcRequest,
            Self::RpcResponse { .. } => MsgType::RpcResponse,
            Self::ProxyPublish { .. } => MsgType::ProxyPublish,
            Self::ProxyRequest { .. } => MsgType::ProxyRequest,
            Self::ProxyResponseCount { .. } => MsgType::ProxyResponseCount,
            Self::ProxyResponse { .. } => MsgType::ProxyResponse,
            Self::ProxyQueryCount { .. } => MsgType::ProxyQueryCount,
        }
    }

    pub fn encode(&self) -> Result<bytes::Bytes, MessageError> {
        let payload = self.payload_value();
        let tagged = Value::Array(vec![Value::from(self.msg_type() as u8), payload]);
        Ok(value::encode(&tagged)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let decoded = value::decode(bytes)?;
        let Value::Array(mut outer) = decoded else {
            return Err(MessageError::Malformed(MsgType::Announce));
        };
        if outer.len() != 2 {
            return Err(MessageError::Malformed(MsgType::Announce));
        }
        let payload = outer.pop().unwrap();
        let tag = outer.pop().unwrap();
        let tag = tag.as_u64().ok_or(MessageError::UnknownType(0))? as u8;
        let msg_type = MsgType::from_u8(tag).ok_or(MessageError::UnknownType(tag))?;
        Self::from_payload(msg_type, payload)
    }

    fn payload_value(&self) -> Value {
        match self {
            Self::Announce {
                target_type,
                service,
                mask,
                value,
            } => Value::Array(vec![
                Value::from(*target_type),
                service.clone(),
                Value::from(*mask),
                Value::from(*value),
            ]),
            Self::Unsubscribe {
                target_type,
                service,
                mask,
                value,
            } => Value::Array(vec![
                Value::from(*target_type),
                service.clone(),
                Value::from(*mask),
                Value::from(*value),
            ]),
            Self::Publish {
                service,
                routing_id,
                method,
                args,
                kwargs,
            } => Value::Array(vec![
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
            Self::PublishIsChunked {
                service,
                routing_id,
                method,
                counter,
                kwargs,
            } => Value::Array(vec![
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
                Value::from(*counter),
                Value::Map(kwargs.clone()),
            ]),
            Self::PublishChunk { counter, item } => {
                Value::Array(vec![Value::from(*counter), item.clone()])
            }
            Self::PublishEnd { counter } => Value::Array(vec![Value::from(*counter)]),
            Self::RpcRequest {
                counter,
                service,
                routing_id,
                method,
                args,
                kwargs,
            } => Value::Array(vec![
                Value::from(*counter),
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
                Value::Array(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
            Self::RpcResponse {
                counter,
                rc,
                result,
            } => Value::Array(vec![Value::from(*counter), Value::from(*rc), result.clone()]),
            Self::ProxyPublish {
                service,
                routing_id,
                method,
                singular,
                args,
                kwargs,
            } => Value::Array(vec![
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
                Value::from(*singular),
                Value::Array(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
            Self::ProxyRequest {
                client_counter,
                service,
                routing_id,
                method,
                singular,
                args,
                kwargs,
            } => Value::Array(vec![
                Value::from(*client_counter),
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
                Value::from(*singular),
                Value::Array(args.clone()),
                Value::Map(kwargs.clone()),
            ]),
            Self::ProxyResponseCount {
                client_counter,
                total,
            } => Value::Array(vec![Value::from(*client_counter), Value::from(*total)]),
            Self::ProxyResponse {
                client_counter,
                rc,
                result,
            } => Value::Array(vec![
                Value::from(*client_counter),
                Value::from(*rc),
                result.clone(),
            ]),
            Self::ProxyQueryCount {
                service,
                routing_id,
                method,
            } => Value::Array(vec![
                service.clone(),
                Value::from(*routing_id),
                Value::from(method.as_str()),
            ]),
        }
    }

    fn from_payload(msg_type: MsgType, payload: Value) -> Result<Self, MessageError> {
        let Value::Array(mut f) = payload else {
            return Err(MessageError::Malformed(msg_type));
        };
        macro_rules! pop {
            () => {
                f.pop().ok_or(MessageError::Malformed(msg_type))?
            };
        }
        macro_rules! pop_front {
            () => {{
                if f.is_empty() {
                    return Err(MessageError::Malformed(msg_type));
                }
                f.remove(0)
            }};
        }
        macro_rules! as_u64 {
            ($v:expr) => {
                $v.as_u64().ok_or(MessageError::Malformed(msg_type))?
            };
        }
        macro_rules! as_i64 {
            ($v:expr) => {
                $v.as_i64().ok_or(MessageError::Malformed(msg_type))?
            };
        }
        macro_rules! as_str {
            ($v:expr) => {
                $v.as_str()
                    .ok_or(MessageError::Malformed(msg_type))?
                    .to_string()
            };
        }
        macro_rules! as_bool {
            ($v:expr) => {
                $v.as_bool().ok_or(MessageError::Malformed(msg_type))?
            };
        }
        macro_rules! as_array {
            ($v:expr) => {
                match $v {
                    Value::Array(a) => a,
                    _ => return Err(MessageError::Malformed(msg_type)),
                }
            };
        }
        macro_rules! as_map {
            ($v:expr) => {
                match $v {
                    Value::Map(m) => m,
                    _ => return Err(MessageError::Malformed(msg_type)),
                }
            };
        }

        Ok(match msg_type {
            MsgType::Announce | MsgType::Unsubscribe => {
                if f.len() != 4 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let target_type = as_u64!(pop_front!()) as u8;
                let service = pop_front!();
                let mask = as_u64!(pop_front!());
                let value = as_u64!(pop_front!());
                if matches!(msg_type, MsgType::Announce) {
                    Self::Announce {
                        target_type,
                        service,
                        mask,
                        value,
                    }
                } else {
                    Self::Unsubscribe {
                        target_type,
                        service,
                        mask,
                        value,
                    }
                }
            }
            MsgType::Publish => {
                if f.len() != 5 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                let args = as_array!(pop_front!());
                let kwargs = as_map!(pop_front!());
                Self::Publish {
                    service,
                    routing_id,
                    method,
                    args,
                    kwargs,
                }
            }
            MsgType::PublishIsChunked => {
                if f.len() != 5 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                let counter = as_u64!(pop_front!());
                let kwargs = as_map!(pop_front!());
                Self::PublishIsChunked {
                    service,
                    routing_id,
                    method,
                    counter,
                    kwargs,
                }
            }
            MsgType::PublishChunk => {
                if f.len() != 2 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let counter = as_u64!(pop_front!());
                let item = pop_front!();
                Self::PublishChunk { counter, item }
            }
            MsgType::PublishEnd => {
                if f.len() != 1 {
                    return Err(MessageError::Malformed(msg_type));
                }
                Self::PublishEnd {
                    counter: as_u64!(pop_front!()),
                }
            }
            MsgType::RpcRequest => {
                if f.len() != 6 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let counter = as_u64!(pop_front!());
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                let args = as_array!(pop_front!());
                let kwargs = as_map!(pop_front!());
                Self::RpcRequest {
                    counter,
                    service,
                    routing_id,
                    method,
                    args,
                    kwargs,
                }
            }
            MsgType::RpcResponse => {
                if f.len() != 3 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let counter = as_u64!(pop_front!());
                let rc = as_i64!(pop_front!()) as i32;
                let result = pop_front!();
                Self::RpcResponse {
                    counter,
                    rc,
                    result,
                }
            }
            MsgType::ProxyPublish => {
                if f.len() != 6 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                let singular = as_bool!(pop_front!());
                let args = as_array!(pop_front!());
                let kwargs = as_map!(pop_front!());
                Self::ProxyPublish {
                    service,
                    routing_id,
                    method,
                    singular,
                    args,
                    kwargs,
                }
            }
            MsgType::ProxyRequest => {
                if f.len() != 7 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let client_counter = as_u64!(pop_front!());
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                let singular = as_bool!(pop_front!());
                let args = as_array!(pop_front!());
                let kwargs = as_map!(pop_front!());
                Self::ProxyRequest {
                    client_counter,
                    service,
                    routing_id,
                    method,
                    singular,
                    args,
                    kwargs,
                }
            }
            MsgType::ProxyResponseCount => {
                if f.len() != 2 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let client_counter = as_u64!(pop_front!());
                let total = as_i64!(pop_front!());
                Self::ProxyResponseCount {
                    client_counter,
                    total,
                }
            }
            MsgType::ProxyResponse => {
                if f.len() != 3 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let client_counter = as_u64!(pop_front!());
                let rc = as_i64!(pop_front!()) as i32;
                let result = pop_front!();
                Self::ProxyResponse {
                    client_counter,
                    rc,
                    result,
                }
            }
            MsgType::ProxyQueryCount => {
                if f.len() != 3 {
                    return Err(MessageError::Malformed(msg_type));
                }
                let service = pop_front!();
                let routing_id = as_u64!(pop_front!());
                let method = as_str!(pop_front!());
                Self::ProxyQueryCount {
                    service,
                    routing_id,
                    method,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_round_trips() {
        let msg = Message::Publish {
            service: Value::from("svc"),
            routing_id: 42,
            method: "m".into(),
            args: vec![Value::from(1)],
            kwargs: vec![],
        };
        let encoded = msg.encode().unwrap();
        let decoded = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Publish {
                service,
                routing_id,
                method,
                args,
                ..
            } => {
                assert_eq!(service, Value::from("svc"));
                assert_eq!(routing_id, 42);
                assert_eq!(method, "m");
                assert_eq!(args, vec![Value::from(1)]);
            }
            _ => panic!("wrong variant decoded"),
        }
    }

    #[test]
    fn rpc_request_response_round_trip() {
        let req = Message::RpcRequest {
            counter: 7,
            service: Value::from("s"),
            routing_id: 0,
            method: "square".into(),
            args: vec![Value::from(3)],
            kwargs: vec![],
        };
        assert_eq!(req.msg_type(), MsgType::RpcRequest);
        let encoded = req.encode().unwrap();
        assert!(matches!(
            Message::decode(&encoded).unwrap(),
            Message::RpcRequest { counter: 7, .. }
        ));

        let resp = Message::RpcResponse {
            counter: 7,
            rc: rc::OK,
            result: Value::from(9),
        };
        let encoded = resp.encode().unwrap();
        assert!(matches!(
            Message::decode(&encoded).unwrap(),
            Message::RpcResponse { counter: 7, rc: 0, .. }
        ));
    }

    #[test]
    fn unknown_msg_type_rejected() {
        let tagged = Value::Array(vec![Value::from(99u8), Value::Nil]);
        let encoded = value::encode(&tagged).unwrap();
        assert!(matches!(
            Message::decode(&encoded),
            Err(MessageError::UnknownType(99))
        ));
    }
}
