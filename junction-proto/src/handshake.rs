//! Handshake payload: sans-IO encode/decode of the first body exchanged over
//! a new connection. The actual socket exchange (write, then block on read,
//! before any application traffic may flow) is driven by the peer
//! connection in the facade crate — this module only knows the wire shape.

use crate::value::{Value, ValueError};
use junction_core::ident::{Ident, PROTOCOL_VERSION};
use thiserror::Error;

/// One subscription snapshot entry exchanged at handshake time:
/// `(msg_type, service, mask, value)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSnapshot {
    pub msg_type: u8,
    pub service: Value,
    pub mask: u64,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub version: u16,
    pub ident: Ident,
    pub subscriptions: Vec<SubscriptionSnapshot>,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake malformed: {0}")]
    Malformed(&'static str),
    #[error("handshake version mismatch: local {local} remote {remote}")]
    VersionMismatch { local: u16, remote: u16 },
    #[error(transparent)]
    Value(#[from] ValueError),
}

impl Handshake {
    pub fn new(ident: Ident, subscriptions: Vec<SubscriptionSnapshot>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            ident,
            subscriptions,
        }
    }

    pub fn encode(&self) -> Result<bytes::Bytes, HandshakeError> {
        let ident = Value::Array(vec![
            Value::from(self.ident.host.as_str()),
            Value::from(self.ident.port),
            Value::from(self.ident.version),
            Value::from(self.ident.reserved),
        ]);
        let subs = Value::Array(
            self.subscriptions
                .iter()
                .map(|s| {
                    Value::Array(vec![
                        Value::from(s.msg_type),
                        s.service.clone(),
                        Value::from(s.mask),
                        Value::from(s.value),
                    ])
                })
                .collect(),
        );
        let body = Value::Array(vec![Value::from(self.version), ident, subs]);
        Ok(crate::value::encode(&body)?)
    }

    pub fn decode(bytes: &[u8], expected_version: u16) -> Result<Self, HandshakeError> {
        let decoded = crate::value::decode(bytes)?;
        let Value::Array(mut fields) = decoded else {
            return Err(HandshakeError::Malformed("expected an array"));
        };
        if fields.len() != 3 {
            return Err(HandshakeError::Malformed("expected 3 fields"));
        }
        let subs_v = fields.pop().unwrap();
        let ident_v = fields.pop().unwrap();
        let version = fields
            .pop()
            .unwrap()
            .as_u64()
            .ok_or(HandshakeError::Malformed("version"))? as u16;

        if version != expected_version {
            return Err(HandshakeError::VersionMismatch {
                local: expected_version,
                remote: version,
            });
        }

        let Value::Array(mut ident_fields) = ident_v else {
            return Err(HandshakeError::Malformed("ident"));
        };
        if ident_fields.len() != 4 {
            return Err(HandshakeError::Malformed("ident arity"));
        }
        let reserved = ident_fields
            .pop()
            .unwrap()
            .as_u64()
            .ok_or(HandshakeError::Malformed("reserved"))? as u32;
        let ident_version = ident_fields
            .pop()
            .unwrap()
            .as_u64()
            .ok_or(HandshakeError::Malformed("ident version"))? as u16;
        let port = ident_fields
            .pop()
            .unwrap()
            .as_u64()
            .ok_or(HandshakeError::Malformed("port"))? as u16;
        let host = ident_fields
            .pop()
            .unwrap()
            .as_str()
            .ok_or(HandshakeError::Malformed("host"))?
            .to_string();

        let Value::Array(subs_list) = subs_v else {
            return Err(HandshakeError::Malformed("subscriptions"));
        };
        let mut subscriptions = Vec::with_capacity(subs_list.len());
        for entry in subs_list {
            let Value::Array(mut e) = entry else {
                return Err(HandshakeError::Malformed("subscription entry"));
            };
            if e.len() != 4 {
                return Err(HandshakeError::Malformed("subscription entry arity"));
            }
            let value = e.pop().unwrap().as_u64().ok_or(HandshakeError::Malformed("value"))?;
            let mask = e.pop().unwrap().as_u64().ok_or(HandshakeError::Malformed("mask"))?;
            let service = e.pop().unwrap();
            let msg_type = e.pop().unwrap().as_u64().ok_or(HandshakeError::Malformed("msg_type"))? as u8;
            subscriptions.push(SubscriptionSnapshot {
                msg_type,
                service,
                mask,
                value,
            });
        }

        Ok(Self {
            version,
            ident: Ident {
                host,
                port,
                version: ident_version,
                reserved,
            },
            subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ident_and_subscriptions() {
        let hs = Handshake::new(
            Ident::new("127.0.0.1", 9000),
            vec![SubscriptionSnapshot {
                msg_type: 2,
                service: Value::from("svc"),
                mask: 0,
                value: 0,
            }],
        );
        let encoded = hs.encode().unwrap();
        let decoded = Handshake::decode(&encoded, PROTOCOL_VERSION).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn version_mismatch_rejected() {
        let hs = Handshake::new(Ident::new("h", 1), vec![]);
        let encoded = hs.encode().unwrap();
        assert!(matches!(
            Handshake::decode(&encoded, PROTOCOL_VERSION + 1),
            Err(HandshakeError::VersionMismatch { .. })
        ));
    }
}
