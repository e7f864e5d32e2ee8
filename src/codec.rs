//! Binary RPC wire codec (§4.1): a pure function over byte buffers, no I/O.
//!
//! Frames are msgpack arrays of length 3 or 4 tagged by their first element:
//!   `[0, msgid, method, params]`        request
//!   `[1, msgid, error_or_nil, result]`  response
//!   `[2, method, params]`               notification
//!
//! The value tree is `rmpv::Value`; its `Map` variant is a `Vec<(Value, Value)>`
//! so encode/decode round-trips preserve key insertion order.

use crate::error::CodecError;
use rmpv::Value;
use std::io::Cursor;

pub type Params = Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        msgid: u64,
        method: String,
        params: Params,
    },
    Response {
        msgid: u64,
        error: Option<Value>,
        result: Value,
    },
    Notification {
        method: String,
        params: Params,
    },
}

const TYPE_REQUEST: i64 = 0;
const TYPE_RESPONSE: i64 = 1;
const TYPE_NOTIFICATION: i64 = 2;

impl Message {
    fn to_value(&self) -> Value {
        match self {
            Message::Request { msgid, method, params } => Value::Array(vec![
                Value::from(TYPE_REQUEST),
                Value::from(*msgid),
                Value::from(method.as_str()),
                params.clone(),
            ]),
            Message::Response { msgid, error, result } => Value::Array(vec![
                Value::from(TYPE_RESPONSE),
                Value::from(*msgid),
                error.clone().unwrap_or(Value::Nil),
                result.clone(),
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(TYPE_NOTIFICATION),
                Value::from(method.as_str()),
                params.clone(),
            ]),
        }
    }

    fn from_value(value: Value) -> Result<Message, CodecError> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(CodecError::TypeMismatch {
                    expected: "array",
                    got: value_kind(&other),
                })
            }
        };

        let tag = items
            .first()
            .and_then(|v| v.as_i64())
            .ok_or(CodecError::InvalidMessageFormat)?;

        match tag {
            TYPE_REQUEST => {
                if items.len() != 4 {
                    return Err(CodecError::InvalidArrayLength(items.len()));
                }
                let msgid = items[1].as_u64().ok_or(CodecError::TypeMismatch {
                    expected: "uint",
                    got: value_kind(&items[1]),
                })?;
                let method = items[2]
                    .as_str()
                    .ok_or(CodecError::TypeMismatch {
                        expected: "string",
                        got: value_kind(&items[2]),
                    })?
                    .to_string();
                Ok(Message::Request {
                    msgid,
                    method,
                    params: items[3].clone(),
                })
            }
            TYPE_RESPONSE => {
                if items.len() != 4 {
                    return Err(CodecError::InvalidArrayLength(items.len()));
                }
                let msgid = items[1].as_u64().ok_or(CodecError::TypeMismatch {
                    expected: "uint",
                    got: value_kind(&items[1]),
                })?;
                let error = match &items[2] {
                    Value::Nil => None,
                    other => Some(other.clone()),
                };
                Ok(Message::Response {
                    msgid,
                    error,
                    result: items[3].clone(),
                })
            }
            TYPE_NOTIFICATION => {
                if items.len() != 3 {
                    return Err(CodecError::InvalidArrayLength(items.len()));
                }
                let method = items[1]
                    .as_str()
                    .ok_or(CodecError::TypeMismatch {
                        expected: "string",
                        got: value_kind(&items[1]),
                    })?
                    .to_string();
                Ok(Message::Notification {
                    method,
                    params: items[2].clone(),
                })
            }
            other => Err(CodecError::InvalidMessageType(other)),
        }
    }
}

fn value_kind(v: &Value) -> &'static str {
    match v {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(_, _) => "ext",
    }
}

/// Encode a message, appending its bytes to `out`.
pub fn encode(msg: &Message, out: &mut Vec<u8>) {
    // rmpv's Value encoder never fails on well-formed values we construct here.
    rmpv::encode::write_value(out, &msg.to_value()).expect("encoding a constructed Value cannot fail");
}

/// Attempt to decode one frame from the front of `buf`.
///
/// Returns `Ok(Some((message, consumed)))` when a complete frame was parsed,
/// `Ok(None)` when `buf` holds only a partial frame (caller should buffer more
/// bytes before retrying), and `Err` for a structurally malformed frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buf);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => {
            let consumed = cursor.position() as usize;
            Ok(Some((Message::from_value(value)?, consumed)))
        }
        Err(rmpv::decode::Error::InvalidMarkerRead(e)) | Err(rmpv::decode::Error::InvalidDataRead(e)) => {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(CodecError::InvalidMessageFormat)
            }
        }
    }
}
