//! Correlation signatures
//!
//! A signature ties an outbound request to the reply frames answering it.
//! What a signature looks like is exchange business: the adapter supplies a
//! [`SignatureExtractor`] and the router only asks it once per inbound frame.

use crate::ws::transport::{FrameType, Response};
use serde_json::Value;
use std::fmt;

/// Correlation key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Signature {
    /// Numeric message ID
    Id(i64),
    /// Any other key (request UUIDs, channel + ID pairs, ...)
    Key(String),
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Id(id) => write!(f, "{}", id),
            Signature::Key(key) => f.write_str(key),
        }
    }
}

impl From<i64> for Signature {
    fn from(id: i64) -> Self {
        Signature::Id(id)
    }
}

impl From<i32> for Signature {
    fn from(id: i32) -> Self {
        Signature::Id(i64::from(id))
    }
}

impl From<u32> for Signature {
    fn from(id: u32) -> Self {
        Signature::Id(i64::from(id))
    }
}

impl From<&str> for Signature {
    fn from(key: &str) -> Self {
        Signature::Key(key.to_string())
    }
}

impl From<String> for Signature {
    fn from(key: String) -> Self {
        Signature::Key(key)
    }
}

/// Derives the correlation signature of an inbound frame
///
/// `None` means the frame is unsolicited.
pub trait SignatureExtractor: Send + Sync + 'static {
    fn extract(&self, frame: &Response) -> Option<Signature>;
}

impl<F> SignatureExtractor for F
where
    F: Fn(&Response) -> Option<Signature> + Send + Sync + 'static,
{
    #[inline]
    fn extract(&self, frame: &Response) -> Option<Signature> {
        self(frame)
    }
}

/// Reads the signature from one field of a JSON reply
///
/// `field` is either a top-level key (`"id"`) or a JSON pointer
/// (`"/result/reqId"`). Numbers become [`Signature::Id`], strings become
/// [`Signature::Key`]; anything else, and any frame that is not JSON, is
/// unsolicited.
#[derive(Debug, Clone)]
pub struct JsonFieldExtractor {
    field: String,
}

impl JsonFieldExtractor {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }
}

impl SignatureExtractor for JsonFieldExtractor {
    fn extract(&self, frame: &Response) -> Option<Signature> {
        if !matches!(frame.frame_type, FrameType::Text | FrameType::Binary) {
            return None;
        }

        let value: Value = serde_json::from_slice(&frame.raw).ok()?;
        let field = if self.field.starts_with('/') {
            value.pointer(&self.field)?
        } else {
            value.get(&self.field)?
        };

        match field {
            Value::Number(n) => n.as_i64().map(Signature::Id),
            Value::String(s) if !s.is_empty() => Some(Signature::Key(s.clone())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_display() {
        assert_eq!(Signature::from(42i64).to_string(), "42");
        assert_eq!(Signature::from("sub-1").to_string(), "sub-1");
    }

    #[test]
    fn test_json_field_numeric_id() {
        let extractor = JsonFieldExtractor::new("id");
        let frame = Response::text(&br#"{"id":42,"result":null}"#[..]);
        assert_eq!(extractor.extract(&frame), Some(Signature::Id(42)));
    }

    #[test]
    fn test_json_field_string_key() {
        let extractor = JsonFieldExtractor::new("req_id");
        let frame = Response::text(&br#"{"req_id":"abc","success":true}"#[..]);
        assert_eq!(extractor.extract(&frame), Some(Signature::from("abc")));
    }

    #[test]
    fn test_json_pointer() {
        let extractor = JsonFieldExtractor::new("/result/reqId");
        let frame = Response::text(&br#"{"result":{"reqId":9}}"#[..]);
        assert_eq!(extractor.extract(&frame), Some(Signature::Id(9)));
    }

    #[test]
    fn test_unsolicited_frames() {
        let extractor = JsonFieldExtractor::new("id");

        // Market data push without an id
        let push = Response::text(&br#"{"e":"aggTrade","s":"BTCUSDT"}"#[..]);
        assert_eq!(extractor.extract(&push), None);

        // Null id
        let null_id = Response::text(&br#"{"id":null}"#[..]);
        assert_eq!(extractor.extract(&null_id), None);

        // Not JSON
        let garbage = Response::text(&b"pong"[..]);
        assert_eq!(extractor.extract(&garbage), None);

        // Control frame
        let ping = Response::new(FrameType::Ping, &br#"{"id":1}"#[..]);
        assert_eq!(extractor.extract(&ping), None);
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |frame: &Response| {
            frame
                .raw
                .strip_prefix(b"ack:")
                .and_then(|rest| std::str::from_utf8(rest).ok())
                .and_then(|s| s.parse::<i64>().ok())
                .map(Signature::Id)
        };
        assert_eq!(
            extractor.extract(&Response::text(&b"ack:5"[..])),
            Some(Signature::Id(5))
        );
        assert_eq!(extractor.extract(&Response::text(&b"tick"[..])), None);
    }
}
