//! Wire envelope types.
//!
//! Outbound requests and inbound responses share one JSON shape:
//! `{uniqueId, action, status, payload}`. Payload decoding is deferred to the
//! event-type-specific filter, so the inbound envelope borrows `payload` as
//! a [`RawValue`] rather than eagerly decoding it, via a hand-rolled
//! `Deserialize` impl.

use serde::{de, Deserialize, Serialize};
use serde_json::value::{to_raw_value, RawValue};
use std::fmt;

/// The single-character liveness reply the client must send whenever the
/// server pushes an empty text frame.
pub const PONG_FRAME: &str = "1";

/// An outbound request: `{uniqueId, action, payload}`.
#[derive(Debug, Serialize)]
pub struct OutboundRequest<'a> {
    #[serde(rename = "uniqueId")]
    pub unique_id: &'a str,
    pub action: &'a str,
    pub payload: &'a RawValue,
}

impl<'a> OutboundRequest<'a> {
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Status carried by an inbound envelope.
pub const STATUS_OK: &str = "ok";

/// An inbound envelope: `{uniqueId, action, status, payload}`.
///
/// `action` is `null` for RPC responses and `Some(..)` for server-pushed
/// subscription notifications. `payload` is left undecoded.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub unique_id: String,
    pub action: Option<String>,
    pub status: String,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// `status == "ok"`.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope {{ uniqueId: {:?}, action: {:?}, status: {:?} }}",
            self.unique_id, self.action, self.status
        )
    }
}

// Hand-rolled so `payload` can be borrowed as a `RawValue` regardless of
// field order, and so a missing `payload` deserializes as `null` rather than
// failing (some server responses, e.g. bare acks, omit it).
impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct EnvelopeVisitor;

        impl<'de> de::Visitor<'de> for EnvelopeVisitor {
            type Value = Envelope;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("an envelope object {uniqueId, action, status, payload}")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut unique_id: Option<String> = None;
                let mut action: Option<Option<String>> = None;
                let mut status: Option<String> = None;
                let mut payload: Option<Box<RawValue>> = None;

                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "uniqueId" => unique_id = Some(map.next_value()?),
                        "action" => action = Some(map.next_value()?),
                        "status" => status = Some(map.next_value()?),
                        "payload" => payload = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }

                let unique_id = unique_id.ok_or_else(|| de::Error::missing_field("uniqueId"))?;
                let status = status.ok_or_else(|| de::Error::missing_field("status"))?;
                let payload = payload.unwrap_or_else(|| to_raw_value(&()).expect("null raw value"));

                Ok(Envelope { unique_id, action: action.flatten(), status, payload })
            }
        }

        deserializer.deserialize_map(EnvelopeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_rpc_response() {
        let raw = r#"{"uniqueId":"ab12cd","action":null,"status":"ok","payload":{"name":"X"}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.unique_id, "ab12cd");
        assert_eq!(env.action, None);
        assert!(env.is_ok());
        assert_eq!(env.payload.get(), r#"{"name":"X"}"#);
    }

    #[test]
    fn deserializes_push_notification() {
        let raw = r#"{"uniqueId":"ignored","action":"locationUpdate","status":"ok","payload":{"7":{"x":2,"y":2}}}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.action.as_deref(), Some("locationUpdate"));
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let raw = r#"{"uniqueId":"x","status":"ok"}"#;
        let env: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(env.payload.get(), "null");
    }

    #[test]
    fn outbound_round_trips() {
        let payload = to_raw_value(&serde_json::json!({"deviceIds": [1, 2]})).unwrap();
        let req = OutboundRequest { unique_id: "abc123", action: "registerTagLocation", payload: &payload };
        let s = req.serialize().unwrap();
        assert!(s.contains("\"uniqueId\":\"abc123\""));
        assert!(s.contains("\"action\":\"registerTagLocation\""));
    }
}
