//! Filter Registry.
//!
//! A static lookup from event type to the wire action names and filtering
//! strategy Event Channel needs to install a subscription or run a one-shot
//! fetch. Positional MessagePack schemas for the initial-state entity types
//! live here too, one table per entity type, even though the actual
//! Base64/MessagePack decoding is an external collaborator (see
//! [`PayloadDecoder`]).

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::error::FilterError;

/// Decodes a Base64-encoded MessagePack payload into a JSON value.
/// Deliberately an external collaborator: this crate only reshapes and
/// filters whatever comes back.
pub trait PayloadDecoder: Send + Sync {
    /// Decodes `base64_msgpack` into a JSON value, typically an object
    /// mapping device id to a positional array of attributes.
    fn decode(&self, base64_msgpack: &str) -> Result<Value, FilterError>;
}

/// The typed surface over the subscribable/fetchable event types
/// (`registerLocationUpdate`, `registerTagDiffStream`, ...). A closed enum
/// rather than a free-form event-type string, since a fixed lookup table is
/// exactly what `match` is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    LocationUpdate,
    P2pDistanceStream,
    TagDiffStream,
    AlertDiffStream,
    TwrStream,
    ContactTracingStream,
    TagState,
    AlertState,
    Site,
    ContactTracingHistory,
}

impl EventType {
    pub fn name(self) -> &'static str {
        match self {
            EventType::LocationUpdate => "locationUpdate",
            EventType::P2pDistanceStream => "p2pDistanceStream",
            EventType::TagDiffStream => "tagDiffStream",
            EventType::AlertDiffStream => "alertDiffStream",
            EventType::TwrStream => "twrStream",
            EventType::ContactTracingStream => "contactTracingStream",
            EventType::TagState => "tagState",
            EventType::AlertState => "alertState",
            EventType::Site => "site",
            EventType::ContactTracingHistory => "contactTracingHistory",
        }
    }
}

/// How a subscription is installed and torn down.
pub enum Shape {
    /// A long-lived server-push subscription.
    Streaming { subscribe_action: &'static str, unsubscribe_action: &'static str, response_action: &'static str },
    /// A single request/response fetch, re-run on reconnect but never
    /// unsubscribed.
    OneShot {
        fetch_action: &'static str,
        /// Some verbs are sent under a fixed, literal `uniqueId` rather than
        /// a freshly generated correlation id; `None` means generate one as
        /// usual.
        fixed_unique_id: Option<&'static str>,
        /// Overrides the key the Tracked Request is filed/resolved under —
        /// needed only for the `getInitialTagState`/`initialTagState`
        /// asymmetry between `getInitialTagState`/`initialTagState`; every
        /// other one-shot verb resolves under its own `uniqueId`.
        expected_response_correlation_id: Option<&'static str>,
    },
}

/// Identifies which field(s) of a payload entry carry the device id that a
/// [`FilterStrategy::DeviceIdSet`] filter keys on.
pub enum DeviceIdLocator {
    /// The payload is an object; each top-level key is itself the device id
    /// (location update, tag diff, alert diff, the reshaped tag/alert state).
    ObjectKey,
    /// Each entry is an object; the device id lives at `field` (alert diff's
    /// nested `deviceId`, contact trace update).
    EntryField(&'static str),
    /// Each entry is an object identifying *two* devices (p2p distance's
    /// `tag1`/`tag2`); kept if either is in the set.
    EntryFieldEither(&'static str, &'static str),
}

/// A per-event-type filtering strategy.
pub enum FilterStrategy {
    DeviceIdSet(DeviceIdLocator),
    TwoSet,
    InitialState { schema: &'static [&'static str] },
    NoOp,
}

/// One row of the registry: everything `register`/the reconnect hook needs
/// for a given event type.
pub struct FilterEntry {
    pub allowed_keys: &'static [&'static str],
    pub required_keys: &'static [&'static str],
    pub shape: Shape,
    pub strategy: FilterStrategy,
}

/// Positional schema for a tag's initial-state snapshot. Field names beyond
/// what the wire examples show are a plausible reconstruction, not a
/// contractual guarantee — downstream code should treat unknown indices as
/// forward-compatible additions rather than errors.
const TAG_STATE_SCHEMA: &[&str] = &["x", "y", "z", "floorId", "battery", "lastUpdate"];

/// Positional schema for an alert's initial-state snapshot.
const ALERT_STATE_SCHEMA: &[&str] = &["alertType", "deviceId", "timestamp", "severity"];

/// Looks up the registry entry for `event_type`.
pub fn lookup(event_type: EventType) -> FilterEntry {
    match event_type {
        EventType::LocationUpdate => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerTagLocation",
                unsubscribe_action: "unregisterTagLocation",
                response_action: "locationUpdate",
            },
            strategy: FilterStrategy::DeviceIdSet(DeviceIdLocator::ObjectKey),
        },
        EventType::P2pDistanceStream => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerP2PDistanceStream",
                unsubscribe_action: "unregisterP2PDistanceStream",
                response_action: "p2pDistance",
            },
            strategy: FilterStrategy::DeviceIdSet(DeviceIdLocator::EntryFieldEither("tag1", "tag2")),
        },
        EventType::TagDiffStream => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerTagDiffStream",
                unsubscribe_action: "unregisterTagDiffStream",
                response_action: "tagDiff",
            },
            strategy: FilterStrategy::DeviceIdSet(DeviceIdLocator::ObjectKey),
        },
        EventType::AlertDiffStream => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerAlertDiffStream",
                unsubscribe_action: "unregisterAlertDiffStream",
                response_action: "alertDiff",
            },
            strategy: FilterStrategy::DeviceIdSet(DeviceIdLocator::EntryField("deviceId")),
        },
        EventType::TwrStream => FilterEntry {
            allowed_keys: &["tagDeviceIds", "beaconDeviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerTwrStream",
                unsubscribe_action: "unregisterTwrStream",
                response_action: "twr",
            },
            strategy: FilterStrategy::TwoSet,
        },
        EventType::ContactTracingStream => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::Streaming {
                subscribe_action: "registerContactTracingStream",
                unsubscribe_action: "unregisterContactTracingStream",
                response_action: "contactTraceUpdate",
            },
            strategy: FilterStrategy::DeviceIdSet(DeviceIdLocator::EntryField("deviceId")),
        },
        EventType::TagState => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::OneShot {
                fetch_action: "initialTagState",
                fixed_unique_id: Some("getInitialTagState"),
                expected_response_correlation_id: Some("initialTagState"),
            },
            strategy: FilterStrategy::InitialState { schema: TAG_STATE_SCHEMA },
        },
        EventType::AlertState => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::OneShot {
                fetch_action: "initialAlertState",
                fixed_unique_id: Some("getInitialAlertState"),
                expected_response_correlation_id: None,
            },
            strategy: FilterStrategy::InitialState { schema: ALERT_STATE_SCHEMA },
        },
        EventType::Site => FilterEntry {
            allowed_keys: &[],
            required_keys: &[],
            shape: Shape::OneShot { fetch_action: "getSite", fixed_unique_id: None, expected_response_correlation_id: None },
            strategy: FilterStrategy::NoOp,
        },
        EventType::ContactTracingHistory => FilterEntry {
            allowed_keys: &["deviceIds"],
            required_keys: &[],
            shape: Shape::OneShot {
                fetch_action: "initialContactTracingState",
                fixed_unique_id: None,
                expected_response_correlation_id: None,
            },
            strategy: FilterStrategy::NoOp,
        },
    }
}

fn value_to_id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn ids_set(filters: &Value, key: &str) -> Result<Option<HashSet<String>>, FilterError> {
    match filters.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            Ok(Some(items.iter().filter_map(value_to_id_string).collect()))
        }
        Some(_) => Err(FilterError::Decode(format!("{key} must be an array or null"))),
    }
}

fn admits(set: &Option<HashSet<String>>, id: Option<&str>) -> bool {
    match (set, id) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(set), Some(id)) => set.contains(id),
    }
}

/// Applies `strategy` to `payload`, returning `Ok(None)` to signal "drop"
/// (a null result or an object with zero keys) and `Ok(Some(value))`
/// otherwise.
pub fn apply(
    strategy: &FilterStrategy,
    filters: &Value,
    payload: Value,
    decoder: Option<&dyn PayloadDecoder>,
) -> Result<Option<Value>, FilterError> {
    match strategy {
        FilterStrategy::NoOp => Ok(Some(payload)),

        FilterStrategy::DeviceIdSet(locator) => {
            let ids = ids_set(filters, "deviceIds")?;
            let object = match payload {
                Value::Object(map) => map,
                other => return Ok(Some(other)),
            };
            Ok(filter_device_id_object(&ids, object, locator))
        }

        FilterStrategy::TwoSet => {
            let tag_ids = ids_set(filters, "tagDeviceIds")?;
            let beacon_ids = ids_set(filters, "beaconDeviceIds")?;
            let object = match payload {
                Value::Object(map) => map,
                other => return Ok(Some(other)),
            };
            let mut out = Map::new();
            for (key, entry) in object {
                let t_id = entry.get("tId").and_then(value_to_id_string);
                let b_id = entry.get("bId").and_then(value_to_id_string);
                if admits(&tag_ids, t_id.as_deref()) && admits(&beacon_ids, b_id.as_deref()) {
                    out.insert(key, entry);
                }
            }
            Ok(if out.is_empty() { None } else { Some(Value::Object(out)) })
        }

        FilterStrategy::InitialState { schema } => {
            let decoder = decoder.ok_or_else(|| FilterError::Decode("no payload decoder configured".into()))?;
            let base64 = match &payload {
                Value::String(s) => s.as_str(),
                _ => return Err(FilterError::Decode("initial state payload was not a string".into())),
            };
            let decoded = decoder.decode(base64)?;
            let reshaped = reshape_positional(decoded, schema);
            let ids = ids_set(filters, "deviceIds")?;
            let object = match reshaped {
                Value::Object(map) => map,
                other => return Ok(Some(other)),
            };
            Ok(filter_device_id_object(&ids, object, &DeviceIdLocator::ObjectKey))
        }
    }
}

fn filter_device_id_object(
    ids: &Option<HashSet<String>>,
    object: Map<String, Value>,
    locator: &DeviceIdLocator,
) -> Option<Value> {
    let mut out = Map::new();
    for (key, entry) in object {
        let id = match locator {
            DeviceIdLocator::ObjectKey => Some(key.clone()),
            DeviceIdLocator::EntryField(field) => entry.get(*field).and_then(value_to_id_string),
            DeviceIdLocator::EntryFieldEither(a, b) => {
                let ida = entry.get(*a).and_then(value_to_id_string);
                let idb = entry.get(*b).and_then(value_to_id_string);
                if admits(ids, ida.as_deref()) || admits(ids, idb.as_deref()) {
                    out.insert(key.clone(), entry);
                }
                continue;
            }
        };
        if admits(ids, id.as_deref()) {
            out.insert(key, entry);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Turns `{"7": [2, 2, 0, 1, 88, 1700000000]}` into
/// `{"7": {"x": 2, "y": 2, "z": 0, "floorId": 1, "battery": 88, "lastUpdate": 1700000000}}`
/// per `schema`'s positional field names. Non-object, non-array inputs pass
/// through unchanged.
fn reshape_positional(decoded: Value, schema: &[&str]) -> Value {
    let map = match decoded {
        Value::Object(map) => map,
        other => return other,
    };
    let mut out = Map::new();
    for (key, value) in map {
        match value {
            Value::Array(items) => {
                let mut obj = Map::new();
                for (field, item) in schema.iter().zip(items) {
                    obj.insert((*field).to_string(), item);
                }
                out.insert(key, Value::Object(obj));
            }
            other => {
                out.insert(key, other);
            }
        }
    }
    Value::Object(out)
}

/// Validates a caller-supplied filter object against an event type's
/// allowed/required key sets.
pub fn validate_filters(event_type: EventType, filters: &Value) -> Result<(), FilterError> {
    let entry = lookup(event_type);
    let object = match filters {
        Value::Object(map) => map,
        Value::Null => {
            if entry.required_keys.is_empty() {
                return Ok(());
            }
            return Err(FilterError::MissingRequired {
                key: entry.required_keys[0].to_string(),
                event_type: event_type.name().to_string(),
            });
        }
        _ => {
            return Err(FilterError::UnknownKey { key: "<non-object>".into(), event_type: event_type.name().to_string() })
        }
    };
    for key in object.keys() {
        if !entry.allowed_keys.contains(&key.as_str()) {
            return Err(FilterError::UnknownKey { key: key.clone(), event_type: event_type.name().to_string() });
        }
    }
    for required in entry.required_keys {
        if !object.contains_key(*required) {
            return Err(FilterError::MissingRequired {
                key: (*required).to_string(),
                event_type: event_type.name().to_string(),
            });
        }
    }
    Ok(())
}
