//! Wire message schemas for the OpCast protocol.
//!
//! Every frame is a JSON record tagged by its action field `a`. The protocol
//! is symmetric at the frame level, so a single [`Message`] enum covers both
//! directions; fields that only one direction populates are optional.
//! Snapshots, query results, and op bodies are opaque to this layer and stay
//! [`serde_json::Value`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorData;

/// Body of a bulk frame: either the version-absent group (a plain id array)
/// or the versioned group (id to version map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BulkBody {
    /// Document ids with no version attached (e.g. unsubscribe).
    Ids(Vec<String>),
    /// Document ids with the version each one is at.
    Versions(BTreeMap<String, Option<u64>>),
}

/// A protocol frame, tagged by the `a` action field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "a")]
pub enum Message {
    /// Server hello. `id` stays opaque so a non-string value can be rejected
    /// with the proper error code instead of failing the decode.
    #[serde(rename = "init")]
    Init {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        protocol: Option<u64>,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none", default)]
        default_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        id: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Single-document fetch: request carries the version, reply the snapshot.
    #[serde(rename = "f")]
    Fetch {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        id: String,
        #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Single-document subscribe.
    #[serde(rename = "s")]
    Subscribe {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        id: String,
        #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Single-document unsubscribe.
    #[serde(rename = "u")]
    Unsubscribe {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        id: String,
        #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// An operation, outbound or broadcast back. `op`, `create`, and `del`
    /// are mutually exclusive sub-fields carried verbatim.
    #[serde(rename = "op")]
    Op {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "d")]
        id: String,
        #[serde(rename = "v", skip_serializing_if = "Option::is_none", default)]
        version: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        src: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        seq: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        op: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        create: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        del: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Bulk fetch for several documents of one collection.
    #[serde(rename = "bf")]
    BulkFetch {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "b", skip_serializing_if = "Option::is_none", default)]
        body: Option<BulkBody>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<BTreeMap<String, Value>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Bulk subscribe.
    #[serde(rename = "bs")]
    BulkSubscribe {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "b", skip_serializing_if = "Option::is_none", default)]
        body: Option<BulkBody>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<BTreeMap<String, Value>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Bulk unsubscribe.
    #[serde(rename = "bu")]
    BulkUnsubscribe {
        #[serde(rename = "c")]
        collection: String,
        #[serde(rename = "b", skip_serializing_if = "Option::is_none", default)]
        body: Option<BulkBody>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<BTreeMap<String, Value>>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// One-shot query fetch: request carries the query, reply the results.
    /// Query-specific request options travel in the flattened map.
    #[serde(rename = "qf")]
    QueryFetch {
        id: u64,
        #[serde(rename = "c", skip_serializing_if = "Option::is_none", default)]
        collection: Option<String>,
        #[serde(rename = "q", skip_serializing_if = "Option::is_none", default)]
        query: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        extra: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
        #[serde(flatten)]
        options: BTreeMap<String, Value>,
    },

    /// Live query subscribe.
    #[serde(rename = "qs")]
    QuerySubscribe {
        id: u64,
        #[serde(rename = "c", skip_serializing_if = "Option::is_none", default)]
        collection: Option<String>,
        #[serde(rename = "q", skip_serializing_if = "Option::is_none", default)]
        query: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        extra: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
        #[serde(flatten)]
        options: BTreeMap<String, Value>,
    },

    /// Query unsubscribe; the server acknowledgement is ignored.
    #[serde(rename = "qu")]
    QueryUnsubscribe {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Live query update, carrying a diff against the last known results.
    #[serde(rename = "q")]
    QueryUpdate {
        id: u64,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        diff: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        extra: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ErrorData>,
    },

    /// Any unrecognized action. The frame still reaches receive middleware;
    /// the dispatcher logs and drops it.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// The wire action tag of this frame.
    #[must_use]
    pub fn action(&self) -> &'static str {
        match self {
            Message::Init { .. } => "init",
            Message::Fetch { .. } => "f",
            Message::Subscribe { .. } => "s",
            Message::Unsubscribe { .. } => "u",
            Message::Op { .. } => "op",
            Message::BulkFetch { .. } => "bf",
            Message::BulkSubscribe { .. } => "bs",
            Message::BulkUnsubscribe { .. } => "bu",
            Message::QueryFetch { .. } => "qf",
            Message::QuerySubscribe { .. } => "qs",
            Message::QueryUnsubscribe { .. } => "qu",
            Message::QueryUpdate { .. } => "q",
            Message::Unknown => "?",
        }
    }

    /// The error envelope of this frame, if one is present.
    #[must_use]
    pub fn error(&self) -> Option<&ErrorData> {
        match self {
            Message::Init { error, .. }
            | Message::Fetch { error, .. }
            | Message::Subscribe { error, .. }
            | Message::Unsubscribe { error, .. }
            | Message::Op { error, .. }
            | Message::BulkFetch { error, .. }
            | Message::BulkSubscribe { error, .. }
            | Message::BulkUnsubscribe { error, .. }
            | Message::QueryFetch { error, .. }
            | Message::QuerySubscribe { error, .. }
            | Message::QueryUnsubscribe { error, .. }
            | Message::QueryUpdate { error, .. } => error.as_ref(),
            Message::Unknown => None,
        }
    }
}

/// A frame that could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
#[error("malformed frame: {0}")]
pub struct CodecError(#[from] serde_json::Error);

/// Serializes a frame to its JSON text form.
///
/// # Errors
///
/// Returns [`CodecError`] if the frame cannot be represented as JSON.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parses a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError`] if the text is not valid JSON or is missing
/// required fields for its action.
pub fn decode(raw: &str) -> Result<Message, CodecError> {
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn roundtrip(message: &Message) -> Message {
        let text = encode(message).expect("encode");
        decode(&text).expect("decode")
    }

    fn wire_keys(message: &Message) -> Vec<String> {
        let text = encode(message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        value
            .as_object()
            .expect("frame is an object")
            .keys()
            .cloned()
            .collect()
    }

    #[test]
    fn init_roundtrip() {
        let message = Message::Init {
            protocol: Some(1),
            default_type: Some("http://sharejs.org/types/JSONv0".to_string()),
            id: Some(json!("C7")),
            error: None,
        };
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn init_uses_type_as_wire_key() {
        let message = Message::Init {
            protocol: Some(1),
            default_type: Some("json0".to_string()),
            id: Some(json!("x")),
            error: None,
        };
        let keys = wire_keys(&message);
        assert!(keys.contains(&"type".to_string()), "keys: {keys:?}");
        assert!(!keys.contains(&"default_type".to_string()));
    }

    #[test]
    fn subscribe_request_wire_shape() {
        let message = Message::Subscribe {
            collection: "books".to_string(),
            id: "moby".to_string(),
            version: Some(3),
            data: None,
            error: None,
        };
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["a"], "s");
        assert_eq!(value["c"], "books");
        assert_eq!(value["d"], "moby");
        assert_eq!(value["v"], 3);
        assert!(value.get("data").is_none());
    }

    #[test]
    fn unsubscribe_omits_version_when_absent() {
        let message = Message::Unsubscribe {
            collection: "books".to_string(),
            id: "moby".to_string(),
            version: None,
            data: None,
            error: None,
        };
        let keys = wire_keys(&message);
        assert_eq!(keys, vec!["a", "c", "d"]);
    }

    #[test]
    fn op_frame_carries_sub_fields_verbatim() {
        let message = Message::Op {
            collection: "books".to_string(),
            id: "moby".to_string(),
            version: Some(7),
            src: Some("C7".to_string()),
            seq: Some(2),
            op: Some(json!([{ "p": ["title"], "oi": "Moby-Dick" }])),
            create: None,
            del: None,
            error: None,
        };
        let decoded = roundtrip(&message);
        assert_eq!(decoded, message);
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["a"], "op");
        assert_eq!(value["src"], "C7");
        assert_eq!(value["seq"], 2);
    }

    #[test]
    fn bulk_body_array_form() {
        let message = Message::BulkUnsubscribe {
            collection: "books".to_string(),
            body: Some(BulkBody::Ids(vec!["a".to_string(), "b".to_string()])),
            data: None,
            error: None,
        };
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["a"], "bu");
        assert_eq!(value["b"], json!(["a", "b"]));
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn bulk_body_map_form() {
        let mut versions = BTreeMap::new();
        versions.insert("a".to_string(), Some(1));
        versions.insert("b".to_string(), Some(4));
        let message = Message::BulkSubscribe {
            collection: "books".to_string(),
            body: Some(BulkBody::Versions(versions)),
            data: None,
            error: None,
        };
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["b"], json!({ "a": 1, "b": 4 }));
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn bulk_reply_with_data_map_decodes() {
        let raw = r#"{"a":"bs","c":"books","data":{"moby":{"v":1},"dune":{"v":2}}}"#;
        let message = decode(raw).expect("decode");
        let Message::BulkSubscribe { collection, data, .. } = message else {
            panic!("expected bulk subscribe");
        };
        assert_eq!(collection, "books");
        let data = data.expect("data map");
        assert_eq!(data.len(), 2);
        assert_eq!(data["moby"], json!({ "v": 1 }));
    }

    #[test]
    fn bulk_reply_with_null_version_decodes() {
        let raw = r#"{"a":"bf","c":"books","b":{"moby":null}}"#;
        let message = decode(raw).expect("decode");
        let Message::BulkFetch { body, .. } = message else {
            panic!("expected bulk fetch");
        };
        assert_eq!(
            body,
            Some(BulkBody::Versions(BTreeMap::from([("moby".to_string(), None)])))
        );
    }

    #[test]
    fn query_subscribe_flattens_options() {
        let mut options = BTreeMap::new();
        options.insert("db".to_string(), json!("mirror"));
        let message = Message::QuerySubscribe {
            id: 4,
            collection: Some("books".to_string()),
            query: Some(json!({ "author": "melville" })),
            data: None,
            extra: None,
            error: None,
            options,
        };
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["a"], "qs");
        assert_eq!(value["id"], 4);
        assert_eq!(value["q"], json!({ "author": "melville" }));
        assert_eq!(value["db"], "mirror");
        assert_eq!(roundtrip(&message), message);
    }

    #[test]
    fn query_update_with_error_envelope() {
        let raw = r#"{"a":"q","id":9,"diff":[],"error":{"code":4022,"message":"Database adapter does not support subscribe"}}"#;
        let message = decode(raw).expect("decode");
        assert_eq!(message.action(), "q");
        let envelope = message.error().expect("error envelope");
        assert_eq!(envelope.code, 4022);
    }

    #[test]
    fn unknown_action_decodes_to_unknown() {
        let message = decode(r#"{"a":"presence","ch":"room"}"#).expect("decode");
        assert_eq!(message, Message::Unknown);
    }

    #[test]
    fn missing_action_fails_to_decode() {
        assert!(decode(r#"{"c":"books","d":"moby"}"#).is_err());
        assert!(decode("not json").is_err());
    }

    #[test]
    fn action_tags_match_wire_names() {
        let message = Message::Fetch {
            collection: "c".to_string(),
            id: "d".to_string(),
            version: None,
            data: None,
            error: None,
        };
        assert_eq!(message.action(), "f");
        let text = encode(&message).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["a"], "f");
    }

    proptest! {
        #[test]
        fn bulk_body_roundtrips(
            ids in proptest::collection::vec("[a-z0-9]{1,12}", 0..8),
            versions in proptest::collection::btree_map("[a-z0-9]{1,12}", proptest::option::of(0u64..1000), 1..8),
        ) {
            let array = Message::BulkFetch {
                collection: "col".to_string(),
                body: Some(BulkBody::Ids(ids)),
                data: None,
                error: None,
            };
            prop_assert_eq!(&roundtrip(&array), &array);

            let map = Message::BulkFetch {
                collection: "col".to_string(),
                body: Some(BulkBody::Versions(versions)),
                data: None,
                error: None,
            };
            prop_assert_eq!(&roundtrip(&map), &map);
        }
    }
}
