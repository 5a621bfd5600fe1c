//! # Protocol messages
//!
//! The Controller and the Isolate exchange these records and nothing else.
//! Every record carries a `name` discriminant. Requests that expect a reply
//! carry the id of the tunnel the reply settles; replies carry only the
//! tunnel id, the owning namespace is recovered from the tunnel itself.
//!
//! ## Wire format
//!
//! Records are JSON objects, e.g.
//! `{"name":"create","namespace":"a","tunnel":3,"parent":null}` or
//! `{"name":"resolve","tunnel":3,"payload":null}`.
//!
//! ## Invariants
//!
//! - **Panic Safety**: decoding never panics on unknown data.
//! - An unknown discriminant is reported together with the tunnel id found in
//!   the record, if any, so the receiver can reject that tunnel.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::dependency::Dependency;

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The record's discriminant is not a known message name.
    Unrecognized { name: String, tunnel: Option<u64> },
    /// The record is not well-formed for its discriminant.
    Malformed { reason: String, tunnel: Option<u64> },
    /// The message could not be serialized.
    Encode(String),
}

impl Error {
    /// The tunnel the offending record referred to, if it named one.
    pub fn tunnel(&self) -> Option<u64> {
        match self {
            Self::Unrecognized { tunnel, .. } | Self::Malformed { tunnel, .. } => *tunnel,
            Self::Encode(_) => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unrecognized { name, .. } => write!(f, "unrecognized message '{}'", name),
            Self::Malformed { reason, .. } => write!(f, "malformed message: {}", reason),
            Self::Encode(reason) => write!(f, "cannot encode message: {}", reason),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Every record of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "camelCase")]
pub enum Message {
    // --- Replies ---
    Resolve { tunnel: u64, #[serde(default)] payload: Value },
    Reject { tunnel: u64, error: String },

    // --- Isolate to Controller ---
    Call { namespace: String, tunnel: u64, idx: u32, #[serde(default)] args: Vec<Value> },

    // --- Either direction, fire and forget ---
    Emit { namespace: String, event: String, #[serde(default)] args: Vec<Value> },

    // --- Controller to Isolate ---
    Install { namespace: String, tunnel: u64, dependency: Dependency },
    Execute { namespace: String, tunnel: u64, dependency: Dependency, #[serde(default)] args: Map<String, Value> },
    Predefine { namespace: String, tunnel: u64, idx: u32, function: String },
    Create { namespace: String, tunnel: u64, #[serde(default)] parent: Option<String> },
    Delete { namespace: String, tunnel: u64 },
    Link { namespace: String, tunnel: u64, target: String },
    Unlink { namespace: String, tunnel: u64, target: String },
    Mute { namespace: String, tunnel: u64 },
    Unmute { namespace: String, tunnel: u64 },
    ListNamespaces { tunnel: u64 },
    ListInstalled { namespace: String, tunnel: u64 },
    ListLinkedTo { namespace: String, tunnel: u64 },
    ListLinkedFrom { namespace: String, tunnel: u64 },
    IsMuted { namespace: String, tunnel: u64 },
    GetAncestors { namespace: String, tunnel: u64 },
    GetChildren { namespace: String, tunnel: u64 },
    PendingTunnels { namespace: String, tunnel: u64 },
}

impl Message {
    /// The wire discriminant of this message.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Resolve { .. } => "resolve",
            Self::Reject { .. } => "reject",
            Self::Call { .. } => "call",
            Self::Emit { .. } => "emit",
            Self::Install { .. } => "install",
            Self::Execute { .. } => "execute",
            Self::Predefine { .. } => "predefine",
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::Link { .. } => "link",
            Self::Unlink { .. } => "unlink",
            Self::Mute { .. } => "mute",
            Self::Unmute { .. } => "unmute",
            Self::ListNamespaces { .. } => "listNamespaces",
            Self::ListInstalled { .. } => "listInstalled",
            Self::ListLinkedTo { .. } => "listLinkedTo",
            Self::ListLinkedFrom { .. } => "listLinkedFrom",
            Self::IsMuted { .. } => "isMuted",
            Self::GetAncestors { .. } => "getAncestors",
            Self::GetChildren { .. } => "getChildren",
            Self::PendingTunnels { .. } => "pendingTunnels",
        }
    }

    /// The tunnel this message refers to; `emit` has none.
    pub fn tunnel(&self) -> Option<u64> {
        match self {
            Self::Emit { .. } => None,
            Self::Resolve { tunnel, .. }
            | Self::Reject { tunnel, .. }
            | Self::Call { tunnel, .. }
            | Self::Install { tunnel, .. }
            | Self::Execute { tunnel, .. }
            | Self::Predefine { tunnel, .. }
            | Self::Create { tunnel, .. }
            | Self::Delete { tunnel, .. }
            | Self::Link { tunnel, .. }
            | Self::Unlink { tunnel, .. }
            | Self::Mute { tunnel, .. }
            | Self::Unmute { tunnel, .. }
            | Self::ListNamespaces { tunnel }
            | Self::ListInstalled { tunnel, .. }
            | Self::ListLinkedTo { tunnel, .. }
            | Self::ListLinkedFrom { tunnel, .. }
            | Self::IsMuted { tunnel, .. }
            | Self::GetAncestors { tunnel, .. }
            | Self::GetChildren { tunnel, .. }
            | Self::PendingTunnels { tunnel, .. } => Some(*tunnel),
        }
    }

    /// The namespace a request is scoped to; replies carry none.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Resolve { .. } | Self::Reject { .. } | Self::ListNamespaces { .. } => None,
            Self::Call { namespace, .. }
            | Self::Emit { namespace, .. }
            | Self::Install { namespace, .. }
            | Self::Execute { namespace, .. }
            | Self::Predefine { namespace, .. }
            | Self::Create { namespace, .. }
            | Self::Delete { namespace, .. }
            | Self::Link { namespace, .. }
            | Self::Unlink { namespace, .. }
            | Self::Mute { namespace, .. }
            | Self::Unmute { namespace, .. }
            | Self::ListInstalled { namespace, .. }
            | Self::ListLinkedTo { namespace, .. }
            | Self::ListLinkedFrom { namespace, .. }
            | Self::IsMuted { namespace, .. }
            | Self::GetAncestors { namespace, .. }
            | Self::GetChildren { namespace, .. }
            | Self::PendingTunnels { namespace, .. } => Some(namespace),
        }
    }

    /// Serializes the message into its wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Encode(e.to_string()))
    }

    /// Parses wire bytes into a message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let record: Value = serde_json::from_slice(bytes).map_err(|e| Error::Malformed {
            reason: e.to_string(),
            tunnel: None,
        })?;

        let tunnel = record.get("tunnel").and_then(Value::as_u64);
        let name = match record.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => {
                return Err(Error::Malformed {
                    reason: "missing message name".into(),
                    tunnel,
                })
            }
        };

        if !KNOWN.contains(&name.as_str()) {
            return Err(Error::Unrecognized { name, tunnel });
        }

        Self::deserialize(record).map_err(|e| Error::Malformed {
            reason: format!("{}: {}", name, e),
            tunnel,
        })
    }
}

const KNOWN: &[&str] = &[
    "resolve", "reject", "call", "emit", "install", "execute", "predefine",
    "create", "delete", "link", "unlink", "mute", "unmute", "listNamespaces",
    "listInstalled", "listLinkedTo", "listLinkedFrom", "isMuted",
    "getAncestors", "getChildren", "pendingTunnels",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = Message::Create {
            namespace: "b".into(),
            tunnel: 4,
            parent: Some("a".into()),
        };
        let record: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            record,
            serde_json::json!({ "name": "create", "namespace": "b", "tunnel": 4, "parent": "a" })
        );
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_camel_case_names() {
        let msg = Message::ListLinkedFrom { namespace: "a".into(), tunnel: 1 };
        let record: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(record["name"], "listLinkedFrom");
        assert_eq!(msg.name(), "listLinkedFrom");
    }

    #[test]
    fn test_every_known_name_has_a_variant() {
        for name in KNOWN {
            let record = serde_json::json!({ "name": name });
            let err = Message::decode(record.to_string().as_bytes()).err();
            assert!(
                !matches!(err, Some(Error::Unrecognized { .. })),
                "{} should be recognized",
                name
            );
        }
    }

    #[test]
    fn test_unrecognized_keeps_tunnel() {
        let bytes = br#"{"name":"explode","tunnel":9}"#;
        assert_eq!(
            Message::decode(bytes),
            Err(Error::Unrecognized { name: "explode".into(), tunnel: Some(9) })
        );
        let bytes = br#"{"name":"explode"}"#;
        assert_eq!(Message::decode(bytes).unwrap_err().tunnel(), None);
    }

    #[test]
    fn test_malformed_keeps_tunnel() {
        let bytes = br#"{"name":"create","tunnel":2}"#;
        let err = Message::decode(bytes).unwrap_err();
        assert!(matches!(err, Error::Malformed { tunnel: Some(2), .. }));
        assert!(Message::decode(b"not json").is_err());
    }

    #[test]
    fn test_accessors() {
        let emit = Message::Emit { namespace: "a".into(), event: "tick".into(), args: vec![] };
        assert_eq!(emit.tunnel(), None);
        assert_eq!(emit.namespace(), Some("a"));

        let reply = Message::Resolve { tunnel: 0, payload: Value::Null };
        assert_eq!(reply.tunnel(), Some(0));
        assert_eq!(reply.namespace(), None);
    }
}
