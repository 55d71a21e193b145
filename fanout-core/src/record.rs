//! Stream record codec.
//!
//! Every row of the shared stream is a self-describing document: namespace,
//! originating instance, optional wall-clock timestamp, and a payload
//! discriminated by `type`. Heartbeats travel as `request`/`HEARTBEAT`
//! rows so cluster liveness shares the stream's ordering and retention.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use fanout_stream::Offset;

use crate::options::BroadcastOptions;
use crate::packet::Packet;
use crate::session::{PrivateId, SocketId};

/// Identifier of an adapter instance, one per process and namespace.
pub type InstanceId = Uuid;

/// Correlation id of a request/response exchange.
pub type RequestId = Uuid;

/// One row of the shared stream. The store-assigned offset travels next to
/// the record, never inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Namespace the record belongs to.
    pub nsp: String,

    /// Originating instance. Listeners skip their own records.
    pub uid: InstanceId,

    /// Wall-clock insert time, written only for store-side TTL pruning.
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    /// Discriminated payload.
    #[serde(flatten)]
    pub payload: RecordPayload,
}

/// Payload of a stream record, discriminated by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum RecordPayload {
    /// A packet fanned out to matching sockets on every instance.
    Broadcast {
        packet: Packet,
        #[serde(default)]
        opts: BroadcastOptions,
    },

    /// A request addressed to every other instance.
    Request(RequestFrame),

    /// One instance's response to a request.
    Response(ResponseFrame),

    /// One instance's aggregate of local client acks for a
    /// broadcast-with-ack request.
    Ack(ResponseFrame),

    /// Arguments for the namespace-level listeners of other instances.
    /// Never delivered to client sockets.
    ServerSideEmit { args: Vec<Value> },

    /// A persisted recoverable session.
    Session(SessionRow),
}

/// A request and its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub op: RequestOp,
}

/// The operations an instance can ask its peers to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "requestType", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestOp {
    /// Enumerate socket ids matching a filter.
    Sockets { opts: BroadcastOptions },

    /// Enumerate room names.
    AllRooms,

    /// Join a socket to rooms wherever it lives.
    RemoteJoin {
        sid: SocketId,
        rooms: BTreeSet<String>,
    },

    /// Remove a socket from a room wherever it lives.
    RemoteLeave { sid: SocketId, room: String },

    /// Disconnect a socket wherever it lives.
    RemoteDisconnect { sid: SocketId, close: bool },

    /// Return serialized views of sockets matching a filter.
    RemoteFetch { opts: BroadcastOptions },

    /// Invoke namespace-level listeners and collect their replies.
    ServerSideEmit { args: Vec<Value> },

    /// Broadcast a packet and collect client acks.
    BroadcastWithAck {
        packet: Packet,
        opts: BroadcastOptions,
    },

    /// Instance liveness beacon. `initial` marks the first beacon after
    /// init; peers answer it immediately so the newcomer converges on the
    /// cluster size before its first request.
    Heartbeat {
        #[serde(default)]
        initial: bool,
    },
}

impl RequestOp {
    /// Whether peers answer this request with a response record.
    #[must_use]
    pub fn expects_responses(&self) -> bool {
        !matches!(self, RequestOp::Heartbeat { .. })
    }
}

/// A response (or ack) and the correlation id it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub request_id: RequestId,
    #[serde(default)]
    pub data: Value,
}

/// A recoverable session persisted to the stream at disconnect time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRow {
    pub sid: SocketId,
    pub pid: PrivateId,
    pub rooms: BTreeSet<String>,
    pub last_offset: Offset,
    pub disconnected_at: DateTime<Utc>,
}

/// A stream row that does not decode as a [`Record`].
///
/// Listeners drop the row, log it, and keep going.
#[derive(Debug, Clone, thiserror::Error)]
#[error("malformed record: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
}

impl Record {
    /// Encode the record into its document form.
    pub fn encode(&self) -> Result<Value, MalformedRecord> {
        serde_json::to_value(self).map_err(|e| MalformedRecord {
            reason: e.to_string(),
        })
    }

    /// Decode a document into a record. Unknown `type` tags and missing
    /// required fields fail here.
    pub fn decode(value: Value) -> Result<Record, MalformedRecord> {
        serde_json::from_value(value).map_err(|e| MalformedRecord {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(payload: RecordPayload) -> Record {
        Record {
            nsp: "/".to_string(),
            uid: Uuid::new_v4(),
            created_at: None,
            payload,
        }
    }

    #[test]
    fn broadcast_record_roundtrip() {
        let original = record(RecordPayload::Broadcast {
            packet: Packet::from(json!(["chat", "hello"])),
            opts: BroadcastOptions::new().to("room1").except("room2"),
        });

        let encoded = original.encode().unwrap();
        assert_eq!(encoded["type"], "broadcast");
        assert_eq!(encoded["data"]["opts"]["rooms"], json!(["room1"]));

        let decoded = Record::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn request_record_roundtrip() {
        let original = record(RecordPayload::Request(RequestFrame {
            request_id: Uuid::new_v4(),
            op: RequestOp::Sockets {
                opts: BroadcastOptions::new().to("r"),
            },
        }));

        let encoded = original.encode().unwrap();
        assert_eq!(encoded["type"], "request");
        assert_eq!(encoded["data"]["requestType"], "SOCKETS");

        let decoded = Record::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn all_request_ops_roundtrip() {
        let sid = SocketId::from("s-1");
        let ops = vec![
            RequestOp::AllRooms,
            RequestOp::RemoteJoin {
                sid: sid.clone(),
                rooms: ["a".to_string(), "b".to_string()].into(),
            },
            RequestOp::RemoteLeave {
                sid: sid.clone(),
                room: "a".to_string(),
            },
            RequestOp::RemoteDisconnect { sid, close: true },
            RequestOp::RemoteFetch {
                opts: BroadcastOptions::new(),
            },
            RequestOp::ServerSideEmit {
                args: vec![json!("ping"), json!(1)],
            },
            RequestOp::BroadcastWithAck {
                packet: Packet::from(json!(["ev"])),
                opts: BroadcastOptions::new().to("r"),
            },
            RequestOp::Heartbeat { initial: true },
        ];

        for op in ops {
            let original = record(RecordPayload::Request(RequestFrame {
                request_id: Uuid::new_v4(),
                op,
            }));
            let decoded = Record::decode(original.encode().unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn response_and_ack_roundtrip() {
        for payload in [
            RecordPayload::Response(ResponseFrame {
                request_id: Uuid::new_v4(),
                data: json!(["s1", "s2"]),
            }),
            RecordPayload::Ack(ResponseFrame {
                request_id: Uuid::new_v4(),
                data: json!([{"ok": true}]),
            }),
        ] {
            let original = record(payload);
            let decoded = Record::decode(original.encode().unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn session_record_roundtrip() {
        let original = record(RecordPayload::Session(SessionRow {
            sid: SocketId::from("s-1"),
            pid: Uuid::new_v4(),
            rooms: ["room1".to_string()].into(),
            last_offset: Offset(42),
            disconnected_at: Utc::now(),
        }));

        let encoded = original.encode().unwrap();
        assert_eq!(encoded["type"], "session");
        assert_eq!(encoded["data"]["lastOffset"], 42);

        let decoded = Record::decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn created_at_is_optional_and_preserved() {
        let mut original = record(RecordPayload::ServerSideEmit { args: vec![] });
        assert!(!original.encode().unwrap().as_object().unwrap().contains_key("createdAt"));

        original.created_at = Some(Utc::now());
        let decoded = Record::decode(original.encode().unwrap()).unwrap();
        assert_eq!(decoded.created_at, original.created_at);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let doc = json!({
            "nsp": "/",
            "uid": Uuid::new_v4(),
            "type": "gossip",
            "data": {}
        });
        assert!(Record::decode(doc).is_err());
    }

    #[test]
    fn missing_fields_are_malformed() {
        let doc = json!({
            "type": "broadcast",
            "data": {"packet": ["ev"]}
        });
        assert!(Record::decode(doc).is_err());

        let doc = json!({
            "nsp": "/",
            "uid": Uuid::new_v4(),
            "type": "request",
            "data": {"requestType": "SOCKETS"}
        });
        assert!(Record::decode(doc).is_err(), "request without id or args");
    }

    #[test]
    fn heartbeat_expects_no_responses() {
        assert!(!RequestOp::Heartbeat { initial: false }.expects_responses());
        assert!(RequestOp::AllRooms.expects_responses());
    }
}
