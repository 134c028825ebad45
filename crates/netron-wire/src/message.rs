//! Wire protocol packet types.
//!
//! All communication between Netron runtimes uses JSON packets. Over a byte
//! stream each packet is prefixed with a 4-byte big-endian length header.

use netron_types::definition::Definition;
use netron_types::error::{NetronError, NetronResult};
use netron_types::event::NetronEvent;
use netron_types::serde_compat::deserialize_some;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum single packet size (16 MB).
pub const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;

/// A wire protocol packet (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Request id, echoed by the matching response. Notifications use 0.
    pub id: u64,
    /// Packet variant.
    #[serde(flatten)]
    pub kind: PacketKind,
}

impl Packet {
    pub fn request(id: u64, request: Request) -> Self {
        Self {
            id,
            kind: PacketKind::Request(request),
        }
    }

    pub fn response(id: u64, response: Response) -> Self {
        Self {
            id,
            kind: PacketKind::Response(response),
        }
    }

    pub fn notification(notification: Notification) -> Self {
        Self {
            id: 0,
            kind: PacketKind::Notification(notification),
        }
    }
}

/// The different kinds of packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PacketKind {
    /// Request from one peer to another.
    #[serde(rename = "request")]
    Request(Request),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(Response),
    /// One-way notification (no response expected).
    #[serde(rename = "notification")]
    Notification(Notification),
}

/// Identity exchanged in both directions while handshaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    /// Sender's runtime uid.
    pub uid: String,
    /// Whether the sender runs in hub mode.
    #[serde(default)]
    pub is_super: bool,
    /// Protocol version.
    pub protocol_version: u32,
    /// Definitions the sender exposes to the receiver.
    #[serde(default)]
    pub definitions: Vec<Definition>,
    /// Free-form data added by handshake hooks (authentication etc.).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
}

impl Handshake {
    pub fn new(uid: impl Into<String>, is_super: bool, definitions: Vec<Definition>) -> Self {
        Self {
            uid: uid.into(),
            is_super,
            protocol_version: PROTOCOL_VERSION,
            definitions,
            payload: Map::new(),
        }
    }
}

/// Request packets.
///
/// `name` is the member being accessed on the target definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Request {
    /// Open the session.
    #[serde(rename = "handshake")]
    Handshake(Handshake),
    /// Read a property.
    #[serde(rename = "get")]
    Get { def_id: u64, name: String },
    /// Write a property. A missing `value` writes undefined.
    #[serde(rename = "set")]
    Set {
        def_id: u64,
        name: String,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        value: Option<Value>,
    },
    /// Invoke a method and return its result.
    #[serde(rename = "call")]
    Call {
        def_id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Invoke a method. Never answered.
    #[serde(rename = "call_void")]
    CallVoid {
        def_id: u64,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Liveness check.
    #[serde(rename = "ping")]
    Ping,
    /// Expose a context of the sender on the receiving hub.
    #[serde(rename = "context_attach")]
    AttachContext { definition: Definition },
    /// Withdraw a context the sender attached on the receiving hub.
    #[serde(rename = "context_detach")]
    DetachContext { name: String },
    /// Start forwarding runtime events of one kind to the sender.
    #[serde(rename = "event_on")]
    Subscribe { event: String },
    /// Stop forwarding runtime events of one kind.
    #[serde(rename = "event_off")]
    Unsubscribe { event: String },
}

impl Request {
    /// Short name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Handshake(_) => "handshake",
            Request::Get { .. } => "get",
            Request::Set { .. } => "set",
            Request::Call { .. } => "call",
            Request::CallVoid { .. } => "call_void",
            Request::Ping => "ping",
            Request::AttachContext { .. } => "context_attach",
            Request::DetachContext { .. } => "context_detach",
            Request::Subscribe { .. } => "event_on",
            Request::Unsubscribe { .. } => "event_off",
        }
    }

    /// Whether the receiver answers this request.
    pub fn expects_response(&self) -> bool {
        !matches!(self, Request::CallVoid { .. })
    }
}

/// Response packets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum Response {
    /// Handshake accepted; carries the responder's identity.
    #[serde(rename = "handshake_ack")]
    HandshakeAck(Handshake),
    /// Result of a `get` or `call`. A missing `value` means undefined.
    #[serde(rename = "value")]
    Value {
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            deserialize_with = "deserialize_some"
        )]
        value: Option<Value>,
    },
    /// Empty acknowledgement of `set`, `ping` and the hub and event requests.
    #[serde(rename = "ack")]
    Ack,
    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },
}

impl Response {
    /// Error packet for a runtime error.
    pub fn error(err: &NetronError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.wire_message(),
        }
    }

    /// Turn an `error` packet back into an error.
    pub fn into_result(self) -> NetronResult<Response> {
        match self {
            Response::Error { code, message } => Err(NetronError::from_wire(code, message)),
            other => Ok(other),
        }
    }

    /// Extract the carried value; `ack` yields undefined.
    pub fn into_value(self) -> NetronResult<Option<Value>> {
        match self.into_result()? {
            Response::Value { value } => Ok(value),
            Response::Ack => Ok(None),
            other => Err(NetronError::Protocol(format!(
                "unexpected response {other:?}"
            ))),
        }
    }
}

/// Notification packets (one-way, no response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Notification {
    /// A context became available on the sender.
    #[serde(rename = "context_attach")]
    ContextAttach { definition: Definition },
    /// A context was removed from the sender.
    #[serde(rename = "context_detach")]
    ContextDetach { name: String, def_id: u64 },
    /// A runtime event the receiver subscribed to.
    #[serde(rename = "event_emit")]
    Event { data: NetronEvent },
}

/// Encode a packet to bytes (4-byte big-endian length + JSON).
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(packet)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a packet.
pub fn decode_packet(body: &[u8]) -> Result<Packet, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netron_types::definition::PropertyDescriptor;
    use serde_json::json;

    fn definition() -> Definition {
        Definition {
            id: 4,
            name: "a".to_string(),
            methods: vec!["method".to_string()],
            properties: vec![PropertyDescriptor {
                name: "counter".to_string(),
                readonly: false,
            }],
        }
    }

    #[test]
    fn test_frame_length_prefix() {
        let packet = Packet::request(1, Request::Ping);
        let bytes = encode_packet(&packet).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        assert_eq!(decode_packet(&bytes[4..]).unwrap(), packet);
    }

    #[test]
    fn test_handshake_serialization() {
        let mut hs = Handshake::new("node-abc", true, vec![definition()]);
        hs.payload.insert("nonce".to_string(), json!("n-1"));
        let packet = Packet::request(7, Request::Handshake(hs));
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["method"], "handshake");
        assert_eq!(json["uid"], "node-abc");
        assert_eq!(json["definitions"][0]["name"], "a");
        let decoded: Packet = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_set_distinguishes_undefined_from_null() {
        let undefined = Packet::request(
            2,
            Request::Set {
                def_id: 1,
                name: "p".to_string(),
                value: None,
            },
        );
        let json = serde_json::to_value(&undefined).unwrap();
        assert!(json.get("value").is_none());
        assert_eq!(serde_json::from_value::<Packet>(json).unwrap(), undefined);

        let null = Packet::request(
            3,
            Request::Set {
                def_id: 1,
                name: "p".to_string(),
                value: Some(Value::Null),
            },
        );
        let bytes = encode_packet(&null).unwrap();
        assert_eq!(decode_packet(&bytes[4..]).unwrap(), null);
    }

    #[test]
    fn test_error_response_restores_error() {
        let err = NetronError::Remote("I'm an error!".to_string());
        let packet = Packet::response(9, Response::error(&err));
        let json = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&json).unwrap();
        match decoded.kind {
            PacketKind::Response(resp) => match resp.into_result() {
                Err(NetronError::Remote(msg)) => assert_eq!(msg, "I'm an error!"),
                other => panic!("Expected Remote error, got {other:?}"),
            },
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_into_value() {
        assert_eq!(Response::Ack.into_value().unwrap(), None);
        assert_eq!(
            Response::Value {
                value: Some(json!([1, 2, 3]))
            }
            .into_value()
            .unwrap(),
            Some(json!([1, 2, 3]))
        );
        assert!(matches!(
            Response::HandshakeAck(Handshake::new("x", false, vec![])).into_value(),
            Err(NetronError::Protocol(_))
        ));
    }

    #[test]
    fn test_hub_request_serialization() {
        let packet = Packet::request(
            5,
            Request::AttachContext {
                definition: definition(),
            },
        );
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["method"], "context_attach");
        assert_eq!(json["definition"]["id"], 4);
        assert_eq!(serde_json::from_value::<Packet>(json).unwrap(), packet);

        let off = Packet::request(
            6,
            Request::Unsubscribe {
                event: "peer online".to_string(),
            },
        );
        let bytes = encode_packet(&off).unwrap();
        assert_eq!(decode_packet(&bytes[4..]).unwrap(), off);
    }

    #[test]
    fn test_call_void_expects_no_response() {
        let void = Request::CallVoid {
            def_id: 1,
            name: "m".to_string(),
            args: vec![],
        };
        assert!(!void.expects_response());
        assert!(Request::Ping.expects_response());
    }

    #[test]
    fn test_event_notification_keeps_event() {
        let packet = Packet::notification(Notification::Event {
            data: NetronEvent::PeerOnline {
                peer_id: 2,
                uid: "b".to_string(),
            },
        });
        let json = serde_json::to_value(&packet).unwrap();
        assert_eq!(json["event"], "event_emit");
        assert_eq!(json["data"]["event"], "peer_online");
        assert_eq!(serde_json::from_value::<Packet>(json).unwrap(), packet);
    }

    #[test]
    fn test_notification_serialization() {
        let packet = Packet::notification(Notification::ContextDetach {
            name: "a".to_string(),
            def_id: 4,
        });
        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains("context_detach"));
        let decoded: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, 0);
        assert_eq!(decoded, packet);
    }
}
