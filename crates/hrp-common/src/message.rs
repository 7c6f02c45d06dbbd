//! JSON wire messages for the client channel.
//!
//! Every frame is a JSON object with a `type` discriminator, sent as a
//! WebSocket text message. Clients send short control messages; the server
//! pushes payloads and answers control messages synchronously.

use crate::types::ConnectionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client may send after the channel is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a named group; the group is created on first join.
    JoinGroup {
        /// Group to join.
        group: String,
    },
    /// Leave a named group; a no-op if not a member.
    LeaveGroup {
        /// Group to leave.
        group: String,
    },
    /// Application-level keepalive request.
    Ping,
}

/// Error codes carried in [`ServerMessage::Error`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The presented token was rejected.
    Unauthorized,
    /// The server is at its connection capacity.
    CapacityExceeded,
    /// The message could not be parsed or referenced an unknown operation.
    BadRequest,
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after a successful connect.
    Welcome {
        /// The id assigned to this connection.
        connection_id: ConnectionId,
    },
    /// A published payload, relayed verbatim.
    Push {
        /// Opaque JSON payload supplied by the publisher.
        payload: Value,
    },
    /// Acknowledges a group membership operation.
    Ack {
        /// The acknowledged operation (`join_group` or `leave_group`).
        op: String,
        /// The group the operation applied to.
        group: String,
    },
    /// Reports a failed client request or a rejected connection.
    Error {
        /// Machine-readable error code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// Application-level keepalive response.
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_group_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_group","group":"ops"}"#).unwrap();
        assert_eq!(msg, ClientMessage::JoinGroup { group: "ops".into() });
    }

    #[test]
    fn ping_wire_shape() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn welcome_serializes_with_numeric_id() {
        let json = serde_json::to_value(ServerMessage::Welcome {
            connection_id: ConnectionId(7),
        })
        .unwrap();
        assert_eq!(json, json!({"type": "welcome", "connection_id": 7}));
    }

    #[test]
    fn push_payload_passes_through_verbatim() {
        let payload = json!({"hello": 1, "nested": {"a": [1, 2, 3]}});
        let frame = ServerMessage::Push {
            payload: payload.clone(),
        };
        let wire = serde_json::to_string(&frame).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed, ServerMessage::Push { payload });
    }

    #[test]
    fn error_code_is_snake_case() {
        let json = serde_json::to_value(ServerMessage::Error {
            code: ErrorCode::CapacityExceeded,
            message: "full".into(),
        })
        .unwrap();
        assert_eq!(json["code"], "capacity_exceeded");
    }
}
