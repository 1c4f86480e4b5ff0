//! Wire protocol: JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { notebook_id: String },
    Unsubscribe { notebook_id: String },
    Ping,
    LockCell { notebook_id: String, cell_id: String },
    UnlockCell { notebook_id: String, cell_id: String },
    ExecuteCell {
        notebook_id: String,
        cell_id: String,
        code: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, String> {
        serde_json::from_str(text).map_err(|e| format!("invalid message: {e}"))
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Direct replies to one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Subscribed {
        notebook_id: String,
    },
    Unsubscribed {
        notebook_id: String,
    },
    Pong,
    Error {
        message: String,
    },
    /// The requester's lock attempt lost; `payload` names the holder.
    LockDenied {
        notebook_id: String,
        payload: serde_json::Value,
    },
}

/// Domain event fanned out to every subscriber of a notebook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CellUpdated,
    LockChanged,
    ExecutionResult,
    InstallProgress,
    FeatureMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub notebook_id: String,
    pub payload: serde_json::Value,
}

impl NotebookEvent {
    pub fn new(kind: EventKind, notebook_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            notebook_id: notebook_id.into(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_subscription_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe","notebookId":"nb1"}"#).unwrap(),
            ClientMessage::Subscribe {
                notebook_id: "nb1".into()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            ClientMessage::Ping
        );
        assert_eq!(
            ClientMessage::parse(
                r#"{"type":"execute_cell","notebookId":"nb1","cellId":"c1","code":"print(1)"}"#
            )
            .unwrap(),
            ClientMessage::ExecuteCell {
                notebook_id: "nb1".into(),
                cell_id: "c1".into(),
                code: "print(1)".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_and_incomplete_messages() {
        assert!(ClientMessage::parse(r#"{"type":"explode"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn server_messages_are_tagged() {
        let json = serde_json::to_value(ServerMessage::Subscribed {
            notebook_id: "nb1".into(),
        })
        .unwrap();
        assert_eq!(json, json!({"type": "subscribed", "notebookId": "nb1"}));

        let json = serde_json::to_value(ServerMessage::Pong).unwrap();
        assert_eq!(json, json!({"type": "pong"}));
    }

    #[test]
    fn events_carry_notebook_and_payload() {
        let event = NotebookEvent::new(EventKind::LockChanged, "nb1", json!({"cellId": "c1"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({"type": "lock_changed", "notebookId": "nb1", "payload": {"cellId": "c1"}})
        );
    }
}
