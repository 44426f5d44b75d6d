//! Rocket.Chat realtime API frames (JSON over websocket).

use crate::channels::IncomingPayload;
use crate::error::AuthFailure;
use serde::Deserialize;
use serde_json::{json, Value};

pub const STREAM_ROOM_MESSAGES: &str = "stream-room-messages";

pub fn connect_frame() -> Value {
    json!({ "msg": "connect", "version": "1", "support": ["1"] })
}

pub fn pong_frame() -> Value {
    json!({ "msg": "pong" })
}

/// `{"msg":"method", ...}`; `params` is omitted when null.
pub fn method_frame(id: &str, method: &str, params: Value) -> Value {
    let mut frame = json!({ "msg": "method", "method": method, "id": id });
    if !params.is_null() {
        frame["params"] = params;
    }
    frame
}

pub fn login_params(username: &str, password: &str) -> Value {
    json!([{ "user": { "username": username }, "password": password }])
}

pub fn subscribe_frame(id: &str, room_id: &str) -> Value {
    json!({ "msg": "sub", "name": STREAM_ROOM_MESSAGES, "id": id, "params": [room_id, false] })
}

pub fn send_message_frame(id: &str, room_id: &str, text: &str, emoji: &str) -> Value {
    method_frame(
        id,
        "sendMessage",
        json!([{ "rid": room_id, "msg": text, "emoji": emoji }]),
    )
}

#[derive(Debug, Deserialize)]
struct ServerFrame {
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    fields: Option<ChangedFields>,
}

#[derive(Debug, Deserialize)]
struct ChangedFields {
    #[serde(default)]
    args: Vec<Value>,
}

/// One message inside a `stream-room-messages` change.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomMessage {
    pub rid: String,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub u: Option<RoomUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomUser {
    #[serde(default)]
    pub username: Option<String>,
}

/// Classification of one server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    /// Any frame tagged with an id: candidate reply to a correlated call.
    Reply { id: String, body: Value },
    /// Id-less acknowledgement (`connected` / `failed`).
    Ack(Value),
    /// New messages in subscribed rooms.
    RoomMessages(Vec<RoomMessageRef>),
    Other(String),
}

/// The parts of a room message the dispatcher needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessageRef {
    pub rid: String,
    pub username: Option<String>,
    pub text: String,
}

impl RoomMessageRef {
    pub fn into_payload(self) -> IncomingPayload {
        IncomingPayload::new(self.rid, self.username, self.text)
    }
}

/// Parse and classify a text frame. Errors are unparsable frames.
pub fn classify(text: &str) -> Result<Frame, serde_json::Error> {
    let body: Value = serde_json::from_str(text)?;
    let frame: ServerFrame = serde_json::from_value(body.clone())?;
    let kind = frame.msg.as_deref().unwrap_or("");
    Ok(match kind {
        "ping" => Frame::Ping,
        "changed" if frame.collection.as_deref() == Some(STREAM_ROOM_MESSAGES) => {
            let args = frame.fields.map(|f| f.args).unwrap_or_default();
            Frame::RoomMessages(
                args.into_iter()
                    .filter_map(|arg| serde_json::from_value::<RoomMessage>(arg).ok())
                    .filter_map(|m| {
                        Some(RoomMessageRef {
                            rid: m.rid,
                            username: m.u.and_then(|u| u.username),
                            text: m.msg?,
                        })
                    })
                    .collect(),
            )
        }
        "changed" | "added" | "removed" => Frame::Other(text.to_string()),
        "connected" | "failed" if frame.id.is_none() => Frame::Ack(body),
        _ => match frame.id {
            Some(id) => Frame::Reply { id, body },
            None => Frame::Other(text.to_string()),
        },
    })
}

/// Classify a login reply. Any error marker fails the attempt.
pub fn classify_login(body: &Value) -> Result<(), AuthFailure> {
    let text = body.to_string();
    if text.contains("User not found") {
        Err(AuthFailure::UserNotFound)
    } else if text.contains("Incorrect password") {
        Err(AuthFailure::IncorrectPassword)
    } else if text.contains("Meteor.Error") || body.get("error").is_some() {
        Err(AuthFailure::ProtocolError(text))
    } else {
        Ok(())
    }
}

/// Room ids from a `subscriptions/get` reply (plain list or `{update: [...]}`).
pub fn subscription_room_ids(body: &Value) -> Vec<String> {
    let result = body.get("result");
    let items = match result {
        Some(Value::Array(items)) => items.as_slice(),
        Some(Value::Object(obj)) => obj
            .get("update")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    items
        .iter()
        .filter_map(|s| s.get("rid").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
