//! Message protocol definitions
//!
//! JSON envelopes exchanged over text frames. Requests carry a numeric
//! `type` and a free-form `data` object; responses mirror the type with
//! the ack code and add `code`, `message` and `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{ErrorCode, HandlerError};
use crate::types::RoomId;

/// Request and response type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    LoginReq,
    LoginAck,
    RoomSwitchReq,
    RoomSwitchAck,
    RoomChatReq,
    RoomChatAck,
    /// Chat line broadcast to a room
    RoomChatNtf,
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            MessageType::LoginReq => 1001,
            MessageType::LoginAck => 1002,
            MessageType::RoomSwitchReq => 2001,
            MessageType::RoomSwitchAck => 2002,
            MessageType::RoomChatReq => 3001,
            MessageType::RoomChatAck => 3002,
            MessageType::RoomChatNtf => 4001,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1001 => Some(MessageType::LoginReq),
            1002 => Some(MessageType::LoginAck),
            2001 => Some(MessageType::RoomSwitchReq),
            2002 => Some(MessageType::RoomSwitchAck),
            3001 => Some(MessageType::RoomChatReq),
            3002 => Some(MessageType::RoomChatAck),
            4001 => Some(MessageType::RoomChatNtf),
            _ => None,
        }
    }
}

/// Client → Server envelope
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(rename = "type", default)]
    pub kind: u32,
    #[serde(default)]
    pub data: Value,
}

impl Request {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode `data` into a typed payload
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, HandlerError> {
        let data = if self.data.is_null() {
            Value::Object(Default::default())
        } else {
            self.data.clone()
        };
        Ok(serde_json::from_value(data)?)
    }
}

/// Login request payload
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginData {
    #[serde(rename = "userName")]
    pub user_name: String,
}

/// Room switch request payload
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SwitchData {
    pub room: i64,
}

/// Chat request payload
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ChatData {
    pub message: String,
}

/// Payload of a successful login or room switch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomJoined {
    #[serde(rename = "roomID")]
    pub room_id: RoomId,
    #[serde(rename = "userName")]
    pub user_name: String,
}

/// Server → Client ack envelope
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: u32,
    pub code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn ok<T: Serialize>(ack: u32, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: ack,
            code: ErrorCode::Ok.value(),
            message: String::new(),
            data: Some(serde_json::to_value(data)?),
        })
    }

    /// Error envelope for a failed request
    pub fn error(ack: u32, err: &HandlerError) -> Self {
        Self {
            kind: ack,
            code: err.code().value(),
            message: err.to_string(),
            data: None,
        }
    }

    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Body of a chat broadcast
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatNotify {
    pub message: String,
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "sendTime")]
    pub send_time: String,
}

/// Broadcast envelope (`type` 4001)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notify<T> {
    #[serde(rename = "type")]
    pub kind: u32,
    pub data: T,
}

impl Notify<ChatNotify> {
    pub fn chat(data: ChatNotify) -> Self {
        Self {
            kind: MessageType::RoomChatNtf.code(),
            data,
        }
    }

    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}
