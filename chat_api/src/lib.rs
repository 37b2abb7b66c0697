use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod capture;

/// Identifier of a user in the directory.
pub type UserId = u32;

/// Maximum length of a text message, counted in characters.
pub const MAX_CONTENT_CHARS: usize = 1000;

/// Display summary of a user as resolved by the user directory.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Reference to a stored voice clip.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub url: String,
    pub duration_seconds: u32,
}

/// Payload of a message. A message carries either text or audio, never both.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Text { content: String },
    Audio { audio: AudioClip },
}

impl MessageBody {
    pub fn text(content: impl Into<String>) -> Self {
        MessageBody::Text {
            content: content.into(),
        }
    }

    pub fn audio(url: impl Into<String>, duration_seconds: u32) -> Self {
        MessageBody::Audio {
            audio: AudioClip {
                url: url.into(),
                duration_seconds,
            },
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            MessageBody::Text { content } => Some(content),
            MessageBody::Audio { .. } => None,
        }
    }

    pub fn audio_clip(&self) -> Option<&AudioClip> {
        match self {
            MessageBody::Text { .. } => None,
            MessageBody::Audio { audio } => Some(audio),
        }
    }
}

/// A persisted direct message with both participants populated.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub sender: UserSummary,
    pub receiver: UserSummary,
    #[serde(flatten)]
    pub body: MessageBody,
    pub is_read: bool,
    /// Unix milliseconds; present iff `is_read`.
    pub read_at: Option<i64>,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Message {
    /// The participant on the other side of `user`.
    pub fn counterpart_of(&self, user: UserId) -> &UserSummary {
        if self.sender.id == user {
            &self.receiver
        } else {
            &self.sender
        }
    }
}

/// One inbox row: the latest message exchanged with a counterpart.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub counterpart: UserSummary,
    pub last_message: Message,
    pub unread_count: u32,
}

/// A page of a conversation, oldest message first.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationPage {
    pub messages: Vec<Message>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
}

/// Events a client sends over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Join { user_id: UserId },
    Leave,
    Typing { receiver_id: UserId },
    StopTyping { receiver_id: UserId },
}

/// Events the server pushes over the realtime channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Joined { user_id: UserId },
    Left,
    ReceiveMessage(Message),
    MessageRead { message_id: Uuid, read_at: i64 },
    MessageDeleted { message_id: Uuid },
    Typing { sender_id: UserId },
    StopTyping { sender_id: UserId },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: UserId, name: &str) -> UserSummary {
        UserSummary {
            id,
            username: name.to_lowercase(),
            name: name.into(),
            avatar_url: None,
        }
    }

    #[test]
    fn message_body_is_flattened_with_kind_tag() {
        let msg = Message {
            id: Uuid::nil(),
            sender: user(1, "Alice"),
            receiver: user(2, "Bob"),
            body: MessageBody::audio("http://host/api/files/ab", 5),
            is_read: false,
            read_at: None,
            created_at: 10,
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["kind"], "audio");
        assert_eq!(v["audio"]["duration_seconds"], 5);
        assert!(v.get("content").is_none());
        let back: Message = serde_json::from_value(v).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn client_events_parse_from_wire() {
        let join: ClientEvent =
            serde_json::from_value(json!({"event":"join","data":{"user_id":7}})).unwrap();
        assert_eq!(join, ClientEvent::Join { user_id: 7 });
        let leave: ClientEvent = serde_json::from_value(json!({"event":"leave"})).unwrap();
        assert_eq!(leave, ClientEvent::Leave);
        let stop: ClientEvent =
            serde_json::from_value(json!({"event":"stop_typing","data":{"receiver_id":2}}))
                .unwrap();
        assert_eq!(stop, ClientEvent::StopTyping { receiver_id: 2 });
    }

    #[test]
    fn server_typing_event_names_sender() {
        let v = serde_json::to_value(ServerEvent::Typing { sender_id: 3 }).unwrap();
        assert_eq!(v, json!({"event":"typing","data":{"sender_id":3}}));
    }

    #[test]
    fn counterpart_is_other_side() {
        let msg = Message {
            id: Uuid::new_v4(),
            sender: user(1, "Alice"),
            receiver: user(2, "Bob"),
            body: MessageBody::text("hi"),
            is_read: false,
            read_at: None,
            created_at: 0,
        };
        assert_eq!(msg.counterpart_of(1).id, 2);
        assert_eq!(msg.counterpart_of(2).id, 1);
        assert_eq!(msg.body.content(), Some("hi"));
        assert!(msg.body.audio_clip().is_none());
    }
}
