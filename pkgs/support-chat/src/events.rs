//! Chat data model, wire events and store notifications

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Who authored a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Support,
}

impl Sender {
    /// The other side of the conversation
    pub fn peer(self) -> Sender {
        match self {
            Sender::User => Sender::Support,
            Sender::Support => Sender::User,
        }
    }
}

/// Message payload kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
}

/// Message lifecycle status
///
/// `pending -> uploading -> sent -> delivered -> seen` is the forward chain,
/// `uploading` only ever applies to attachments. `failed` and `canceled` are
/// reachable from `pending`/`uploading`, and both return to `pending` on retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Uploading,
    Sent,
    Delivered,
    Seen,
    Failed,
    Canceled,
}

impl MessageStatus {
    /// Whether `self -> next` is a legal edge. Staying put is not a transition.
    ///
    /// `pending -> sent` is the text path, attachments go through `uploading`.
    /// A read receipt may overtake the delivery ack, so `sent -> seen` is legal.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading | Sent)
                | (Uploading, Sent)
                | (Sent, Delivered | Seen)
                | (Delivered, Seen)
                | (Pending | Uploading, Failed | Canceled)
                | (Failed | Canceled, Pending)
        )
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, MessageStatus::Failed | MessageStatus::Canceled)
    }

    /// Whether the message has left this client
    pub fn is_outbound_done(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Seen
        )
    }
}

/// A reference that can be turned into something displayable
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaRef {
    /// A link, possibly pointing at the auth-gated file endpoint
    Url(String),
    /// A storage key served by the auth-gated file endpoint
    Key(String),
}

/// Attachment addressing, resolved once when a message enters the store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Attachment {
    ExternalUrl {
        url: String,
        thumb_url: Option<String>,
    },
    StorageRef {
        file_key: String,
        thumb_key: Option<String>,
    },
}

impl Attachment {
    /// Reference to the full-size original
    pub fn original(&self) -> MediaRef {
        match self {
            Attachment::ExternalUrl { url, .. } => MediaRef::Url(url.clone()),
            Attachment::StorageRef { file_key, .. } => MediaRef::Key(file_key.clone()),
        }
    }

    /// Reference to the thumbnail, falling back to the original
    pub fn preview(&self) -> MediaRef {
        match self {
            Attachment::ExternalUrl {
                thumb_url: Some(thumb),
                ..
            } => MediaRef::Url(thumb.clone()),
            Attachment::StorageRef {
                thumb_key: Some(thumb),
                ..
            } => MediaRef::Key(thumb.clone()),
            _ => self.original(),
        }
    }

    pub fn thumb_key(&self) -> Option<&str> {
        match self {
            Attachment::StorageRef { thumb_key, .. } => thumb_key.as_deref(),
            Attachment::ExternalUrl { .. } => None,
        }
    }

    pub fn thumb_url(&self) -> Option<&str> {
        match self {
            Attachment::ExternalUrl { thumb_url, .. } => thumb_url.as_deref(),
            Attachment::StorageRef { .. } => None,
        }
    }

    pub fn has_thumbnail(&self) -> bool {
        self.thumb_key().is_some() || self.thumb_url().is_some()
    }
}

/// Attachment as it appears on the wire: either a bare URL or an object
/// carrying any mix of `file`, `thumb`, `url` and `thumbUrl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum WireAttachment {
    Url(String),
    Fields {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thumb: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(
            default,
            rename = "thumbUrl",
            skip_serializing_if = "Option::is_none"
        )]
        thumb_url: Option<String>,
    },
}

impl WireAttachment {
    /// Collapse the wire shape into a single addressing scheme.
    ///
    /// Storage keys win over direct links. Returns `None` when neither is present.
    pub fn resolve(self) -> Option<Attachment> {
        match self {
            WireAttachment::Url(url) if url.is_empty() => None,
            WireAttachment::Url(url) => Some(Attachment::ExternalUrl {
                url,
                thumb_url: None,
            }),
            WireAttachment::Fields {
                file: Some(file_key),
                thumb,
                ..
            } if !file_key.is_empty() => Some(Attachment::StorageRef {
                file_key,
                thumb_key: thumb.filter(|t| !t.is_empty()),
            }),
            WireAttachment::Fields {
                url: Some(url),
                thumb_url,
                ..
            } if !url.is_empty() => Some(Attachment::ExternalUrl {
                url,
                thumb_url: thumb_url.filter(|t| !t.is_empty()),
            }),
            WireAttachment::Fields { .. } => None,
        }
    }
}

impl From<&Attachment> for WireAttachment {
    fn from(attachment: &Attachment) -> Self {
        match attachment {
            Attachment::ExternalUrl { url, thumb_url } => WireAttachment::Fields {
                file: None,
                thumb: None,
                url: Some(url.clone()),
                thumb_url: thumb_url.clone(),
            },
            Attachment::StorageRef {
                file_key,
                thumb_key,
            } => WireAttachment::Fields {
                file: Some(file_key.clone()),
                thumb: thumb_key.clone(),
                url: None,
                thumb_url: None,
            },
        }
    }
}

/// Message entity owned by the [`MessageStore`](crate::MessageStore)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub local_id: String,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    /// Client wall-clock milliseconds at creation, the only ordering key
    pub timestamp: i64,
    pub status: MessageStatus,
    /// Upload progress mirrored from the upload task (0-100)
    pub progress: Option<u8>,
    /// Last failure, kept for the retry prompt
    pub error: Option<String>,
}

impl Message {
    /// A fresh optimistic message in `pending`
    pub fn outgoing(
        conversation_id: impl Into<String>,
        sender: Sender,
        kind: MessageKind,
        content: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender,
            content: content.into(),
            kind,
            attachment: None,
            timestamp,
            status: MessageStatus::Pending,
            progress: None,
            error: None,
        }
    }

    /// Whether this message may move to `next`, taking its kind into account
    pub fn can_move_to(&self, next: MessageStatus) -> bool {
        let attachment = self.kind != MessageKind::Text;
        match (self.status, next) {
            (MessageStatus::Pending, MessageStatus::Uploading) => attachment,
            (MessageStatus::Pending, MessageStatus::Sent) => !attachment,
            (from, to) => from.can_transition_to(to),
        }
    }

    /// Build a message from an inbound wire payload.
    ///
    /// Anything the peer has not marked `seen` counts as delivered to us.
    pub fn from_wire(wire: WireMessage) -> Self {
        let status = match wire.status {
            Some(MessageStatus::Seen) => MessageStatus::Seen,
            _ => MessageStatus::Delivered,
        };

        Self {
            local_id: wire
                .local_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            conversation_id: wire.conversation_id,
            sender: wire.sender,
            content: wire.content,
            kind: wire.kind,
            attachment: wire.attachment.and_then(WireAttachment::resolve),
            timestamp: wire.timestamp,
            status,
            progress: None,
            error: None,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            local_id: Some(self.local_id.clone()),
            conversation_id: self.conversation_id.clone(),
            sender: self.sender,
            content: self.content.clone(),
            kind: self.kind,
            attachment: self.attachment.as_ref().map(WireAttachment::from),
            timestamp: self.timestamp,
            status: Some(self.status),
        }
    }

    /// One-line preview for inbox listings
    pub fn preview(&self) -> String {
        match self.kind {
            MessageKind::Text => self.content.clone(),
            MessageKind::Image => format!("[image] {}", self.content),
            MessageKind::File => format!("[file] {}", self.content),
        }
    }
}

/// Message payload carried by `newMessage` and the REST history endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub conversation_id: String,
    pub sender: Sender,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<WireAttachment>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// Upload task status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Done,
    Error,
    Canceled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadStatus::Done | UploadStatus::Error | UploadStatus::Canceled
        )
    }
}

/// Outbound file transfer tracked by the [`UploadManager`](crate::UploadManager)
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    /// Weak back-reference, the message may already be gone from view
    pub message_local_id: String,
    pub progress: u8,
    pub status: UploadStatus,
    pub error: Option<String>,
    pub cancel_handle: CancellationToken,
}

/// Derived per-conversation row of the admin inbox, never stored
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub display_name: String,
    pub last_message_preview: Option<String>,
    pub last_timestamp: Option<i64>,
    pub unread_count: usize,
}

/// Transport event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Join,
    AdminJoin,
    NewMessage,
    TypingStart,
    TypingStop,
    AdminTypingStart,
    AdminTypingStop,
    MessageSeen,
    MessagesSeen,
    SessionEnded,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Join => "join",
            EventName::AdminJoin => "adminJoin",
            EventName::NewMessage => "newMessage",
            EventName::TypingStart => "typingStart",
            EventName::TypingStop => "typingStop",
            EventName::AdminTypingStart => "adminTypingStart",
            EventName::AdminTypingStop => "adminTypingStop",
            EventName::MessageSeen => "messageSeen",
            EventName::MessagesSeen => "messagesSeen",
            EventName::SessionEnded => "sessionEnded",
        }
    }
}

/// Events exchanged over the realtime channel.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ChatEvent {
    Join { conversation_id: String },
    AdminJoin,
    NewMessage(WireMessage),
    TypingStart { conversation_id: String },
    TypingStop { conversation_id: String },
    AdminTypingStart { conversation_id: String },
    AdminTypingStop { conversation_id: String },
    /// Produced by a client after viewing a batch of inbound messages
    MessageSeen { conversation_id: String, by: Sender },
    /// Relayed to the other side once the server accepted a `messageSeen`
    MessagesSeen { conversation_id: String, by: Sender },
    SessionEnded { conversation_id: String },
}

impl ChatEvent {
    pub fn name(&self) -> EventName {
        match self {
            ChatEvent::Join { .. } => EventName::Join,
            ChatEvent::AdminJoin => EventName::AdminJoin,
            ChatEvent::NewMessage(_) => EventName::NewMessage,
            ChatEvent::TypingStart { .. } => EventName::TypingStart,
            ChatEvent::TypingStop { .. } => EventName::TypingStop,
            ChatEvent::AdminTypingStart { .. } => EventName::AdminTypingStart,
            ChatEvent::AdminTypingStop { .. } => EventName::AdminTypingStop,
            ChatEvent::MessageSeen { .. } => EventName::MessageSeen,
            ChatEvent::MessagesSeen { .. } => EventName::MessagesSeen,
            ChatEvent::SessionEnded { .. } => EventName::SessionEnded,
        }
    }

    /// Conversation the event is scoped to, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            ChatEvent::AdminJoin => None,
            ChatEvent::NewMessage(message) => Some(&message.conversation_id),
            ChatEvent::Join { conversation_id }
            | ChatEvent::TypingStart { conversation_id }
            | ChatEvent::TypingStop { conversation_id }
            | ChatEvent::AdminTypingStart { conversation_id }
            | ChatEvent::AdminTypingStop { conversation_id }
            | ChatEvent::MessageSeen {
                conversation_id, ..
            }
            | ChatEvent::MessagesSeen {
                conversation_id, ..
            }
            | ChatEvent::SessionEnded { conversation_id } => Some(conversation_id),
        }
    }
}

/// Why a conversation transcript was emptied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    SessionExpired,
    SessionEnded,
    NewSession,
}

/// Change notifications published by the message store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Appended {
        conversation_id: String,
        local_id: String,
    },
    Ingested {
        conversation_id: String,
        local_id: String,
    },
    Updated {
        conversation_id: String,
        local_id: String,
        status: MessageStatus,
        progress: Option<u8>,
    },
    Cleared {
        conversation_id: String,
        reason: ClearReason,
        removed: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_chain_transitions() {
        use MessageStatus::*;

        assert!(Pending.can_transition_to(Uploading));
        assert!(Pending.can_transition_to(Sent));
        assert!(Uploading.can_transition_to(Sent));
        assert!(Sent.can_transition_to(Delivered));
        assert!(Sent.can_transition_to(Seen));
        assert!(Delivered.can_transition_to(Seen));
    }

    #[test]
    fn test_illegal_transitions() {
        use MessageStatus::*;

        assert!(!Seen.can_transition_to(Sent));
        assert!(!Delivered.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(Uploading));
        assert!(!Uploading.can_transition_to(Pending));
        assert!(!Sent.can_transition_to(Failed));
        assert!(!Seen.can_transition_to(Canceled));
        assert!(!Failed.can_transition_to(Sent));
        assert!(!Uploading.can_transition_to(Delivered));
        assert!(!Seen.can_transition_to(Seen));
        assert!(!Pending.can_transition_to(Delivered));
        assert!(!Pending.can_transition_to(Seen));
        assert!(!Uploading.can_transition_to(Seen));
        assert!(!Delivered.can_transition_to(Failed));
    }

    #[test]
    fn test_kind_decides_first_edge() {
        let text = Message::outgoing("u1", Sender::User, MessageKind::Text, "hi", 1);
        let image = Message::outgoing("u1", Sender::User, MessageKind::Image, "a.png", 1);

        assert!(text.can_move_to(MessageStatus::Sent));
        assert!(!text.can_move_to(MessageStatus::Uploading));
        assert!(image.can_move_to(MessageStatus::Uploading));
        assert!(!image.can_move_to(MessageStatus::Sent));
        assert!(image.can_move_to(MessageStatus::Canceled));
        assert!(!image.can_move_to(MessageStatus::Delivered));
    }

    #[test]
    fn test_retry_edges() {
        use MessageStatus::*;

        assert!(Failed.can_transition_to(Pending));
        assert!(Canceled.can_transition_to(Pending));
        assert!(Failed.is_retryable());
        assert!(!Sent.is_retryable());
    }

    #[test]
    fn test_wire_attachment_bare_url() {
        let wire: WireAttachment = serde_json::from_str(r#""https://cdn.example/a.png""#).unwrap();
        assert_eq!(
            wire.resolve(),
            Some(Attachment::ExternalUrl {
                url: "https://cdn.example/a.png".to_string(),
                thumb_url: None,
            })
        );
    }

    #[test]
    fn test_wire_attachment_prefers_storage_keys() {
        let wire: WireAttachment = serde_json::from_str(
            r#"{"file":"f-1","thumb":"t-1","url":"https://x/f","thumbUrl":"https://x/t"}"#,
        )
        .unwrap();
        let attachment = wire.resolve().unwrap();
        assert_eq!(attachment.thumb_key(), Some("t-1"));
        assert_eq!(attachment.original(), MediaRef::Key("f-1".to_string()));
        assert_eq!(attachment.preview(), MediaRef::Key("t-1".to_string()));
    }

    #[test]
    fn test_wire_attachment_without_address() {
        let wire: WireAttachment = serde_json::from_str(r#"{"thumb":"t-1"}"#).unwrap();
        assert_eq!(wire.resolve(), None);
    }

    #[test]
    fn test_chat_event_wire_format() {
        let event = ChatEvent::MessageSeen {
            conversation_id: "u42".to_string(),
            by: Sender::Support,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "messageSeen");
        assert_eq!(json["data"]["conversationId"], "u42");
        assert_eq!(json["data"]["by"], "support");

        let admin_join = serde_json::to_value(&ChatEvent::AdminJoin).unwrap();
        assert_eq!(admin_join["event"], "adminJoin");
        assert_eq!(ChatEvent::AdminJoin.name().as_str(), "adminJoin");
    }

    #[test]
    fn test_new_message_from_wire() {
        let json = r#"{
            "event": "newMessage",
            "data": {
                "conversationId": "u1",
                "sender": "user",
                "content": "photo.png",
                "type": "image",
                "attachment": {"url": "https://cdn.example/p.png", "thumbUrl": "https://cdn.example/p_t.png"},
                "timestamp": 1000
            }
        }"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        let ChatEvent::NewMessage(wire) = event else {
            panic!("Wrong event type");
        };
        let message = Message::from_wire(wire);
        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.kind, MessageKind::Image);
        assert!(!message.local_id.is_empty());
        assert_eq!(
            message.attachment.as_ref().and_then(|a| a.thumb_url()),
            Some("https://cdn.example/p_t.png")
        );
    }
}
