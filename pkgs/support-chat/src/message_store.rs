//! Message store - ordered per-conversation message state and lifecycle

use crate::error::{ChatError, Result};
use crate::events::{Attachment, ClearReason, Message, MessageStatus, Sender, StoreEvent};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Composite identity used to recognise echoes of our own messages.
/// Scoped per conversation, so the conversation id is implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EchoKey {
    timestamp: i64,
    content: String,
    sender: Sender,
}

impl EchoKey {
    fn of(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            content: message.content.clone(),
            sender: message.sender,
        }
    }
}

#[derive(Debug, Default)]
struct Conversation {
    /// Sorted by timestamp, ties keep insertion order
    messages: Vec<Message>,
    /// Kept in lockstep with `messages`
    echo_index: HashMap<EchoKey, String>,
}

impl Conversation {
    fn insert(&mut self, message: Message) {
        self.echo_index
            .insert(EchoKey::of(&message), message.local_id.clone());
        let pos = self
            .messages
            .partition_point(|m| m.timestamp <= message.timestamp);
        self.messages.insert(pos, message);
    }

    fn get_mut(&mut self, local_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.local_id == local_id)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    conversations: HashMap<String, Conversation>,
    /// local_id -> conversation_id
    locations: HashMap<String, String>,
}

/// Partial update applied through [`MessageStore::update_by_local_id`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub status: Option<MessageStatus>,
    pub attachment: Option<Attachment>,
    pub progress: Option<u8>,
    pub error: Option<String>,
}

impl MessagePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MessageStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachment = Some(attachment);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Message store - exclusive owner of message lifecycle.
///
/// Every mutation runs under one lock and publishes a [`StoreEvent`] to all
/// subscribers once the lock is released.
#[derive(Debug, Default)]
pub struct MessageStore {
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl MessageStore {
    /// Create an empty message store
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn notify(&self, events: Vec<StoreEvent>) {
        if events.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| {
            events
                .iter()
                .all(|event| tx.unbounded_send(event.clone()).is_ok())
        });
    }

    /// Insert an optimistic local message. Its status is forced to `pending`.
    pub fn append(&self, mut message: Message) -> Result<Message> {
        message.status = MessageStatus::Pending;
        message.progress = None;
        message.error = None;

        {
            let mut state = self.state.lock();
            if state.locations.contains_key(&message.local_id) {
                return Err(ChatError::DuplicateMessage(message.local_id));
            }
            state
                .locations
                .insert(message.local_id.clone(), message.conversation_id.clone());
            state
                .conversations
                .entry(message.conversation_id.clone())
                .or_default()
                .insert(message.clone());
        }

        debug!(
            local_id = %message.local_id,
            conversation_id = %message.conversation_id,
            "Appended local message"
        );
        self.notify(vec![StoreEvent::Appended {
            conversation_id: message.conversation_id.clone(),
            local_id: message.local_id.clone(),
        }]);
        Ok(message)
    }

    /// Ingest a message that arrived from the transport or from history.
    ///
    /// Idempotent: a message whose `(timestamp, content, sender)` already exists
    /// in the conversation, or whose local id is already known, is dropped.
    /// When the dropped event echoes one of our `sent` messages, that message
    /// advances to `delivered`. Returns `true` if the message was inserted.
    pub fn ingest_remote(&self, message: Message) -> bool {
        let mut events = Vec::new();
        let inserted = {
            let mut state = self.state.lock();
            let StoreState {
                conversations,
                locations,
            } = &mut *state;
            let conversation = conversations
                .entry(message.conversation_id.clone())
                .or_default();

            let existing = conversation
                .echo_index
                .get(&EchoKey::of(&message))
                .cloned()
                .or_else(|| {
                    locations
                        .get(&message.local_id)
                        .filter(|cid| **cid == message.conversation_id)
                        .map(|_| message.local_id.clone())
                });

            match existing {
                Some(local_id) => {
                    if let Some(local) = conversation.get_mut(&local_id) {
                        if local.status == MessageStatus::Sent {
                            local.status = MessageStatus::Delivered;
                            events.push(StoreEvent::Updated {
                                conversation_id: local.conversation_id.clone(),
                                local_id: local.local_id.clone(),
                                status: local.status,
                                progress: local.progress,
                            });
                        }
                    }
                    false
                }
                None if locations.contains_key(&message.local_id) => {
                    warn!(
                        local_id = %message.local_id,
                        "Inbound message reuses a local id from another conversation, dropping"
                    );
                    false
                }
                None => {
                    locations.insert(message.local_id.clone(), message.conversation_id.clone());
                    events.push(StoreEvent::Ingested {
                        conversation_id: message.conversation_id.clone(),
                        local_id: message.local_id.clone(),
                    });
                    conversation.insert(message);
                    true
                }
            }
        };

        if !inserted {
            debug!("Dropped duplicate inbound message");
        }
        self.notify(events);
        inserted
    }

    /// Apply a patch to a message, enforcing the status state machine.
    ///
    /// Re-applying the current status is a no-op, except for `pending` and
    /// `uploading`, which are rejected.
    ///
    /// Progress never moves backwards except when a retry returns the message
    /// to `pending`, which also clears progress and error.
    pub fn update_by_local_id(&self, local_id: &str, patch: MessagePatch) -> Result<Message> {
        let updated = {
            let mut state = self.state.lock();
            let conversation_id = state
                .locations
                .get(local_id)
                .cloned()
                .ok_or_else(|| ChatError::MessageNotFound(local_id.to_string()))?;
            let message = state
                .conversations
                .get_mut(&conversation_id)
                .and_then(|c| c.get_mut(local_id))
                .ok_or_else(|| ChatError::MessageNotFound(local_id.to_string()))?;

            if let Some(next) = patch.status {
                // Entering `pending` or `uploading` starts an attempt, twice in a row is a second writer
                let restart = next == message.status
                    && matches!(next, MessageStatus::Pending | MessageStatus::Uploading);
                if next != message.status || restart {
                    if restart || !message.can_move_to(next) {
                        warn!(
                            local_id,
                            from = ?message.status,
                            to = ?next,
                            "Rejected illegal status transition"
                        );
                        return Err(ChatError::IllegalTransition {
                            local_id: local_id.to_string(),
                            from: message.status,
                            to: next,
                        });
                    }
                    message.status = next;
                    if next == MessageStatus::Pending {
                        message.progress = None;
                        message.error = None;
                    }
                }
            }

            if let Some(progress) = patch.progress {
                let progress = progress.min(100);
                if message.progress.map_or(true, |current| progress > current) {
                    message.progress = Some(progress);
                }
            }
            if let Some(attachment) = patch.attachment {
                message.attachment = Some(attachment);
            }
            if let Some(error) = patch.error {
                message.error = Some(error);
            }

            message.clone()
        };

        self.notify(vec![StoreEvent::Updated {
            conversation_id: updated.conversation_id.clone(),
            local_id: updated.local_id.clone(),
            status: updated.status,
            progress: updated.progress,
        }]);
        Ok(updated)
    }

    /// Advance every `sent`/`delivered` message authored by `from` to `seen`.
    /// Returns the local ids that changed.
    pub fn mark_seen(&self, conversation_id: &str, from: Sender) -> Vec<String> {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                for message in conversation.messages.iter_mut().filter(|m| {
                    m.sender == from
                        && matches!(m.status, MessageStatus::Sent | MessageStatus::Delivered)
                }) {
                    message.status = MessageStatus::Seen;
                    events.push(StoreEvent::Updated {
                        conversation_id: message.conversation_id.clone(),
                        local_id: message.local_id.clone(),
                        status: message.status,
                        progress: message.progress,
                    });
                }
            }
        }

        let changed = events
            .iter()
            .filter_map(|event| match event {
                StoreEvent::Updated { local_id, .. } => Some(local_id.clone()),
                _ => None,
            })
            .collect();
        self.notify(events);
        changed
    }

    /// Messages of one conversation in timestamp order
    pub fn list(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, local_id: &str) -> Option<Message> {
        let state = self.state.lock();
        let conversation_id = state.locations.get(local_id)?;
        state
            .conversations
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.local_id == local_id)
            .cloned()
    }

    /// Ids of every conversation holding at least one message
    pub fn conversation_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .conversations
            .iter()
            .filter(|(_, c)| !c.messages.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn len(&self, conversation_id: &str) -> usize {
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .map_or(0, |c| c.messages.len())
    }

    pub fn is_empty(&self, conversation_id: &str) -> bool {
        self.len(conversation_id) == 0
    }

    /// Drop a conversation transcript
    pub fn clear(&self, conversation_id: &str, reason: ClearReason) -> usize {
        let removed = {
            let mut state = self.state.lock();
            match state.conversations.remove(conversation_id) {
                Some(conversation) => {
                    for message in &conversation.messages {
                        state.locations.remove(&message.local_id);
                    }
                    conversation.messages.len()
                }
                None => 0,
            }
        };

        info!(
            conversation_id,
            removed,
            reason = ?reason,
            "Cleared conversation transcript"
        );
        self.notify(vec![StoreEvent::Cleared {
            conversation_id: conversation_id.to_string(),
            reason,
            removed,
        }]);
        removed
    }
}
