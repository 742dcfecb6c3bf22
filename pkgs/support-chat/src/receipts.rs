//! Read-receipt synchronizer

use crate::api::ChatApi;
use crate::events::{ChatEvent, Sender};
use crate::message_store::MessageStore;
use crate::transport::TransportClient;
use std::sync::Arc;
use tracing::{debug, warn};

/// Marks inbound messages seen and applies the peer's receipts to ours
pub struct ReadReceiptSync {
    store: Arc<MessageStore>,
    transport: Arc<TransportClient>,
    api: Option<Arc<dyn ChatApi>>,
    /// The side this client speaks for
    side: Sender,
}

impl ReadReceiptSync {
    pub fn new(
        store: Arc<MessageStore>,
        transport: Arc<TransportClient>,
        api: Option<Arc<dyn ChatApi>>,
        side: Sender,
    ) -> Self {
        Self {
            store,
            transport,
            api,
            side,
        }
    }

    /// Mark every unseen message from the peer as seen.
    ///
    /// One `messageSeen` goes out per non-empty batch. Returns the batch size.
    pub async fn mark_seen(&self, conversation_id: &str) -> usize {
        let changed = self.store.mark_seen(conversation_id, self.side.peer());
        if changed.is_empty() {
            return 0;
        }

        debug!(conversation_id, count = changed.len(), "Marked batch seen");
        let event = ChatEvent::MessageSeen {
            conversation_id: conversation_id.to_string(),
            by: self.side,
        };
        if let Err(e) = self.transport.emit(event).await {
            warn!(conversation_id, "Could not emit read receipt: {}", e);
        }
        if let Some(api) = &self.api {
            if let Err(e) = api.mark_seen(conversation_id, self.side).await {
                warn!(conversation_id, "Could not persist read receipt: {}", e);
            }
        }
        changed.len()
    }

    /// Apply a receipt from the other side: our messages become seen
    pub fn apply_remote(&self, conversation_id: &str, by: Sender) -> usize {
        if by == self.side {
            return 0;
        }
        let changed = self.store.mark_seen(conversation_id, self.side);
        debug!(conversation_id, count = changed.len(), "Peer saw our messages");
        changed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Message, MessageKind, MessageStatus};
    use crate::message_store::MessagePatch;
    use crate::transport::MemoryHub;

    async fn setup(side: Sender) -> (MemoryHub, Arc<MessageStore>, ReadReceiptSync) {
        let hub = MemoryHub::new();
        let transport = Arc::new(TransportClient::new(Arc::new(hub.transport()), 8));
        transport.connect().await.unwrap();
        let store = Arc::new(MessageStore::new());
        let sync = ReadReceiptSync::new(store.clone(), transport, None, side);
        (hub, store, sync)
    }

    fn inbound(sender: Sender, content: &str, timestamp: i64) -> Message {
        let mut message = Message::outgoing("u42", sender, MessageKind::Text, content, timestamp);
        message.status = MessageStatus::Delivered;
        message
    }

    #[tokio::test]
    async fn test_one_event_per_batch() {
        let (hub, store, sync) = setup(Sender::Support).await;
        for i in 0..3 {
            store.ingest_remote(inbound(Sender::User, &format!("q{i}"), i));
        }

        assert_eq!(sync.mark_seen("u42").await, 3);
        assert_eq!(sync.mark_seen("u42").await, 0);
        assert_eq!(
            hub.count_received(|e| matches!(e, ChatEvent::MessageSeen { .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_remote_receipt_upgrades_our_messages() {
        let (_hub, store, sync) = setup(Sender::User).await;
        let ours = store
            .append(Message::outgoing("u42", Sender::User, MessageKind::Text, "hi", 1))
            .unwrap();
        store
            .update_by_local_id(&ours.local_id, MessagePatch::status(MessageStatus::Sent))
            .unwrap();

        assert_eq!(sync.apply_remote("u42", Sender::User), 0);
        assert_eq!(sync.apply_remote("u42", Sender::Support), 1);
        assert_eq!(store.get(&ours.local_id).unwrap().status, MessageStatus::Seen);
    }
}
