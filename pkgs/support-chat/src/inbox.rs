//! Admin inbox - every user's conversation multiplexed over one message store
//!
//! Summaries are derived from the store on every call. Nothing here keeps an
//! unread counter of its own, so counts cannot drift from the messages.

use crate::api::ChatApi;
use crate::error::Result;
use crate::events::{
    ChatEvent, ConversationSummary, Message, MessageStatus, Sender, StoreEvent,
};
use crate::media_cache::AttachmentStore;
use crate::message_store::MessageStore;
use crate::outbox::{MessagePublisher, Outbox};
use crate::receipts::ReadReceiptSync;
use crate::timing::TaskGuard;
use crate::transport::TransportClient;
use crate::typing::TypingIndicator;
use crate::upload_manager::{UploadFile, UploadManager};
use crate::{ChatConfig, ChatDeps};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub struct AdminInbox {
    store: Arc<MessageStore>,
    transport: Arc<TransportClient>,
    outbox: Outbox,
    receipts: ReadReceiptSync,
    api: Option<Arc<dyn ChatApi>>,
    media: Option<Arc<AttachmentStore>>,
    selected: Mutex<Option<String>>,
    loaded: Mutex<HashSet<String>>,
    display_names: Mutex<HashMap<String, String>>,
    typing_users: Mutex<HashSet<String>>,
    typing: Mutex<HashMap<String, Arc<TypingIndicator>>>,
    typing_quiet_period: Duration,
}

impl AdminInbox {
    pub fn new(config: &ChatConfig, deps: ChatDeps) -> Self {
        let store = Arc::new(MessageStore::new());
        let transport = Arc::new(TransportClient::new(
            deps.transport,
            config.outbound_queue_capacity,
        ));
        let publisher = Arc::new(MessagePublisher::new(transport.clone(), deps.api.clone()));
        let uploads = UploadManager::new(
            store.clone(),
            deps.storage,
            publisher.clone(),
            config.max_upload_bytes,
            config.max_concurrent_uploads,
        );

        Self {
            outbox: Outbox::new(Sender::Support, store.clone(), uploads, publisher, deps.clock),
            receipts: ReadReceiptSync::new(
                store.clone(),
                transport.clone(),
                deps.api.clone(),
                Sender::Support,
            ),
            api: deps.api,
            media: deps.media,
            selected: Mutex::new(None),
            loaded: Mutex::new(HashSet::new()),
            display_names: Mutex::new(HashMap::new()),
            typing_users: Mutex::new(HashSet::new()),
            typing: Mutex::new(HashMap::new()),
            typing_quiet_period: config.typing_quiet_period(),
            store,
            transport,
        }
    }

    /// Connect and join the admin room
    pub async fn start(&self) -> Result<()> {
        self.transport.connect().await?;
        self.transport.admin_join().await?;
        info!("Admin inbox started");
        Ok(())
    }

    /// Process inbound events until the transport shuts down
    pub async fn run(&self) {
        while let Some(event) = self.transport.next_event().await {
            self.handle_event(event).await;
        }
        debug!("Admin event stream ended");
    }

    pub async fn handle_event(&self, event: ChatEvent) {
        match event {
            ChatEvent::NewMessage(wire) => {
                let conversation_id = wire.conversation_id.clone();
                let from_user = wire.sender == Sender::User;
                let inserted = self.store.ingest_remote(Message::from_wire(wire));
                if from_user {
                    self.typing_users.lock().remove(&conversation_id);
                }
                if inserted && from_user && self.is_selected(&conversation_id) {
                    self.receipts.mark_seen(&conversation_id).await;
                }
            }
            ChatEvent::TypingStart { conversation_id } => {
                self.typing_users.lock().insert(conversation_id);
            }
            ChatEvent::TypingStop { conversation_id } => {
                self.typing_users.lock().remove(&conversation_id);
            }
            ChatEvent::MessagesSeen {
                conversation_id,
                by,
            } => {
                self.receipts.apply_remote(&conversation_id, by);
            }
            ChatEvent::SessionEnded { conversation_id } => {
                self.typing_users.lock().remove(&conversation_id);
                info!(%conversation_id, "User session ended");
            }
            _ => {}
        }
    }

    fn is_selected(&self, conversation_id: &str) -> bool {
        self.selected.lock().as_deref() == Some(conversation_id)
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.lock().clone()
    }

    /// Make a conversation the active view.
    ///
    /// Loads its history on first selection, then marks the user's unseen
    /// messages seen with a single `messageSeen`. Returns the batch size.
    #[instrument(skip(self))]
    pub async fn select_conversation(&self, conversation_id: &str) -> usize {
        let previous = self.selected.lock().replace(conversation_id.to_string());
        if let (Some(previous), Some(media)) = (previous, &self.media) {
            if previous != conversation_id {
                media.revoke_conversation(&previous);
            }
        }

        let needs_history = !self.loaded.lock().contains(conversation_id);
        if needs_history {
            if let Err(e) = self.load_history(conversation_id).await {
                warn!(conversation_id, "History load failed: {}", e);
            }
        }

        self.receipts.mark_seen(conversation_id).await
    }

    /// Fetch and ingest a conversation's history. Returns how many were new.
    pub async fn load_history(&self, conversation_id: &str) -> Result<usize> {
        let Some(api) = &self.api else {
            self.loaded.lock().insert(conversation_id.to_string());
            return Ok(0);
        };

        let history = api.fetch_history(conversation_id).await?;
        let inserted = history
            .into_iter()
            .filter(|wire| wire.conversation_id == conversation_id)
            .map(|wire| self.store.ingest_remote(Message::from_wire(wire)))
            .filter(|inserted| *inserted)
            .count();
        self.loaded.lock().insert(conversation_id.to_string());
        debug!(conversation_id, inserted, "History ingested");
        Ok(inserted)
    }

    /// Re-fetch the selected conversation and mark new arrivals seen
    pub async fn refresh_selected(&self) -> Result<usize> {
        let Some(conversation_id) = self.selected() else {
            return Ok(0);
        };
        let inserted = self.load_history(&conversation_id).await?;
        if inserted > 0 {
            self.receipts.mark_seen(&conversation_id).await;
        }
        Ok(inserted)
    }

    /// Refresh the selected conversation every `interval` until the guard drops
    pub fn spawn_history_refresh(self: &Arc<Self>, interval: Duration) -> TaskGuard {
        let inbox = Arc::clone(self);
        TaskGuard::new(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = inbox.refresh_selected().await {
                    warn!("History refresh failed: {}", e);
                }
            }
        }))
    }

    fn summarize(&self, conversation_id: &str, selected: Option<&str>) -> ConversationSummary {
        let messages = self.store.list(conversation_id);
        let unread_count = if selected == Some(conversation_id) {
            0
        } else {
            messages
                .iter()
                .filter(|m| m.sender == Sender::User && m.status != MessageStatus::Seen)
                .count()
        };
        let last = messages.last();

        ConversationSummary {
            conversation_id: conversation_id.to_string(),
            display_name: self
                .display_names
                .lock()
                .get(conversation_id)
                .cloned()
                .unwrap_or_else(|| conversation_id.to_string()),
            last_message_preview: last.map(Message::preview),
            last_timestamp: last.map(|m| m.timestamp),
            unread_count,
        }
    }

    /// Sidebar rows, most recent conversation first
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let selected = self.selected();
        let mut ids: HashSet<String> = self.store.conversation_ids().into_iter().collect();
        if let Some(selected) = &selected {
            ids.insert(selected.clone());
        }

        let mut summaries: Vec<_> = ids
            .iter()
            .map(|id| self.summarize(id, selected.as_deref()))
            .collect();
        summaries.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        summaries
    }

    pub fn unread_count(&self, conversation_id: &str) -> usize {
        self.summarize(conversation_id, self.selected().as_deref())
            .unread_count
    }

    pub fn total_unread(&self) -> usize {
        self.summaries().iter().map(|s| s.unread_count).sum()
    }

    /// Messages of the selected conversation
    pub fn active_messages(&self) -> Vec<Message> {
        self.selected()
            .map(|id| self.store.list(&id))
            .unwrap_or_default()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.store.list(conversation_id)
    }

    pub fn set_display_name(&self, conversation_id: &str, name: impl Into<String>) {
        self.display_names
            .lock()
            .insert(conversation_id.to_string(), name.into());
    }

    /// Conversations whose user is typing right now
    pub fn typing_conversations(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.typing_users.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    fn typing_indicator(&self, conversation_id: &str) -> Arc<TypingIndicator> {
        self.typing
            .lock()
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(TypingIndicator::new(
                    self.transport.clone(),
                    conversation_id,
                    Sender::Support,
                    self.typing_quiet_period,
                ))
            })
            .clone()
    }

    pub async fn keystroke(&self, conversation_id: &str) -> Result<()> {
        self.typing_indicator(conversation_id).keystroke().await
    }

    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<Message> {
        if let Err(e) = self.typing_indicator(conversation_id).stop().await {
            debug!(conversation_id, "Typing stop not delivered: {}", e);
        }
        self.outbox.send_text(conversation_id, text).await
    }

    pub async fn send_attachment(
        &self,
        conversation_id: &str,
        file: UploadFile,
    ) -> Result<(Message, String)> {
        self.outbox.send_attachment(conversation_id, file).await
    }

    pub fn cancel_upload(&self, task_id: &str) -> Result<()> {
        self.outbox.cancel_upload(task_id)
    }

    pub async fn retry(&self, local_id: &str) -> Result<Message> {
        self.outbox.retry(local_id).await
    }

    /// Close a user's conversation; their widget clears its transcript
    pub async fn end_session(&self, conversation_id: &str) -> Result<()> {
        if let Err(e) = self.typing_indicator(conversation_id).stop().await {
            debug!(conversation_id, "Typing stop not delivered: {}", e);
        }
        self.transport
            .emit(ChatEvent::SessionEnded {
                conversation_id: conversation_id.to_string(),
            })
            .await?;
        info!(conversation_id, "Ended user session");
        Ok(())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn uploads(&self) -> &UploadManager {
        self.outbox.uploads()
    }

    pub fn media(&self) -> Option<&Arc<AttachmentStore>> {
        self.media.as_ref()
    }

    pub fn transport(&self) -> &Arc<TransportClient> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChatError;
    use crate::events::{MessageKind, WireMessage};
    use crate::transport::MemoryHub;
    use crate::upload_manager::{BlobStorage, ProgressFn, StoredBlob};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct NoStorage;

    #[async_trait]
    impl BlobStorage for NoStorage {
        async fn upload(
            &self,
            _file: &UploadFile,
            _progress: ProgressFn,
            _cancel: CancellationToken,
        ) -> Result<StoredBlob> {
            Err(ChatError::Storage("unavailable".to_string()))
        }
    }

    #[derive(Default)]
    struct HistoryApi {
        history: Mutex<Vec<WireMessage>>,
        fetches: Mutex<usize>,
    }

    #[async_trait]
    impl ChatApi for HistoryApi {
        async fn post_message(&self, _message: &WireMessage) -> Result<()> {
            Ok(())
        }

        async fn fetch_history(&self, _conversation_id: &str) -> Result<Vec<WireMessage>> {
            *self.fetches.lock() += 1;
            Ok(self.history.lock().clone())
        }

        async fn mark_seen(&self, _conversation_id: &str, _by: Sender) -> Result<()> {
            Ok(())
        }
    }

    fn user_message(conversation_id: &str, content: &str, timestamp: i64) -> WireMessage {
        WireMessage {
            local_id: None,
            conversation_id: conversation_id.to_string(),
            sender: Sender::User,
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: None,
            timestamp,
            status: None,
        }
    }

    fn inbox(hub: &MemoryHub, api: Option<Arc<dyn ChatApi>>) -> AdminInbox {
        let mut deps = ChatDeps::new(Arc::new(hub.transport()), Arc::new(NoStorage));
        deps.api = api;
        AdminInbox::new(&ChatConfig::default(), deps)
    }

    #[tokio::test]
    async fn test_summaries_sorted_by_recency_with_names() {
        let hub = MemoryHub::new();
        let inbox = inbox(&hub, None);
        inbox
            .handle_event(ChatEvent::NewMessage(user_message("u1", "old", 10)))
            .await;
        inbox
            .handle_event(ChatEvent::NewMessage(user_message("u2", "new", 20)))
            .await;
        inbox.set_display_name("u1", "Ada");

        let summaries = inbox.summaries();
        assert_eq!(summaries[0].conversation_id, "u2");
        assert_eq!(summaries[1].display_name, "Ada");
        assert_eq!(summaries[1].last_message_preview.as_deref(), Some("old"));
        assert_eq!(inbox.total_unread(), 2);
    }

    #[tokio::test]
    async fn test_first_selection_loads_history_once() {
        let hub = MemoryHub::new();
        let api = Arc::new(HistoryApi {
            history: Mutex::new(vec![user_message("u7", "from history", 1)]),
            ..Default::default()
        });
        let inbox = inbox(&hub, Some(api.clone() as Arc<dyn ChatApi>));
        inbox.start().await.unwrap();

        assert_eq!(inbox.select_conversation("u7").await, 1);
        inbox.select_conversation("u8").await;
        inbox.select_conversation("u7").await;

        assert_eq!(inbox.messages("u7").len(), 1);
        assert_eq!(*api.fetches.lock(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_refresh_picks_up_missed_messages() {
        let hub = MemoryHub::new();
        let api = Arc::new(HistoryApi::default());
        let inbox = Arc::new(inbox(&hub, Some(api.clone() as Arc<dyn ChatApi>)));
        inbox.start().await.unwrap();
        assert_eq!(inbox.select_conversation("u7").await, 0);

        // Arrived while the live channel was down
        api.history.lock().push(user_message("u7", "missed", 3));
        let guard = inbox.spawn_history_refresh(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let messages = inbox.messages("u7");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Seen);
        assert_eq!(*api.fetches.lock(), 2);

        drop(guard);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(*api.fetches.lock(), 2);
    }

    #[tokio::test]
    async fn test_new_message_in_selected_conversation_is_seen() {
        let hub = MemoryHub::new();
        let inbox = inbox(&hub, None);
        inbox.start().await.unwrap();
        inbox.select_conversation("u1").await;

        inbox
            .handle_event(ChatEvent::NewMessage(user_message("u1", "hi", 5)))
            .await;
        assert_eq!(inbox.active_messages()[0].status, MessageStatus::Seen);
        assert_eq!(inbox.unread_count("u1"), 0);
    }

    #[tokio::test]
    async fn test_typing_presence_tracked_per_conversation() {
        let hub = MemoryHub::new();
        let inbox = inbox(&hub, None);
        inbox
            .handle_event(ChatEvent::TypingStart {
                conversation_id: "u2".to_string(),
            })
            .await;
        inbox
            .handle_event(ChatEvent::TypingStart {
                conversation_id: "u1".to_string(),
            })
            .await;
        assert_eq!(inbox.typing_conversations(), vec!["u1", "u2"]);

        inbox
            .handle_event(ChatEvent::NewMessage(user_message("u1", "done typing", 1)))
            .await;
        assert_eq!(inbox.typing_conversations(), vec!["u2"]);
    }

    #[tokio::test]
    async fn test_end_session_emits_event() {
        let hub = MemoryHub::new();
        let inbox = inbox(&hub, None);
        inbox.start().await.unwrap();
        inbox.end_session("u3").await.unwrap();

        assert_eq!(
            hub.count_received(|e| matches!(e, ChatEvent::SessionEnded { conversation_id } if conversation_id == "u3")),
            1
        );
    }
}
