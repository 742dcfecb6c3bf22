//! User-side chat widget

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, Message, Sender, StoreEvent};
use crate::media_cache::AttachmentStore;
use crate::message_store::MessageStore;
use crate::outbox::{MessagePublisher, Outbox};
use crate::receipts::ReadReceiptSync;
use crate::session::{Session, SessionPersistence, SessionTimer};
use crate::timing::TaskGuard;
use crate::transport::TransportClient;
use crate::typing::TypingIndicator;
use crate::upload_manager::{UploadFile, UploadManager};
use crate::{ChatConfig, ChatDeps};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// One end user's conversation with support
pub struct UserChat {
    conversation_id: String,
    store: Arc<MessageStore>,
    transport: Arc<TransportClient>,
    outbox: Outbox,
    receipts: ReadReceiptSync,
    session: Arc<SessionTimer>,
    typing: TypingIndicator,
    api: Option<Arc<dyn ChatApi>>,
    media: Option<Arc<AttachmentStore>>,
    check_interval: Duration,
    visible: AtomicBool,
    peer_typing: AtomicBool,
    watchdog: Mutex<Option<TaskGuard>>,
}

impl UserChat {
    pub fn new(
        conversation_id: impl Into<String>,
        config: &ChatConfig,
        deps: ChatDeps,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Self {
        let conversation_id = conversation_id.into();
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
            outbox: Outbox::new(
                Sender::User,
                store.clone(),
                uploads,
                publisher,
                deps.clock.clone(),
            ),
            receipts: ReadReceiptSync::new(
                store.clone(),
                transport.clone(),
                deps.api.clone(),
                Sender::User,
            ),
            session: Arc::new(SessionTimer::new(
                conversation_id.clone(),
                config.session_ttl_ms,
                store.clone(),
                transport.clone(),
                persistence,
                deps.clock,
            )),
            typing: TypingIndicator::new(
                transport.clone(),
                conversation_id.clone(),
                Sender::User,
                config.typing_quiet_period(),
            ),
            api: deps.api,
            media: deps.media,
            check_interval: config.session_check_interval(),
            visible: AtomicBool::new(false),
            peer_typing: AtomicBool::new(false),
            watchdog: Mutex::new(None),
            conversation_id,
            store,
            transport,
        }
    }

    /// Restore the session, connect, join the conversation room, reload the
    /// transcript of a live session and start the expiry watchdog
    #[instrument(skip(self), fields(conversation_id = %self.conversation_id))]
    pub async fn start(&self) -> Result<()> {
        self.session.restore().await?;
        self.transport.connect().await?;
        self.transport.join(&self.conversation_id).await?;
        if let Err(e) = self.load_history().await {
            warn!("History not loaded: {}", e);
        }
        *self.watchdog.lock() = Some(self.session.spawn_watchdog(self.check_interval));
        info!("User chat started");
        Ok(())
    }

    /// Fetch and ingest the conversation history. An expired session stays
    /// empty. Returns how many messages were new.
    pub async fn load_history(&self) -> Result<usize> {
        let Some(api) = &self.api else {
            return Ok(0);
        };
        if self.session.is_expired() {
            debug!(conversation_id = %self.conversation_id, "Session expired, skipping history");
            return Ok(0);
        }

        let history = api.fetch_history(&self.conversation_id).await?;
        let inserted = history
            .into_iter()
            .filter(|wire| wire.conversation_id == self.conversation_id)
            .map(|wire| self.store.ingest_remote(Message::from_wire(wire)))
            .filter(|inserted| *inserted)
            .count();
        debug!(conversation_id = %self.conversation_id, inserted, "History ingested");
        Ok(inserted)
    }

    /// Stop the watchdog; the view is going away
    pub fn stop(&self) {
        self.watchdog.lock().take();
        if let Some(media) = &self.media {
            media.revoke_conversation(&self.conversation_id);
        }
    }

    /// Process inbound events until the transport shuts down
    pub async fn run(&self) {
        while let Some(event) = self.transport.next_event().await {
            self.handle_event(event).await;
        }
        debug!(conversation_id = %self.conversation_id, "Event stream ended");
    }

    pub async fn handle_event(&self, event: ChatEvent) {
        if event.conversation_id() != Some(self.conversation_id.as_str()) {
            return;
        }

        match event {
            ChatEvent::NewMessage(wire) => {
                let from_support = wire.sender == Sender::Support;
                let inserted = self.store.ingest_remote(Message::from_wire(wire));
                if from_support {
                    self.peer_typing.store(false, Ordering::SeqCst);
                }
                if inserted && from_support && self.is_visible() {
                    self.receipts.mark_seen(&self.conversation_id).await;
                }
            }
            ChatEvent::AdminTypingStart { .. } => self.peer_typing.store(true, Ordering::SeqCst),
            ChatEvent::AdminTypingStop { .. } => self.peer_typing.store(false, Ordering::SeqCst),
            ChatEvent::MessagesSeen { by, .. } => {
                self.receipts.apply_remote(&self.conversation_id, by);
            }
            ChatEvent::SessionEnded { .. } => {
                self.peer_typing.store(false, Ordering::SeqCst);
                self.session.end_by_peer().await;
            }
            _ => {}
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.session.is_expired() {
            return Err(ChatError::SessionExpired);
        }
        Ok(())
    }

    /// Send a text message
    pub async fn send(&self, text: &str) -> Result<Message> {
        self.ensure_active()?;
        self.session.touch().await;
        if let Err(e) = self.typing.stop().await {
            debug!("Typing stop not delivered: {}", e);
        }
        self.outbox.send_text(&self.conversation_id, text).await
    }

    /// Send a file; returns the optimistic message and its upload task id
    pub async fn send_attachment(&self, file: UploadFile) -> Result<(Message, String)> {
        self.ensure_active()?;
        self.outbox.uploads().check_size(&file)?;
        self.session.touch().await;
        self.outbox
            .send_attachment(&self.conversation_id, file)
            .await
    }

    pub fn cancel_upload(&self, task_id: &str) -> Result<()> {
        self.outbox.cancel_upload(task_id)
    }

    pub async fn retry(&self, local_id: &str) -> Result<Message> {
        self.ensure_active()?;
        self.outbox.retry(local_id).await
    }

    /// "Start new chat": fresh session, empty transcript
    pub async fn start_new_session(&self) {
        self.session.start_new().await;
        if let Some(media) = &self.media {
            media.revoke_conversation(&self.conversation_id);
        }
    }

    /// Mark support's messages seen; returns the batch size
    pub async fn mark_seen(&self) -> usize {
        self.receipts.mark_seen(&self.conversation_id).await
    }

    /// Opening the widget marks everything seen
    pub async fn set_visible(&self, visible: bool) {
        self.visible.store(visible, Ordering::SeqCst);
        if visible {
            self.mark_seen().await;
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub async fn keystroke(&self) -> Result<()> {
        self.typing.keystroke().await
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> Vec<Message> {
        self.store.list(&self.conversation_id)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.store.subscribe()
    }

    pub fn session(&self) -> Session {
        self.session.session()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.peer_typing.load(Ordering::SeqCst)
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
    use crate::events::{MessageKind, MessageStatus, WireMessage};
    use crate::session::InMemorySessionStore;
    use crate::timing::ManualClock;
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

    fn chat(hub: &MemoryHub, clock: Arc<ManualClock>) -> UserChat {
        let deps = ChatDeps::new(Arc::new(hub.transport()), Arc::new(NoStorage)).with_clock(clock);
        UserChat::new(
            "u1",
            &ChatConfig::default(),
            deps,
            Arc::new(InMemorySessionStore::default()),
        )
    }

    fn support_message(content: &str, timestamp: i64) -> ChatEvent {
        ChatEvent::NewMessage(WireMessage {
            local_id: None,
            conversation_id: "u1".to_string(),
            sender: Sender::Support,
            content: content.to_string(),
            kind: MessageKind::Text,
            attachment: None,
            timestamp,
            status: None,
        })
    }

    #[tokio::test]
    async fn test_inbound_support_message_seen_when_visible() {
        let hub = MemoryHub::new();
        let chat = chat(&hub, Arc::new(ManualClock::new(0)));
        chat.start().await.unwrap();

        chat.handle_event(support_message("hidden", 1)).await;
        assert_eq!(chat.messages()[0].status, MessageStatus::Delivered);

        chat.set_visible(true).await;
        chat.handle_event(support_message("shown", 2)).await;
        assert!(chat
            .messages()
            .iter()
            .all(|m| m.status == MessageStatus::Seen));
        assert_eq!(
            hub.count_received(|e| matches!(e, ChatEvent::MessageSeen { .. })),
            2
        );
    }

    #[tokio::test]
    async fn test_events_for_other_conversations_ignored() {
        let hub = MemoryHub::new();
        let chat = chat(&hub, Arc::new(ManualClock::new(0)));
        chat.handle_event(ChatEvent::AdminTypingStart {
            conversation_id: "u2".to_string(),
        })
        .await;
        assert!(!chat.is_peer_typing());

        chat.handle_event(ChatEvent::AdminTypingStart {
            conversation_id: "u1".to_string(),
        })
        .await;
        assert!(chat.is_peer_typing());
        chat.handle_event(support_message("hi", 1)).await;
        assert!(!chat.is_peer_typing());
    }

    #[tokio::test]
    async fn test_session_ended_blocks_sends_until_new_session() {
        let hub = MemoryHub::new();
        let chat = chat(&hub, Arc::new(ManualClock::new(0)));
        chat.start().await.unwrap();
        chat.send("Hello").await.unwrap();

        chat.handle_event(ChatEvent::SessionEnded {
            conversation_id: "u1".to_string(),
        })
        .await;
        assert!(chat.messages().is_empty());
        assert!(chat.session().expired);
        assert!(matches!(
            chat.send("again").await,
            Err(ChatError::SessionExpired)
        ));

        chat.start_new_session().await;
        chat.send("again").await.unwrap();
        assert_eq!(chat.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_failure_surfaces_on_message() {
        let hub = MemoryHub::new();
        let chat = chat(&hub, Arc::new(ManualClock::new(0)));
        chat.start().await.unwrap();

        let file = UploadFile::new("a.txt", "text/plain", b"hello".to_vec());
        let (message, task_id) = chat.send_attachment(file).await.unwrap();
        chat.uploads().wait(&task_id).await.unwrap();

        let failed = chat
            .messages()
            .into_iter()
            .find(|m| m.local_id == message.local_id)
            .unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.error.unwrap().contains("unavailable"));
    }
}
