//! Outbound path shared by both chat surfaces
//!
//! Text goes straight to the transport. Attachments go through the upload
//! manager first and are published once the storage keys are known.

use crate::api::ChatApi;
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, Message, MessageKind, MessageStatus, Sender};
use crate::message_store::{MessagePatch, MessageStore};
use crate::timing::Clock;
use crate::transport::TransportClient;
use crate::upload_manager::{UploadFile, UploadManager};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Publishes finalized messages to the far end
pub struct MessagePublisher {
    transport: Arc<TransportClient>,
    api: Option<Arc<dyn ChatApi>>,
}

impl MessagePublisher {
    pub fn new(transport: Arc<TransportClient>, api: Option<Arc<dyn ChatApi>>) -> Self {
        Self { transport, api }
    }

    /// Persist through REST when configured, then broadcast as `newMessage`
    pub async fn publish(&self, message: &Message) -> Result<()> {
        let wire = message.to_wire();
        if let Some(api) = &self.api {
            api.post_message(&wire).await?;
        }
        self.transport.emit(ChatEvent::NewMessage(wire)).await
    }
}

/// Optimistic send, cancel and retry for one side of the chat
pub struct Outbox {
    side: Sender,
    store: Arc<MessageStore>,
    uploads: UploadManager,
    publisher: Arc<MessagePublisher>,
    clock: Arc<dyn Clock>,
}

impl Outbox {
    pub fn new(
        side: Sender,
        store: Arc<MessageStore>,
        uploads: UploadManager,
        publisher: Arc<MessagePublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            side,
            store,
            uploads,
            publisher,
            clock,
        }
    }

    pub fn uploads(&self) -> &UploadManager {
        &self.uploads
    }

    /// Send a text message. Transport failures leave it `failed` for retry.
    #[instrument(skip(self, text))]
    pub async fn send_text(&self, conversation_id: &str, text: &str) -> Result<Message> {
        let message = self.store.append(Message::outgoing(
            conversation_id,
            self.side,
            MessageKind::Text,
            text,
            self.clock.now_millis(),
        ))?;
        self.publish_text(message).await
    }

    async fn publish_text(&self, mut message: Message) -> Result<Message> {
        message.status = MessageStatus::Sent;
        let patch = match self.publisher.publish(&message).await {
            Ok(()) => MessagePatch::status(MessageStatus::Sent),
            Err(e) => {
                warn!(local_id = %message.local_id, "Text send failed: {}", e);
                MessagePatch::failed(e.to_string())
            }
        };
        self.store.update_by_local_id(&message.local_id, patch)
    }

    /// Send a file. The size limit is checked before anything is stored.
    /// Returns the optimistic message and the upload task id.
    #[instrument(skip(self, file), fields(file = %file.name))]
    pub async fn send_attachment(
        &self,
        conversation_id: &str,
        file: UploadFile,
    ) -> Result<(Message, String)> {
        self.uploads.check_size(&file)?;

        let message = self.store.append(Message::outgoing(
            conversation_id,
            self.side,
            file.kind(),
            file.name.clone(),
            self.clock.now_millis(),
        ))?;
        let task_id = self.uploads.enqueue(file, &message.local_id)?;
        info!(local_id = %message.local_id, %task_id, "Attachment queued");
        Ok((message, task_id))
    }

    pub fn cancel_upload(&self, task_id: &str) -> Result<()> {
        self.uploads.cancel(task_id)
    }

    /// Retry a failed or canceled message, keeping its local id.
    ///
    /// Attachments get a fresh upload task; text is published again.
    pub async fn retry(&self, local_id: &str) -> Result<Message> {
        let message = self
            .store
            .get(local_id)
            .ok_or_else(|| ChatError::MessageNotFound(local_id.to_string()))?;
        if !message.status.is_retryable() {
            return Err(ChatError::MessageNotRetryable(local_id.to_string()));
        }

        if let Some(task) = self.uploads.latest_for_message(local_id) {
            self.uploads.retry(&task.id)?;
            return self
                .store
                .get(local_id)
                .ok_or_else(|| ChatError::MessageNotFound(local_id.to_string()));
        }

        let pending = self
            .store
            .update_by_local_id(local_id, MessagePatch::status(MessageStatus::Pending))?;
        info!(local_id, "Retrying text message");
        self.publish_text(pending).await
    }
}
