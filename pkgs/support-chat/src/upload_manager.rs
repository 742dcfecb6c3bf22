//! Upload manager - queue of outbound file transfers with progress, cancel and retry

use crate::error::{ChatError, Result};
use crate::events::{
    Attachment, MessageKind, MessageStatus, UploadStatus, UploadTask, WireAttachment,
};
use crate::message_store::{MessagePatch, MessageStore};
use crate::outbox::MessagePublisher;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A file picked for upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub content_type: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a file from disk, guessing its content type from the extension
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_string();
        Ok(Self::new(name, content_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Images render inline, everything else as a file card
    pub fn kind(&self) -> MessageKind {
        if self.content_type.starts_with("image/") {
            MessageKind::Image
        } else {
            MessageKind::File
        }
    }
}

/// What the storage service returns for a stored file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    #[serde(default, alias = "file")]
    pub file_key: Option<String>,
    #[serde(default, alias = "thumb")]
    pub thumb_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub thumb_url: Option<String>,
}

impl StoredBlob {
    /// Map the storage response onto an attachment, `None` if it names no file
    pub fn to_attachment(&self) -> Option<Attachment> {
        WireAttachment::Fields {
            file: self.file_key.clone(),
            thumb: self.thumb_key.clone(),
            url: self.url.clone(),
            thumb_url: self.thumb_url.clone(),
        }
        .resolve()
    }
}

/// Progress callback, percent 0-100
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// Blob storage service receiving uploads
#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Transfer one file. Implementations should stop early and return
    /// [`ChatError::Canceled`] once `cancel` fires.
    async fn upload(
        &self,
        file: &UploadFile,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<StoredBlob>;
}

struct TaskEntry {
    task: UploadTask,
    /// Kept while the task may still be retried
    file: Option<UploadFile>,
    /// The transfer future has returned and the message carries its outcome
    settled: bool,
}

struct Inner {
    tasks: Mutex<Vec<TaskEntry>>,
    store: Arc<MessageStore>,
    storage: Arc<dyn BlobStorage>,
    publisher: Arc<MessagePublisher>,
    permits: Arc<Semaphore>,
    max_bytes: u64,
    changed: Notify,
}

impl Inner {
    /// Forget settled tasks whose message has left the store
    fn prune(&self, tasks: &mut Vec<TaskEntry>) {
        let before = tasks.len();
        tasks.retain(|entry| {
            !entry.settled || self.store.get(&entry.task.message_local_id).is_some()
        });
        if tasks.len() < before {
            debug!(pruned = before - tasks.len(), "Pruned finished uploads");
        }
    }

    fn push(&self, tasks: &mut Vec<TaskEntry>, file: &UploadFile, local_id: &str) -> UploadTask {
        let task = UploadTask {
            id: Uuid::new_v4().to_string(),
            message_local_id: local_id.to_string(),
            progress: 0,
            status: UploadStatus::Pending,
            error: None,
            cancel_handle: CancellationToken::new(),
        };
        tasks.push(TaskEntry {
            task: task.clone(),
            file: Some(file.clone()),
            settled: false,
        });
        task
    }

    fn with_task<R>(&self, task_id: &str, f: impl FnOnce(&mut UploadTask) -> R) -> Option<R> {
        let result = self
            .tasks
            .lock()
            .iter_mut()
            .find(|entry| entry.task.id == task_id)
            .map(|entry| f(&mut entry.task));
        self.changed.notify_waiters();
        result
    }

    /// A finished upload is never retried, its bytes can go
    fn release_file(&self, task_id: &str) {
        if let Some(entry) = self
            .tasks
            .lock()
            .iter_mut()
            .find(|entry| entry.task.id == task_id)
        {
            entry.file = None;
        }
    }

    fn mark_settled(&self, task_id: &str) {
        if let Some(entry) = self
            .tasks
            .lock()
            .iter_mut()
            .find(|entry| entry.task.id == task_id)
        {
            entry.settled = true;
        }
        self.changed.notify_waiters();
    }

    /// Move a live task to `status`; terminal tasks are left alone
    fn settle(&self, task_id: &str, status: UploadStatus, error: Option<String>) -> bool {
        self.with_task(task_id, |task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = status;
            task.error = error;
            true
        })
        .unwrap_or(false)
    }

    fn report_progress(&self, task_id: &str, local_id: &str, progress: u8) {
        let progress = progress.min(100);
        let advanced = self
            .with_task(task_id, |task| {
                if task.status.is_terminal() || progress <= task.progress {
                    return false;
                }
                task.progress = progress;
                true
            })
            .unwrap_or(false);

        if advanced {
            debug!(task_id, progress, "Upload progress");
            if let Err(e) = self
                .store
                .update_by_local_id(local_id, MessagePatch::progress(progress))
            {
                debug!(task_id, "Could not mirror progress: {}", e);
            }
        }
    }

    fn fail(&self, task_id: &str, local_id: &str, error: String) {
        warn!(task_id, local_id, %error, "Upload failed");
        if self.settle(task_id, UploadStatus::Error, Some(error.clone())) {
            if let Err(e) = self
                .store
                .update_by_local_id(local_id, MessagePatch::failed(error))
            {
                warn!(local_id, "Could not mark message failed: {}", e);
            }
        }
    }
}

/// Queue of outbound file transfers.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn new(
        store: Arc<MessageStore>,
        storage: Arc<dyn BlobStorage>,
        publisher: Arc<MessagePublisher>,
        max_bytes: u64,
        max_concurrent: usize,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(Vec::new()),
                store,
                storage,
                publisher,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                max_bytes,
                changed: Notify::new(),
            }),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    /// Reject files over the size limit before anything is queued
    pub fn check_size(&self, file: &UploadFile) -> Result<()> {
        if file.size() > self.inner.max_bytes {
            return Err(ChatError::FileTooLarge {
                size: file.size(),
                limit: self.inner.max_bytes,
            });
        }
        Ok(())
    }

    /// Queue a transfer for an existing message and start it right away.
    /// Returns the task id.
    #[instrument(skip(self, file), fields(file = %file.name, size = file.size()))]
    pub fn enqueue(&self, file: UploadFile, message_local_id: &str) -> Result<String> {
        self.check_size(&file)?;

        let task = {
            let mut tasks = self.inner.tasks.lock();
            self.inner.prune(&mut tasks);
            self.inner.push(&mut tasks, &file, message_local_id)
        };
        info!(task_id = %task.id, message_local_id, "Upload queued");
        Ok(self.start(task, file))
    }

    fn start(&self, task: UploadTask, file: UploadFile) -> String {
        let task_id = task.id.clone();
        tokio::spawn(run(self.inner.clone(), task, file));
        task_id
    }

    /// Abort a transfer. Canceling a finished task is a no-op.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let (local_id, token) = {
            let mut tasks = self.inner.tasks.lock();
            let entry = tasks
                .iter_mut()
                .find(|entry| entry.task.id == task_id)
                .ok_or_else(|| ChatError::TaskNotFound(task_id.to_string()))?;
            if entry.task.status.is_terminal() {
                debug!(task_id, status = ?entry.task.status, "Cancel ignored, task already finished");
                return Ok(());
            }
            entry.task.status = UploadStatus::Canceled;
            (
                entry.task.message_local_id.clone(),
                entry.task.cancel_handle.clone(),
            )
        };
        self.inner.changed.notify_waiters();
        token.cancel();

        info!(task_id, %local_id, "Upload canceled");
        if let Err(e) = self
            .inner
            .store
            .update_by_local_id(&local_id, MessagePatch::status(MessageStatus::Canceled))
        {
            debug!(%local_id, "Message not marked canceled: {}", e);
        }
        Ok(())
    }

    /// Start a fresh task for a failed or canceled transfer.
    ///
    /// The message keeps its local id and returns to `pending`. Only the most
    /// recent task of a message can be retried, and only once.
    pub fn retry(&self, task_id: &str) -> Result<String> {
        let (task, file) = {
            let mut tasks = self.inner.tasks.lock();
            let index = tasks
                .iter()
                .position(|entry| entry.task.id == task_id)
                .ok_or_else(|| ChatError::TaskNotFound(task_id.to_string()))?;
            let local_id = tasks[index].task.message_local_id.clone();
            let superseded = tasks[index + 1..]
                .iter()
                .any(|entry| entry.task.message_local_id == local_id);
            let retryable = matches!(
                tasks[index].task.status,
                UploadStatus::Error | UploadStatus::Canceled
            );
            if superseded || !retryable || tasks[index].file.is_none() {
                return Err(ChatError::TaskNotRetryable(task_id.to_string()));
            }

            // Still under the task lock, so a racing retry sees the new task
            self.inner
                .store
                .update_by_local_id(&local_id, MessagePatch::status(MessageStatus::Pending))?;
            let Some(file) = tasks[index].file.take() else {
                return Err(ChatError::TaskNotRetryable(task_id.to_string()));
            };
            let task = self.inner.push(&mut tasks, &file, &local_id);
            (task, file)
        };

        info!(task_id, retry_id = %task.id, local_id = %task.message_local_id, "Retrying upload");
        Ok(self.start(task, file))
    }

    /// Snapshot of every task, oldest first
    pub fn tasks(&self) -> Vec<UploadTask> {
        self.inner
            .tasks
            .lock()
            .iter()
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn task(&self, task_id: &str) -> Option<UploadTask> {
        self.inner
            .tasks
            .lock()
            .iter()
            .find(|entry| entry.task.id == task_id)
            .map(|entry| entry.task.clone())
    }

    /// Most recent task created for a message
    pub fn latest_for_message(&self, local_id: &str) -> Option<UploadTask> {
        self.inner
            .tasks
            .lock()
            .iter()
            .rev()
            .find(|entry| entry.task.message_local_id == local_id)
            .map(|entry| entry.task.clone())
    }

    /// Wait until a task is terminal and its transfer has wound down
    pub async fn wait(&self, task_id: &str) -> Option<UploadTask> {
        loop {
            let changed = self.inner.changed.notified();
            let (task, settled) = self
                .inner
                .tasks
                .lock()
                .iter()
                .find(|entry| entry.task.id == task_id)
                .map(|entry| (entry.task.clone(), entry.settled))?;
            if task.status.is_terminal() && settled {
                return Some(task);
            }
            changed.await;
        }
    }
}

async fn run(inner: Arc<Inner>, task: UploadTask, file: UploadFile) {
    let task_id = task.id.clone();
    transfer(inner.clone(), task, file).await;
    inner.mark_settled(&task_id);
}

async fn transfer(inner: Arc<Inner>, task: UploadTask, file: UploadFile) {
    let task_id = task.id;
    let local_id = task.message_local_id;
    let cancel = task.cancel_handle;

    let _permit = tokio::select! {
        _ = cancel.cancelled() => return,
        permit = inner.permits.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => {
                inner.fail(&task_id, &local_id, "upload queue closed".to_string());
                return;
            }
        },
    };

    if !inner.settle(&task_id, UploadStatus::Uploading, None) {
        return;
    }
    if let Err(e) = inner
        .store
        .update_by_local_id(&local_id, MessagePatch::status(MessageStatus::Uploading))
    {
        warn!(%task_id, %local_id, "Message no longer uploadable, dropping task: {}", e);
        inner.settle(&task_id, UploadStatus::Canceled, None);
        cancel.cancel();
        return;
    }
    info!(%task_id, %local_id, file = %file.name, "Upload started");

    let progress: ProgressFn = {
        let inner = inner.clone();
        let task_id = task_id.clone();
        let local_id = local_id.clone();
        Arc::new(move |p| inner.report_progress(&task_id, &local_id, p))
    };

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(ChatError::Canceled),
        result = inner.storage.upload(&file, progress, cancel.clone()) => result,
    };

    match result {
        Ok(blob) => {
            let Some(attachment) = blob.to_attachment() else {
                inner.fail(
                    &task_id,
                    &local_id,
                    "storage response carried no file reference".to_string(),
                );
                return;
            };
            finalize(&inner, &task_id, &local_id, attachment).await;
        }
        Err(ChatError::Canceled) => {
            debug!(%task_id, "Upload stopped after cancel");
        }
        Err(e) => inner.fail(&task_id, &local_id, e.to_string()),
    }
}

/// Publish the finished attachment and mark the message sent
async fn finalize(inner: &Inner, task_id: &str, local_id: &str, attachment: Attachment) {
    // Claim the task first so a late cancel becomes a no-op
    let claimed = inner
        .with_task(task_id, |task| {
            if task.status.is_terminal() {
                return false;
            }
            task.status = UploadStatus::Done;
            task.progress = 100;
            true
        })
        .unwrap_or(false);
    if !claimed {
        debug!(task_id, "Upload finished after cancel, keeping canceled");
        return;
    }

    let Some(mut message) = inner.store.get(local_id) else {
        warn!(task_id, local_id, "Message vanished before upload finished");
        return;
    };
    message.attachment = Some(attachment.clone());
    message.status = MessageStatus::Sent;

    if let Err(e) = inner.publisher.publish(&message).await {
        let error = e.to_string();
        warn!(task_id, local_id, %error, "Failed to publish finished upload");
        inner.with_task(task_id, |task| {
            task.status = UploadStatus::Error;
            task.error = Some(error.clone());
        });
        if let Err(e) = inner.store.update_by_local_id(
            local_id,
            MessagePatch::failed(error).with_attachment(attachment),
        ) {
            warn!(local_id, "Could not mark message failed: {}", e);
        }
        return;
    }
    inner.release_file(task_id);

    match inner.store.update_by_local_id(
        local_id,
        MessagePatch::status(MessageStatus::Sent)
            .with_attachment(attachment)
            .with_progress(100),
    ) {
        Ok(_) => info!(task_id, local_id, "Upload complete"),
        Err(e) => warn!(local_id, "Could not mark message sent: {}", e),
    }
}
