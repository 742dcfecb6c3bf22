#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support_chat::{
    AdminInbox, BlobStorage, ChatApi, ChatConfig, ChatDeps, ChatError, ChatEvent, InMemorySessionStore,
    ManualClock, MemoryHub, ProgressFn, Result, StoreEvent, StoredBlob, TransportClient,
    UploadFile, UserChat, Sender, WireMessage,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Storage that replays scripted progress and optionally waits for a release
pub struct ScriptedStorage {
    pub steps: Vec<u8>,
    pub release: Arc<Notify>,
    pub blocking: bool,
}

impl ScriptedStorage {
    pub fn instant(steps: Vec<u8>) -> Self {
        Self {
            steps,
            release: Arc::new(Notify::new()),
            blocking: false,
        }
    }

    pub fn held(steps: Vec<u8>, release: Arc<Notify>) -> Self {
        Self {
            steps,
            release,
            blocking: true,
        }
    }
}

#[async_trait]
impl BlobStorage for ScriptedStorage {
    async fn upload(
        &self,
        _file: &UploadFile,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<StoredBlob> {
        for step in &self.steps {
            progress(*step);
        }
        if self.blocking {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChatError::Canceled),
                _ = self.release.notified() => {}
            }
        }
        Ok(StoredBlob {
            file_key: Some("abc.png".to_string()),
            thumb_key: Some("thumb-abc.png".to_string()),
            ..Default::default()
        })
    }
}

/// REST backend that keeps whatever is posted and serves it back as history
#[derive(Default)]
pub struct RecordingApi {
    pub posted: Mutex<Vec<WireMessage>>,
    pub fetches: AtomicUsize,
}

impl RecordingApi {
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatApi for RecordingApi {
    async fn post_message(&self, message: &WireMessage) -> Result<()> {
        self.posted.lock().push(message.clone());
        Ok(())
    }

    async fn fetch_history(&self, conversation_id: &str) -> Result<Vec<WireMessage>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .posted
            .lock()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn mark_seen(&self, _conversation_id: &str, _by: Sender) -> Result<()> {
        Ok(())
    }
}

pub fn user_chat(
    hub: &MemoryHub,
    conversation_id: &str,
    clock: Arc<ManualClock>,
    storage: ScriptedStorage,
) -> UserChat {
    let deps = ChatDeps::new(Arc::new(hub.transport()), Arc::new(storage)).with_clock(clock);
    UserChat::new(
        conversation_id,
        &ChatConfig::default(),
        deps,
        Arc::new(InMemorySessionStore::default()),
    )
}

pub fn admin_inbox(hub: &MemoryHub, clock: Arc<ManualClock>) -> AdminInbox {
    let deps = ChatDeps::new(Arc::new(hub.transport()), Arc::new(ScriptedStorage::instant(vec![])))
        .with_clock(clock);
    AdminInbox::new(&ChatConfig::default(), deps)
}

/// Next inbound chat event, failing the test after a second of silence
pub async fn next_event(transport: &TransportClient) -> ChatEvent {
    tokio::time::timeout(Duration::from_secs(1), transport.next_event())
        .await
        .expect("timed out waiting for an event")
        .expect("transport closed")
}

/// Everything the store published so far
pub fn drain(rx: &mut futures::channel::mpsc::UnboundedReceiver<StoreEvent>) -> Vec<StoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until `condition` holds, polling cooperatively
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition never became true");
}
