//! Support Chat - real-time messaging core for a customer support chat
//!
//! This crate implements the messaging pipeline behind a user-side chat widget
//! and a multiplexed admin inbox, over a pluggable realtime transport and a
//! blob storage service.
//!
//! # Architecture
//!
//! Components, leaves first:
//!
//! - **TransportClient**: room-aware wrapper over a [`Transport`]; re-joins
//!   rooms on every reconnect and queues sends while disconnected
//! - **AttachmentStore**: authenticated fetch and `blob:` handle cache for
//!   protected media
//! - **UploadManager**: outbound file transfers with progress, cancel and retry
//! - **MessageStore**: per-conversation ordered messages and the status
//!   state machine; deduplicates echoes of optimistic messages
//! - **SessionTimer**: conversation TTL for the user widget
//! - **ReadReceiptSync**: seen-events in both directions
//! - **AdminInbox**: conversation summaries, unread counts and the active view
//!
//! `UserChat` and `AdminInbox` are the two facades an application drives.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use support_chat::{ChatConfig, ChatDeps, InMemorySessionStore, UserChat, WsTransport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ChatConfig {
//!     api_base_url: "https://support.example/api/".to_string(),
//!     ..Default::default()
//! };
//!
//! let transport = Arc::new(WsTransport::new("wss://support.example/socket"));
//! let deps = ChatDeps::http(&config, transport, Some("bearer-token".to_string()))?;
//! let chat = Arc::new(UserChat::new(
//!     "user-42",
//!     &config,
//!     deps,
//!     Arc::new(InMemorySessionStore::default()),
//! ));
//!
//! chat.start().await?;
//! chat.send("Hello, I need help with a withdrawal").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod error;
pub mod events;
pub mod inbox;
pub mod media_cache;
pub mod message_store;
pub mod outbox;
pub mod receipts;
pub mod session;
pub mod timing;
pub mod transport;
pub mod typing;
pub mod upload_manager;
pub mod widget;

pub use api::{ChatApi, HttpBlobStorage, HttpChatApi, HttpMediaFetcher, RestClient};
pub use error::{ChatError, Result};
pub use events::{
    Attachment, ChatEvent, ClearReason, ConversationSummary, EventName, MediaRef, Message,
    MessageKind, MessageStatus, Sender, StoreEvent, UploadStatus, UploadTask, WireAttachment,
    WireMessage,
};
pub use inbox::AdminInbox;
pub use media_cache::{AttachmentStore, BlobHandle, FetchedMedia, MediaFetcher};
pub use message_store::{MessagePatch, MessageStore};
pub use outbox::{MessagePublisher, Outbox};
pub use receipts::ReadReceiptSync;
pub use session::{
    FileSessionStore, InMemorySessionStore, Session, SessionPersistence, SessionTimer,
};
pub use timing::{Clock, ManualClock, SystemClock, TaskGuard};
pub use transport::{
    MemoryHub, MemoryTransport, Transport, TransportClient, TransportEvent, WsTransport,
};
pub use typing::TypingIndicator;
pub use upload_manager::{BlobStorage, ProgressFn, StoredBlob, UploadFile, UploadManager};
pub use widget::UserChat;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by both chat surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// REST root for `/message`, `/messages`, `/message-seen`, `/upload` and `/file/:key`
    pub api_base_url: String,

    /// Largest file accepted for upload (default: 10 MiB)
    pub max_upload_bytes: u64,

    /// Transfers allowed in flight at once (default: 2)
    pub max_concurrent_uploads: usize,

    /// Session lifetime from its first message (default: 30 minutes)
    pub session_ttl_ms: i64,

    /// Session expiry check period (default: 10s)
    pub session_check_interval_ms: u64,

    /// Quiet period after the last keystroke before typing stops (default: 1.5s)
    pub typing_quiet_period_ms: u64,

    /// Admin history refresh period for the selected conversation (default: 5s)
    pub history_refresh_interval_ms: u64,

    /// Events held while the transport is down (default: 256)
    pub outbound_queue_capacity: usize,

    /// Shown when protected media cannot be fetched
    pub placeholder_url: String,

    /// Where the user session record is kept
    pub session_state_path: PathBuf,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000/api/".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            max_concurrent_uploads: 2,
            session_ttl_ms: 30 * 60 * 1000,
            session_check_interval_ms: 10_000,
            typing_quiet_period_ms: 1_500,
            history_refresh_interval_ms: 5_000,
            outbound_queue_capacity: 256,
            placeholder_url: "/assets/placeholder.png".to_string(),
            session_state_path: PathBuf::from("support-chat-session.json"),
        }
    }
}

impl ChatConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: ChatConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(ChatError::InvalidConfig(
                "max_concurrent_uploads must be at least 1".to_string(),
            ));
        }
        if self.session_ttl_ms <= 0 {
            return Err(ChatError::InvalidConfig(
                "session_ttl_ms must be positive".to_string(),
            ));
        }
        if self.session_check_interval_ms == 0 || self.history_refresh_interval_ms == 0 {
            return Err(ChatError::InvalidConfig(
                "timer intervals must be positive".to_string(),
            ));
        }
        api::normalize_base(&self.api_base_url)?;
        Ok(())
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }

    pub fn typing_quiet_period(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_period_ms)
    }

    pub fn history_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.history_refresh_interval_ms)
    }

    /// Session persistence at `session_state_path`
    pub fn session_store(&self) -> FileSessionStore {
        FileSessionStore::new(self.session_state_path.clone())
    }
}

/// External collaborators handed to a chat facade
#[derive(Clone)]
pub struct ChatDeps {
    pub transport: Arc<dyn Transport>,
    pub storage: Arc<dyn BlobStorage>,
    pub api: Option<Arc<dyn ChatApi>>,
    pub media: Option<Arc<AttachmentStore>>,
    pub clock: Arc<dyn Clock>,
}

impl ChatDeps {
    pub fn new(transport: Arc<dyn Transport>, storage: Arc<dyn BlobStorage>) -> Self {
        Self {
            transport,
            storage,
            api: None,
            media: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wire up the REST collaborators for `config.api_base_url`
    pub fn http(
        config: &ChatConfig,
        transport: Arc<dyn Transport>,
        bearer: Option<String>,
    ) -> Result<Self> {
        let rest = RestClient::new(&config.api_base_url)?;
        rest.set_bearer(bearer.clone());
        let media = AttachmentStore::new(
            Arc::new(HttpMediaFetcher::new()),
            &config.api_base_url,
            config.placeholder_url.clone(),
        )?;
        media.set_bearer(bearer);

        Ok(Self::new(transport, Arc::new(HttpBlobStorage::new(rest.clone())))
            .with_api(Arc::new(HttpChatApi::new(rest)))
            .with_media(Arc::new(media)))
    }

    pub fn with_api(mut self, api: Arc<dyn ChatApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_media(mut self, media: Arc<AttachmentStore>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
