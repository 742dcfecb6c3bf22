//! Realtime transport: the channel trait and the room-aware client on top of it
//!
//! A [`Transport`] is a raw bidirectional channel. [`TransportClient`] adds the
//! behaviour the chat relies on:
//!
//! - room membership is remembered and re-issued on every `Connected` event,
//!   so a reconnect never silently drops the client out of its rooms
//! - events emitted while disconnected are queued (bounded) and flushed in
//!   order right after the rooms are re-joined
//! - handlers registered with [`TransportClient::on`] are invoked for every
//!   inbound event of that name

pub mod memory;
pub mod websocket;

use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, EventName};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use memory::{MemoryHub, MemoryTransport};
pub use websocket::WsTransport;

/// What a transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected { reason: String },
    Event(ChatEvent),
}

/// A persistent bidirectional event channel
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the channel. The returned stream yields link-state changes and
    /// inbound events until the transport shuts down.
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Send one event. Fails with [`ChatError::TransportClosed`] when the link is down.
    async fn send(&self, event: ChatEvent) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Room the client wants to be a member of
#[derive(Debug, Clone, PartialEq, Eq)]
enum Room {
    Conversation(String),
    Admin,
}

impl Room {
    fn join_event(&self) -> ChatEvent {
        match self {
            Room::Conversation(conversation_id) => ChatEvent::Join {
                conversation_id: conversation_id.clone(),
            },
            Room::Admin => ChatEvent::AdminJoin,
        }
    }
}

type Handler = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

/// Room-aware client shared by every chat component
pub struct TransportClient {
    transport: Arc<dyn Transport>,
    rooms: Mutex<Vec<Room>>,
    outbound: Mutex<VecDeque<ChatEvent>>,
    capacity: usize,
    handlers: Mutex<HashMap<EventName, Vec<Handler>>>,
    inbound: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl TransportClient {
    /// Wrap a transport; at most `capacity` events are held while disconnected
    pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Self {
        Self {
            transport,
            rooms: Mutex::new(Vec::new()),
            outbound: Mutex::new(VecDeque::new()),
            capacity,
            handlers: Mutex::new(HashMap::new()),
            inbound: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the underlying channel
    pub async fn connect(&self) -> Result<()> {
        let rx = self.transport.connect().await?;
        *self.inbound.lock().await = Some(rx);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Join a conversation room, now and after every reconnect
    pub async fn join(&self, conversation_id: &str) -> Result<()> {
        self.join_room(Room::Conversation(conversation_id.to_string()))
            .await
    }

    /// Join the admin room that receives every conversation
    pub async fn admin_join(&self) -> Result<()> {
        self.join_room(Room::Admin).await
    }

    async fn join_room(&self, room: Room) -> Result<()> {
        let added = {
            let mut rooms = self.rooms.lock();
            if rooms.contains(&room) {
                false
            } else {
                rooms.push(room.clone());
                true
            }
        };

        if added && self.transport.is_connected() {
            self.transport.send(room.join_event()).await?;
        }
        Ok(())
    }

    /// Register a handler for one event name
    pub fn on<F>(&self, name: EventName, handler: F)
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .entry(name)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Send an event, queueing it while the link is down
    pub async fn emit(&self, event: ChatEvent) -> Result<()> {
        if self.transport.is_connected() && self.outbound.lock().is_empty() {
            match self.transport.send(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(ChatError::TransportClosed) => {
                    debug!(event = event.name().as_str(), "Link dropped during send");
                }
                Err(e) => return Err(e),
            }
        }
        self.enqueue(event)
    }

    fn enqueue(&self, event: ChatEvent) -> Result<()> {
        let mut outbound = self.outbound.lock();
        if outbound.len() >= self.capacity {
            warn!(
                pending = outbound.len(),
                event = event.name().as_str(),
                "Outbound queue full, rejecting event"
            );
            return Err(ChatError::OutboundQueueFull(outbound.len()));
        }
        debug!(
            event = event.name().as_str(),
            "Queued event until reconnect"
        );
        outbound.push_back(event);
        Ok(())
    }

    /// Number of events waiting for the link to come back
    pub fn pending_outbound(&self) -> usize {
        self.outbound.lock().len()
    }

    async fn on_connected(&self) {
        let rooms = self.rooms.lock().clone();
        info!(rooms = rooms.len(), "Transport connected, re-joining rooms");
        for room in rooms {
            if let Err(e) = self.transport.send(room.join_event()).await {
                warn!("Failed to re-join {:?}: {}", room, e);
                return;
            }
        }
        self.flush().await;
    }

    async fn flush(&self) {
        loop {
            let Some(event) = self.outbound.lock().pop_front() else {
                break;
            };
            if let Err(e) = self.transport.send(event.clone()).await {
                warn!("Flush interrupted: {}", e);
                self.outbound.lock().push_front(event);
                break;
            }
        }
    }

    fn dispatch(&self, event: &ChatEvent) {
        let handlers = self
            .handlers
            .lock()
            .get(&event.name())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(event);
        }
    }

    /// Wait for the next inbound chat event.
    ///
    /// Link-state changes are handled here: `Connected` re-joins rooms and
    /// flushes the queue. Returns `None` once the transport has shut down.
    pub async fn next_event(&self) -> Option<ChatEvent> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut()?;

        while let Some(event) = rx.next().await {
            match event {
                TransportEvent::Connected => self.on_connected().await,
                TransportEvent::Disconnected { reason } => {
                    warn!(%reason, "Transport disconnected");
                }
                TransportEvent::Event(event) => {
                    self.dispatch(&event);
                    return Some(event);
                }
            }
        }

        None
    }
}
