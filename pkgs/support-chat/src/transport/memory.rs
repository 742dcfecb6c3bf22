//! In-process room hub that plays the server side of the realtime channel
//!
//! Routing follows the chat server: user messages reach the conversation room
//! and the admin room, sender included, so optimistic messages get echoed back.
//! `messageSeen` is relayed to the other side as `messagesSeen`. Room
//! membership is lost on disconnect, like a socket server forgets it.

use super::{Transport, TransportEvent};
use crate::error::{ChatError, Result};
use crate::events::{ChatEvent, Sender};
use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

const ADMIN_ROOM: &str = "admins";

fn conversation_room(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

#[derive(Debug, Default)]
struct Connection {
    tx: Option<mpsc::UnboundedSender<TransportEvent>>,
    rooms: HashSet<String>,
    online: bool,
}

#[derive(Debug, Default)]
struct HubState {
    next_id: u64,
    connections: HashMap<u64, Connection>,
    received: Vec<(u64, ChatEvent)>,
}

/// Shared hub; cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection, offline until `connect`
    pub fn transport(&self) -> MemoryTransport {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.connections.insert(id, Connection::default());
        MemoryTransport {
            hub: self.clone(),
            id,
        }
    }

    /// Every event the hub accepted from clients, in arrival order
    pub fn received(&self) -> Vec<(u64, ChatEvent)> {
        self.state.lock().received.clone()
    }

    /// Count accepted events matching a predicate
    pub fn count_received(&self, predicate: impl Fn(&ChatEvent) -> bool) -> usize {
        self.state
            .lock()
            .received
            .iter()
            .filter(|(_, event)| predicate(event))
            .count()
    }

    pub fn is_member(&self, connection: u64, conversation_id: &str) -> bool {
        self.state
            .lock()
            .connections
            .get(&connection)
            .is_some_and(|c| c.rooms.contains(&conversation_room(conversation_id)))
    }

    /// Drop a connection's link. Its rooms are forgotten.
    pub fn disconnect(&self, connection: u64) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.get_mut(&connection) {
            conn.online = false;
            conn.rooms.clear();
            if let Some(tx) = &conn.tx {
                let _ = tx.unbounded_send(TransportEvent::Disconnected {
                    reason: "link dropped".to_string(),
                });
            }
        }
    }

    /// Bring a dropped link back
    pub fn reconnect(&self, connection: u64) {
        let mut state = self.state.lock();
        if let Some(conn) = state.connections.get_mut(&connection) {
            if conn.tx.is_some() && !conn.online {
                conn.online = true;
                if let Some(tx) = &conn.tx {
                    let _ = tx.unbounded_send(TransportEvent::Connected);
                }
            }
        }
    }

    /// Push an event straight to one connection, ignoring rooms
    pub fn send_to(&self, connection: u64, event: ChatEvent) {
        let state = self.state.lock();
        if let Some(tx) = state
            .connections
            .get(&connection)
            .and_then(|c| c.tx.as_ref())
        {
            let _ = tx.unbounded_send(TransportEvent::Event(event));
        }
    }

    fn open(&self, connection: u64) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded();
        let _ = tx.unbounded_send(TransportEvent::Connected);
        let mut state = self.state.lock();
        let conn = state.connections.entry(connection).or_default();
        conn.tx = Some(tx);
        conn.online = true;
        conn.rooms.clear();
        rx
    }

    fn is_online(&self, connection: u64) -> bool {
        self.state
            .lock()
            .connections
            .get(&connection)
            .is_some_and(|c| c.online)
    }

    fn route(&self, from: u64, event: ChatEvent) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connections.get(&from).is_some_and(|c| c.online) {
            return Err(ChatError::TransportClosed);
        }
        state.received.push((from, event.clone()));

        let (rooms, outgoing, include_sender): (Vec<String>, Option<ChatEvent>, bool) =
            match &event {
                ChatEvent::Join { conversation_id } => {
                    if let Some(conn) = state.connections.get_mut(&from) {
                        conn.rooms.insert(conversation_room(conversation_id));
                    }
                    return Ok(());
                }
                ChatEvent::AdminJoin => {
                    if let Some(conn) = state.connections.get_mut(&from) {
                        conn.rooms.insert(ADMIN_ROOM.to_string());
                    }
                    return Ok(());
                }
                ChatEvent::NewMessage(message) => (
                    vec![
                        conversation_room(&message.conversation_id),
                        ADMIN_ROOM.to_string(),
                    ],
                    Some(event.clone()),
                    true,
                ),
                ChatEvent::TypingStart { .. } | ChatEvent::TypingStop { .. } => {
                    (vec![ADMIN_ROOM.to_string()], Some(event.clone()), false)
                }
                ChatEvent::AdminTypingStart { conversation_id }
                | ChatEvent::AdminTypingStop { conversation_id } => (
                    vec![conversation_room(conversation_id)],
                    Some(event.clone()),
                    false,
                ),
                ChatEvent::MessageSeen {
                    conversation_id,
                    by,
                } => {
                    let relayed = ChatEvent::MessagesSeen {
                        conversation_id: conversation_id.clone(),
                        by: *by,
                    };
                    let room = match by {
                        Sender::User => ADMIN_ROOM.to_string(),
                        Sender::Support => conversation_room(conversation_id),
                    };
                    (vec![room], Some(relayed), false)
                }
                ChatEvent::SessionEnded { conversation_id } => (
                    vec![
                        conversation_room(conversation_id),
                        ADMIN_ROOM.to_string(),
                    ],
                    Some(event.clone()),
                    false,
                ),
                // Server-originated only
                ChatEvent::MessagesSeen { .. } => (Vec::new(), None, false),
            };

        let Some(outgoing) = outgoing else {
            return Ok(());
        };

        let mut delivered = 0;
        for (id, conn) in &state.connections {
            if !conn.online || (*id == from && !include_sender) {
                continue;
            }
            if !rooms.iter().any(|room| conn.rooms.contains(room)) {
                continue;
            }
            if let Some(tx) = &conn.tx {
                if tx
                    .unbounded_send(TransportEvent::Event(outgoing.clone()))
                    .is_ok()
                {
                    delivered += 1;
                }
            }
        }

        debug!(
            event = outgoing.name().as_str(),
            from, delivered, "Hub routed event"
        );
        Ok(())
    }
}

/// One client connection to a [`MemoryHub`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
}

impl MemoryTransport {
    /// Connection id as known by the hub
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        Ok(self.hub.open(self.id))
    }

    async fn send(&self, event: ChatEvent) -> Result<()> {
        self.hub.route(self.id, event)
    }

    fn is_connected(&self) -> bool {
        self.hub.is_online(self.id)
    }
}
