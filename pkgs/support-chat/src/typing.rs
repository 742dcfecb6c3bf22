//! Debounced typing indicator

use crate::error::Result;
use crate::events::{ChatEvent, Sender};
use crate::transport::TransportClient;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Default)]
struct TypingState {
    typing: bool,
    stop_timer: Option<JoinHandle<()>>,
}

/// Emits a start event on the first keystroke and a stop event once the
/// quiet period passes without another keystroke.
pub struct TypingIndicator {
    transport: Arc<TransportClient>,
    conversation_id: String,
    side: Sender,
    quiet_period: Duration,
    state: Arc<Mutex<TypingState>>,
}

impl TypingIndicator {
    pub fn new(
        transport: Arc<TransportClient>,
        conversation_id: impl Into<String>,
        side: Sender,
        quiet_period: Duration,
    ) -> Self {
        Self {
            transport,
            conversation_id: conversation_id.into(),
            side,
            quiet_period,
            state: Arc::new(Mutex::new(TypingState::default())),
        }
    }

    fn start_event(&self) -> ChatEvent {
        let conversation_id = self.conversation_id.clone();
        match self.side {
            Sender::User => ChatEvent::TypingStart { conversation_id },
            Sender::Support => ChatEvent::AdminTypingStart { conversation_id },
        }
    }

    fn stop_event(side: Sender, conversation_id: String) -> ChatEvent {
        match side {
            Sender::User => ChatEvent::TypingStop { conversation_id },
            Sender::Support => ChatEvent::AdminTypingStop { conversation_id },
        }
    }

    /// Record a keystroke and re-arm the stop timer
    pub async fn keystroke(&self) -> Result<()> {
        let started = {
            let mut state = self.state.lock();
            if let Some(timer) = state.stop_timer.take() {
                timer.abort();
            }
            let started = !state.typing;
            state.typing = true;

            let transport = self.transport.clone();
            let shared = self.state.clone();
            let side = self.side;
            let conversation_id = self.conversation_id.clone();
            let quiet_period = self.quiet_period;
            state.stop_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(quiet_period).await;
                let was_typing = {
                    let mut state = shared.lock();
                    state.stop_timer = None;
                    std::mem::replace(&mut state.typing, false)
                };
                if was_typing {
                    debug!(%conversation_id, "Typing quiet period elapsed");
                    if let Err(e) = transport
                        .emit(Self::stop_event(side, conversation_id.clone()))
                        .await
                    {
                        debug!(%conversation_id, "Typing stop not delivered: {}", e);
                    }
                }
            }));
            started
        };

        if started {
            self.transport.emit(self.start_event()).await?;
        }
        Ok(())
    }

    /// Stop immediately, e.g. when the message is sent
    pub async fn stop(&self) -> Result<()> {
        let was_typing = {
            let mut state = self.state.lock();
            if let Some(timer) = state.stop_timer.take() {
                timer.abort();
            }
            std::mem::replace(&mut state.typing, false)
        };
        if was_typing {
            self.transport
                .emit(Self::stop_event(self.side, self.conversation_id.clone()))
                .await?;
        }
        Ok(())
    }

    pub fn is_typing(&self) -> bool {
        self.state.lock().typing
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        if let Some(timer) = self.state.lock().stop_timer.take() {
            timer.abort();
        }
    }
}
