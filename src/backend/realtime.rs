// Realtime change feed
// Row changes on `messages` are fanned out to every open channel with a matching binding.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::Table;
use crate::models::Message;

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A committed row change; `new` is the row as it is after the change
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub new: Message,
}

/// What a channel listens for. `receiver_id` narrows the binding to rows
/// addressed to one user.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelBinding {
    pub kind: ChangeKind,
    pub table: Table,
    pub receiver_id: Option<String>,
}

impl ChannelBinding {
    pub fn inserts_for(receiver_id: &str) -> Self {
        ChannelBinding {
            kind: ChangeKind::Insert,
            table: Table::Messages,
            receiver_id: Some(receiver_id.to_string()),
        }
    }

    pub fn all_updates() -> Self {
        ChannelBinding {
            kind: ChangeKind::Update,
            table: Table::Messages,
            receiver_id: None,
        }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if self.kind != event.kind || self.table != event.table {
            return false;
        }
        match &self.receiver_id {
            Some(receiver) => &event.new.receiver_id == receiver,
            None => true,
        }
    }
}

/// Receiving end of a subscription. `recv` yields `None` once the channel
/// has been removed.
pub struct RealtimeChannel {
    id: ChannelId,
    events: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl RealtimeChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

struct ChannelEntry {
    bindings: Vec<ChannelBinding>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, bindings: Vec<ChannelBinding>) -> RealtimeChannel {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        match self.channels.lock() {
            Ok(mut channels) => {
                channels.insert(id, ChannelEntry { bindings, tx });
            }
            Err(e) => warn!("Channel registry lock poisoned while opening channel {}: {}", id, e),
        }
        debug!("Opened realtime channel {}", id);
        RealtimeChannel { id, events: rx }
    }

    /// Returns true if the channel was open
    pub fn close(&self, id: ChannelId) -> bool {
        let removed = match self.channels.lock() {
            Ok(mut channels) => channels.remove(&id).is_some(),
            Err(_) => false,
        };
        if removed {
            debug!("Closed realtime channel {}", id);
        }
        removed
    }

    pub fn publish(&self, event: &ChangeEvent) {
        let mut channels = match self.channels.lock() {
            Ok(channels) => channels,
            Err(e) => {
                warn!("Channel registry lock poisoned, dropping change event: {}", e);
                return;
            }
        };

        let mut dead = Vec::new();
        for (id, entry) in channels.iter() {
            if entry.bindings.iter().any(|b| b.matches(event)) {
                if entry.tx.send(event.clone()).is_err() {
                    dead.push(*id);
                }
            }
        }

        // Receivers that were dropped without removing the channel
        for id in dead {
            channels.remove(&id);
        }
    }

    pub fn active_channels(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}
