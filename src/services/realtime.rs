//! Best-effort fan-out of state changes to live subscribers.
//!
//! Each subscriber owns a bounded queue. `emit` never blocks: a full queue
//! drops the event for that subscriber, a closed one is pruned. Nothing is
//! persisted or replayed for late joiners.

use log::{debug, trace};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

pub const SENSOR_DATA: &str = "sensor_data";
pub const GATEWAY_STATUS: &str = "gateway_status";
pub const ALERT_NEW: &str = "alert:new";

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Room(String),
}

pub type SubscriberId = u64;

pub struct Subscription {
    pub id: SubscriberId,
    receiver: Receiver<Event>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Everything queued right now.
    pub fn drain(&self) -> Vec<Event> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    sender: SyncSender<Event>,
    rooms: HashSet<String>,
}

pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    dropped: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Broadcaster {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::sync_channel(self.queue_capacity);
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscriber {
                    sender,
                    rooms: HashSet::new(),
                },
            );
        debug!("Realtime: subscriber {} connected", id);
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        if self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
        {
            debug!("Realtime: subscriber {} disconnected", id);
        }
    }

    /// Adds the subscriber to `room`. Joining twice is a no-op.
    /// Returns false for an unknown subscriber.
    pub fn join(&self, id: SubscriberId, room: &str) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        match subs.get_mut(&id) {
            Some(sub) => {
                sub.rooms.insert(room.to_string());
                true
            }
            None => false,
        }
    }

    /// Removes the subscriber from `room`. Leaving a room one is not in is a no-op.
    pub fn leave(&self, id: SubscriberId, room: &str) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        match subs.get_mut(&id) {
            Some(sub) => {
                sub.rooms.remove(room);
                true
            }
            None => false,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Events dropped because a subscriber's queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queues the event for every subscriber in `scope` and returns how many
    /// accepted it.
    pub fn emit(&self, event: &str, payload: Value, scope: &Scope) -> usize {
        let message = Event {
            name: event.to_string(),
            payload,
        };
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let subs = self.subscribers.read().unwrap_or_else(PoisonError::into_inner);
            for (id, sub) in subs.iter() {
                let in_scope = match scope {
                    Scope::All => true,
                    Scope::Room(room) => sub.rooms.contains(room),
                };
                if !in_scope {
                    continue;
                }
                match sub.sender.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("Realtime: subscriber {} queue full, dropped {}", id, event);
                    }
                    Err(TrySendError::Disconnected(_)) => closed.push(*id),
                }
            }
        }

        if !closed.is_empty() {
            let mut subs = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
            for id in closed {
                subs.remove(&id);
                debug!("Realtime: pruned closed subscriber {}", id);
            }
        }

        trace!("Realtime: {} delivered to {} subscriber(s)", event, delivered);
        delivered
    }
}
