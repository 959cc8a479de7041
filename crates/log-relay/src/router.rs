use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::mpsc::{self, error::SendError};
use uuid::Uuid;

use crate::protocol::ServerMessage;

pub type ConnectionId = Uuid;

/// Sink handle for one realtime connection.
///
/// Cloning shares the underlying queue; the connection's writer task owns the
/// receiving half.
#[derive(Clone, Debug)]
pub struct Subscriber {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl Subscriber {
    /// Creates a subscriber with a fresh connection id. The queue is unbounded:
    /// frames for a live connection are never dropped, only held until its
    /// writer catches up.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                sender,
            },
            receiver,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues a frame for this connection only.
    /// Fails only once the connection's writer is gone.
    pub fn send(&self, message: ServerMessage) -> Result<(), SendError<ServerMessage>> {
        self.sender.send(message)
    }
}

/// Maps channel names to the connections currently subscribed to them.
///
/// Membership of each channel sits behind its own lock, so joins, leaves and
/// deliveries on unrelated channels never contend beyond a map shard.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    inner: Arc<RouterInner>,
}

#[derive(Default)]
struct RouterInner {
    channels: DashMap<String, Arc<ChannelState>>,
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the connection was already a member.
    pub newly_joined: bool,
    pub members: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryMetrics {
    pub delivered: usize,
    /// Members evicted because their connection had already gone away.
    pub closed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel: String,
    pub subscribers: usize,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `subscriber` to `channel`. Joining a channel twice is a no-op.
    pub fn join(&self, channel: &str, subscriber: &Subscriber) -> JoinOutcome {
        // Insert while the shard guard is held so a concurrent prune of an
        // empty channel cannot orphan this membership.
        let outcome = {
            let state = self
                .inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(ChannelState::new(channel)));
            state.add(subscriber)
        };

        self.inner
            .memberships
            .entry(subscriber.id)
            .or_default()
            .insert(channel.to_string());

        outcome
    }

    /// Removes the connection from every channel it joined. Returns the number
    /// of channels it was removed from.
    pub fn leave_all(&self, connection_id: ConnectionId) -> usize {
        let Some((_, channels)) = self.inner.memberships.remove(&connection_id) else {
            return 0;
        };

        let mut left = 0usize;
        for channel in channels {
            if self.remove_member(&channel, connection_id) {
                left += 1;
            }
        }
        left
    }

    /// Sends `message` to every current member of `channel`.
    ///
    /// Never blocks. A member whose connection is gone is evicted; that does
    /// not affect delivery to the remaining members.
    pub fn deliver(&self, channel: &str, message: &ServerMessage) -> DeliveryMetrics {
        let mut metrics = DeliveryMetrics::default();

        let Some(state) = self
            .inner
            .channels
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return metrics;
        };

        for (connection_id, sender) in state.senders() {
            if sender.send(message.clone()).is_ok() {
                metrics.delivered += 1;
            } else {
                metrics.closed += 1;
                self.evict(channel, connection_id);
            }
        }

        metrics
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|entry| entry.value().len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Channels the connection currently belongs to, sorted.
    pub fn channels_of(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut channels: Vec<String> = self
            .inner
            .memberships
            .get(&connection_id)
            .map(|entry| entry.value().iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let states: Vec<Arc<ChannelState>> = self
            .inner
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut snapshot: Vec<ChannelSnapshot> = states
            .into_iter()
            .map(|state| ChannelSnapshot {
                channel: state.name.clone(),
                subscribers: state.len(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.channel.cmp(&b.channel));
        snapshot
    }

    fn evict(&self, channel: &str, connection_id: ConnectionId) {
        self.remove_member(channel, connection_id);
        if let Some(mut channels) = self.inner.memberships.get_mut(&connection_id) {
            channels.remove(channel);
        }
    }

    fn remove_member(&self, channel: &str, connection_id: ConnectionId) -> bool {
        let Some(state) = self
            .inner
            .channels
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };

        let removed = state.remove(connection_id);
        if state.len() == 0 {
            self.inner
                .channels
                .remove_if(channel, |_, current| {
                    Arc::ptr_eq(current, &state) && current.len() == 0
                });
        }
        removed
    }
}

struct ChannelState {
    name: String,
    members: Mutex<ChannelMembers>,
}

struct ChannelMembers {
    slab: Slab<MemberEntry>,
    index_map: HashMap<ConnectionId, usize>,
}

struct MemberEntry {
    id: ConnectionId,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: Mutex::new(ChannelMembers {
                slab: Slab::new(),
                index_map: HashMap::new(),
            }),
        }
    }

    fn add(&self, subscriber: &Subscriber) -> JoinOutcome {
        let mut guard = self.members.lock();
        if guard.index_map.contains_key(&subscriber.id) {
            return JoinOutcome {
                newly_joined: false,
                members: guard.slab.len(),
            };
        }
        let key = guard.slab.insert(MemberEntry {
            id: subscriber.id,
            sender: subscriber.sender.clone(),
        });
        guard.index_map.insert(subscriber.id, key);
        JoinOutcome {
            newly_joined: true,
            members: guard.slab.len(),
        }
    }

    fn remove(&self, connection_id: ConnectionId) -> bool {
        let mut guard = self.members.lock();
        match guard.index_map.remove(&connection_id) {
            Some(key) => {
                guard.slab.remove(key);
                true
            }
            None => false,
        }
    }

    fn senders(&self) -> Vec<(ConnectionId, mpsc::UnboundedSender<ServerMessage>)> {
        let guard = self.members.lock();
        guard
            .slab
            .iter()
            .map(|(_, entry)| (entry.id, entry.sender.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.members.lock().slab.len()
    }
}
