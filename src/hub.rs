//! Connection Hub
//!
//! Local half of the group fan-out bus: tracks every live connection on this
//! node and the groups it belongs to. Each group is a tokio broadcast channel,
//! so a publish is O(1) regardless of membership and never waits on a slow
//! member. A per-membership forwarding task moves payloads into the
//! connection's bounded outbox, which the gateway drains onto the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Broadcast channel capacity per group
const GROUP_CAPACITY: usize = 256;

/// Outbox capacity per connection
const OUTBOX_CAPACITY: usize = 512;

pub type ConnId = u64;

struct Member {
    user_id: Uuid,
    outbox: mpsc::Sender<Vec<u8>>,
}

/// A group's broadcast sender and its local membership count
///
/// Membership is counted here rather than read from `receiver_count()`,
/// since aborted forwarders release their receivers asynchronously.
struct Group {
    sender: broadcast::Sender<Vec<u8>>,
    members: usize,
}

/// Hub manages connections and group memberships
#[derive(Default)]
pub struct Hub {
    /// Live connections by ID
    members: DashMap<ConnId, Member>,

    /// Group channels: group -> Group
    groups: DashMap<String, Group>,

    /// Forwarding tasks: conn_id -> (group -> AbortHandle)
    subscriptions: DashMap<ConnId, HashMap<String, AbortHandle>>,

    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning its ID and outbox receiver
    pub fn register(&self, user_id: Uuid) -> (ConnId, mpsc::Receiver<Vec<u8>>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (outbox, rx) = mpsc::channel(OUTBOX_CAPACITY);

        self.subscriptions.insert(conn_id, HashMap::new());
        self.members.insert(conn_id, Member { user_id, outbox });
        debug!(conn_id, %user_id, "connection registered");

        (conn_id, rx)
    }

    /// Join a connection to a group
    pub fn join(&self, conn_id: ConnId, group: &str) {
        let Some(outbox) = self.members.get(&conn_id).map(|m| m.outbox.clone()) else {
            warn!(conn_id, group, "join for unknown connection");
            return;
        };

        // Held for the whole join; lock order is subscriptions then groups
        let Some(mut subs) = self.subscriptions.get_mut(&conn_id) else {
            warn!(conn_id, group, "join for unknown connection");
            return;
        };
        if subs.contains_key(group) {
            debug!(conn_id, group, "already a member");
            return;
        }

        // Subscribe before spawning so nothing published after join is missed
        let mut rx = {
            let mut entry = self.groups.entry(group.to_string()).or_insert_with(|| Group {
                sender: broadcast::channel(GROUP_CAPACITY).0,
                members: 0,
            });
            entry.members += 1;
            entry.sender.subscribe()
        };
        let group_name = group.to_string();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        if outbox.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn_id, group = %group_name, lagged = n, "member lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        subs.insert(group.to_string(), handle.abort_handle());
        debug!(conn_id, group, "joined group");
    }

    /// Remove a connection from a group
    pub fn leave(&self, conn_id: ConnId, group: &str) {
        if let Some(mut subs) = self.subscriptions.get_mut(&conn_id)
            && let Some(handle) = subs.remove(group)
        {
            handle.abort();
            self.release(group);
            debug!(conn_id, group, "left group");
        }
    }

    /// Remove a connection and every membership it holds
    pub fn remove(&self, conn_id: ConnId) {
        if let Some((_, subs)) = self.subscriptions.remove(&conn_id) {
            for (group, handle) in subs {
                handle.abort();
                self.release(&group);
            }
        }

        if let Some((_, member)) = self.members.remove(&conn_id) {
            debug!(conn_id, user_id = %member.user_id, "connection removed");
        }
    }

    /// Drop one membership, removing the group with its last member
    fn release(&self, group: &str) {
        let removed = self.groups.remove_if_mut(group, |_, entry| {
            entry.members = entry.members.saturating_sub(1);
            entry.members == 0
        });
        if removed.is_some() {
            debug!(group, "removed empty group");
        }
    }

    /// Deliver a payload to every local member of a group
    ///
    /// Returns the number of members reached. A group with no members is a no-op.
    pub fn broadcast(&self, group: &str, payload: &[u8]) -> usize {
        let Some(entry) = self.groups.get(group) else {
            return 0;
        };

        match entry.sender.send(payload.to_vec()) {
            Ok(n) => {
                debug!(group, receivers = n, "broadcast sent");
                n
            }
            Err(_) => {
                debug!(group, "no receivers for broadcast");
                0
            }
        }
    }

    /// Queue a payload for one connection without waiting
    pub fn send(&self, conn_id: ConnId, payload: &[u8]) -> bool {
        let Some(member) = self.members.get(&conn_id) else {
            return false;
        };

        match member.outbox.try_send(payload.to_vec()) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn_id, error = %e, "dropped direct frame");
                false
            }
        }
    }

    /// Number of local members in a group
    pub fn group_members(&self, group: &str) -> usize {
        self.groups.get(group).map(|g| g.members).unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.members.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.members.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}
