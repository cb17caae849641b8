//! Per-peer communication channels shared by every relay task in a process.
//!
//! A [`ChannelRegistry`] maps peer public keys to unbounded byte channels
//! with atomic get-or-create semantics: any relay task can `ensure` an entry
//! for a key it has just learned about, and the task that owns the socket to
//! that peer claims the receiving end once with `take_receiver`.  Two
//! registries exist per process: one for intra-process pipe handoff and one
//! for the outbound publish queues drained by [`BlockPublisher`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::RwLock;

use crate::logging;
use crate::mlog;

struct ChannelEntry {
    sender: UnboundedSender<Vec<u8>>,
    /// Present until the owning task claims it.
    receiver: Option<UnboundedReceiver<Vec<u8>>>,
}

/// Shared map of peer key → byte channel with atomic get-or-create.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, ChannelEntry>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        ChannelRegistry::default()
    }

    /// Create the channel for `key` if it does not exist yet.  Safe to call
    /// concurrently from many relay tasks; exactly one channel results.
    pub async fn ensure(&self, key: &str) {
        let mut inner = self.inner.write().await;
        inner.entry(key.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            ChannelEntry {
                sender,
                receiver: Some(receiver),
            }
        });
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.contains_key(key)
    }

    /// Claim the receiving end of `key`'s channel.  Returns `None` when the
    /// channel does not exist or was already claimed.
    pub async fn take_receiver(&self, key: &str) -> Option<UnboundedReceiver<Vec<u8>>> {
        let mut inner = self.inner.write().await;
        inner.get_mut(key)?.receiver.take()
    }

    /// Send bytes into `key`'s channel.  Returns whether a channel existed
    /// and accepted the message.
    pub async fn send(&self, key: &str, bytes: Vec<u8>) -> bool {
        let inner = self.inner.read().await;
        match inner.get(key) {
            Some(entry) => entry.sender.send(bytes).is_ok(),
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Outbound fan-out over a queue registry.
///
/// Forwarded packets are handed off here; whichever task owns the socket to
/// the addressed peer drains that peer's queue.  Publishing to a peer nobody
/// listens for yet is logged and dropped, matching the at-most-once relay
/// semantics of a hop with no live next-hop connection.
#[derive(Clone)]
pub struct BlockPublisher {
    queues: ChannelRegistry,
}

impl BlockPublisher {
    pub fn new(queues: ChannelRegistry) -> Self {
        BlockPublisher { queues }
    }

    pub fn queues(&self) -> &ChannelRegistry {
        &self.queues
    }

    /// Queue raw packet bytes for delivery to `key`.
    pub async fn publish_message(&self, key: &str, bytes: Vec<u8>) -> bool {
        self.queues.ensure(key).await;
        let delivered = self.queues.send(key, bytes).await;
        if !delivered {
            mlog!(
                "publisher: dropped message for {} (no live consumer)",
                logging::peer_key(key)
            );
        }
        delivered
    }
}
