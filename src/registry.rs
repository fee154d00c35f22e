//! The authoritative mapping from upstream receiver identity to its
//! downstream sender (§3, §4.3).

use std::sync::Arc;

use indexmap::IndexMap;

use crate::downstream::DownstreamSender;
use crate::upstream::UpstreamReceiver;

/// Identity of an upstream receiver within the registry: unique per
/// `(connection_id, link_id)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiverKey {
    pub connection_id: String,
    pub link_id: String,
}

impl ReceiverKey {
    pub fn of(receiver: &dyn UpstreamReceiver) -> Self {
        Self {
            connection_id: receiver.connection_id().to_string(),
            link_id: receiver.link_id().to_string(),
        }
    }
}

struct Entry {
    receiver: Arc<dyn UpstreamReceiver>,
    sender: Arc<dyn DownstreamSender>,
}

/// `active: UpstreamReceiver → DownstreamSender` plus the secondary
/// `byConnection` index, kept strictly consistent (§3).
///
/// Invariants maintained after every mutation:
/// - every key in `active` appears in exactly one list of `by_connection`,
///   under its own `connection_id`;
/// - no two distinct upstream receivers share the same downstream sender.
#[derive(Default)]
pub struct LinkRegistry {
    active: IndexMap<ReceiverKey, Entry>,
    by_connection: IndexMap<String, Vec<ReceiverKey>>,
}

impl std::fmt::Debug for LinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkRegistry")
            .field("active_len", &self.active.len())
            .field("connections", &self.by_connection.len())
            .finish()
    }
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `receiver → sender`, appending `receiver` to its connection's
    /// ordered list.
    pub fn add(&mut self, receiver: Arc<dyn UpstreamReceiver>, sender: Arc<dyn DownstreamSender>) {
        let key = ReceiverKey::of(receiver.as_ref());
        self.by_connection
            .entry(key.connection_id.clone())
            .or_default()
            .push(key.clone());
        self.active.insert(key, Entry { receiver, sender });
    }

    /// Look up the downstream sender for `receiver`, if any.
    pub fn get(&self, receiver: &dyn UpstreamReceiver) -> Option<Arc<dyn DownstreamSender>> {
        let key = ReceiverKey::of(receiver);
        self.active.get(&key).map(|e| e.sender.clone())
    }

    /// Look up both halves of an entry by key, used by FLOW handling which
    /// only knows the key a credit-replenish handler closure was created
    /// with.
    pub fn get_by_key(
        &self,
        key: &ReceiverKey,
    ) -> Option<(Arc<dyn UpstreamReceiver>, Arc<dyn DownstreamSender>)> {
        self.active
            .get(key)
            .map(|e| (e.receiver.clone(), e.sender.clone()))
    }

    /// Remove `receiver` from both maps, returning the prior sender if any
    /// so the caller can close it.
    pub fn remove(&mut self, receiver: &dyn UpstreamReceiver) -> Option<Arc<dyn DownstreamSender>> {
        let key = ReceiverKey::of(receiver);
        let entry = self.active.shift_remove(&key)?;

        if let Some(list) = self.by_connection.get_mut(&key.connection_id) {
            list.retain(|k| k != &key);
            if list.is_empty() {
                self.by_connection.shift_remove(&key.connection_id);
            }
        }

        Some(entry.sender)
    }

    /// Detach all entries for `connection_id` in one step, returning the
    /// receivers that were removed together with the sender each owned, in
    /// the order they were originally added.
    pub fn remove_connection(
        &mut self,
        connection_id: &str,
    ) -> Vec<(Arc<dyn UpstreamReceiver>, Arc<dyn DownstreamSender>)> {
        let keys = match self.by_connection.shift_remove(connection_id) {
            Some(keys) => keys,
            None => return Vec::new(),
        };

        keys.into_iter()
            .filter_map(|key| self.active.shift_remove(&key))
            .map(|entry| (entry.receiver, entry.sender))
            .collect()
    }

    /// Remove all entries (used on downstream disconnect), returning them in
    /// insertion order for reproducible close notifications.
    pub fn clear(&mut self) -> Vec<(Arc<dyn UpstreamReceiver>, Arc<dyn DownstreamSender>)> {
        self.by_connection.clear();
        self.active
            .drain(..)
            .map(|(_, entry)| (entry.receiver, entry.sender))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Assert the two maps are mutually consistent. Used by tests; cheap
    /// enough to also run from debug assertions if ever needed.
    #[cfg(test)]
    fn assert_consistent(&self) {
        for (key, entry) in &self.active {
            let list = self
                .by_connection
                .get(&key.connection_id)
                .unwrap_or_else(|| panic!("receiver {key:?} missing from byConnection index"));
            assert!(list.contains(key));
            assert_eq!(&ReceiverKey::of(entry.receiver.as_ref()), key);
        }
        for (connection_id, keys) in &self.by_connection {
            for key in keys {
                assert_eq!(&key.connection_id, connection_id);
                assert!(self.active.contains_key(key));
            }
        }
    }
}
