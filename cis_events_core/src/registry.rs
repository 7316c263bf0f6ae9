// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping from type URL to the set of local receiver queues currently
//! interested in it, plus whether the upstream session is subscribed.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::receiver_queue::{QueueId, ReceiverQueueHandle};

struct Entry {
    queues: Vec<ReceiverQueueHandle>,
    upstream_subscribed: bool,
}

impl Entry {
    fn new() -> Self {
        Self {
            queues: Vec::new(),
            upstream_subscribed: false,
        }
    }
}

/// Registry of per-type receiver queues. All operations take a single
/// mutex; [`TopicRegistry::receivers`] returns an owned snapshot precisely
/// so that delivery need not hold the lock across (potentially slow)
/// channel sends.
#[derive(Default)]
pub struct TopicRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl TopicRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `queue` as interested in `type_url`. Returns `true` if this
    /// was the first queue registered for that type, meaning the caller
    /// should arrange for an upstream subscribe. Idempotent: re-adding a
    /// queue already present for the type is a no-op.
    pub fn add(&self, type_url: &str, queue: ReceiverQueueHandle) -> bool {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let entry = entries
            .entry(type_url.to_string())
            .or_insert_with(Entry::new);

        if entry.queues.iter().any(|q| q.id() == queue.id()) {
            return false;
        }

        let first_for_type = entry.queues.is_empty();
        entry.queues.push(queue);
        if first_for_type {
            entry.upstream_subscribed = true;
        }
        first_for_type
    }

    /// Remove `queue` from every entry that contains it. Each entry is
    /// scanned, and the queue is removed from it at most once; entries that
    /// become empty as a result are reported (at most once each) in the
    /// returned list, and have their `upstream_subscribed` flag cleared.
    ///
    /// This resolves the double-count hazard in the original design (see
    /// §9 of the design): because each entry's queue list is filtered
    /// exactly once per call, a queue present in multiple type entries can
    /// never cause the same entry to be reported empty twice.
    pub fn remove(&self, queue_id: QueueId) -> Vec<String> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        let mut newly_empty = Vec::new();

        for (type_url, entry) in entries.iter_mut() {
            let before = entry.queues.len();
            entry.queues.retain(|q| q.id() != queue_id);
            if entry.queues.is_empty() && before > 0 {
                entry.upstream_subscribed = false;
                newly_empty.push(type_url.clone());
            }
        }

        newly_empty
    }

    /// Return a snapshot of the queues currently registered for `type_url`.
    #[must_use]
    pub fn receivers(&self, type_url: &str) -> Vec<ReceiverQueueHandle> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(type_url)
            .map(|entry| entry.queues.clone())
            .unwrap_or_default()
    }

    /// Return the set of type URLs that currently have at least one
    /// registered queue. Used to drive resubscription on upstream reconnect.
    #[must_use]
    pub fn live_types(&self) -> Vec<String> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .iter()
            .filter(|(_, entry)| !entry.queues.is_empty())
            .map(|(type_url, _)| type_url.clone())
            .collect()
    }

    /// Whether the given type currently has an active upstream subscription
    /// recorded. Exposed for tests exercising invariant 1 of §3.
    #[must_use]
    pub fn is_upstream_subscribed(&self, type_url: &str) -> bool {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(type_url)
            .is_some_and(|entry| entry.upstream_subscribed)
    }
}
