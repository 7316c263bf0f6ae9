// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mapping from type URL to the most recent retained event for that type.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::event::Event;

/// Holds, for each type URL, at most one [`Event`] with `retained == true`.
///
/// Writers only appear on the Broker's message-dispatch path, so the read/
/// write lock is expected to see far more readers (every subscribe call)
/// than writers (every retained publish echoed back from upstream).
#[derive(Default)]
pub struct RetainedCache {
    entries: RwLock<HashMap<String, Event>>,
}

impl RetainedCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the retained event for a type URL, if any.
    #[must_use]
    pub fn get(&self, type_url: &str) -> Option<Event> {
        self.entries
            .read()
            .expect("retained cache lock poisoned")
            .get(type_url)
            .cloned()
    }

    /// Record a new retained event, overwriting whatever was previously
    /// cached for its type URL. `event.retained()` must be `true`; this is
    /// an invariant enforced by the only caller (the dispatch path), not
    /// re-validated here.
    pub fn put(&self, event: Event) {
        self.entries
            .write()
            .expect("retained cache lock poisoned")
            .insert(event.type_url().to_string(), event);
    }

    /// Remove the retained entry for a type URL. Called when the Topic
    /// Registry transitions that type's entry to empty, so the cache never
    /// outlives interest in a type.
    pub fn forget(&self, type_url: &str) {
        self.entries
            .write()
            .expect("retained cache lock poisoned")
            .remove(type_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn put_then_get_roundtrips() {
        let cache = RetainedCache::new();
        let event = Event::new("tkd.tasks.v1.TaskEvent", Bytes::from_static(b"\x0a"), true);
        cache.put(event.clone());
        assert_eq!(cache.get("tkd.tasks.v1.TaskEvent"), Some(event));
    }

    #[test]
    fn overwrites_previous_retained_value() {
        let cache = RetainedCache::new();
        cache.put(Event::new("t", Bytes::from_static(b"1"), true));
        cache.put(Event::new("t", Bytes::from_static(b"2"), true));
        assert_eq!(cache.get("t").unwrap().payload(), &Bytes::from_static(b"2"));
    }

    #[test]
    fn forget_clears_entry() {
        let cache = RetainedCache::new();
        cache.put(Event::new("t", Bytes::from_static(b"1"), true));
        cache.forget("t");
        assert_eq!(cache.get("t"), None);
    }

    #[test]
    fn missing_type_url_is_none() {
        let cache = RetainedCache::new();
        assert_eq!(cache.get("unknown"), None);
    }
}
