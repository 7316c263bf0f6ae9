// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The orchestrator: wires the Upstream Session, Retained Cache, and Topic
//! Registry together and implements the fan-out/backpressure policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{BusError, BusErrorKind};
use crate::event::Event;
use crate::receiver_queue::{
    ReceiverQueueHandle, SendTimeoutError, TrySendError, CONSUMER_SEND_TIMEOUT,
};
use crate::registry::TopicRegistry;
use crate::retained_cache::RetainedCache;
use crate::upstream::UpstreamSession;

/// MQTT topic prefix under which all event types are published. See §6 of
/// the design.
pub const TOPIC_PREFIX: &str = "cis/protobuf/events/";

/// Build the MQTT topic for a (prefix-stripped) type URL.
#[must_use]
pub fn topic_for(type_url: &str) -> String {
    format!("{TOPIC_PREFIX}{type_url}")
}

/// Encodes and decodes the wire representation of an [`Event`] envelope.
/// Schema management is injected, per the bus's non-goals: this crate knows
/// nothing about protobuf.
pub trait EventCodec: Send + Sync {
    /// Serialize an event envelope to bytes for publication upstream.
    ///
    /// # Errors
    /// Returns [`BusErrorKind::InvalidArgument`] if the event cannot be
    /// represented on the wire (for example, an unregistered type URL).
    fn encode(&self, event: &Event) -> Result<Bytes, BusError>;

    /// Deserialize bytes received from upstream into an event envelope.
    ///
    /// # Errors
    /// Returns [`BusErrorKind::DecodeFailure`] if the bytes cannot be
    /// parsed as an event envelope.
    fn decode(&self, bytes: &Bytes) -> Result<Event, BusError>;
}

/// The Broker orchestrates the Upstream Session, Retained Cache, and Topic
/// Registry. Cheap to clone: all state is held behind `Arc`.
#[derive(Clone)]
pub struct Broker<U> {
    inner: Arc<Inner<U>>,
}

struct Inner<U> {
    upstream: U,
    registry: TopicRegistry,
    retained: RetainedCache,
    codec: Arc<dyn EventCodec>,
    // Serializes subscribe/unsubscribe upstream calls per type, so that a
    // subscribe racing the last unsubscribe for the same type resolves
    // deterministically instead of losing the subscription. See §4.4 and
    // §9 of the design.
    topic_workers: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<U> Broker<U>
where
    U: UpstreamSession + Send + Sync + 'static,
{
    /// Construct a new Broker around an upstream session and codec. Wires
    /// the upstream's reconnect handler to [`Broker::handle_upstream_connect`].
    #[must_use]
    pub fn new(upstream: U, codec: Arc<dyn EventCodec>) -> Self {
        let broker = Self {
            inner: Arc::new(Inner {
                upstream,
                registry: TopicRegistry::new(),
                retained: RetainedCache::new(),
                codec,
                topic_workers: Mutex::new(HashMap::new()),
            }),
        };

        let on_connect_broker = broker.clone();
        broker.inner.upstream.on_connect(Box::new(move || {
            let broker = on_connect_broker.clone();
            tokio::spawn(async move {
                broker.handle_upstream_connect().await;
            });
        }));

        broker
    }

    /// Direct access to the topic registry, for Stream Subscriber use and
    /// for tests asserting on invariants.
    #[must_use]
    pub fn registry(&self) -> &TopicRegistry {
        &self.inner.registry
    }

    /// Direct access to the retained cache, mostly for tests.
    #[must_use]
    pub fn retained_cache(&self) -> &RetainedCache {
        &self.inner.retained
    }

    fn topic_worker(&self, type_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .topic_workers
            .lock()
            .expect("topic worker map lock poisoned")
            .entry(type_url.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Register `queue` as a subscriber for `type_url`. If a retained event
    /// exists for the type, it is delivered immediately. If this is the
    /// first queue for the type, an upstream subscribe is scheduled in the
    /// background. Returns synchronously without waiting on the upstream
    /// call.
    pub fn subscribe(&self, type_url: &str, queue: ReceiverQueueHandle) {
        let first_for_type = self.inner.registry.add(type_url, queue.clone());

        if let Some(retained) = self.inner.retained.get(type_url) {
            self.offer(&queue, retained, type_url);
        }

        if first_for_type {
            let broker = self.clone();
            let type_url = type_url.to_string();
            tokio::spawn(async move {
                broker.ensure_upstream_subscribed(&type_url).await;
            });
        }
    }

    /// Remove `queue` from every type it was subscribed to. For each type
    /// that becomes empty, the retained cache entry is cleared and an
    /// upstream unsubscribe is scheduled in the background.
    pub fn unsubscribe_all(&self, queue_id: crate::receiver_queue::QueueId) {
        let emptied = self.inner.registry.remove(queue_id);
        for type_url in emptied {
            self.inner.retained.forget(&type_url);
            let broker = self.clone();
            tokio::spawn(async move {
                broker.ensure_upstream_unsubscribed(&type_url).await;
            });
        }
    }

    /// Publish an event. Rejects events with no inner payload. Delivery to
    /// local subscribers happens only when the broker's own MQTT session
    /// echoes the message back — this method never calls into the registry.
    ///
    /// # Errors
    /// Returns [`BusErrorKind::InvalidArgument`] if the event has no
    /// payload, or whatever the upstream session returned otherwise.
    pub async fn publish(&self, event: &Event) -> Result<(), BusError> {
        if !event.has_payload() {
            return Err(BusError::new(BusErrorKind::InvalidArgument));
        }

        let wire = self.inner.codec.encode(event)?;
        let topic = topic_for(event.type_url());
        self.inner
            .upstream
            .publish(&topic, event.retained(), wire)
            .await
    }

    /// Callback wired to the upstream session: invoked for every delivered
    /// message. Never surfaces an error; decode failures are logged and the
    /// message is dropped.
    pub async fn handle_upstream_message(&self, raw: &Bytes, was_retained: bool) {
        let event = match self.inner.codec.decode(raw) {
            Ok(event) => event.with_retained(was_retained),
            Err(err) => {
                log::warn!("dropping undecodable event envelope: {err}");
                return;
            }
        };

        if was_retained {
            self.inner.retained.put(event.clone());
        }

        let receivers = self.inner.registry.receivers(event.type_url());
        for handle in receivers {
            self.offer(&handle, event.clone(), event.type_url());
        }
    }

    /// Callback wired to the upstream session: invoked on every reconnect,
    /// including the initial connect. Resubscribes every type URL with at
    /// least one live receiver.
    pub async fn handle_upstream_connect(&self) {
        for type_url in self.inner.registry.live_types() {
            self.ensure_upstream_subscribed(&type_url).await;
        }
    }

    /// Offer `event` to `handle`: a non-blocking try-send first, and if the
    /// queue is full, a background task that blocks up to
    /// [`CONSUMER_SEND_TIMEOUT`] before dropping. Other receivers are never
    /// affected by one consumer's backlog.
    fn offer(&self, handle: &ReceiverQueueHandle, event: Event, type_url: &str) {
        match handle.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                let handle = handle.clone();
                let type_url = type_url.to_string();
                tokio::spawn(async move {
                    match handle.send_with_timeout(event, CONSUMER_SEND_TIMEOUT).await {
                        Ok(()) => {}
                        Err(SendTimeoutError::TimedOut) => {
                            log::warn!(
                                "consumer slow, dropping message for type {type_url} after {CONSUMER_SEND_TIMEOUT:?}"
                            );
                        }
                        Err(SendTimeoutError::Closed) => {}
                    }
                });
            }
        }
    }

    async fn ensure_upstream_subscribed(&self, type_url: &str) {
        let worker = self.topic_worker(type_url);
        let _guard = worker.lock().await;

        if self.inner.registry.live_types().iter().any(|t| t == type_url) {
            let topic = topic_for(type_url);
            if let Err(err) = self.inner.upstream.subscribe(&topic).await {
                log::error!("failed to subscribe to topic {topic}: {err}");
            }
        }
    }

    async fn ensure_upstream_unsubscribed(&self, type_url: &str) {
        let worker = self.topic_worker(type_url);
        let _guard = worker.lock().await;

        if !self.inner.registry.live_types().iter().any(|t| t == type_url) {
            let topic = topic_for(type_url);
            if let Err(err) = self.inner.upstream.unsubscribe(&[topic.clone()]).await {
                log::error!("failed to unsubscribe from topic {topic}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::receiver_queue::ReceiverQueue;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    /// Encodes an event as `"<type_url>:<payload>"` so tests can round-trip
    /// multiple distinct type URLs through `handle_upstream_message`
    /// without needing real protobuf machinery.
    struct FakeCodec;
    impl EventCodec for FakeCodec {
        fn encode(&self, event: &Event) -> Result<Bytes, BusError> {
            let mut out = Vec::with_capacity(event.type_url().len() + 1 + event.payload().len());
            out.extend_from_slice(event.type_url().as_bytes());
            out.push(b':');
            out.extend_from_slice(event.payload());
            Ok(Bytes::from(out))
        }
        fn decode(&self, bytes: &Bytes) -> Result<Event, BusError> {
            let sep = bytes
                .iter()
                .position(|b| *b == b':')
                .ok_or_else(|| BusError::new(BusErrorKind::DecodeFailure))?;
            let type_url = std::str::from_utf8(&bytes[..sep])
                .map_err(|_| BusError::new(BusErrorKind::DecodeFailure))?
                .to_string();
            Ok(Event::new(type_url, bytes.slice(sep + 1..), false))
        }
    }

    /// Build a wire-encoded message the way `FakeCodec` expects, for tests
    /// that drive `handle_upstream_message` directly with raw bytes.
    fn wire(type_url: &str, payload: &[u8]) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(type_url.as_bytes());
        out.push(b':');
        out.extend_from_slice(payload);
        Bytes::from(out)
    }

    #[derive(Default)]
    struct MockUpstream {
        subscribes: AsyncMutex<Vec<String>>,
        unsubscribes: AsyncMutex<Vec<String>>,
        connect_handlers: std::sync::Mutex<Vec<crate::upstream::ConnectHandler>>,
        publish_count: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamSession for MockUpstream {
        async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
            self.subscribes.lock().await.push(topic.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, topics: &[String]) -> Result<(), BusError> {
            self.unsubscribes.lock().await.extend(topics.iter().cloned());
            Ok(())
        }

        async fn publish(&self, _topic: &str, _retained: bool, _payload: Bytes) -> Result<(), BusError> {
            self.publish_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_connect(&self, handler: crate::upstream::ConnectHandler) {
            self.connect_handlers.lock().unwrap().push(handler);
        }
    }

    fn test_broker() -> Broker<MockUpstream> {
        Broker::new(MockUpstream::default(), Arc::new(FakeCodec))
    }

    #[tokio::test]
    async fn subscribe_schedules_exactly_one_upstream_subscribe_for_first_queue() {
        let broker = test_broker();
        let (_q1, h1) = ReceiverQueue::new();
        let (_q2, h2) = ReceiverQueue::new();

        broker.subscribe("A", h1);
        broker.subscribe("A", h2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(broker.inner.upstream.subscribes.lock().await.as_slice(), ["cis/protobuf/events/A"]);
    }

    #[tokio::test]
    async fn retained_event_is_delivered_immediately_on_subscribe() {
        let broker = test_broker();
        broker
            .inner
            .retained
            .put(Event::new("A", Bytes::from_static(b"retained"), true));

        let (mut queue, handle) = ReceiverQueue::new();
        broker.subscribe("A", handle);

        let delivered = queue.recv().await.unwrap();
        assert_eq!(delivered.payload(), &Bytes::from_static(b"retained"));
    }

    #[tokio::test]
    async fn late_join_does_not_see_earlier_publish() {
        let broker = test_broker();
        broker.handle_upstream_message(&wire("t", b"E1"), false).await;

        let (mut queue, handle) = ReceiverQueue::new();
        broker.subscribe("t", handle);

        broker.handle_upstream_message(&wire("t", b"E2"), false).await;

        let delivered = queue.recv().await.unwrap();
        assert_eq!(delivered.payload(), &Bytes::from_static(b"E2"));
    }

    #[tokio::test]
    async fn fan_out_delivers_to_every_subscriber_in_order() {
        let broker = test_broker();
        let (mut q1, h1) = ReceiverQueue::new();
        let (mut q2, h2) = ReceiverQueue::new();
        let (mut q3, h3) = ReceiverQueue::new();
        broker.subscribe("X", h1);
        broker.subscribe("X", h2);
        broker.subscribe("X", h3);

        for i in 0u8..5 {
            broker.handle_upstream_message(&wire("X", &[i]), false).await;
        }

        for q in [&mut q1, &mut q2, &mut q3] {
            for i in 0u8..5 {
                let event = q.recv().await.unwrap();
                assert_eq!(event.payload(), &Bytes::from(vec![i]));
            }
        }
    }

    #[tokio::test]
    async fn type_isolation_across_subscribers() {
        let broker = test_broker();
        let (mut qa, ha) = ReceiverQueue::new();
        broker.subscribe("A", ha);

        broker.handle_upstream_message(&wire("B", b"for-b"), false).await;

        let result = tokio::time::timeout(Duration::from_millis(50), qa.recv()).await;
        assert!(result.is_err(), "subscriber to A must not receive an event for a different type");
    }

    #[tokio::test]
    async fn unsubscribe_all_clears_retained_cache_and_schedules_unsubscribe() {
        let broker = test_broker();
        let (_q, handle) = ReceiverQueue::new();
        broker.subscribe("A", handle.clone());
        broker
            .inner
            .retained
            .put(Event::new("A", Bytes::from_static(b"r"), true));

        broker.unsubscribe_all(handle.id());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(broker.retained_cache().get("A").is_none());
        assert_eq!(broker.inner.upstream.unsubscribes.lock().await.as_slice(), ["cis/protobuf/events/A"]);
    }

    #[tokio::test]
    async fn publish_rejects_empty_payload() {
        let broker = test_broker();
        let event = Event::new("A", Bytes::new(), false);
        let err = broker.publish(&event).await.unwrap_err();
        assert_eq!(err.kind(), &BusErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn publish_forwards_to_upstream() {
        let broker = test_broker();
        let event = Event::new("A", Bytes::from_static(b"hi"), false);
        broker.publish(&event).await.unwrap();
        assert_eq!(broker.inner.upstream.publish_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_consumer_does_not_block_delivery_to_others() {
        let broker = test_broker();
        let (_slow_queue, slow_handle) = ReceiverQueue::new(); // never drained
        let (mut fast_queue, fast_handle) = ReceiverQueue::new();
        broker.subscribe("X", slow_handle);
        broker.subscribe("X", fast_handle);

        // Fill the slow consumer's queue to capacity, then publish ten more
        // so the slow consumer's sends fall onto the background
        // timeout path, while the fast consumer must still see everything
        // promptly.
        for i in 0..crate::receiver_queue::QUEUE_CAPACITY as u8 {
            broker.handle_upstream_message(&wire("X", &[i]), false).await;
        }
        // Drain the fast queue so it doesn't also appear full, isolating
        // the slow consumer as the only full one for the next burst.
        for _ in 0..crate::receiver_queue::QUEUE_CAPACITY {
            fast_queue.recv().await.unwrap();
        }

        for i in 0..10u8 {
            broker.handle_upstream_message(&wire("X", &[100 + i]), false).await;
        }

        let result = tokio::time::timeout(Duration::from_millis(200), async {
            for i in 0..10u8 {
                let event = fast_queue.recv().await.unwrap();
                assert_eq!(event.payload(), &Bytes::from(vec![100 + i]));
            }
        })
        .await;
        assert!(result.is_ok(), "fast consumer must not be held up by a slow sibling");
    }

    #[tokio::test]
    async fn reconnect_resubscribes_every_live_type_exactly_once() {
        let broker = test_broker();
        let (_qa, ha) = ReceiverQueue::new();
        let (_qb, hb) = ReceiverQueue::new();
        broker.subscribe("A", ha);
        broker.subscribe("B", hb);
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.inner.upstream.subscribes.lock().await.clear();

        broker.handle_upstream_connect().await;

        let mut subs = broker.inner.upstream.subscribes.lock().await.clone();
        subs.sort();
        assert_eq!(subs, vec!["cis/protobuf/events/A".to_string(), "cis/protobuf/events/B".to_string()]);
    }
}
