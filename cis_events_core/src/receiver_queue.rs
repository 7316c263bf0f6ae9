// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounded, single-producer/single-consumer queues owned by one Stream
//! Subscriber.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::event::Event;

/// Capacity of a receiver queue. Design constant; see §3 of the design.
pub const QUEUE_CAPACITY: usize = 100;

/// How long delivery will block on a full queue before dropping the message
/// for that consumer. See §5 of the design.
pub const CONSUMER_SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a receiver queue for equality/removal purposes. Opaque and
/// cheap to copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle state of a receiver queue. Transitions only forward:
/// `Open -> Draining -> Closed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum QueueState {
    /// Accepting new deliveries.
    Open = 0,
    /// No longer accepting new deliveries, but existing ones may still be
    /// consumed.
    Draining = 1,
    /// No further deliveries will ever be consumed.
    Closed = 2,
}

impl From<u8> for QueueState {
    fn from(value: u8) -> Self {
        match value {
            0 => QueueState::Open,
            1 => QueueState::Draining,
            _ => QueueState::Closed,
        }
    }
}

/// A cloneable handle to the producer side of a [`ReceiverQueue`]. This is
/// what the Topic Registry and Retained Cache push stores alongside.
#[derive(Clone)]
pub struct ReceiverQueueHandle {
    id: QueueId,
    sender: mpsc::Sender<Event>,
    state: Arc<AtomicU8>,
}

impl ReceiverQueueHandle {
    /// The identity of the queue this handle refers to.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        QueueState::from(self.state.load(Ordering::Acquire))
    }

    /// Attempt to deliver without blocking. Returns `Err` if the queue is
    /// currently full (the caller decides whether to retry with a timeout)
    /// or if the consumer has gone away.
    pub fn try_send(&self, event: Event) -> Result<(), TrySendError> {
        match self.sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(event)) => Err(TrySendError::Full(event)),
            Err(mpsc::error::TrySendError::Closed(event)) => Err(TrySendError::Closed(event)),
        }
    }

    /// Deliver, waiting up to `timeout` for room in the queue.
    pub async fn send_with_timeout(
        &self,
        event: Event,
        timeout: std::time::Duration,
    ) -> Result<(), SendTimeoutError> {
        match tokio::time::timeout(timeout, self.sender.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendTimeoutError::Closed),
            Err(_) => Err(SendTimeoutError::TimedOut),
        }
    }
}

impl PartialEq for ReceiverQueueHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ReceiverQueueHandle {}

/// Error from [`ReceiverQueueHandle::try_send`].
#[derive(Debug)]
pub enum TrySendError {
    /// The queue is at capacity.
    Full(Event),
    /// The consumer has been dropped.
    Closed(Event),
}

/// Error from [`ReceiverQueueHandle::send_with_timeout`].
#[derive(Debug, Eq, PartialEq)]
pub enum SendTimeoutError {
    /// The consumer did not drain the queue within the timeout. Maps to
    /// [`crate::error::BusErrorKind::ConsumerSlow`] at the call site.
    TimedOut,
    /// The consumer has been dropped.
    Closed,
}

/// The consumer side of a receiver queue, owned by exactly one Stream
/// Subscriber's send task.
pub struct ReceiverQueue {
    id: QueueId,
    receiver: mpsc::Receiver<Event>,
    state: Arc<AtomicU8>,
}

impl ReceiverQueue {
    /// Create a new queue pair: the consumer-owned [`ReceiverQueue`] and a
    /// cloneable [`ReceiverQueueHandle`] for the producer side.
    #[must_use]
    pub fn new() -> (Self, ReceiverQueueHandle) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let id = QueueId::next();
        let state = Arc::new(AtomicU8::new(QueueState::Open as u8));
        (
            Self {
                id,
                receiver,
                state: state.clone(),
            },
            ReceiverQueueHandle { id, sender, state },
        )
    }

    /// The identity of this queue.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        QueueState::from(self.state.load(Ordering::Acquire))
    }

    /// Receive the next event, or `None` once the queue is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Stop accepting new deliveries. Already-queued events remain
    /// consumable via [`ReceiverQueue::recv`] until drained.
    pub fn begin_draining(&mut self) {
        self.transition(QueueState::Draining);
        self.receiver.close();
    }

    /// Mark the queue fully closed. Called once the send loop has drained
    /// and is about to return, per invariant 4: no receiver queue outlives
    /// its owning Stream Subscriber.
    pub fn close(&mut self) {
        self.begin_draining();
        self.transition(QueueState::Closed);
    }

    fn transition(&self, to: QueueState) {
        // States only move forward; never let a close() followed by a
        // stray begin_draining() resurrect an already-closed queue.
        let current = self.state();
        if (current as u8) < (to as u8) {
            self.state.store(to as u8, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (mut queue, handle) = ReceiverQueue::new();
        handle
            .try_send(Event::new("t", Bytes::from_static(b"1"), false))
            .unwrap();
        handle
            .try_send(Event::new("t", Bytes::from_static(b"2"), false))
            .unwrap();

        assert_eq!(queue.recv().await.unwrap().payload(), &Bytes::from_static(b"1"));
        assert_eq!(queue.recv().await.unwrap().payload(), &Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn close_is_forward_only() {
        let (mut queue, _handle) = ReceiverQueue::new();
        queue.close();
        assert_eq!(queue.state(), QueueState::Closed);
        queue.begin_draining();
        assert_eq!(queue.state(), QueueState::Closed);
    }

    #[tokio::test]
    async fn try_send_reports_full() {
        let (mut queue, handle) = ReceiverQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            handle
                .try_send(Event::new("t", Bytes::from_static(b"x"), false))
                .unwrap();
        }
        match handle.try_send(Event::new("t", Bytes::from_static(b"x"), false)) {
            Err(TrySendError::Full(_)) => {}
            other => panic!("expected Full, got {other:?}"),
        }
        // Drain one and confirm it opens a slot again.
        queue.recv().await.unwrap();
    }

    #[tokio::test]
    async fn send_with_timeout_times_out_on_full_queue() {
        let (mut queue, handle) = ReceiverQueue::new();
        for _ in 0..QUEUE_CAPACITY {
            handle
                .try_send(Event::new("t", Bytes::from_static(b"x"), false))
                .unwrap();
        }
        let result = handle
            .send_with_timeout(
                Event::new("t", Bytes::from_static(b"x"), false),
                std::time::Duration::from_millis(20),
            )
            .await;
        assert_eq!(result, Err(SendTimeoutError::TimedOut));
        // queue still usable afterwards
        queue.recv().await.unwrap();
    }
}
