// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-RPC adapter between one client stream and the Broker.
//!
//! ```text
//!   Created ──start()──▶ Running ──ctx done / send error──▶ Closing ──▶ Closed
//! ```
//!
//! The control (receive) side and the event (send) side run independently.
//! The control side reaching EOF — a `SubscribeOnce` client's fixed list
//! running out, or a bidi client half-closing its request stream — does not
//! by itself end the call: events keep flowing until the caller cancels or
//! a send to the peer fails, matching a live feed that was simply told no
//! more subscribe/unsubscribe requests are coming.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::control::{ControlMessage, ControlSource};
use crate::error::BusError;
use crate::event::Event;
use crate::receiver_queue::{QueueId, ReceiverQueue, ReceiverQueueHandle};
use crate::upstream::UpstreamSession;

/// The outgoing half of a Stream Subscriber: writes events back to the
/// client. Implemented by a thin wrapper around the RPC framework's stream
/// sender in the service layer; kept as a trait here so this crate never
/// depends on a specific RPC transport.
#[async_trait]
pub trait EventSink: Send {
    /// Write one event to the peer.
    ///
    /// # Errors
    /// Returns an error other than
    /// [`StreamClosed`](crate::error::BusErrorKind::StreamClosed) if the
    /// write failed for a reason other than the peer having gone away.
    async fn send(&mut self, event: Event) -> Result<(), BusError>;
}

/// The adapter between one bidirectional (or one-shot) RPC stream and the
/// [`Broker`]. One instance is created per RPC call.
pub struct StreamSubscriber<U> {
    broker: Broker<U>,
}

impl<U> StreamSubscriber<U>
where
    U: UpstreamSession + Send + Sync + 'static,
{
    /// Create a new adapter bound to `broker`.
    #[must_use]
    pub fn new(broker: Broker<U>) -> Self {
        Self { broker }
    }

    /// Drive `control` (subscribe/unsubscribe requests) and `sink`
    /// (outgoing events) until `cancellation` is triggered or a send to
    /// `sink` fails. The receive side reaching EOF on its own does not end
    /// the call — see the module docs. Returns only after both the receive
    /// and send tasks have joined, per the Stream Subscriber's contract
    /// that its queue never outlives the call.
    pub async fn handle(
        &self,
        control: impl ControlSource + 'static,
        sink: impl EventSink + 'static,
        cancellation: CancellationToken,
    ) {
        let (queue, queue_handle) = ReceiverQueue::new();
        let local_types: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let recv_task = tokio::spawn(Self::run_receive(
            self.broker.clone(),
            control,
            queue_handle.clone(),
            local_types.clone(),
            cancellation.clone(),
        ));
        let send_task = tokio::spawn(Self::run_send(queue, sink, local_types, cancellation.clone()));

        // The call only ends when delivery stops: cancellation, or the send
        // task giving up on a send error (it drains and closes its queue
        // either way before returning). A bare control-stream EOF must not
        // race this down early, so it is not part of this join.
        let _ = send_task.await;
        cancellation.cancel();
        let _ = recv_task.await;

        self.broker.unsubscribe_all(queue_handle.id());
    }

    async fn run_receive(
        broker: Broker<U>,
        mut control: impl ControlSource,
        queue_handle: ReceiverQueueHandle,
        local_types: Arc<Mutex<HashSet<String>>>,
        cancellation: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                () = cancellation.cancelled() => break,
                next = control.next() => next,
            };

            match next {
                None => break,
                Some(Ok(ControlMessage::Subscribe(type_url))) => {
                    local_types.lock().expect("lock poisoned").insert(type_url.clone());
                    broker.subscribe(&type_url, queue_handle.clone());
                }
                Some(Ok(ControlMessage::Unsubscribe(type_url))) => {
                    // Filtering locally is sufficient; the upstream side is
                    // reconciled when the whole stream closes, via
                    // `unsubscribe_all`. See §4.5 of the design.
                    local_types.lock().expect("lock poisoned").remove(&type_url);
                }
                Some(Err(err)) => {
                    log::warn!("control stream error: {err}");
                    break;
                }
            }
        }
        log::debug!("receive task finished");
    }

    async fn run_send(
        mut queue: ReceiverQueue,
        mut sink: impl EventSink,
        local_types: Arc<Mutex<HashSet<String>>>,
        cancellation: CancellationToken,
    ) {
        let mut send_failed = false;

        loop {
            let event = tokio::select! {
                () = cancellation.cancelled() => break,
                event = queue.recv() => event,
            };

            let Some(event) = event else { break };

            if !local_types
                .lock()
                .expect("lock poisoned")
                .contains(event.type_url())
            {
                continue;
            }

            if let Err(err) = sink.send(event).await {
                if err.kind() != &crate::error::BusErrorKind::StreamClosed {
                    log::warn!("failed to send event to subscriber: {err}");
                }
                send_failed = true;
                break;
            }
        }

        // Cancellation (the normal path once a client disconnects) still
        // owes every already-buffered event a delivery attempt before the
        // queue is torn down; a send failure means the peer is gone and
        // further attempts would only fail the same way.
        if !send_failed {
            queue.begin_draining();
            while let Some(event) = queue.recv().await {
                if !local_types
                    .lock()
                    .expect("lock poisoned")
                    .contains(event.type_url())
                {
                    continue;
                }
                if sink.send(event).await.is_err() {
                    break;
                }
            }
        }

        queue.close();
        log::debug!("send task finished");
    }
}

/// Identity helper for callers that need to drop a queue out of band (for
/// example, a test harness simulating an abrupt disconnect).
#[must_use]
pub fn queue_id_of(handle: &ReceiverQueueHandle) -> QueueId {
    handle.id()
}
