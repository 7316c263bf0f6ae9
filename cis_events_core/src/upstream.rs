// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The [`UpstreamSession`] trait the Broker drives, and the callback shapes
//! it invokes. Concrete implementations (an MQTT client, or a mock for
//! tests) live outside this crate.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::BusError;

/// A handler invoked whenever the upstream session transitions from
/// disconnected to connected, including the initial connect. Handlers are
/// kept in a plain ordered list by implementations (see §4.1 of the
/// design); all handlers run even if an earlier one fails.
pub type ConnectHandler = Box<dyn Fn() + Send + Sync>;

/// Blocking (from the caller's point of view; `async` in this
/// implementation), error-returning access to an external MQTT broker.
///
/// The message-delivery callback is not a parameter of [`subscribe`], as it
/// would be in a per-topic-callback MQTT client API. It is wired once, at
/// construction of the concrete session, because every subscription in this
/// system shares the same dispatch path (the Broker's
/// `handle_upstream_message`).
///
/// [`subscribe`]: UpstreamSession::subscribe
#[async_trait]
pub trait UpstreamSession: Send + Sync {
    /// Subscribe to `topic`. Fails with
    /// [`TransientUnavailable`](crate::error::BusErrorKind::TransientUnavailable)
    /// if no session is currently connected; otherwise blocks until the
    /// broker acknowledges the subscribe.
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    /// Unsubscribe from the given topics. Idempotent: topics with no active
    /// subscription are silently ignored.
    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BusError>;

    /// Publish `payload` to `topic` at QoS 0, with the MQTT retained bit
    /// set to `retained`. Fails with `TransientUnavailable` if not
    /// connected; otherwise blocks until the broker acknowledges.
    async fn publish(&self, topic: &str, retained: bool, payload: Bytes) -> Result<(), BusError>;

    /// Register a handler to be invoked on every connect, including the
    /// initial one. Registration order is preserved and every handler runs
    /// regardless of whether an earlier one panics-free-errors (handlers do
    /// not return a `Result`; failures are the handler's own concern to log).
    fn on_connect(&self, handler: ConnectHandler);
}
