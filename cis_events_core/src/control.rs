// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A source of subscribe/unsubscribe control messages terminating in EOF.
//!
//! The design-level primitive behind both `Subscribe` (bidi-stream) and
//! `SubscribeOnce` (server-stream, with a client-supplied fixed list) is the
//! same: "a source of control messages terminating in EOF". This module
//! expresses that as a trait with two constructors, rather than a
//! hand-written shim that adapts one stream kind into the other.

use async_trait::async_trait;

use crate::error::BusError;

/// One control message read from a client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    /// Start receiving events of this type URL.
    Subscribe(String),
    /// Stop receiving events of this type URL. Takes effect immediately for
    /// local delivery filtering; the upstream unsubscribe (if warranted) is
    /// deferred to stream teardown, per §4.5 of the design.
    Unsubscribe(String),
}

/// A source of [`ControlMessage`]s, terminating in `None` (EOF) or a
/// transport error.
#[async_trait]
pub trait ControlSource: Send {
    /// Read the next control message. Returns `None` on clean EOF.
    async fn next(&mut self) -> Option<Result<ControlMessage, BusError>>;
}

/// A fixed list of type URLs, presented once as a run of `Subscribe`
/// messages followed by EOF. Backs the `SubscribeOnce` one-shot RPC, which
/// is otherwise handled by the exact same Stream Subscriber code path as a
/// live bidirectional stream.
pub struct FixedListSource {
    remaining: std::vec::IntoIter<String>,
}

impl FixedListSource {
    /// Construct a source that yields one `Subscribe` message per type URL
    /// in `type_urls`, in order, then reports EOF.
    #[must_use]
    pub fn new(type_urls: Vec<String>) -> Self {
        Self {
            remaining: type_urls.into_iter(),
        }
    }
}

#[async_trait]
impl ControlSource for FixedListSource {
    async fn next(&mut self) -> Option<Result<ControlMessage, BusError>> {
        self.remaining.next().map(|t| Ok(ControlMessage::Subscribe(t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fixed_list_yields_subscribes_then_eof() {
        let mut source = FixedListSource::new(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            source.next().await.unwrap().unwrap(),
            ControlMessage::Subscribe("A".to_string())
        );
        assert_eq!(
            source.next().await.unwrap().unwrap(),
            ControlMessage::Subscribe("B".to_string())
        );
        assert!(source.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_fixed_list_is_immediate_eof() {
        let mut source = FixedListSource::new(vec![]);
        assert!(source.next().await.is_none());
    }
}
