// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error kinds shared across the bus, propagated by name rather than by type
//! identity so that RPC and logging layers can match on them without
//! depending on this crate's internal error hierarchy.

use std::fmt;

use thiserror::Error;

/// An error raised by the bus core.
#[derive(Debug, Error, Clone)]
#[error("{kind}")]
pub struct BusError {
    kind: BusErrorKind,
}

impl BusError {
    /// Create a new [`BusError`] of the given kind.
    #[must_use]
    pub fn new(kind: BusErrorKind) -> Self {
        Self { kind }
    }

    /// Return the [`BusErrorKind`] for this error.
    #[must_use]
    pub fn kind(&self) -> &BusErrorKind {
        &self.kind
    }
}

/// Categories of [`BusError`].
///
/// See §7 of the design: these are propagated by name, not by type identity,
/// so that callers (RPC handlers, loggers) can match on the kind without
/// reaching into this crate's error hierarchy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BusErrorKind {
    /// Malformed publish (missing inner payload) or malformed subscribe
    /// (empty type URL).
    InvalidArgument,
    /// The upstream session is not currently connected. Retryable.
    TransientUnavailable,
    /// The upstream MQTT broker returned an error to subscribe, publish, or
    /// unsubscribe.
    UpstreamProtocol(String),
    /// A received message's envelope could not be parsed. Never surfaced to
    /// callers; logged and dropped at the point of failure.
    DecodeFailure,
    /// A receiver queue was full for the entire drop window. Logged with
    /// peer identity; message dropped for that consumer only.
    ConsumerSlow,
    /// The peer closed the stream. Not an error from the server's
    /// perspective.
    StreamClosed,
}

impl fmt::Display for BusErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusErrorKind::InvalidArgument => write!(f, "invalid argument"),
            BusErrorKind::TransientUnavailable => write!(f, "upstream session unavailable"),
            BusErrorKind::UpstreamProtocol(msg) => write!(f, "upstream protocol error: {msg}"),
            BusErrorKind::DecodeFailure => write!(f, "failed to decode event envelope"),
            BusErrorKind::ConsumerSlow => write!(f, "consumer did not drain in time"),
            BusErrorKind::StreamClosed => write!(f, "stream closed by peer"),
        }
    }
}
