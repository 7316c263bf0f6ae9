// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The event envelope that flows through the bus.

use bytes::Bytes;

/// The conventional prefix protobuf `Any` type URLs carry. Stripped before
/// the type URL is used as a routing key anywhere in the bus.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// An envelope carrying one `any`-typed payload plus a retained bit.
///
/// Events are immutable once constructed. Fan-out delivers clones so that a
/// slow consumer holding on to one cannot observe mutations caused by
/// another receiver's handling of the same delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    type_url: String,
    payload: Bytes,
    retained: bool,
}

impl Event {
    /// Construct a new event. `type_url` is normalized by stripping the
    /// `type.googleapis.com/` prefix if present, so that callers may pass
    /// either the bare fully-qualified name or the full `Any` type URL.
    #[must_use]
    pub fn new(type_url: impl Into<String>, payload: impl Into<Bytes>, retained: bool) -> Self {
        Self {
            type_url: strip_type_url_prefix(&type_url.into()).to_string(),
            payload: payload.into(),
            retained,
        }
    }

    /// The routing key: the protobuf fully-qualified name, without the
    /// `type.googleapis.com/` prefix.
    #[must_use]
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// The serialized inner payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether this event was (or should be) published with the MQTT
    /// retained bit set.
    #[must_use]
    pub fn retained(&self) -> bool {
        self.retained
    }

    /// Whether the inner payload is present. A publish of an event with an
    /// empty payload is rejected with `InvalidArgument`.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    /// Return a copy of this event with the retained bit forced to `true`.
    /// Used when stamping an event pulled off the retained cache's source:
    /// a message delivered with the MQTT retained bit set.
    #[must_use]
    pub fn with_retained(mut self, retained: bool) -> Self {
        self.retained = retained;
        self
    }
}

/// Strip the `type.googleapis.com/` prefix from a type URL, if present.
#[must_use]
pub fn strip_type_url_prefix(type_url: &str) -> &str {
    type_url
        .strip_prefix(TYPE_URL_PREFIX)
        .unwrap_or(type_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_googleapis_prefix() {
        let e = Event::new("type.googleapis.com/tkd.events.v1.Ping", Bytes::from_static(b"\x01"), false);
        assert_eq!(e.type_url(), "tkd.events.v1.Ping");
    }

    #[test]
    fn leaves_bare_type_url_unchanged() {
        let e = Event::new("tkd.events.v1.Ping", Bytes::from_static(b"\x01"), false);
        assert_eq!(e.type_url(), "tkd.events.v1.Ping");
    }

    #[test]
    fn empty_payload_is_detected() {
        let e = Event::new("tkd.events.v1.Ping", Bytes::new(), false);
        assert!(!e.has_payload());
    }
}
