// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Generated gRPC types for the event bus, plus the [`ProtoEventCodec`] that
//! lets [`cis_events_core::Broker`] encode and decode them without knowing
//! anything about protobuf itself.

use bytes::Bytes;
use cis_events_core::broker::EventCodec;
use cis_events_core::error::{BusError, BusErrorKind};
use cis_events_core::event::Event;
use prost::Message;

impl From<Event> for pb::Event {
    fn from(event: Event) -> Self {
        pb::Event {
            type_url: event.type_url().to_string(),
            payload: event.payload().clone(),
            retained: event.retained(),
        }
    }
}

impl From<pb::Event> for Event {
    fn from(event: pb::Event) -> Self {
        Event::new(event.type_url, event.payload, event.retained)
    }
}

/// Wraps each [`Event`] as a prost-encoded [`pb::Event`] message for
/// transport over MQTT. The codec is the only place in this workspace that
/// binds the core crate's type-agnostic `Event` to protobuf specifically.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtoEventCodec;

impl EventCodec for ProtoEventCodec {
    fn encode(&self, event: &Event) -> Result<Bytes, BusError> {
        let message: pb::Event = event.clone().into();
        Ok(message.encode_to_vec().into())
    }

    fn decode(&self, bytes: &Bytes) -> Result<Event, BusError> {
        pb::Event::decode(bytes.clone())
            .map(Into::into)
            .map_err(|_| BusError::new(BusErrorKind::DecodeFailure))
    }
}

/// Re-exports the generated message and service types under a short alias,
/// matching the package name used in `events.proto`.
pub mod pb {
    tonic_prost::include_proto!("cis.events.v1");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrips_an_event() {
        let codec = ProtoEventCodec;
        let original = Event::new("tkd.events.v1.Ping", Bytes::from_static(b"hi"), true);
        let wire = codec.encode(&original).unwrap();
        let decoded = codec.decode(&wire).unwrap();
        assert_eq!(decoded.type_url(), original.type_url());
        assert_eq!(decoded.payload(), original.payload());
        assert!(decoded.retained());
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = ProtoEventCodec;
        let err = codec.decode(&Bytes::from_static(&[0xFF, 0xFF, 0xFF])).unwrap_err();
        assert_eq!(err.kind(), &BusErrorKind::DecodeFailure);
    }
}
