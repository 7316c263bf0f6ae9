// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! In-process publish/subscribe relay for the event bus service.
//!
//! This crate implements the subscription fabric that sits between an
//! upstream MQTT session, an in-memory registry of per-type subscribers, and
//! a set of long-lived bidirectional RPC streams. It does not speak MQTT or
//! any particular RPC framing itself — both are injected through the
//! [`upstream::UpstreamSession`] trait and the [`control`] stream
//! abstraction, respectively.

pub mod broker;
pub mod control;
pub mod error;
pub mod event;
pub mod receiver_queue;
pub mod registry;
pub mod retained_cache;
pub mod stream_subscriber;
pub mod upstream;

pub use broker::Broker;
pub use error::{BusError, BusErrorKind};
pub use event::Event;
