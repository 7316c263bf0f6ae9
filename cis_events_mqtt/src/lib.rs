// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT-backed Upstream Session for the event bus.

pub use crate::settings::{MqttConnectionSettings, MqttConnectionSettingsBuilder, MqttConnectionSettingsBuilderError};
pub use crate::session::{IncomingMessage, IncomingMessages, MqttUpstreamSession};

pub mod error;
mod session;
mod settings;

#[macro_use]
extern crate derive_builder;
