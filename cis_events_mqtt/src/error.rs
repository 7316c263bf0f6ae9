// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types local to settings parsing. Errors raised while talking to the
//! broker are reported directly as `cis_events_core::BusError`.

use thiserror::Error;

/// Error parsing or building [`crate::settings::MqttConnectionSettings`].
#[derive(Debug, Error, Clone)]
#[error("{0}")]
pub struct MqttSettingsError(String);

impl MqttSettingsError {
    /// Create a new [`MqttSettingsError`] with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
