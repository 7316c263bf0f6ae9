// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The concrete [`UpstreamSession`] backed by `rumqttc`.
//!
//! The event loop is polled on a dedicated background task, started at
//! construction. Incoming publishes are forwarded over an unbounded channel
//! rather than dispatched directly, so that a slow downstream consumer can
//! never stall the poll loop and, with it, the broker's keep-alive traffic.
//! The paired [`IncomingMessages`] receiver is handed to the caller, who is
//! expected to drive it into [`cis_events_core::Broker::handle_upstream_message`].

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cis_events_core::error::{BusError, BusErrorKind};
use cis_events_core::upstream::{ConnectHandler, UpstreamSession};
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;

use crate::settings::MqttConnectionSettings;

/// One message delivered by the broker: the raw payload and whether it was
/// flagged retained.
pub struct IncomingMessage {
    /// The raw MQTT payload, undecoded.
    pub payload: Bytes,
    /// Whether the MQTT retained bit was set.
    pub retained: bool,
}

/// The receiving half of the channel fed by the background poll task.
pub struct IncomingMessages {
    receiver: mpsc::UnboundedReceiver<IncomingMessage>,
}

impl IncomingMessages {
    /// Receive the next message, or `None` once the session has shut down.
    pub async fn recv(&mut self) -> Option<IncomingMessage> {
        self.receiver.recv().await
    }
}

/// Upstream session backed by a `rumqttc` client and its own background poll
/// task. Cheap to clone: the client and handler list are both reference
/// counted internally, matching `rumqttc::AsyncClient`'s own design.
#[derive(Clone)]
pub struct MqttUpstreamSession {
    client: AsyncClient,
    connect_handlers: Arc<Mutex<Vec<ConnectHandler>>>,
}

impl MqttUpstreamSession {
    /// Connect to the broker described by `settings` and start the
    /// background poll task. Returns the session and the channel of incoming
    /// messages it will produce.
    #[must_use]
    pub fn new(settings: &MqttConnectionSettings) -> (Self, IncomingMessages) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.hostname, settings.tcp_port);
        options.set_keep_alive(settings.keep_alive);
        if let (Some(username), Some(password)) = (&settings.username, &settings.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, event_loop) = AsyncClient::new(options, 128);
        let session = Self {
            client,
            connect_handlers: Arc::new(Mutex::new(Vec::new())),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::poll_loop(session.clone(), event_loop, tx));

        (session, IncomingMessages { receiver: rx })
    }

    async fn poll_loop(
        session: Self,
        mut event_loop: EventLoop,
        outgoing: mpsc::UnboundedSender<IncomingMessage>,
    ) {
        loop {
            match event_loop.poll().await {
                Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                    let handlers = session
                        .connect_handlers
                        .lock()
                        .expect("connect handler lock poisoned");
                    for handler in handlers.iter() {
                        handler();
                    }
                }
                Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                    let message = IncomingMessage {
                        payload: publish.payload,
                        retained: publish.retain,
                    };
                    if outgoing.send(message).is_err() {
                        log::debug!("incoming message channel closed, stopping poll loop");
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!("mqtt event loop error, retrying: {err}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[async_trait]
impl UpstreamSession for MqttUpstreamSession {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|e| BusError::new(BusErrorKind::UpstreamProtocol(e.to_string())))
    }

    async fn unsubscribe(&self, topics: &[String]) -> Result<(), BusError> {
        for topic in topics {
            self.client
                .unsubscribe(topic)
                .await
                .map_err(|e| BusError::new(BusErrorKind::UpstreamProtocol(e.to_string())))?;
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, retained: bool, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, retained, payload)
            .await
            .map_err(|e| BusError::new(BusErrorKind::UpstreamProtocol(e.to_string())))
    }

    fn on_connect(&self, handler: ConnectHandler) {
        self.connect_handlers
            .lock()
            .expect("connect handler lock poisoned")
            .push(handler);
    }
}
