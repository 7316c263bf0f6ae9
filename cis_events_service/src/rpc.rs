// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The gRPC front end: adapts tonic's streaming types to the
//! [`ControlSource`]/[`EventSink`] abstractions the core crate drives, and
//! maps [`BusError`] kinds onto RPC status codes.

use async_trait::async_trait;
use cis_events_core::broker::Broker;
use cis_events_core::control::{ControlMessage, ControlSource, FixedListSource};
use cis_events_core::error::{BusError, BusErrorKind};
use cis_events_core::event::Event;
use cis_events_core::stream_subscriber::{EventSink, StreamSubscriber};
use cis_events_mqtt::MqttUpstreamSession;
use cis_events_proto::pb::event_bus_server::EventBus;
use cis_events_proto::pb::subscribe_request::Action;
use cis_events_proto::pb::{Event as PbEvent, PublishResponse, SubscribeOnceRequest, SubscribeRequest};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

/// Bounded capacity of the channel feeding each streaming RPC response. Kept
/// small; true backpressure lives in the per-subscriber receiver queue
/// inside [`cis_events_core`].
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

fn status_for(err: &BusError) -> Status {
    let message = err.to_string();
    match err.kind() {
        BusErrorKind::InvalidArgument => Status::invalid_argument(message),
        BusErrorKind::TransientUnavailable => Status::unavailable(message),
        BusErrorKind::UpstreamProtocol(_) => Status::unavailable(message),
        BusErrorKind::DecodeFailure => Status::internal(message),
        BusErrorKind::ConsumerSlow => Status::resource_exhausted(message),
        BusErrorKind::StreamClosed => Status::cancelled(message),
    }
}

/// Adapts a client's `Subscribe` request stream into a [`ControlSource`],
/// skipping malformed (empty-oneof) messages rather than ending the stream
/// over them.
struct GrpcControlSource {
    inner: Streaming<SubscribeRequest>,
}

#[async_trait]
impl ControlSource for GrpcControlSource {
    async fn next(&mut self) -> Option<Result<ControlMessage, BusError>> {
        loop {
            return match self.inner.message().await {
                Ok(Some(request)) => match request.action {
                    Some(Action::Subscribe(type_url)) => Some(Ok(ControlMessage::Subscribe(type_url))),
                    Some(Action::Unsubscribe(type_url)) => {
                        Some(Ok(ControlMessage::Unsubscribe(type_url)))
                    }
                    None => {
                        log::warn!("received SubscribeRequest with no action set, ignoring");
                        continue;
                    }
                },
                Ok(None) => None,
                Err(status) => Some(Err(BusError::new(BusErrorKind::UpstreamProtocol(status.to_string())))),
            };
        }
    }
}

/// Adapts the sending half of a streaming RPC response into an
/// [`EventSink`].
struct GrpcEventSink {
    sender: mpsc::Sender<Result<PbEvent, Status>>,
}

#[async_trait]
impl EventSink for GrpcEventSink {
    async fn send(&mut self, event: Event) -> Result<(), BusError> {
        self.sender
            .send(Ok(event.into()))
            .await
            .map_err(|_| BusError::new(BusErrorKind::StreamClosed))
    }
}

/// The tonic service implementation, thinly wrapping a [`Broker`]. Cheap to
/// clone, since [`Broker`] itself is; both the public and admin listeners
/// hold their own clone bound to a tonic service instance.
#[derive(Clone)]
pub struct EventBusService {
    broker: Broker<MqttUpstreamSession>,
}

impl EventBusService {
    /// Build a new service around `broker`.
    #[must_use]
    pub fn new(broker: Broker<MqttUpstreamSession>) -> Self {
        Self { broker }
    }

    fn spawn_subscriber(
        &self,
        control: impl ControlSource + 'static,
    ) -> ReceiverStream<Result<PbEvent, Status>> {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let sink = GrpcEventSink { sender: tx };
        let subscriber = StreamSubscriber::new(self.broker.clone());
        let cancellation = CancellationToken::new();

        tokio::spawn(async move {
            subscriber.handle(control, sink, cancellation).await;
        });

        ReceiverStream::new(rx)
    }
}

#[tonic::async_trait]
impl EventBus for EventBusService {
    async fn publish(&self, request: Request<PbEvent>) -> Result<Response<PublishResponse>, Status> {
        let event: Event = request.into_inner().into();
        self.broker.publish(&event).await.map_err(|e| status_for(&e))?;
        Ok(Response::new(PublishResponse {}))
    }

    async fn publish_stream(
        &self,
        request: Request<Streaming<PbEvent>>,
    ) -> Result<Response<PublishResponse>, Status> {
        let mut incoming = request.into_inner();
        while let Some(pb_event) = incoming.message().await? {
            let event: Event = pb_event.into();
            self.broker.publish(&event).await.map_err(|e| status_for(&e))?;
        }
        Ok(Response::new(PublishResponse {}))
    }

    type SubscribeStream = ReceiverStream<Result<PbEvent, Status>>;

    async fn subscribe(
        &self,
        request: Request<Streaming<SubscribeRequest>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let control = GrpcControlSource {
            inner: request.into_inner(),
        };
        Ok(Response::new(self.spawn_subscriber(control)))
    }

    type SubscribeOnceStream = ReceiverStream<Result<PbEvent, Status>>;

    async fn subscribe_once(
        &self,
        request: Request<SubscribeOnceRequest>,
    ) -> Result<Response<Self::SubscribeOnceStream>, Status> {
        let control = FixedListSource::new(request.into_inner().type_urls);
        Ok(Response::new(self.spawn_subscriber(control)))
    }
}
