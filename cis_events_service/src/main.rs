// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Entry point: reads configuration, connects the upstream MQTT session,
//! and serves the event bus over two gRPC listeners (public and admin).
//! The admin listener runs the identical service behind [`AdminTagLayer`],
//! which tags each request's extensions for a downstream interceptor rather
//! than changing anything about how requests are handled here.

mod admin_tag;
mod config;
mod rpc;

use admin_tag::AdminTagLayer;
use cis_events_core::broker::Broker;
use cis_events_mqtt::{MqttConnectionSettings, MqttUpstreamSession};
use cis_events_proto::pb::event_bus_server::EventBusServer;
use cis_events_proto::ProtoEventCodec;
use config::Config;
use rpc::EventBusService;
use tonic::transport::Server;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp(None)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        log::error!("service exited with error: {err}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr = config.listen_addr()?;
    let admin_listen_addr = config.admin_listen_addr()?;

    let client_id = format!("cis-events-{}", std::process::id());
    let mqtt_settings = MqttConnectionSettings::from_url(&config.mqtt_url, client_id)?;
    let (upstream, mut incoming) = MqttUpstreamSession::new(&mqtt_settings);

    let broker = Broker::new(upstream, std::sync::Arc::new(ProtoEventCodec));

    let dispatch_broker = broker.clone();
    tokio::spawn(async move {
        while let Some(message) = incoming.recv().await {
            dispatch_broker
                .handle_upstream_message(&message.payload, message.retained)
                .await;
        }
        log::warn!("upstream message channel closed; no more events will be delivered");
    });

    let service = EventBusService::new(broker);
    let cors = cors_layer(&config.allowed_origins);

    let public_server = Server::builder()
        .layer(cors)
        .add_service(EventBusServer::new(service.clone()))
        .serve(listen_addr);
    let admin_server = Server::builder()
        .layer(AdminTagLayer)
        .add_service(EventBusServer::new(service))
        .serve(admin_listen_addr);

    log::info!("listening on {listen_addr} (public) and {admin_listen_addr} (admin)");
    tokio::try_join!(public_server, admin_server)?;
    Ok(())
}

fn cors_layer(allowed_origins: &str) -> CorsLayer {
    let origin = if allowed_origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<_> = allowed_origins
            .split(',')
            .filter_map(|o| o.trim().parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new().allow_origin(origin)
}
