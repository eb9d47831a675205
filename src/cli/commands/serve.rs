//! `hivemind serve`: run the streaming server until interrupted.

use anyhow::Result;
use std::time::Duration;

use crate::adapters::http::{StreamServer, StreamServerConfig};
use crate::domain::models::Config;
use crate::services::event_store::EventService;
use crate::services::reservations::ReservationService;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub async fn handle_serve(
    events: EventService,
    config: &Config,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    let server = StreamServer::new(
        events.clone(),
        StreamServerConfig {
            host: host.unwrap_or_else(|| config.http.host.clone()),
            port: port.unwrap_or(config.http.port),
            ..Default::default()
        },
    );

    let url = server.start().await?;
    println!("streaming at {url}/streams/{{project_key}}");

    // TTL sweeper: expired reservations become reservation_expired events.
    let sweeper = {
        let reservations = ReservationService::new(events);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                match reservations.sweep_all_expired().await {
                    Ok(0) => {}
                    Ok(swept) => tracing::info!(swept, "expired reservations swept"),
                    Err(error) => tracing::warn!(%error, "reservation sweep failed"),
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    sweeper.abort();
    server.stop().await;
    Ok(())
}
