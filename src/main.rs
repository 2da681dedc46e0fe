use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use rtmp_fanout::config::AppConfig;
use rtmp_fanout::http::{self, HttpState};
use rtmp_fanout::registry::StreamRegistry;
use rtmp_fanout::relay::RelayEngine;
use rtmp_fanout::server::RtmpServer;
use rtmp_fanout::stats::StatsAggregator;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rtmp_fanout=info")),
        )
        .init();

    let registry = Arc::new(StreamRegistry::with_config(config.registry_config()));
    let events = registry.events();

    let targets = config.relay_targets();
    let engine = Arc::new(RelayEngine::new(
        targets.clone(),
        Arc::clone(&registry),
        config.relay_config(),
    ));

    let server = Arc::new(RtmpServer::new(config.server_config(), Arc::clone(&registry)));
    let stats = StatsAggregator::new(
        Arc::clone(&registry),
        Arc::clone(engine.status_board()),
        &targets,
    )
    .with_server_stats(Arc::clone(server.stats()));

    let rtmp_listener = TcpListener::bind(config.rtmp_addr()).await?;
    let http_listener = TcpListener::bind(config.http_addr()).await?;

    tracing::info!(
        ingest = %format!("rtmp://<host>:{}/{}/<stream-key>", config.rtmp_port, config.rtmp_app),
        dashboard = %config.http_addr(),
        publish_key = config.publish_key.is_some(),
        "rtmp-fanout starting"
    );
    if targets.is_empty() {
        tracing::warn!(
            "No platform stream keys configured; set YOUTUBE_STREAM_KEY, FACEBOOK_STREAM_KEY, \
             TWITCH_STREAM_KEY or INSTAGRAM_STREAM_KEY to relay"
        );
    }
    for target in &targets {
        tracing::info!(platform = %target.platform, url = %target.base_url, "Relay target");
    }

    let shutdown = CancellationToken::new();

    let relay_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run(events).await }
    });

    let http_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let state = HttpState::new(stats, config.rtmp_port, config.rtmp_app.clone());
        async move { http::serve(http_listener, state, shutdown.cancelled_owned()).await }
    });

    let rtmp_task = tokio::spawn({
        let shutdown = shutdown.clone();
        let server = Arc::clone(&server);
        async move { server.run_until(rtmp_listener, shutdown.cancelled_owned()).await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();

    if let Ok(Err(e)) = rtmp_task.await {
        tracing::error!(error = %e, "RTMP server error");
    }
    if let Ok(Err(e)) = http_task.await {
        tracing::error!(error = %e, "HTTP server error");
    }
    engine.shutdown().await;
    relay_task.abort();

    Ok(())
}
