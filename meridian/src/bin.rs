use meridian::{Config, RoutingNode};
use meridian_net::{AtomicClock, ClusterTime, CommandBody, CommandResponse, TokioExecutor};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Illustrative entrypoint: wires a `RoutingNode` over a loopback fake wire
/// and idles. Routing-table discovery, BSON wire parsing, and the rest of
/// the listener stack are external collaborators (spec §1) this binary does
/// not stand up; it exists to show the facade assembled end to end, not to
/// serve real shard traffic.
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::load(std::env::var("MERIDIAN_CONFIG").ok().as_deref()).unwrap_or_else(|err| {
        tracing::error!(target: "meridian", %err, "failed to load configuration, using defaults");
        Config::default()
    });

    let executor = Arc::new(TokioExecutor::new(|shard, command| async move {
        tracing::debug!(target: "meridian", %shard, command = %command.name, "no shard transport configured, echoing ok");
        Ok(CommandResponse::ok(CommandBody::new()))
    }));
    let clock = Arc::new(AtomicClock::new(ClusterTime::ZERO));

    let node = Arc::new(RoutingNode::new(executor, clock, config));
    tracing::info!(target: "meridian", "routing node started");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(target: "meridian", %err, "failed to listen for shutdown signal");
    }

    tracing::info!(
        target: "meridian",
        total_started = node.metrics().total_started(),
        total_committed = node.metrics().total_committed(),
        "routing node shutting down"
    );
}
