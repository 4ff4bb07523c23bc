pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod observability;
pub mod server;
pub mod upstream;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use quoteflow_core::{
    Broadcaster, CoreEvent, EventBus, RedisStore, RefreshScheduler, TieredCache,
};
use tokio::sync::{broadcast, watch};

pub use config::AppConfig;
pub use server::{AppState, QuoteflowServer, build_app};
pub use upstream::UpstreamClient;

/// Create the tiered cache with graceful degradation.
///
/// If Redis is disabled or unreachable at startup, the cache runs
/// local-only. The server starts either way.
pub async fn create_cache(config: &AppConfig, events: EventBus) -> TieredCache {
    let cache_config = config.cache.to_cache_config(&config.redis);
    let redis = &config.redis;

    if !redis.enabled {
        tracing::info!("Redis disabled, using local cache only");
        return TieredCache::new_local(cache_config).with_events(events);
    }

    tracing::info!(url = %redis.url, "Connecting to Redis");
    match RedisStore::connect(
        &redis.url,
        redis.pool_size,
        Duration::from_millis(redis.timeout_ms),
    )
    .await
    {
        Ok(store) => {
            tracing::info!("Connected to Redis");
            TieredCache::with_remote(cache_config, Arc::new(store)).with_events(events)
        }
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Failed to connect to Redis. Falling back to local cache."
            );
            TieredCache::new_local(cache_config).with_events(events)
        }
    }
}

/// Wire cache, scheduler and broadcaster from configuration.
///
/// Background loops are not started; see [`start_background`].
pub async fn build_state(config: &AppConfig, events: EventBus) -> anyhow::Result<AppState> {
    let cache = Arc::new(create_cache(config, events.clone()).await);
    let upstream =
        UpstreamClient::new(Duration::from_millis(config.server.upstream_timeout_ms))?;

    let scheduler = Arc::new(
        RefreshScheduler::new(cache.clone(), config.scheduler.to_scheduler_config())
            .with_events(events.clone()),
    );
    for job in &config.jobs {
        scheduler.register_job(upstream.job_definition(job))?;
        tracing::info!(job = %job.name, url = %job.url, interval_secs = job.interval_secs, "Refresh job registered");
    }

    let mut broadcaster = Broadcaster::new(config.broadcaster.to_broadcaster_config())
        .with_cache(cache.clone())
        .with_events(events);
    if let Some(url) = &config.broadcaster.topic_source_url {
        broadcaster = broadcaster.with_fetcher(upstream.topic_fetcher(url));
    }

    Ok(AppState {
        cache,
        scheduler,
        broadcaster: Arc::new(broadcaster),
    })
}

/// Start the cache sweeper, the refresh loop and the broadcaster loops.
///
/// Sending `true` on a returned handle stops that loop.
pub fn start_background(state: &AppState) -> Vec<watch::Sender<bool>> {
    vec![
        state.cache.start_sweeper(),
        state.scheduler.start(),
        state.broadcaster.start(),
    ]
}

/// Build a ready-to-run server: metrics exporter, event logging, components
/// and background loops.
pub async fn build_server(config: &AppConfig) -> anyhow::Result<QuoteflowServer> {
    metrics::init_metrics();

    let events = EventBus::new();
    spawn_event_logger(events.subscribe());

    let state = build_state(config, events).await?;
    let background = start_background(&state);
    Ok(QuoteflowServer::new(config.addr(), state, background))
}

/// Log core events until the bus is dropped.
pub fn spawn_event_logger(
    mut events: broadcast::Receiver<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &CoreEvent) {
    match event {
        CoreEvent::JobSucceeded {
            job,
            duration,
            bytes,
        } => tracing::debug!(job = %job, duration_ms = duration.as_millis() as u64, bytes, "event: job succeeded"),
        CoreEvent::JobFailed {
            job,
            error,
            retry_count,
        } => tracing::warn!(job = %job, error = %error, retry_count, "event: job failed"),
        CoreEvent::RetryScheduled {
            job,
            attempt,
            delay,
        } => tracing::info!(job = %job, attempt, delay_ms = delay.as_millis() as u64, "event: retry scheduled"),
        CoreEvent::RemoteDegraded { operation, error } => {
            tracing::warn!(operation, error = %error, "event: remote cache degraded")
        }
        CoreEvent::ConnectionAccepted {
            connection_id,
            origin,
        } => tracing::debug!(connection_id = %connection_id, origin = ?origin, "event: connection accepted"),
        CoreEvent::ConnectionRejected { max_connections } => {
            tracing::warn!(max_connections, "event: connection rejected")
        }
        CoreEvent::ConnectionClosed {
            connection_id,
            reason,
        } => tracing::debug!(connection_id = %connection_id, reason = %reason, "event: connection closed"),
        CoreEvent::RateLimited { connection_id } => {
            tracing::debug!(connection_id = %connection_id, "event: connection rate limited")
        }
    }
}
