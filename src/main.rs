// =============================================================================
// Meridian FX Engine — Main Entry Point
// =============================================================================
//
// Startup order: environment -> config -> store -> cache -> broker ->
// fan-out server -> scheduler. Config problems exit 1; a store that cannot
// initialise exits 2. After that, job failures are recorded in the job log
// and never take the process down.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analytics;
mod broker;
mod cache;
mod config;
mod error;
mod fanout;
mod jobs;
mod scheduler;
mod store;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::broker::{BrokerClient, TokenBucket};
use crate::cache::Cache;
use crate::config::Config;
use crate::fanout::{router, run_relay, FanoutState};
use crate::jobs::{DailyCorrelationJob, HourlyJob};
use crate::scheduler::{daily_spec, hourly_spec, JobFn, ScheduledJob, SHUTDOWN_GRACE};
use crate::store::Store;

/// How often the cache sweeper clears expired entries.
const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    info!(
        broker_env = %config.broker_env,
        tracked = config.tracked_pairs.len(),
        hourly = config.job_hourly_enabled,
        daily = config.job_daily_enabled,
        retention_days = config.data_retention_days,
        "Meridian FX engine starting"
    );

    // ── 2. Store ─────────────────────────────────────────────────────────
    let store = match Store::connect(&config.store_dsn).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store initialisation failed");
            std::process::exit(2);
        }
    };
    if let Err(e) = store.migrate().await {
        error!(error = %e, "store migration failed");
        std::process::exit(2);
    }

    // ── 3. Cache & broker ────────────────────────────────────────────────
    let cache = Arc::new(Cache::new(config.cache_ttls));
    let limiter = Arc::new(TokenBucket::new(
        config.rate_limit_requests,
        config.rate_limit_window,
    ));
    let broker = Arc::new(BrokerClient::new(
        &config.broker_token,
        config.broker_env,
        limiter,
    ));

    // Periodic sweep so expired keys do not accumulate between reads.
    {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CACHE_SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let purged = cache.purge_expired();
                if purged > 0 {
                    info!(purged, "expired cache entries swept");
                }
            }
        });
    }

    // ── 4. Fan-out server & bus relay ────────────────────────────────────
    let fanout_state = Arc::new(FanoutState::new(&config, cache.clone()));

    {
        let relay_state = fanout_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_relay(relay_state).await {
                error!(error = %e, "bus relay terminated; fan-out is down");
            }
        });
    }

    let listener = match tokio::net::TcpListener::bind(&config.fanout_bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %config.fanout_bind_addr, error = %e, "could not bind fan-out server");
            std::process::exit(2);
        }
    };
    info!(addr = %config.fanout_bind_addr, "fan-out server listening");
    {
        let app = router(fanout_state.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "fan-out server failed");
            }
        });
    }

    // ── 5. Scheduler ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduled: Vec<Arc<ScheduledJob>> = Vec::new();

    if config.job_hourly_enabled {
        let job = Arc::new(HourlyJob::new(
            broker.clone(),
            store.clone(),
            cache.clone(),
            config.tracked_pairs.clone(),
            config.volatility_threshold,
            config.job_concurrency,
        ));
        let job_fn: JobFn = Arc::new(move |now| {
            let job = job.clone();
            Box::pin(async move { job.run(now).await })
        });

        let sched = Arc::new(ScheduledJob::new(hourly_spec()));
        scheduled.push(sched.clone());
        let loop_store = store.clone();
        let loop_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sched.run_loop(loop_store, job_fn, loop_shutdown).await });
    } else {
        warn!("hourly ingest disabled by configuration");
    }

    if config.job_daily_enabled {
        let job = Arc::new(DailyCorrelationJob::new(
            store.clone(),
            cache.clone(),
            config.correlation_universe(),
            config.correlation_threshold,
        ));
        let job_fn: JobFn = Arc::new(move |now| {
            let job = job.clone();
            Box::pin(async move { job.run(now).await })
        });

        let sched = Arc::new(ScheduledJob::new(daily_spec()));
        scheduled.push(sched.clone());
        let loop_store = store.clone();
        let loop_shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sched.run_loop(loop_store, job_fn, loop_shutdown).await });
    } else {
        warn!("daily correlation disabled by configuration");
    }

    info!("all subsystems running");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    shutdown_signal().await;
    warn!("shutdown signal received, stopping new ticks");
    let _ = shutdown_tx.send(true);

    for sched in &scheduled {
        if !sched.await_idle(SHUTDOWN_GRACE).await {
            warn!(job = sched.spec.name, "run still in flight at shutdown deadline");
        }
    }

    info!("Meridian FX engine shut down complete");
}

/// Resolve on SIGINT or (on unix) SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
