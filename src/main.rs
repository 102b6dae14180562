//! Rollcall scheduling daemons.
//!
//! Main entry point. Each subcommand runs one independent process: the
//! reminder scheduler, the status-transition scheduler, the dead-letter
//! retry daemon, a one-shot health check, or the schema migration.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{
    storage::schema::{self, GAME_STATUS_CHANNEL, NOTIFICATION_CHANNEL},
    Clock, RealClock,
};
use rollcall_scheduler::{
    broker::dead_letter_queue_name,
    health::{self, AmqpProbe, HealthService, HealthState, HealthStatus},
    AmqpBroker, DaemonStats, DeadLetterDrainer, DeadLetterRetryDaemon, DeadLetterSource,
    DeadLetterStats, DrainPolicy, EventBuilder, PgChangeNotifier, Publisher, ReminderPolicy,
    ReminderStore, ScheduleStore, SchedulerConfig, SchedulerDaemon, StatusStore,
    StatusTransitionPolicy,
};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "rollcall", version, about = "Game reminder and status scheduling daemons")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Publish game reminders as they come due
    Notifications,
    /// Apply and publish game status transitions as they come due
    StatusTransitions,
    /// Periodically republish dead-lettered messages
    DlqRetry,
    /// Check broker reachability and dead-letter depths, then exit
    Health,
    /// Create tables, indexes and notification triggers
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SchedulerConfig::load()?;

    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        amqp_url = %config.amqp_url_masked(),
        exchange = %config.exchange_name,
        command = ?cli.command,
        "Configuration loaded"
    );

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    match cli.command {
        Command::Notifications => {
            let store = ReminderStore::new(config.database_connect_options()?);
            run_scheduler(
                &config,
                store,
                ReminderPolicy,
                NOTIFICATION_CHANNEL,
                "rollcall-notifications",
                token,
            )
            .await
        },
        Command::StatusTransitions => {
            let store = StatusStore::new(config.database_connect_options()?);
            run_scheduler(
                &config,
                store,
                StatusTransitionPolicy,
                GAME_STATUS_CHANNEL,
                "rollcall-status-transitions",
                token,
            )
            .await
        },
        Command::DlqRetry => run_dlq_retry(&config, token).await,
        Command::Health => check_health(&config).await,
        Command::Migrate => migrate(&config).await,
    }
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("Invalid RUST_LOG filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Runs one scheduler daemon until shutdown.
async fn run_scheduler<S, E>(
    config: &SchedulerConfig,
    store: S,
    builder: E,
    channel: &str,
    service: &'static str,
    token: CancellationToken,
) -> Result<()>
where
    S: ScheduleStore,
    E: EventBuilder<S::Row>,
{
    let topology = config.topology()?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut daemon = SchedulerDaemon::new(
        store,
        builder,
        Box::new(PgChangeNotifier::new(config.database_connect_options()?)),
        Box::new(AmqpBroker::new(config.amqp_url.clone(), topology.clone())),
        config.daemon_config(channel),
        clock.clone(),
        token.clone(),
    );

    let drainer =
        DeadLetterDrainer::new(DrainPolicy::DropOnFailure, topology.queue_names(), clock.clone());
    let dead_letters = drainer.stats();
    if config.embedded_dlq_drain {
        daemon = daemon.with_embedded_drain(drainer, config.dlq_retry_interval());
    }

    spawn_health_server(config, clock, dead_letters, Some(daemon.stats()), service, &token)?;

    info!(service, channel, "scheduler daemon starting");
    daemon.run().await.context("scheduler daemon failed")?;
    info!(service, "shutdown complete");
    Ok(())
}

/// Runs the dead-letter retry daemon until shutdown.
async fn run_dlq_retry(config: &SchedulerConfig, token: CancellationToken) -> Result<()> {
    let topology = config.topology()?;
    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let daemon = DeadLetterRetryDaemon::new(
        Box::new(AmqpBroker::new(config.amqp_url.clone(), topology.clone())),
        topology.queue_names(),
        config.dlq_retry_interval(),
        clock.clone(),
        token.clone(),
    );

    spawn_health_server(config, clock, daemon.stats(), None, "rollcall-dlq-retry", &token)?;

    daemon.run().await.context("dead-letter retry daemon failed")?;
    info!("shutdown complete");
    Ok(())
}

/// Serves the health routes in the background when an address is
/// configured.
fn spawn_health_server(
    config: &SchedulerConfig,
    clock: Arc<dyn Clock>,
    dead_letters: Arc<RwLock<DeadLetterStats>>,
    daemon: Option<Arc<RwLock<DaemonStats>>>,
    service: &'static str,
    token: &CancellationToken,
) -> Result<()> {
    let Some(addr) = config.health_socket_addr()? else {
        return Ok(());
    };

    let state = HealthState {
        clock,
        probe: Arc::new(AmqpProbe::new(config.amqp_url.clone())),
        dead_letters,
        daemon,
        service,
    };

    let token = token.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(addr, state, token).await {
            error!(error = %e, "health endpoint failed");
        }
    });
    Ok(())
}

/// Probes the broker, reports dead-letter depths and fails when unhealthy.
async fn check_health(config: &SchedulerConfig) -> Result<()> {
    let topology = config.topology()?;
    let service = HealthService::new(
        Arc::new(RealClock::new()),
        Arc::new(AmqpProbe::new(config.amqp_url.clone())),
    );
    let response = service.health_check(&DeadLetterStats::default()).await;

    let mut depths = serde_json::Map::new();
    if response.status == HealthStatus::Healthy {
        let mut broker = AmqpBroker::new(config.amqp_url.clone(), topology.clone());
        broker.connect().await.context("Failed to connect to broker")?;
        for queue in topology.queue_names() {
            let depth = broker
                .declare_dead_letter_queue(&queue)
                .await
                .with_context(|| format!("Failed to read depth of {queue}"))?;
            depths.insert(dead_letter_queue_name(&queue), depth.into());
        }
        broker.close().await?;
    }

    let report = serde_json::json!({
        "health": &response,
        "dead_letter_depths": depths,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if response.status != HealthStatus::Healthy {
        anyhow::bail!("broker is unreachable");
    }
    Ok(())
}

/// Applies the schema.
async fn migrate(config: &SchedulerConfig) -> Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(config.database_connect_options()?)
        .await
        .context("Failed to connect to database")?;

    schema::run_migrations(&pool).await.context("Failed to run migrations")?;
    pool.close().await;

    info!("Database migrations completed");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
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
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
