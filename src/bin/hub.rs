use std::path::PathBuf;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};
use vitalstack::{
    AlertHandle, EventBus, EventFilter, EventPayload, HealthCheckHandle, HealthEvent,
    MetricDefinition, MetricsCollector, NotifierRegistry, Pool, TcpManager, Topic,
    config::{Config, read_config_file},
    events::Subscription,
    metrics::labels,
    util,
};

const RESPONSE_TIME: &str = "pool.health.response_time";

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (defaults to $VITALSTACK_CONFIG or ./vitalstack.json)
    #[arg(short)]
    file: Option<PathBuf>,
}

fn init() {
    let level = LevelFilter::from_level(util::get_log_level());
    let filter = filter::Targets::new()
        .with_targets(vec![("vitalstack", level), ("vitalstack_hub", level)]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let path = args.file.unwrap_or_else(util::get_config_path);
    let config = read_config_file(&path)?;
    info!("loaded configuration from {}", path.display());

    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let events = EventBus::default();
    let errors = events.subscribe(EventFilter::topic(Topic::SystemError));
    let error_logger = tokio::spawn(log_system_errors(errors));

    let metrics = MetricsCollector::new(config.metrics.resolve()).with_events(events.clone());
    let cleanup = metrics.spawn_cleanup();
    metrics.register_metric(
        MetricDefinition::histogram(RESPONSE_TIME)
            .with_help("Time to acquire and release a pooled connection in seconds")
            .with_labels(["database"]),
    )?;

    let alerts = AlertHandle::spawn(
        metrics.clone(),
        events.clone(),
        NotifierRegistry::with_defaults(),
        config.alerts.resolve(),
    );
    for channel in config.alerts.channels.iter().cloned() {
        alerts.add_channel(channel).await?;
    }
    for rule in config.alerts.rules.iter().cloned() {
        alerts.add_rule(rule).await?;
    }
    alerts.start_sweep().await;

    let pool_config = &config.pool;
    let manager = TcpManager::new(&pool_config.endpoint, &pool_config.database);
    let pool = Pool::builder(manager, pool_config.resolve())
        .metrics(metrics.clone())
        .events(events.clone())
        .build()
        .await?;
    info!(
        "connection pool to {} ready with {} connections",
        pool_config.endpoint,
        pool.size().await
    );

    let probe_pool = pool.clone();
    let health = HealthCheckHandle::start("pool", config.health.resolve(), move || {
        let pool = probe_pool.clone();
        async move {
            let conn = pool.acquire().await?;
            pool.release(conn);
            anyhow::Ok(())
        }
    });
    let recorder = tokio::spawn(record_response_times(
        health.subscribe(),
        metrics.clone(),
        pool_config.database.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");

    health.shutdown().await;
    recorder.abort();
    alerts.shutdown().await;
    pool.shutdown().await;
    cleanup.stop();
    error_logger.abort();

    info!("shutdown complete");
    Ok(())
}

#[instrument(skip_all)]
async fn record_response_times(
    mut health_rx: broadcast::Receiver<HealthEvent>,
    metrics: MetricsCollector,
    database: String,
) {
    let labels = labels([("database", database)]);

    loop {
        match health_rx.recv().await {
            Ok(HealthEvent::Healthy { response_time, .. }) => {
                if let Err(e) = metrics.observe(RESPONSE_TIME, response_time.as_secs_f64(), &labels)
                {
                    error!("failed to record response time: {e}");
                }
            }
            Ok(HealthEvent::Unhealthy { name, error }) => {
                warn!("{name} is unhealthy: {error}");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("response time recorder lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("health check stopped");
                break;
            }
        }
    }
}

#[instrument(skip_all)]
async fn log_system_errors(mut errors: Subscription) {
    loop {
        match errors.recv().await {
            Ok(event) => {
                if let EventPayload::SystemError {
                    service,
                    error,
                    details,
                } = event.payload
                {
                    error!("{service}: {error} ({details})");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("error logger lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
