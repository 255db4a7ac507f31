//! Consume client events, attribute them to experiments and persist them to the warehouse.
use std::path::Path;
use std::sync::Arc;

use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use event_persister::config::{Config, WarehouseBackend};
use event_persister::error::{PersisterError, SourceError};
use event_persister::evaluations::{
    ClickHouseEvaluationSource, EvaluationSource, JsonLinesEvaluationSource,
    PostgresEvaluationSource,
};
use event_persister::experiments::{ExperimentResolver, HttpExperimentSource};
use event_persister::kafka::KafkaMessageSource;
use event_persister::linker::Linker;
use event_persister::persister::Persister;
use event_persister::pump::RateLimitedPump;
use event_persister::retry::scanner::RetryScanner;
use event_persister::retry::{lock_ttl, RetryStore};
use event_persister::windower::BatchWindower;
use event_persister::writer::clickhouse::ClickHouseSink;
use event_persister::writer::jsonl::JsonLinesSink;
use event_persister::writer::postgres::PostgresSink;
use event_persister::writer::{Sink, Writer};
use persister_common::health::HealthRegistry;
use persister_common::lock::RedisLock;
use persister_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use persister_common::redis::{Client, RedisClient};
use persister_common::retry::RetryPolicy;
use persister_common::time::{SystemTime, TimeSource};

/// Slack on top of the longest expected iteration before a component is reported stalled.
const LIVENESS_SLACK_SECS: i64 = 30;

async fn shutdown(token: CancellationToken) {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
        _ = token.cancelled() => return,
    };

    info!("Shutting down gracefully...");
    token.cancel();
}

struct Warehouse {
    evaluation_sink: Arc<dyn Sink>,
    goal_sink: Arc<dyn Sink>,
    evaluations: Arc<dyn EvaluationSource>,
}

async fn warehouse(config: &Config, http: reqwest::Client) -> Result<Warehouse, PersisterError> {
    match config.warehouse_backend {
        WarehouseBackend::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_pg_connections)
                .connect(&config.database_url)
                .await?;

            Ok(Warehouse {
                evaluation_sink: Arc::new(PostgresSink::new(
                    pool.clone(),
                    config.evaluation_table.clone(),
                )),
                goal_sink: Arc::new(PostgresSink::new(pool.clone(), config.goal_table.clone())),
                evaluations: Arc::new(PostgresEvaluationSource::new(
                    pool,
                    &config.evaluation_table,
                )),
            })
        }
        WarehouseBackend::ClickHouse => {
            let url = Url::parse(&config.clickhouse_url)?;

            Ok(Warehouse {
                evaluation_sink: Arc::new(ClickHouseSink::new(
                    http.clone(),
                    url.clone(),
                    config.evaluation_table.clone(),
                )),
                goal_sink: Arc::new(ClickHouseSink::new(
                    http.clone(),
                    url.clone(),
                    config.goal_table.clone(),
                )),
                evaluations: Arc::new(ClickHouseEvaluationSource::new(
                    http,
                    url,
                    &config.evaluation_table,
                )),
            })
        }
        WarehouseBackend::JsonLines => {
            let dir = Path::new(&config.row_store_dir);
            tokio::fs::create_dir_all(dir).await?;

            Ok(Warehouse {
                evaluation_sink: Arc::new(JsonLinesSink::new(
                    dir,
                    config.evaluation_table.clone(),
                )),
                goal_sink: Arc::new(JsonLinesSink::new(dir, config.goal_table.clone())),
                evaluations: Arc::new(JsonLinesEvaluationSource::new(
                    dir,
                    &config.evaluation_table,
                )),
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), PersisterError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder()?;
    let router = setup_metrics_router(recorder_handle, liveness.clone());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let clock: Arc<dyn TimeSource> = Arc::new(SystemTime {});
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout.0)
        .build()?;
    let warehouse = warehouse(&config, http.clone()).await?;

    let experiments = HttpExperimentSource::new(http, Url::parse(&config.experiment_service_url)?);
    let resolver = Arc::new(ExperimentResolver::new(
        Arc::new(experiments),
        config.experiment_cache_ttl.0,
        clock.clone(),
    ));

    let redis: Arc<dyn Client> = Arc::new(RedisClient::new(config.redis_url.clone()).await?);
    let retry_interval = config.retry.retry_interval.0;
    let retries = Arc::new(
        RetryStore::new(
            redis.clone(),
            RetryPolicy::new(2, retry_interval),
            config.retry.max_retry_period.0,
            clock,
        )
        .with_scan_interval(config.retry.retry_scan_interval.0),
    );
    let lock = Arc::new(RedisLock::new(redis, lock_ttl(retry_interval)));

    let persister = Arc::new(Persister::new(
        resolver,
        Linker::new(warehouse.evaluations),
        Writer::new(
            config.evaluation_table.as_str(),
            warehouse.evaluation_sink,
            config.batch_size,
        ),
        Writer::new(
            config.goal_table.as_str(),
            warehouse.goal_sink,
            config.batch_size,
        ),
        retries.clone(),
    ));

    let source = Arc::new(KafkaMessageSource::new(&config.kafka).map_err(SourceError::from)?);

    let shutdown_token = CancellationToken::new();
    tokio::spawn(shutdown(shutdown_token.clone()));

    let (sender, receiver) = mpsc::channel(config.channel_capacity.max(1));
    let receiver = Arc::new(Mutex::new(receiver));
    let windower_deadline = ::time::Duration::seconds(
        (config.flush_interval.0 + config.flush_timeout.0).as_secs() as i64 + LIVENESS_SLACK_SECS,
    );
    let mut windowers = Vec::with_capacity(config.worker_num);
    for i in 0..config.worker_num.max(1) {
        let name = format!("windower-{i}");
        let windower = BatchWindower::new(
            &name,
            receiver.clone(),
            persister.clone(),
            config.flush_size,
            config.flush_interval.0,
            config.flush_timeout.0,
            liveness.register(name.clone(), windower_deadline),
        );
        windowers.push(tokio::spawn(windower.run(shutdown_token.clone())));
    }

    let scanner_deadline = ::time::Duration::seconds(
        config.retry.retry_scan_interval.0.as_secs() as i64 + 2 * LIVENESS_SLACK_SECS,
    );
    let scanner = RetryScanner::new(
        retries,
        lock,
        persister.clone(),
        config.retry.retry_scan_interval.0,
        config.retry.retry_scan_page_size,
        liveness.register("retry-scanner".to_owned(), scanner_deadline),
    );
    let scanner = tokio::spawn(scanner.run(shutdown_token.clone()));

    let pump = RateLimitedPump::new(source, config.max_mps, sender);
    let pumped = pump.run(shutdown_token.clone()).await;

    // The pump only returns on shutdown or when the source fails, stop the rest either way.
    shutdown_token.cancel();
    for windower in windowers {
        windower.await?;
    }
    scanner.await?;
    persister.close().await;

    info!("event persister stopped");
    pumped?;

    Ok(())
}
