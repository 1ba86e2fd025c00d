use clap::Parser;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;

use pg_archiver::application::cancellation::CancellationSignal;
use pg_archiver::application::orchestrator::{Archiver, LogProgressObserver};
use pg_archiver::application::runtime::RuntimeContext;
use pg_archiver::config::{AppConfig, CliArgs};
use pg_archiver::domain::entities::RunSummary;
use pg_archiver::infrastructure::postgres::catalog_adapter::PostgresCatalogAdapter;
use pg_archiver::infrastructure::postgres::row_source_adapter::PostgresRowSource;
use pg_archiver::infrastructure::storage::s3_adapter::S3ObjectStore;

fn main() {
    // 1. Logging (RUST_LOG, default info)
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 2. Configuration: file first, then CLI overrides
    let args = CliArgs::parse();
    let mut config = match &args.config {
        Some(path) => match AppConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to load config: {}", e);
                process::exit(2);
            }
        },
        None => AppConfig::default(),
    };
    config.merge_cli(&args);
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        process::exit(2);
    }

    // 3. Async runtime for object storage and the Ctrl-C listener
    let io_runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("archive-io")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to start I/O runtime: {}", e);
            process::exit(1);
        }
    };

    let cancel = CancellationSignal::new();
    {
        let cancel = cancel.clone();
        io_runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing in-flight chunks and stopping");
                cancel.cancel();
            }
        });
    }

    // 4. Adapters
    let runtime = match RuntimeContext::init(&config) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to initialize runtime: {}", e);
            process::exit(1);
        }
    };
    let store = match S3ObjectStore::new(&config.destination, io_runtime.handle().clone()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };
    let schema = config.database.schema.clone();
    let catalog = Arc::new(PostgresCatalogAdapter::new(Arc::clone(&runtime.pool), schema.clone()));
    let source = Arc::new(PostgresRowSource::new(Arc::clone(&runtime.pool), schema));

    // 5. Run
    let archiver = match Archiver::new(catalog, source, store, config) {
        Ok(a) => a
            .with_progress(Arc::new(LogProgressObserver))
            .with_cancellation(cancel.clone())
            .with_thread_pool(Arc::clone(&runtime.workers)),
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    match archiver.run() {
        Ok(results) => {
            let summary = RunSummary::from_results(&results);
            if let Ok(json) = serde_json::to_string(&summary) {
                info!("Summary: {}", json);
            }
            if cancel.is_cancelled() || summary.cancelled > 0 {
                process::exit(130);
            }
            if summary.failed > 0 {
                process::exit(1);
            }
        }
        Err(e) => {
            error!("Archive run failed: {}", e);
            process::exit(1);
        }
    }
}
