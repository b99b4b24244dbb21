use provd::adapters::{
    DryRunPublisher, FsCommitter, HttpTransport, LogAnnouncer, MemoryCapacityManager,
    MemoryDealStore, MemoryFundsManager, PostgresDealStore,
};
use provd::config::{AppConfig, LoggingConfig};
use provd::deal_log::TracingDealLogger;
use provd::error::Result;
use provd::filter::{AcceptAllFilter, CommandFilter};
use provd::provider::{DealFilter, DealStore, Provider, ProviderDeps};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},provd=debug,sqlx=warn", config.level))
    });

    // `tracing_appender::rolling::daily` panics if it can't create the
    // initial log file, so writability is checked first.
    let file_layer = config.dir.as_ref().and_then(|log_dir| {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                log_dir.display(),
                e
            );
            return None;
        }
        let test_path = log_dir.join(".provd_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);
                let file_appender = tracing_appender::rolling::daily(log_dir, "provd.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
                // Lives for the rest of the process
                Box::leak(Box::new(guard));
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir.display(),
                    e
                );
                None
            }
        }
    });

    let (json_layer, text_layer) = if config.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .init();
}

pub fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Wire the configured adapters into a provider
pub async fn build_provider(config: &AppConfig) -> Result<Provider> {
    let store: Arc<dyn DealStore> = match &config.database.url {
        Some(url) => {
            info!("using postgres deal store");
            Arc::new(PostgresDealStore::new(url, config.database.max_connections).await?)
        }
        None => {
            info!("no database configured, deals are kept in memory");
            Arc::new(MemoryDealStore::new())
        }
    };

    let filter: Arc<dyn DealFilter> = match &config.filter.command {
        Some(command) => Arc::new(CommandFilter::new(command, config.filter.timeout)?),
        None => Arc::new(AcceptAllFilter),
    };

    let deps = ProviderDeps {
        store,
        capacity: Arc::new(MemoryCapacityManager::new(config.resources.storage_capacity)),
        funds: Arc::new(MemoryFundsManager::new(config.resources.funds_balance)),
        filter,
        committer: Arc::new(FsCommitter::new(config.committer.clone()).await?),
        transport: Arc::new(HttpTransport::new(Duration::from_secs(30))?),
        publisher: Arc::new(DryRunPublisher::default()),
        announcer: Arc::new(LogAnnouncer),
        logger: Arc::new(TracingDealLogger),
    };

    Ok(Provider::new(config.to_provider_config(), deps))
}
