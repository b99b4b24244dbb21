mod main_runtime;

use clap::Parser;
use provd::api::{create_router, AppState};
use provd::cli::{Cli, Commands};
use provd::config::AppConfig;
use provd::error::{ProvdError, Result};
use std::sync::Arc;
use tracing::{error, info};

use main_runtime::{build_provider, init_logging, init_logging_simple, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    match cli.command {
        Commands::Config => {
            init_logging_simple();
            println!("{}", serde_json::to_string_pretty(&config)?);
            if let Err(errors) = config.validate() {
                for e in errors {
                    eprintln!("invalid: {e}");
                }
            }
        }
        Commands::Run => {
            init_logging(&config.logging);
            run(config).await?;
        }
    }

    Ok(())
}

async fn run(config: AppConfig) -> Result<()> {
    if let Err(errors) = config.validate() {
        return Err(ProvdError::Validation(errors.join("; ")));
    }

    let provider = Arc::new(build_provider(&config).await?);
    provider.start().await?;

    let app = create_router(AppState::new(Arc::clone(&provider), config.api.token.clone()));
    let listener = tokio::net::TcpListener::bind(config.api.listen).await?;
    info!(listen = %config.api.listen, "API server listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("API server error: {}", e);
    }

    info!("Shutting down...");
    provider.stop().await;
    Ok(())
}
