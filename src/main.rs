use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txn_pipeline::cli::{self, Cli, Commands};
use txn_pipeline::config::{
    self, AlertConfig, GatewayConfig, LogFormat, ScoringConfig, StorageConfig,
};
use txn_pipeline::startup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing(LogFormat::from_env());

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let config = GatewayConfig::from_env()?;
            startup::serve_gateway(config, shutdown_signal()).await
        }
        Commands::Score => {
            let config = ScoringConfig::from_env()?;
            startup::run_scoring(config, shutdown_channel()).await
        }
        Commands::Store => {
            let config = StorageConfig::from_env()?;
            startup::run_storage(config, shutdown_channel()).await
        }
        Commands::Alert => {
            let config = AlertConfig::from_env()?;
            startup::run_alerts(config, shutdown_channel()).await
        }
        Commands::Token {
            subject,
            account,
            roles,
            ttl_hours,
        } => {
            let secret = config::jwt_secret_from_env()?;
            let token = cli::handle_token(&secret, &subject, account.as_deref(), &roles, ttl_hours)?;
            println!("{token}");
            Ok(())
        }
        Commands::Config { check } => cli::handle_config_validate(check).await,
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Flips to true once SIGINT or SIGTERM arrives.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
