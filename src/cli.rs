use clap::{Parser, Subcommand};
use std::time::Duration;

use crate::middleware::auth::JwtVerifier;

#[derive(Parser)]
#[command(name = "txn-pipeline")]
#[command(about = "Transaction pipeline - idempotent intake, risk scoring, storage and alerts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the HTTP ingestion gateway (default)
    Serve,

    /// Score raw transactions and publish processed events
    Score,

    /// Persist processed transactions to Postgres
    Store,

    /// Forward flagged and rejected transactions to the chat webhook
    Alert,

    /// Mint a bearer token for local testing
    Token {
        /// Token subject, usually the user ID
        #[arg(long)]
        subject: String,

        /// Account the caller acts for
        #[arg(long)]
        account: Option<String>,

        /// Role to grant; repeat for several
        #[arg(long = "role", default_value = "submitter")]
        roles: Vec<String>,

        /// Lifetime of the token
        #[arg(long, default_value_t = 24)]
        ttl_hours: u64,
    },

    /// Print and validate configuration
    Config {
        /// Also check connectivity to Redis and Postgres
        #[arg(long)]
        check: bool,
    },
}

pub fn handle_token(
    secret: &str,
    subject: &str,
    account: Option<&str>,
    roles: &[String],
    ttl_hours: u64,
) -> anyhow::Result<String> {
    let ttl = Duration::from_secs(ttl_hours.saturating_mul(3600));
    let token = JwtVerifier::new(secret).issue(subject, account, roles, ttl)?;
    tracing::info!(subject, roles = ?roles, ttl_hours, "Issued token");
    Ok(token)
}

pub async fn handle_config_validate(check: bool) -> anyhow::Result<()> {
    tracing::info!(connectivity = check, "Validating configuration...");

    let report = crate::startup::validate_environment(check).await;
    report.print();

    if !report.is_valid() {
        anyhow::bail!("Configuration is invalid");
    }
    println!("✓ Configuration is valid");
    Ok(())
}

/// Hides the password component of a connection URL.
pub fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}
