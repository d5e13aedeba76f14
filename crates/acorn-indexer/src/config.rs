use anyhow::{Context, Result};
use std::collections::HashSet;
use std::env;

/// Known-bad mainnet txid whose script must never be processed. Default of
/// the deny-list; operators can extend or clear it via DENY_TXIDS.
const DEFAULT_DENY_TXIDS: &str =
    "0xb00a0d7b752ba935206e1db67079c186ba38a4696d3afe28814a4834b2254cbe";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub rpc_urls: Vec<String>,
    pub applog_workers: u32,
    pub deny_txids: HashSet<String>,
    pub alert_webhook_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .context("Invalid DB_MAX_CONNECTIONS")?,
            rpc_urls: env::var("RPC_URLS")
                .context("RPC_URLS must be set")?
                .split(',')
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect(),
            applog_workers: env::var("APPLOG_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .context("Invalid APPLOG_WORKERS")?,
            deny_txids: env::var("DENY_TXIDS")
                .unwrap_or_else(|_| DEFAULT_DENY_TXIDS.to_string())
                .split(',')
                .map(|txid| txid.trim().to_string())
                .filter(|txid| !txid.is_empty())
                .collect(),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
        })
    }
}
