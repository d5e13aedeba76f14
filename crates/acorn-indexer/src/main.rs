use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod alert;
mod cache;
mod config;
mod counter;
mod nft;
mod rpc;
mod script;
mod store;

/// Retry delays for exponential backoff (in seconds)
const RETRY_DELAYS: &[u64] = &[5, 10, 20, 30, 60];
const MAX_RETRY_DELAY: u64 = 60;

#[derive(Parser, Debug)]
#[command(name = "acorn-indexer", about = "NFT indexer for a NEO-style chain")]
struct Args {
    /// Enable alert notifications on task failure and full sync
    #[arg(long)]
    mail: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "acorn_indexer=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Acorn NFT indexer");

    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = config::Config::from_env()?;
    let alerter = alert::Alerter::new(args.mail, config.alert_webhook_url.clone());

    let pool =
        acorn_common::db::create_pool(&config.database_url, config.db_max_connections).await?;

    let rpc = Arc::new(rpc::RpcClient::new(config.rpc_urls.clone())?);
    rpc.spawn_height_tracker();

    tracing::info!("Waiting for chain best height");
    let best_height = rpc.wait_for_height().await;
    tracing::info!("Chain best height: {best_height}");

    // The addr_tx denormalization runs on its own cursor, independent of
    // the main pipeline.
    let counter_pool = pool.clone();
    let counter_alerter = alerter.clone();
    tokio::spawn(async move {
        run_with_retry("nft addr_tx counter", &counter_alerter, || {
            counter::run(counter_pool.clone())
        })
        .await
    });

    run_with_retry("nft pipeline", &alerter, || {
        nft::run(
            pool.clone(),
            Arc::clone(&rpc),
            config.clone(),
            alerter.clone(),
        )
    })
    .await;

    Ok(())
}

/// Supervise a task forever: every exit is a failure, alerted and restarted
/// with backoff. Tasks resume from their durable cursors, so a restart
/// replays at most the uncommitted tail.
async fn run_with_retry<F, Fut>(task: &str, alerter: &alert::Alerter, f: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut retry_count = 0;
    loop {
        match f().await {
            Ok(()) => {
                retry_count = 0;
            }
            Err(e) => {
                let delay = RETRY_DELAYS
                    .get(retry_count)
                    .copied()
                    .unwrap_or(MAX_RETRY_DELAY);
                tracing::error!(
                    "{task} failed: {e:#}. Restarting in {delay}s (attempt {})...",
                    retry_count + 1
                );
                alerter
                    .notify(&format!("{task} failed"), &format!("{e:#}"))
                    .await;
                tokio::time::sleep(Duration::from_secs(delay)).await;
                retry_count += 1;
            }
        }
    }
}
