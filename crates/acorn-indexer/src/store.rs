//! Single-writer persistence of pipeline store events.
//!
//! One task consumes the typed event stream and performs one SQL transaction
//! per event, advancing the `(last_tx_pk, app_log_idx)` cursor inside the
//! same transaction. Running every mutation on this one task keeps the
//! `UPDATE ... + delta` counter statements safe without row locking games.

use std::sync::Arc;
use std::time::{Duration, Instant};

use acorn_common::{NftAsset, NftCursor, NftRegInfo, Transaction};
use anyhow::{anyhow, Result};
use bigdecimal::BigDecimal;
use sqlx::PgPool;
use tokio::sync::mpsc;

use crate::alert::Alerter;
use crate::cache::AddrAssetCache;

#[derive(Debug)]
pub enum StoreEvent {
    Register(RegisterStore),
    Transfer(TransferStore),
    TotalSupplyRefresh(SupplyStore),
    Cursor(NftCursor),
}

#[derive(Debug)]
pub struct RegisterStore {
    pub tx_pk: i64,
    pub asset: NftAsset,
    pub reg_info: NftRegInfo,
    /// Chain height the registration facts were read at.
    pub at_height: u32,
}

#[derive(Debug)]
pub struct TransferStore {
    pub tx: Transaction,
    pub app_log_idx: i32,
    pub asset_id: String,
    pub from_addr: String,
    pub from_balance: BigDecimal,
    pub to_addr: String,
    pub to_balance: BigDecimal,
    pub transfer_value: BigDecimal,
    pub token_id: String,
    /// Refreshed supply attached when the transfer looked like a storage
    /// injection.
    pub total_supply: Option<BigDecimal>,
    /// `properties` JSON for a first-seen token, empty otherwise.
    pub nft_json_info: String,
}

#[derive(Debug)]
pub struct SupplyStore {
    pub tx_pk: i64,
    pub block_index: u32,
    pub block_time: u64,
    pub asset_id: String,
    pub total_supply: BigDecimal,
}

pub async fn run_writer(
    pool: PgPool,
    cache: Arc<AddrAssetCache>,
    alerter: Alerter,
    mut events: mpsc::Receiver<StoreEvent>,
) -> Result<()> {
    let mut progress = Progress::new();
    while let Some(event) = events.recv().await {
        let tx_pk = store_event(&pool, &cache, &event).await?;
        progress.show(&pool, &alerter, tx_pk).await;
    }
    Err(anyhow!("store channel closed"))
}

async fn store_event(pool: &PgPool, cache: &AddrAssetCache, event: &StoreEvent) -> Result<i64> {
    match event {
        StoreEvent::Register(reg) => store_registration(pool, reg).await,
        StoreEvent::Transfer(transfer) => store_transfer(pool, cache, transfer).await,
        StoreEvent::TotalSupplyRefresh(supply) => store_total_supply(pool, supply).await,
        StoreEvent::Cursor(cursor) => store_cursor(pool, cursor).await,
    }
}

async fn store_registration(pool: &PgPool, reg: &RegisterStore) -> Result<i64> {
    let mut db_tx = pool.begin().await?;

    let (nft_pk,): (i64,) = sqlx::query_as(
        "INSERT INTO nft
            (asset_id, admin_address, name, symbol, decimals, total_supply,
             txid, block_index, block_time, addresses, holding_addresses, transfers)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0)
         RETURNING id",
    )
    .bind(&reg.asset.asset_id)
    .bind(&reg.asset.admin_address)
    .bind(&reg.asset.name)
    .bind(&reg.asset.symbol)
    .bind(reg.asset.decimals as i16)
    .bind(&reg.asset.total_supply)
    .bind(&reg.asset.txid)
    .bind(reg.asset.block_index as i64)
    .bind(reg.asset.block_time as i64)
    .fetch_one(&mut *db_tx)
    .await?;

    sqlx::query(
        "INSERT INTO nft_reg_info
            (nft_id, name, version, author, email, description,
             need_storage, parameter_list, return_type)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
    )
    .bind(nft_pk)
    .bind(&reg.reg_info.name)
    .bind(&reg.reg_info.version)
    .bind(&reg.reg_info.author)
    .bind(&reg.reg_info.email)
    .bind(&reg.reg_info.description)
    .bind(reg.reg_info.need_storage)
    .bind(&reg.reg_info.parameter_list)
    .bind(&reg.reg_info.return_type)
    .execute(&mut *db_tx)
    .await?;

    advance_cursor(&mut db_tx, reg.tx_pk, -1).await?;
    db_tx.commit().await?;

    tracing::info!(
        asset_id = %reg.asset.asset_id,
        name = %reg.asset.name,
        at_height = reg.at_height,
        "registered nft asset"
    );
    Ok(reg.tx_pk)
}

async fn store_transfer(
    pool: &PgPool,
    cache: &AddrAssetCache,
    transfer: &TransferStore,
) -> Result<i64> {
    let mut db_tx = pool.begin().await?;

    // At most two distinct parties; sorted ascending so concurrent writers
    // of the address table always lock rows in the same order.
    let mut parties: Vec<(&str, &BigDecimal)> = vec![
        (transfer.from_addr.as_str(), &transfer.from_balance),
        (transfer.to_addr.as_str(), &transfer.to_balance),
    ];
    if transfer.from_addr == transfer.to_addr {
        parties.truncate(1);
    } else {
        parties.sort_by(|a, b| a.0.cmp(b.0));
    }

    let mut addresses_offset: i64 = 0;
    let mut holding_offset: i64 = 0;
    let mut created_count: i64 = 0;

    for (address, balance) in parties {
        if address.is_empty() {
            continue;
        }

        let touch = cache.touch_addr(address, transfer.tx.block_time);
        if touch.created {
            created_count += 1;
            sqlx::query(
                "INSERT INTO address
                    (address, created_at, last_transaction_time, trans_asset, trans_nep5, trans_nft)
                 VALUES ($1, $2, $3, 0, 0, 1)",
            )
            .bind(address)
            .bind(transfer.tx.block_time as i64)
            .bind(transfer.tx.block_time as i64)
            .execute(&mut *db_tx)
            .await?;
        } else {
            // Timestamps move only when this observation actually extended
            // them; pipelines for other asset classes touch the same rows
            // out of block order.
            sqlx::query(
                "UPDATE address SET
                    trans_nft = trans_nft + 1,
                    created_at = COALESCE($2, created_at),
                    last_transaction_time = COALESCE($3, last_transaction_time)
                 WHERE address = $1",
            )
            .bind(address)
            .bind(touch.new_created_at.map(|t| t as i64))
            .bind(touch.new_last_tx_time.map(|t| t as i64))
            .execute(&mut *db_tx)
            .await?;
        }

        let previous = cache.get_or_create_addr_asset(address, &transfer.asset_id, balance);
        let (addr_delta, holding_delta) = balance_offsets(previous.as_ref(), balance);
        addresses_offset += addr_delta;
        holding_offset += holding_delta;

        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT id FROM addr_asset_nft
             WHERE address = $1 AND asset_id = $2 AND token_id = $3)",
        )
        .bind(address)
        .bind(&transfer.asset_id)
        .bind(&transfer.token_id)
        .fetch_one(&mut *db_tx)
        .await?;

        if !exists {
            sqlx::query(
                "INSERT INTO addr_asset_nft (address, asset_id, token_id, balance)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(address)
            .bind(&transfer.asset_id)
            .bind(&transfer.token_id)
            .bind(&transfer.transfer_value)
            .execute(&mut *db_tx)
            .await?;
        } else {
            cache.set_addr_asset_balance(
                address,
                &transfer.asset_id,
                balance.clone(),
                transfer.tx.block_index,
            );
            let statement = if address == transfer.from_addr {
                "UPDATE addr_asset_nft SET balance = balance - $4
                 WHERE address = $1 AND asset_id = $2 AND token_id = $3"
            } else {
                "UPDATE addr_asset_nft SET balance = balance + $4
                 WHERE address = $1 AND asset_id = $2 AND token_id = $3"
            };
            sqlx::query(statement)
                .bind(address)
                .bind(&transfer.asset_id)
                .bind(&transfer.token_id)
                .bind(&transfer.transfer_value)
                .execute(&mut *db_tx)
                .await?;
        }
    }

    sqlx::query(
        "UPDATE nft SET
            addresses = addresses + $2,
            holding_addresses = holding_addresses + $3,
            transfers = transfers + 1
         WHERE asset_id = $1",
    )
    .bind(&transfer.asset_id)
    .bind(addresses_offset)
    .bind(holding_offset)
    .execute(&mut *db_tx)
    .await?;

    sqlx::query(
        "INSERT INTO nft_tx
            (txid, asset_id, from_addr, to_addr, token_id, value, block_index, block_time)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(&transfer.tx.txid)
    .bind(&transfer.asset_id)
    .bind(&transfer.from_addr)
    .bind(&transfer.to_addr)
    .bind(&transfer.token_id)
    .bind(&transfer.transfer_value)
    .bind(transfer.tx.block_index as i64)
    .bind(transfer.tx.block_time as i64)
    .execute(&mut *db_tx)
    .await?;

    if let Some(total_supply) = &transfer.total_supply {
        sqlx::query("UPDATE nft SET total_supply = $2 WHERE asset_id = $1")
            .bind(&transfer.asset_id)
            .bind(total_supply)
            .execute(&mut *db_tx)
            .await?;
    }

    if !transfer.nft_json_info.is_empty() {
        sqlx::query(
            "INSERT INTO nft_token (asset_id, token_id, info)
             VALUES ($1, $2, $3)
             ON CONFLICT (asset_id, token_id) DO NOTHING",
        )
        .bind(&transfer.asset_id)
        .bind(&transfer.token_id)
        .bind(&transfer.nft_json_info)
        .execute(&mut *db_tx)
        .await?;
    }

    if created_count > 0 {
        sqlx::query("UPDATE counter SET addr_count = addr_count + $1 WHERE id = 1")
            .bind(created_count)
            .execute(&mut *db_tx)
            .await?;
    }

    advance_cursor(&mut db_tx, transfer.tx.pk, transfer.app_log_idx).await?;
    db_tx.commit().await?;
    Ok(transfer.tx.pk)
}

async fn store_total_supply(pool: &PgPool, supply: &SupplyStore) -> Result<i64> {
    sqlx::query("UPDATE nft SET total_supply = $2 WHERE asset_id = $1")
        .bind(&supply.asset_id)
        .bind(&supply.total_supply)
        .execute(pool)
        .await?;
    tracing::debug!(
        asset_id = %supply.asset_id,
        block_index = supply.block_index,
        block_time = supply.block_time,
        "refreshed total supply"
    );
    // The cursor is not advanced here; the handler emits its cursor event
    // once the whole transaction is processed.
    Ok(supply.tx_pk)
}

async fn store_cursor(pool: &PgPool, cursor: &NftCursor) -> Result<i64> {
    sqlx::query("UPDATE counter SET last_tx_pk_for_nft = $1, nft_app_log_idx = $2 WHERE id = 1")
        .bind(cursor.last_tx_pk)
        .bind(cursor.app_log_idx)
        .execute(pool)
        .await?;
    Ok(cursor.last_tx_pk)
}

async fn advance_cursor(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    tx_pk: i64,
    app_log_idx: i32,
) -> Result<()> {
    sqlx::query("UPDATE counter SET last_tx_pk_for_nft = $1, nft_app_log_idx = $2 WHERE id = 1")
        .bind(tx_pk)
        .bind(app_log_idx)
        .execute(&mut **db_tx)
        .await?;
    Ok(())
}

/// Counter deltas for one transfer party: whether the address counts as a
/// new holder of the asset, and how the holding-address count moves given
/// the previous cached balance versus the newly observed one.
fn balance_offsets(previous: Option<&BigDecimal>, new_balance: &BigDecimal) -> (i64, i64) {
    let zero = BigDecimal::from(0);
    let addresses = i64::from(previous.is_none());
    let holding = match previous {
        None => i64::from(*new_balance > zero),
        Some(prev) => {
            if *new_balance > zero {
                i64::from(*prev == zero)
            } else if *prev > zero {
                -1
            } else {
                0
            }
        }
    };
    (addresses, holding)
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

struct Progress {
    max_pk: i64,
    start_pk: Option<i64>,
    init_time: Instant,
    last_output: Option<Instant>,
    notified: bool,
}

impl Progress {
    fn new() -> Self {
        Self {
            max_pk: 0,
            start_pk: None,
            init_time: Instant::now(),
            last_output: None,
            notified: false,
        }
    }

    /// Log sync progress, at most once per second while catching up.
    async fn show(&mut self, pool: &PgPool, alerter: &Alerter, tx_pk: i64) {
        if self.start_pk.is_none() {
            self.start_pk = Some(tx_pk);
        }
        if self.max_pk == 0 || tx_pk > self.max_pk {
            match max_invocation_pk(pool).await {
                Ok(Some(max)) => self.max_pk = max,
                Ok(None) => {}
                Err(e) => tracing::debug!("max tx pk query failed: {e}"),
            }
        }
        if self.max_pk == 0 {
            return;
        }

        let now = Instant::now();
        if tx_pk < self.max_pk {
            if let Some(last) = self.last_output {
                if now.duration_since(last) < Duration::from_secs(1) {
                    return;
                }
            }
        }

        let percentage = (tx_pk as f64 / self.max_pk as f64) * 100.0;
        tracing::info!(
            "nft sync progress: {}/{} ({:.4}%){}",
            tx_pk,
            self.max_pk,
            percentage,
            self.estimate_remaining(tx_pk)
        );
        self.last_output = Some(now);

        if tx_pk >= self.max_pk && !self.notified {
            self.notified = true;
            // A short catch-up is routine; only a real initial sync is worth
            // a notification.
            let elapsed = self.init_time.elapsed();
            if elapsed >= Duration::from_secs(300) {
                alerter
                    .notify(
                        "nft tx fully synced",
                        &format!("synced to pk {tx_pk} in {}s", elapsed.as_secs()),
                    )
                    .await;
            }
        }
    }

    fn estimate_remaining(&self, tx_pk: i64) -> String {
        let Some(start) = self.start_pk else {
            return String::new();
        };
        let done = tx_pk - start;
        if done <= 0 || tx_pk >= self.max_pk {
            return String::new();
        }
        let rate = done as f64 / self.init_time.elapsed().as_secs_f64();
        if rate <= 0.0 {
            return String::new();
        }
        let seconds = ((self.max_pk - tx_pk) as f64 / rate) as u64;
        format!(", ~{}m{}s left", seconds / 60, seconds % 60)
    }
}

async fn max_invocation_pk(pool: &PgPool) -> Result<Option<i64>, sqlx::Error> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM tx WHERE type = $1 ORDER BY id DESC LIMIT 1")
            .bind("InvocationTransaction")
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(pk,)| pk))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(v: i64) -> BigDecimal {
        BigDecimal::from(v)
    }

    #[test]
    fn mint_to_fresh_address_creates_a_holder() {
        // S1: first observation of (addrA, a1) with balance 1.
        assert_eq!(balance_offsets(None, &dec(1)), (1, 1));
    }

    #[test]
    fn transfer_moves_holding_without_changing_count() {
        // S2: addrA drops to zero, addrB appears with one token. Net
        // holding change is zero while addresses grows by one.
        let from = balance_offsets(Some(&dec(1)), &dec(0));
        let to = balance_offsets(None, &dec(1));
        assert_eq!(from, (0, -1));
        assert_eq!(to, (1, 1));
        assert_eq!(from.0 + to.0, 1);
        assert_eq!(from.1 + to.1, 0);
    }

    #[test]
    fn regaining_a_balance_counts_as_holding_again() {
        assert_eq!(balance_offsets(Some(&dec(0)), &dec(1)), (0, 1));
        assert_eq!(balance_offsets(Some(&dec(2)), &dec(3)), (0, 0));
        assert_eq!(balance_offsets(Some(&dec(0)), &dec(0)), (0, 0));
    }

    #[test]
    fn empty_mint_party_never_holds() {
        // A mint's empty `from` is skipped before offsets are computed, but
        // a zero balance on a fresh pair still counts the address.
        assert_eq!(balance_offsets(None, &dec(0)), (1, 0));
    }
}
