//! Tail task denormalizing `nft_tx` rows into `addr_tx`.
//!
//! Runs on its own cursor (`counter.nft_tx_pk_for_addr_tx`), independent of
//! the main pipeline: it only ever reads committed transfer rows, so it can
//! lag or restart freely.

use std::time::Duration;

use acorn_common::NftTxRecord;
use anyhow::Result;
use sqlx::PgPool;

const PAGE_SIZE: i64 = 1000;
const BATCH_WAIT: Duration = Duration::from_millis(10);
const IDLE_WAIT: Duration = Duration::from_secs(1);

pub async fn run(pool: PgPool) -> Result<()> {
    let (mut last_pk,): (i64,) =
        sqlx::query_as("SELECT nft_tx_pk_for_addr_tx FROM counter WHERE id = 1")
            .fetch_one(&pool)
            .await?;

    loop {
        let records: Vec<NftTxRecord> = sqlx::query_as(
            "SELECT id, txid, from_addr, to_addr, block_time FROM nft_tx
             WHERE id > $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(last_pk)
        .bind(PAGE_SIZE)
        .fetch_all(&pool)
        .await?;

        if records.is_empty() {
            tokio::time::sleep(IDLE_WAIT).await;
            continue;
        }

        last_pk = records.last().map(|r| r.id).unwrap_or(last_pk);
        insert_addr_tx(&pool, &records, last_pk).await?;
        tokio::time::sleep(BATCH_WAIT).await;
    }
}

/// One `addr_tx` row per non-empty transfer party, inserted idempotently so
/// a replay after a crash is harmless.
async fn insert_addr_tx(pool: &PgPool, records: &[NftTxRecord], last_pk: i64) -> Result<()> {
    let mut txids: Vec<&str> = Vec::new();
    let mut addresses: Vec<&str> = Vec::new();
    let mut block_times: Vec<i64> = Vec::new();
    for record in records {
        if !record.from_addr.is_empty() {
            txids.push(&record.txid);
            addresses.push(&record.from_addr);
            block_times.push(record.block_time);
        }
        if !record.to_addr.is_empty() {
            txids.push(&record.txid);
            addresses.push(&record.to_addr);
            block_times.push(record.block_time);
        }
    }

    let mut db_tx = pool.begin().await?;
    if !txids.is_empty() {
        sqlx::query(
            "INSERT INTO addr_tx (txid, address, block_time, asset_type)
             SELECT txid, address, block_time, 'nft'
             FROM unnest($1::text[], $2::text[], $3::bigint[]) AS t(txid, address, block_time)
             ON CONFLICT (txid, address, asset_type) DO NOTHING",
        )
        .bind(&txids[..])
        .bind(&addresses[..])
        .bind(&block_times[..])
        .execute(&mut *db_tx)
        .await?;
    }
    sqlx::query("UPDATE counter SET nft_tx_pk_for_addr_tx = $1 WHERE id = 1")
        .bind(last_pk)
        .execute(&mut *db_tx)
        .await?;
    db_tx.commit().await?;
    Ok(())
}
