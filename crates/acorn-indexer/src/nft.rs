//! The NFT indexing pipeline.
//!
//! Stages, connected by bounded channels:
//!
//!   tx fetcher ──▶ app-log workers (parallel RPC, rejoined per tx through a
//!   oneshot) ──▶ transaction handler (classification + enrichment RPC) ──▶
//!   store writer (single consumer, one SQL transaction per event).
//!
//! Transactions are handled and stored in strict ascending pk order no
//! matter how the parallel application-log calls complete, and the dual
//! `(last_tx_pk, app_log_idx)` cursor makes a restart resume exactly after
//! the last committed notification.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use acorn_common::{NftAsset, NftCursor, NftRegInfo, Transaction};
use anyhow::{anyhow, Context, Result};
use bigdecimal::BigDecimal;
use num_bigint::{BigInt, BigUint};
use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::alert::Alerter;
use crate::cache::AddrAssetCache;
use crate::config::Config;
use crate::rpc::{ApplicationLog, Notification, RpcClient, StackItem};
use crate::script::{self, DataStack};
use crate::store::{self, RegisterStore, StoreEvent, SupplyStore, TransferStore};

const CHAN_SIZE: usize = 5000;
const TX_PAGE_SIZE: i64 = 1000;
/// Scripts at or under this hex length cannot contain a contract call.
const MIN_SCRIPT_HEX_LEN: usize = 42;
const EMPTY_PAGE_WAIT: Duration = Duration::from_secs(2);
const TOKEN_INFO_ATTEMPTS: usize = 3;
const TOKEN_INFO_RETRY_WAIT: Duration = Duration::from_secs(1);

/// hex("transfer")
const TRANSFER_HEX: &str = "7472616e73666572";
/// hex("totalSupply"); a transfer "to" this value is a storage injection.
const TOTAL_SUPPLY_HEX: &str = "746f74616c537570706c79";

/// Method names (hex) every NFT deploy script carries.
const REGISTRATION_MARKS: &[&str] = &[
    "6e616d65",               // name
    "73796d626f6c",           // symbol
    "746f74616c537570706c79", // totalSupply
    "646563696d616c73",       // decimals
    "7472616e73666572",       // transfer
    "6f776e65724f66",         // ownerOf
    "62616c616e63654f66",     // balanceOf
    "746f6b656e734f66",       // tokensOf
    "70726f70657274696573",   // properties
];

struct AppLogRequest {
    block_index: u32,
    txid: String,
    reply: oneshot::Sender<ApplicationLog>,
}

/// A fetched transaction waiting for its application log.
struct PendingTx {
    tx: Transaction,
    app_log: oneshot::Receiver<ApplicationLog>,
}

/// Run the whole pipeline until one of its stages fails. The caller restarts
/// it from the durable cursor; cache and decimals are reloaded here so
/// memory state is in sync with the database on every (re)start.
pub async fn run(
    pool: PgPool,
    rpc: Arc<RpcClient>,
    config: Config,
    alerter: Alerter,
) -> Result<()> {
    let cache = Arc::new(AddrAssetCache::load(&pool).await?);
    let decimals = load_asset_decimals(&pool).await?;
    let cursor = load_cursor(&pool).await?;
    tracing::info!(
        last_tx_pk = cursor.last_tx_pk,
        app_log_idx = cursor.app_log_idx,
        assets = decimals.len(),
        "starting nft pipeline"
    );

    let (applog_tx, applog_rx) = async_channel::bounded::<AppLogRequest>(CHAN_SIZE);
    let (pending_tx, pending_rx) = mpsc::channel::<PendingTx>(CHAN_SIZE);
    let (store_tx, store_rx) = mpsc::channel::<StoreEvent>(CHAN_SIZE);

    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    for worker_id in 0..config.applog_workers as usize {
        let rpc = Arc::clone(&rpc);
        let requests = applog_rx.clone();
        workers.push(tokio::spawn(applog_worker(rpc, requests, worker_id)));
    }
    drop(applog_rx);

    let mut fetcher = tokio::spawn(fetch_transactions(
        pool.clone(),
        config.deny_txids.clone(),
        cursor,
        applog_tx,
        pending_tx,
    ));
    let handler = TxHandler {
        pool: pool.clone(),
        rpc,
        cache: Arc::clone(&cache),
        store: store_tx,
        decimals,
    };
    let mut processor = tokio::spawn(process_transactions(
        handler,
        pending_rx,
        cursor.app_log_idx,
    ));
    let mut writer = tokio::spawn(store::run_writer(pool, cache, alerter, store_rx));

    // Every stage loops forever; the first one to return took down the
    // pipeline.
    let result = tokio::select! {
        r = &mut fetcher => flatten("nft tx fetcher", r),
        r = &mut processor => flatten("nft tx handler", r),
        r = &mut writer => flatten("nft store writer", r),
    };

    fetcher.abort();
    processor.abort();
    writer.abort();
    for worker in &workers {
        worker.abort();
    }

    result
}

fn flatten(task: &str, joined: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(())) => Err(anyhow!("{task} exited unexpectedly")),
        Ok(Err(e)) => Err(e.context(task.to_string())),
        Err(e) => Err(anyhow!("{task} panicked: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Tx fetcher
// ---------------------------------------------------------------------------

/// Page invocation transactions by ascending pk, starting from the durable
/// cursor, and hand each one to the app-log workers plus the ordered queue.
async fn fetch_transactions(
    pool: PgPool,
    deny_txids: HashSet<String>,
    cursor: NftCursor,
    applog_tx: async_channel::Sender<AppLogRequest>,
    pending_tx: mpsc::Sender<PendingTx>,
) -> Result<()> {
    // app_log_idx == -1 means the cursor's transaction is fully handled.
    let mut next_pk = if cursor.app_log_idx == -1 {
        cursor.last_tx_pk + 1
    } else {
        cursor.last_tx_pk
    };

    loop {
        let page = match fetch_invocation_page(&pool, next_pk, TX_PAGE_SIZE).await {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!("tx page read failed: {e}, retrying");
                tokio::time::sleep(EMPTY_PAGE_WAIT).await;
                continue;
            }
        };
        if page.is_empty() {
            tokio::time::sleep(EMPTY_PAGE_WAIT).await;
            continue;
        }
        // Advance over the raw page; the filters below must never stall the
        // cursor.
        next_pk = page.last().map(|tx| tx.pk + 1).unwrap_or(next_pk);

        for tx in page {
            if tx.script.len() <= MIN_SCRIPT_HEX_LEN || deny_txids.contains(&tx.txid) {
                continue;
            }

            let (reply, app_log) = oneshot::channel();
            applog_tx
                .send(AppLogRequest {
                    block_index: tx.block_index,
                    txid: tx.txid.clone(),
                    reply,
                })
                .await
                .map_err(|_| anyhow!("app log request channel closed"))?;
            pending_tx
                .send(PendingTx { tx, app_log })
                .await
                .map_err(|_| anyhow!("pending tx channel closed"))?;
        }
    }
}

async fn fetch_invocation_page(
    pool: &PgPool,
    start_pk: i64,
    limit: i64,
) -> Result<Vec<Transaction>, sqlx::Error> {
    let rows: Vec<(i64, String, i64, i64, String)> = sqlx::query_as(
        "SELECT id, txid, block_index, block_time, script FROM tx
         WHERE id >= $1 AND type = $2 ORDER BY id ASC LIMIT $3",
    )
    .bind(start_pk)
    .bind("InvocationTransaction")
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(pk, txid, block_index, block_time, script)| Transaction {
            pk,
            txid,
            block_index: block_index as u32,
            block_time: block_time as u64,
            script,
        })
        .collect())
}

// ---------------------------------------------------------------------------
// App-log fan-out
// ---------------------------------------------------------------------------

async fn applog_worker(
    rpc: Arc<RpcClient>,
    requests: async_channel::Receiver<AppLogRequest>,
    worker_id: usize,
) {
    tracing::debug!("app log worker {worker_id} started");
    while let Ok(request) = requests.recv().await {
        let log = rpc
            .get_application_log(request.block_index, &request.txid)
            .await;
        // The handler may already be gone during shutdown.
        let _ = request.reply.send(log);
    }
    tracing::debug!("app log worker {worker_id} shutting down");
}

// ---------------------------------------------------------------------------
// Transaction handler
// ---------------------------------------------------------------------------

struct TxHandler {
    pool: PgPool,
    rpc: Arc<RpcClient>,
    cache: Arc<AddrAssetCache>,
    store: mpsc::Sender<StoreEvent>,
    /// decimals per known NFT asset; also the "is this asset ours" check.
    decimals: HashMap<String, u8>,
}

/// Drain the ordered queue. Awaiting each transaction's oneshot restores
/// input order after the parallel RPC fan-out. `resume_idx` is the cursor's
/// notification index and only applies to the first transaction after a
/// restart.
async fn process_transactions(
    mut handler: TxHandler,
    mut pending_rx: mpsc::Receiver<PendingTx>,
    mut resume_idx: i32,
) -> Result<()> {
    while let Some(pending) = pending_rx.recv().await {
        let PendingTx { tx, app_log } = pending;
        let app_log = app_log.await.context("app log worker dropped request")?;
        handler.handle_tx(&tx, app_log, resume_idx).await?;
        resume_idx = -1;
    }
    Err(anyhow!("transaction stream closed"))
}

impl TxHandler {
    async fn handle_tx(
        &mut self,
        tx: &Transaction,
        app_log: ApplicationLog,
        resume_idx: i32,
    ) -> Result<()> {
        let stack = script::read_script(&tx.script).unwrap_or_default();
        if stack.is_empty() {
            return self.emit_cursor(tx.pk, -1).await;
        }

        if resume_idx == -1 && is_nft_registration(&tx.script) {
            return self.handle_registration(tx, stack).await;
        }

        // Side-effectful contract calls can move totalSupply without any
        // notification; already covered by the previous run when resuming.
        if resume_idx == -1 {
            self.scan_contract_calls(tx, stack).await?;
        }

        let notifications = collect_notifications(&app_log);
        self.handle_transfers(tx, &notifications, resume_idx)
            .await?;

        self.emit_cursor(tx.pk, -1).await
    }

    async fn emit_cursor(&self, tx_pk: i64, app_log_idx: i32) -> Result<()> {
        self.store
            .send(StoreEvent::Cursor(NftCursor {
                last_tx_pk: tx_pk,
                app_log_idx,
            }))
            .await
            .map_err(|_| anyhow!("store channel closed"))
    }

    // -- registration --------------------------------------------------------

    async fn handle_registration(&mut self, tx: &Transaction, mut stack: DataStack) -> Result<()> {
        let Some(admin_hash) = self.caller_script_hash(&tx.txid).await? else {
            return Ok(());
        };
        let Some((contract_hash, reg_info)) = extract_reg_info(&mut stack) else {
            return Ok(());
        };

        let asset_id = script::asset_id_from_script_hash(&contract_hash);
        if self.decimals.contains_key(&asset_id) {
            return Ok(());
        }

        // Confirm against the chain that this really is an NFT contract.
        let Some((asset, at_height)) = self.query_asset_info(tx, &contract_hash, &admin_hash).await
        else {
            return Ok(());
        };

        self.cache
            .set_total_supply(&asset.asset_id, asset.total_supply.clone(), at_height);
        self.decimals.insert(asset.asset_id.clone(), asset.decimals);

        self.store
            .send(StoreEvent::Register(RegisterStore {
                tx_pk: tx.pk,
                asset,
                reg_info,
                at_height,
            }))
            .await
            .map_err(|_| anyhow!("store channel closed"))
    }

    /// Script hash of the transaction's verification script; identifies the
    /// deploying party.
    async fn caller_script_hash(&self, txid: &str) -> Result<Option<Vec<u8>>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT verification FROM tx_scripts WHERE txid = $1 LIMIT 1")
                .bind(txid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(verification,)| {
            let bytes = hex::decode(verification).ok()?;
            if bytes.is_empty() {
                return None;
            }
            Some(script::script_hash(&bytes))
        }))
    }

    /// Read-only `name` + `symbol` + `decimals` + `totalSupply` invocation
    /// against the freshly deployed contract. Any validation failure rejects
    /// the registration.
    async fn query_asset_info(
        &self,
        tx: &Transaction,
        contract_hash: &[u8],
        admin_hash: &[u8],
    ) -> Option<(NftAsset, u32)> {
        if contract_hash.len() != 20 {
            return None;
        }

        let mut invoke = String::new();
        for method in ["name", "symbol", "decimals", "totalSupply"] {
            invoke.push_str(&script::method_call_script(contract_hash, method, &[])?);
        }

        let min_height = self.min_height(tx.block_index);
        let result = self.rpc.invoke_script(min_height, &invoke).await.ok()?;
        if result.state.contains("FAULT") || result.stack.len() < 4 {
            return None;
        }

        let name = utf8_or_empty(hex::decode(result.stack[0].as_str()?).ok()?);
        if name.is_empty() {
            return None;
        }
        let symbol = utf8_or_empty(hex::decode(result.stack[1].as_str()?).ok()?);
        if symbol.is_empty() {
            return None;
        }

        let decimals = result.stack[2].as_bigint()?;
        if decimals < BigInt::from(0) || decimals > BigInt::from(8) {
            return None;
        }
        let decimals = decimals.to_string().parse::<u8>().ok()?;

        let raw_supply = result.stack[3].as_bigint()?;
        let total_supply = scaled(raw_supply, decimals);

        let asset = NftAsset {
            asset_id: script::asset_id_from_script_hash(contract_hash),
            admin_address: script::address_from_script_hash(admin_hash),
            name,
            symbol,
            decimals,
            total_supply,
            txid: tx.txid.clone(),
            block_index: tx.block_index,
            block_time: tx.block_time,
            addresses: 0,
            holding_addresses: 0,
            transfers: 0,
        };
        Some((asset, min_height))
    }

    // -- non-transfer contract calls -----------------------------------------

    /// Walk the decoded script for APPCALLs whose method is anything but
    /// `transfer`: contract-invoked mint/burn and storage injection change
    /// totalSupply without leaving a notification behind.
    async fn scan_contract_calls(&self, tx: &Transaction, mut stack: DataStack) -> Result<()> {
        while stack.len() >= 2 {
            let Some((opcode, data)) = stack.pop_item() else {
                break;
            };
            if opcode != script::OP_APPCALL {
                continue;
            }
            if data.len() != 20 {
                continue;
            }
            let Some(method) = stack.pop_data() else {
                break;
            };
            if method.is_empty() || method == b"transfer" {
                continue;
            }

            let Some(total_supply) = self.query_total_supply(tx.block_index, &data).await else {
                continue;
            };
            self.store
                .send(StoreEvent::TotalSupplyRefresh(SupplyStore {
                    tx_pk: tx.pk,
                    block_index: tx.block_index,
                    block_time: tx.block_time,
                    asset_id: script::asset_id_from_script_hash(&data),
                    total_supply,
                }))
                .await
                .map_err(|_| anyhow!("store channel closed"))?;
        }
        Ok(())
    }

    async fn query_total_supply(
        &self,
        tx_block_index: u32,
        contract_hash: &[u8],
    ) -> Option<BigDecimal> {
        let asset_id = script::asset_id_from_script_hash(contract_hash);
        let decimals = *self.decimals.get(&asset_id)?;

        if let Some((supply, at_height)) = self.cache.total_supply(&asset_id) {
            if at_height > tx_block_index {
                return Some(supply);
            }
        }

        let invoke = script::method_call_script(contract_hash, "totalSupply", &[])?;
        let min_height = self.rpc.best_height();
        let result = self.rpc.invoke_script(min_height, &invoke).await.ok()?;
        if result.state.contains("FAULT") {
            return None;
        }
        // Some broken contracts leave junk under the result; take the first
        // decodable stack value.
        let raw = result.stack.iter().find_map(|item| item.as_bigint())?;
        let supply = scaled(raw, decimals);

        self.cache.set_total_supply(&asset_id, supply.clone(), min_height);
        Some(supply)
    }

    // -- transfers -----------------------------------------------------------

    /// Process transfer notifications in application-log order, starting
    /// after `resume_idx`.
    async fn handle_transfers(
        &self,
        tx: &Transaction,
        notifications: &[Notification],
        resume_idx: i32,
    ) -> Result<()> {
        let start = (resume_idx + 1).max(0) as usize;
        for (idx, notification) in notifications.iter().enumerate().skip(start) {
            let Some(notice) = parse_transfer_notification(notification) else {
                continue;
            };
            if !self.decimals.contains_key(&notice.asset_id) {
                continue;
            }
            self.record_transfer(tx, &notice, idx as i32).await?;
        }
        Ok(())
    }

    async fn record_transfer(
        &self,
        tx: &Transaction,
        notice: &TransferNotice,
        app_log_idx: i32,
    ) -> Result<()> {
        let Some(contract_hash) = script::script_hash_from_asset_id(&notice.asset_id) else {
            return Ok(());
        };

        let from = hex::decode(&notice.from_sc).unwrap_or_default();
        let to = hex::decode(&notice.to_sc).unwrap_or_default();
        let from_addr = script::address_from_script_hash(&from);
        let to_addr = script::address_from_script_hash(&to);
        if from_addr.len() > 128 || to_addr.len() > 128 {
            tracing::error!(txid = %tx.txid, from = %from_addr, to = %to_addr, "oversized address");
            return Ok(());
        }

        let Some(transfer_value) = self.transfer_value(&notice.asset_id, &notice.value) else {
            return Ok(());
        };
        let Some(token_id) = token_id(&notice.token) else {
            return Ok(());
        };

        let Some(balances) = self
            .query_balances(
                tx.block_index,
                &contract_hash,
                &notice.asset_id,
                &[from.as_slice(), to.as_slice()],
            )
            .await
        else {
            // Broken contract (FAULT) or exhausted RPC: without balances the
            // counter deltas cannot be computed, so the record is dropped.
            return Ok(());
        };
        let [from_balance, to_balance]: [BigDecimal; 2] = balances
            .try_into()
            .map_err(|_| anyhow!("balance query arity mismatch"))?;

        // A transfer "to" the totalSupply storage key is an injection
        // attempt; refresh the real supply from the chain alongside it.
        let total_supply = if notice.to_sc == TOTAL_SUPPLY_HEX {
            self.query_total_supply(tx.block_index, &contract_hash).await
        } else {
            None
        };

        let mut nft_json_info = String::new();
        if !token_id.is_empty() && !self.token_exists(&notice.asset_id, &token_id).await? {
            nft_json_info = self
                .query_token_info(tx, &contract_hash, &token_id)
                .await
                .unwrap_or_default();
        }

        self.store
            .send(StoreEvent::Transfer(TransferStore {
                tx: tx.clone(),
                app_log_idx,
                asset_id: notice.asset_id.clone(),
                from_addr,
                from_balance,
                to_addr,
                to_balance,
                transfer_value,
                token_id,
                total_supply,
                nft_json_info,
            }))
            .await
            .map_err(|_| anyhow!("store channel closed"))
    }

    fn transfer_value(&self, asset_id: &str, item: &StackItem) -> Option<BigDecimal> {
        let raw = item.as_bigint()?;
        let decimals = *self.decimals.get(asset_id)?;
        Some(scaled(raw, decimals))
    }

    /// Current balances for the transfer parties: cache when fresh enough,
    /// otherwise one batched `balanceOf` invocation at best height. Empty
    /// parties contribute balance 0.
    async fn query_balances(
        &self,
        tx_block_index: u32,
        contract_hash: &[u8],
        asset_id: &str,
        parties: &[&[u8]],
    ) -> Option<Vec<BigDecimal>> {
        let decimals = *self.decimals.get(asset_id)?;

        let mut balances: Vec<Option<BigDecimal>> = vec![None; parties.len()];
        let mut invoke = String::new();
        for (idx, party) in parties.iter().enumerate() {
            if party.is_empty() {
                balances[idx] = Some(BigDecimal::from(0));
                continue;
            }
            let address = script::address_from_script_hash(party);
            if let Some(cached) = self.cache.addr_asset_balance(&address, asset_id) {
                if cached.block_index > tx_block_index {
                    balances[idx] = Some(cached.balance);
                    continue;
                }
            }
            invoke.push_str(&script::method_call_script(
                contract_hash,
                "balanceOf",
                &[party.to_vec()],
            )?);
        }

        let mut results = Vec::new();
        if !invoke.is_empty() {
            let result = self
                .rpc
                .invoke_script(self.rpc.best_height(), &invoke)
                .await
                .ok()?;
            if result.state.contains("FAULT") {
                return None;
            }
            results = result.stack;
        }

        let mut stack = results.into_iter();
        for balance in balances.iter_mut() {
            if balance.is_none() {
                let raw = stack.next()?.as_bigint()?;
                *balance = Some(scaled(raw, decimals));
            }
        }
        balances.into_iter().collect()
    }

    async fn token_exists(&self, asset_id: &str, token_id: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT id FROM nft_token WHERE asset_id = $1 AND token_id = $2 LIMIT 1)",
        )
        .bind(asset_id)
        .bind(token_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// `properties(tokenId)` for a token seen for the first time. Right
    /// after a block, one fullnode can know the token while another does
    /// not, so a FAULT is retried a few times before concluding the token id
    /// is simply invalid.
    async fn query_token_info(
        &self,
        tx: &Transaction,
        contract_hash: &[u8],
        token_id: &str,
    ) -> Option<String> {
        let invoke = script::properties_script(contract_hash, token_id)?;
        let min_height = self.min_height(tx.block_index);

        for _ in 0..TOKEN_INFO_ATTEMPTS {
            let Ok(result) = self.rpc.invoke_script(min_height, &invoke).await else {
                tokio::time::sleep(TOKEN_INFO_RETRY_WAIT).await;
                continue;
            };
            if result.state.contains("FAULT") || result.stack.is_empty() {
                tokio::time::sleep(TOKEN_INFO_RETRY_WAIT).await;
                continue;
            }
            let Some(hex_str) = result.stack[0].as_str() else {
                tokio::time::sleep(TOKEN_INFO_RETRY_WAIT).await;
                continue;
            };
            let bytes = hex::decode(hex_str).unwrap_or_default();
            return Some(utf8_or_empty(bytes));
        }
        None
    }

    fn min_height(&self, tx_block_index: u32) -> u32 {
        tx_block_index.max(self.rpc.best_height())
    }
}

// ---------------------------------------------------------------------------
// Pure classification helpers
// ---------------------------------------------------------------------------

/// Notifications of all non-faulted executions, in log order.
fn collect_notifications(app_log: &ApplicationLog) -> Vec<Notification> {
    let mut notifications = Vec::new();
    for execution in &app_log.executions {
        if execution.vmstate.contains("FAULT") || execution.notifications.is_empty() {
            continue;
        }
        notifications.extend(execution.notifications.iter().cloned());
    }
    notifications
}

/// A deploy script advertises the full NFT method set.
fn is_nft_registration(script: &str) -> bool {
    REGISTRATION_MARKS.iter().all(|mark| script.contains(mark))
}

/// A well-formed transfer notification: 5-element Array tagged "transfer",
/// neither party a boolean, at least one party non-empty.
#[derive(Debug)]
struct TransferNotice {
    asset_id: String,
    from_sc: String,
    to_sc: String,
    value: StackItem,
    token: StackItem,
}

fn parse_transfer_notification(notification: &Notification) -> Option<TransferNotice> {
    let state = notification.state.as_ref()?;
    if state.kind != "Array" {
        return None;
    }
    let items = state.as_items()?;
    if items.len() != 5 {
        return None;
    }
    if items[0].kind != "ByteArray" || items[0].as_str() != Some(TRANSFER_HEX) {
        return None;
    }
    if items[1].kind == "Boolean" || items[2].kind == "Boolean" {
        return None;
    }

    let from_sc = items[1].as_str().unwrap_or_default().to_string();
    let to_sc = items[2].as_str().unwrap_or_default().to_string();
    if from_sc.is_empty() && to_sc.is_empty() {
        return None;
    }

    let contract = notification.contract.strip_prefix("0x")?;
    Some(TransferNotice {
        asset_id: contract.to_string(),
        from_sc,
        to_sc,
        value: items[3].clone(),
        token: items[4].clone(),
    })
}

/// Canonical decimal token id: `Integer` values pass through, `ByteArray`
/// values decode as unsigned little-endian integers.
fn token_id(item: &StackItem) -> Option<String> {
    match item.kind.as_str() {
        "Integer" => item
            .as_str()
            .map(str::to_string)
            .or_else(|| item.as_bigint().map(|n| n.to_string())),
        "ByteArray" => {
            let bytes = hex::decode(item.as_str()?).ok()?;
            Some(BigUint::from_bytes_le(&bytes).to_string())
        }
        _ => None,
    }
}

/// Raw chain integer scaled to its decimal representation.
fn scaled(raw: BigInt, decimals: u8) -> BigDecimal {
    BigDecimal::new(raw, decimals as i64)
}

fn utf8_or_empty(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_default()
}

/// Pop the 9 contract-deploy arguments off a decoded script. Anything above
/// them (trailing syscall items) is discarded first.
fn extract_reg_info(stack: &mut DataStack) -> Option<(Vec<u8>, NftRegInfo)> {
    if stack.len() < 9 {
        return None;
    }
    while stack.len() > 9 {
        stack.pop_data();
    }

    let contract_script = stack.pop_data()?;
    let contract_hash = script::script_hash(&contract_script);
    let parameter_list = hex::encode(stack.pop_data()?);
    let return_type = hex::encode(stack.pop_data()?);
    let need_storage = stack.pop_data()?.first() == Some(&0x01);

    let reg_info = NftRegInfo {
        name: utf8_or_empty(stack.pop_data()?),
        version: utf8_or_empty(stack.pop_data()?),
        author: utf8_or_empty(stack.pop_data()?),
        email: utf8_or_empty(stack.pop_data()?),
        description: utf8_or_empty(stack.pop_data()?),
        need_storage,
        parameter_list,
        return_type,
    };
    Some((contract_hash, reg_info))
}

// ---------------------------------------------------------------------------
// Startup reads
// ---------------------------------------------------------------------------

async fn load_asset_decimals(pool: &PgPool) -> Result<HashMap<String, u8>, sqlx::Error> {
    let rows: Vec<(String, i16)> = sqlx::query_as("SELECT asset_id, decimals FROM nft")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(|(id, d)| (id, d as u8)).collect())
}

async fn load_cursor(pool: &PgPool) -> Result<NftCursor, sqlx::Error> {
    let (last_tx_pk, app_log_idx): (i64, i32) =
        sqlx::query_as("SELECT last_tx_pk_for_nft, nft_app_log_idx FROM counter WHERE id = 1")
            .fetch_one(pool)
            .await?;
    Ok(NftCursor {
        last_tx_pk,
        app_log_idx,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notification(contract: &str, state: serde_json::Value) -> Notification {
        serde_json::from_value(json!({ "contract": contract, "state": state })).unwrap()
    }

    fn transfer_state(from: &str, to: &str, value: serde_json::Value, token: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "Array",
            "value": [
                {"type": "ByteArray", "value": TRANSFER_HEX},
                {"type": "ByteArray", "value": from},
                {"type": "ByteArray", "value": to},
                value,
                token,
            ]
        })
    }

    #[test]
    fn registration_scripts_need_every_method_name() {
        let full = REGISTRATION_MARKS.concat();
        assert!(is_nft_registration(&full));
        // Missing properties: an NEP-5 deploy, not an NFT one.
        let partial = REGISTRATION_MARKS[..8].concat();
        assert!(!is_nft_registration(&partial));
    }

    #[test]
    fn transfer_notifications_are_filtered_strictly() {
        let valid = notification(
            "0xa1a1",
            transfer_state(
                "",
                "68656c6c6f",
                json!({"type": "Integer", "value": "1"}),
                json!({"type": "Integer", "value": "7"}),
            ),
        );
        let notice = parse_transfer_notification(&valid).unwrap();
        assert_eq!(notice.asset_id, "a1a1");
        assert_eq!(notice.from_sc, "");
        assert_eq!(notice.to_sc, "68656c6c6f");

        // Wrong arity.
        let four = notification(
            "0xa1a1",
            json!({"type": "Array", "value": [
                {"type": "ByteArray", "value": TRANSFER_HEX},
                {"type": "ByteArray", "value": "aa"},
                {"type": "Integer", "value": "1"},
                {"type": "Integer", "value": "7"},
            ]}),
        );
        assert!(parse_transfer_notification(&four).is_none());

        // Boolean party.
        let boolean = notification(
            "0xa1a1",
            json!({"type": "Array", "value": [
                {"type": "ByteArray", "value": TRANSFER_HEX},
                {"type": "Boolean", "value": false},
                {"type": "ByteArray", "value": "aa"},
                {"type": "Integer", "value": "1"},
                {"type": "Integer", "value": "7"},
            ]}),
        );
        assert!(parse_transfer_notification(&boolean).is_none());

        // Both parties empty.
        let empty = notification(
            "0xa1a1",
            transfer_state(
                "",
                "",
                json!({"type": "Integer", "value": "1"}),
                json!({"type": "Integer", "value": "7"}),
            ),
        );
        assert!(parse_transfer_notification(&empty).is_none());

        // Wrong event tag.
        let approve = notification(
            "0xa1a1",
            json!({"type": "Array", "value": [
                {"type": "ByteArray", "value": "617070726f7665"},
                {"type": "ByteArray", "value": "aa"},
                {"type": "ByteArray", "value": "bb"},
                {"type": "Integer", "value": "1"},
                {"type": "Integer", "value": "7"},
            ]}),
        );
        assert!(parse_transfer_notification(&approve).is_none());
    }

    #[test]
    fn faulted_executions_contribute_no_notifications() {
        let log: ApplicationLog = serde_json::from_value(json!({
            "executions": [
                {
                    "vmstate": "FAULT, BREAK",
                    "notifications": [{"contract": "0xaa", "state": null}]
                },
                {
                    "vmstate": "HALT, BREAK",
                    "notifications": [{"contract": "0xbb", "state": null}]
                }
            ]
        }))
        .unwrap();
        let notifications = collect_notifications(&log);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].contract, "0xbb");
    }

    #[test]
    fn token_ids_canonicalize_across_encodings() {
        let from_int: StackItem =
            serde_json::from_value(json!({"type": "Integer", "value": "1"})).unwrap();
        let from_bytes: StackItem =
            serde_json::from_value(json!({"type": "ByteArray", "value": "0100"})).unwrap();
        assert_eq!(token_id(&from_int), Some("1".to_string()));
        assert_eq!(token_id(&from_bytes), Some("1".to_string()));

        let boolean: StackItem =
            serde_json::from_value(json!({"type": "Boolean", "value": true})).unwrap();
        assert_eq!(token_id(&boolean), None);
    }

    #[test]
    fn byte_array_values_scale_by_decimals() {
        // 0x0a00 little-endian = 10; with decimals=2 that is 0.10.
        let item: StackItem =
            serde_json::from_value(json!({"type": "ByteArray", "value": "0a00"})).unwrap();
        let value = scaled(item.as_bigint().unwrap(), 2);
        assert_eq!(value.to_string(), "0.10");
        assert_eq!(value, "0.1".parse::<BigDecimal>().unwrap());
    }

    #[test]
    fn reg_info_pops_deploy_arguments_in_order() {
        use crate::script::read_script;

        // A deploy script pushes description first and the contract bytes
        // last, followed by the create syscall.
        let contract_bytes = vec![0xDE, 0xAD, 0xBE, 0xEF];
        let mut script_hex = String::new();
        for data in [
            b"a demo token".as_slice(), // description
            b"demo@example.com",        // email
            b"demo author",             // author
            b"1.0",                     // version
            b"Demo",                    // name
        ] {
            script_hex.push_str(&format!("{:02x}", data.len()));
            script_hex.push_str(&hex::encode(data));
        }
        script_hex.push_str("51"); // needStorage = push 1
        script_hex.push_str(&format!("01{:02x}", 0x05)); // return type
        script_hex.push_str(&format!("02{}", hex::encode([0x07, 0x10]))); // parameter list
        script_hex.push_str(&format!("{:02x}{}", contract_bytes.len(), hex::encode(&contract_bytes)));
        script_hex.push_str("68134e656f2e436f6e74726163742e437265617465"); // syscall

        let mut stack = read_script(&script_hex).unwrap();
        let (contract_hash, reg_info) = extract_reg_info(&mut stack).unwrap();

        assert_eq!(contract_hash, script::script_hash(&contract_bytes));
        assert_eq!(reg_info.name, "Demo");
        assert_eq!(reg_info.version, "1.0");
        assert_eq!(reg_info.author, "demo author");
        assert_eq!(reg_info.email, "demo@example.com");
        assert_eq!(reg_info.description, "a demo token");
        assert!(reg_info.need_storage);
        assert_eq!(reg_info.parameter_list, "0710");
        assert_eq!(reg_info.return_type, "05");
    }

    #[test]
    fn reg_info_rejects_short_stacks() {
        let mut stack = script::read_script("515151").unwrap();
        assert!(extract_reg_info(&mut stack).is_none());
    }

    #[test]
    fn invalid_utf8_strings_become_empty() {
        assert_eq!(utf8_or_empty(vec![0xFF, 0xFE]), "");
        assert_eq!(utf8_or_empty(b"ok".to_vec()), "ok");
    }
}
