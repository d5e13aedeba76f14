use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Invocation transaction as read from the upstream `tx` table.
/// Produced by the block ingester; this crate only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub pk: i64,
    pub txid: String,
    pub block_index: u32,
    pub block_time: u64,
    /// Invocation script, hex encoded.
    pub script: String,
}

/// NFT asset as stored in the `nft` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftAsset {
    pub asset_id: String,
    pub admin_address: String,
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub total_supply: BigDecimal,
    pub txid: String,
    pub block_index: u32,
    pub block_time: u64,
    pub addresses: u64,
    pub holding_addresses: u64,
    pub transfers: u64,
}

/// Contract registration arguments as stored in `nft_reg_info`.
/// Extracted from the deploy script's argument stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftRegInfo {
    pub name: String,
    pub version: String,
    pub author: String,
    pub email: String,
    pub description: String,
    pub need_storage: bool,
    /// Hex encoded parameter list byte string.
    pub parameter_list: String,
    /// Hex encoded return type byte.
    pub return_type: String,
}

/// A row of the append-only `nft_tx` transfer history table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NftTxRecord {
    pub id: i64,
    pub txid: String,
    pub from_addr: String,
    pub to_addr: String,
    pub block_time: i64,
}

/// Dual progress cursor for the NFT pipeline, one row in `counter`.
/// `app_log_idx == -1` means the transaction at `last_tx_pk` is fully
/// handled and processing resumes at `last_tx_pk + 1`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NftCursor {
    pub last_tx_pk: i64,
    pub app_log_idx: i32,
}
