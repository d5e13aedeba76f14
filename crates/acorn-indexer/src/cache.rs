//! Process-wide address / asset state.
//!
//! Within a batch the cache is the source of truth: the classifier reads
//! balances and supplies from it before falling back to RPC, and the single
//! writer folds every committed mutation back in. It is rebuilt from SQL on
//! every pipeline (re)start, so memory can never run ahead of the database
//! after a failed commit.

use std::collections::HashMap;
use std::sync::RwLock;

use acorn_common::AcornError;
use bigdecimal::BigDecimal;
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct CachedBalance {
    pub balance: BigDecimal,
    /// Height the balance was observed at; a cached value is only valid for
    /// a transaction at a strictly lower block index.
    pub block_index: u32,
}

#[derive(Debug, Default)]
struct AddrEntry {
    created_at: u64,
    last_tx_time: u64,
    assets: HashMap<String, CachedBalance>,
}

#[derive(Debug, Clone)]
struct SupplyEntry {
    total_supply: BigDecimal,
    at_height: u32,
}

/// Result of folding an observed block time into an address entry.
#[derive(Debug, PartialEq, Eq)]
pub struct AddrTouch {
    pub created: bool,
    /// Set when the observation moved `created_at` backwards.
    pub new_created_at: Option<u64>,
    /// Set when the observation moved `last_transaction_time` forwards.
    pub new_last_tx_time: Option<u64>,
}

#[derive(Default)]
pub struct AddrAssetCache {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    addrs: HashMap<String, AddrEntry>,
    supplies: HashMap<String, SupplyEntry>,
}

impl AddrAssetCache {
    /// Rehydrate from SQL: every known address plus its aggregated NFT
    /// balance per asset. Loaded balances carry block index 0 so they are
    /// never mistaken for fresher-than-chain observations.
    pub async fn load(pool: &PgPool) -> Result<Self, AcornError> {
        let addr_rows: Vec<(String, i64, i64)> =
            sqlx::query_as("SELECT address, created_at, last_transaction_time FROM address")
                .fetch_all(pool)
                .await?;
        let balance_rows: Vec<(String, String, BigDecimal)> = sqlx::query_as(
            "SELECT address, asset_id, SUM(balance) AS balance
             FROM addr_asset_nft GROUP BY address, asset_id",
        )
        .fetch_all(pool)
        .await?;

        let mut inner = Inner::default();
        for (address, created_at, last_tx_time) in addr_rows {
            inner.addrs.insert(
                address,
                AddrEntry {
                    created_at: created_at as u64,
                    last_tx_time: last_tx_time as u64,
                    assets: HashMap::new(),
                },
            );
        }
        for (address, asset_id, balance) in balance_rows {
            inner.addrs.entry(address).or_default().assets.insert(
                asset_id,
                CachedBalance {
                    balance,
                    block_index: 0,
                },
            );
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub fn addr_asset_balance(&self, address: &str, asset_id: &str) -> Option<CachedBalance> {
        self.read()
            .addrs
            .get(address)
            .and_then(|entry| entry.assets.get(asset_id))
            .cloned()
    }

    pub fn total_supply(&self, asset_id: &str) -> Option<(BigDecimal, u32)> {
        self.read()
            .supplies
            .get(asset_id)
            .map(|s| (s.total_supply.clone(), s.at_height))
    }

    pub fn set_total_supply(&self, asset_id: &str, total_supply: BigDecimal, at_height: u32) {
        self.write().supplies.insert(
            asset_id.to_string(),
            SupplyEntry {
                total_supply,
                at_height,
            },
        );
    }

    /// Fold an observed block time into the address entry, creating it if
    /// unseen. `created_at` only ever moves backwards and
    /// `last_transaction_time` only forwards; pipelines for other asset
    /// classes touch the same rows out of block order.
    pub fn touch_addr(&self, address: &str, block_time: u64) -> AddrTouch {
        let mut inner = self.write();
        match inner.addrs.get_mut(address) {
            None => {
                inner.addrs.insert(
                    address.to_string(),
                    AddrEntry {
                        created_at: block_time,
                        last_tx_time: block_time,
                        assets: HashMap::new(),
                    },
                );
                AddrTouch {
                    created: true,
                    new_created_at: None,
                    new_last_tx_time: None,
                }
            }
            Some(entry) => {
                let mut touch = AddrTouch {
                    created: false,
                    new_created_at: None,
                    new_last_tx_time: None,
                };
                if block_time < entry.created_at {
                    entry.created_at = block_time;
                    touch.new_created_at = Some(block_time);
                }
                if block_time > entry.last_tx_time {
                    entry.last_tx_time = block_time;
                    touch.new_last_tx_time = Some(block_time);
                }
                touch
            }
        }
    }

    /// Returns the previous cached balance for `(address, asset)`, or `None`
    /// if the pair was just created with `balance`.
    pub fn get_or_create_addr_asset(
        &self,
        address: &str,
        asset_id: &str,
        balance: &BigDecimal,
    ) -> Option<BigDecimal> {
        let mut inner = self.write();
        let entry = inner.addrs.entry(address.to_string()).or_default();
        match entry.assets.get(asset_id) {
            Some(cached) => Some(cached.balance.clone()),
            None => {
                entry.assets.insert(
                    asset_id.to_string(),
                    CachedBalance {
                        balance: balance.clone(),
                        block_index: 0,
                    },
                );
                None
            }
        }
    }

    pub fn set_addr_asset_balance(
        &self,
        address: &str,
        asset_id: &str,
        balance: BigDecimal,
        block_index: u32,
    ) {
        let mut inner = self.write();
        let entry = inner.addrs.entry(address.to_string()).or_default();
        entry.assets.insert(
            asset_id.to_string(),
            CachedBalance {
                balance,
                block_index,
            },
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("cache lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("cache lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_addr_folds_timestamps_monotonically() {
        let cache = AddrAssetCache::default();

        let first = cache.touch_addr("AdTkzzzz", 1000);
        assert!(first.created);

        // Later block: only last_transaction_time moves.
        let later = cache.touch_addr("AdTkzzzz", 1500);
        assert_eq!(
            later,
            AddrTouch {
                created: false,
                new_created_at: None,
                new_last_tx_time: Some(1500),
            }
        );

        // Earlier block from a concurrent pipeline: only created_at moves.
        let earlier = cache.touch_addr("AdTkzzzz", 900);
        assert_eq!(
            earlier,
            AddrTouch {
                created: false,
                new_created_at: Some(900),
                new_last_tx_time: None,
            }
        );
    }

    #[test]
    fn addr_asset_creation_reports_no_previous_balance() {
        let cache = AddrAssetCache::default();
        cache.touch_addr("addr", 10);

        let one = BigDecimal::from(1);
        assert_eq!(cache.get_or_create_addr_asset("addr", "a1", &one), None);
        // Second observation sees the balance the first one seeded.
        assert_eq!(
            cache.get_or_create_addr_asset("addr", "a1", &BigDecimal::from(5)),
            Some(one.clone())
        );

        cache.set_addr_asset_balance("addr", "a1", BigDecimal::from(0), 42);
        let cached = cache.addr_asset_balance("addr", "a1").unwrap();
        assert_eq!(cached.balance, BigDecimal::from(0));
        assert_eq!(cached.block_index, 42);
    }

    #[test]
    fn total_supply_round_trips() {
        let cache = AddrAssetCache::default();
        assert!(cache.total_supply("a1").is_none());
        cache.set_total_supply("a1", BigDecimal::from(100), 777);
        assert_eq!(cache.total_supply("a1"), Some((BigDecimal::from(100), 777)));
    }
}
