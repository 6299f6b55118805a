//! Persistence: record layouts and storage traits.
//!
//! The store is an opaque-byte key-value collaborator; this module owns the
//! JSON layouts written into it. Method-data inside a swap record is an
//! untagged union: the variant is detected on load by field presence, not by
//! a type tag (a compatibility requirement of the wire format).

use crate::error::Result;
use crate::evm::{EvmHtlcState, EvmSwapParams};
use crate::swap::SwapState;
use crate::types::{Network, Role, SwapMethod, hex_bytes32_opt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// Type alias for storage futures (Send, for multi-threaded runtimes).
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Swap records
// ---------------------------------------------------------------------------

/// Per-chain MuSig2 session state that survives a restart.
///
/// The secret nonce and any in-flight signing round are deliberately not
/// persisted; after a restart the parties exchange fresh nonces and the old
/// public nonce stays in the consumed set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Musig2ChainRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taproot_addr: Option<String>,
    /// X-only refund key of this chain's funder (hex), if a refund leaf
    /// was committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_blocks: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pub_nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_nonce: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_sig: Option<String>,
    #[serde(default)]
    pub used_nonces: Vec<String>,
    #[serde(default)]
    pub nonce_used: bool,
    #[serde(default)]
    pub session_invalid: bool,
}

/// MuSig2 method data: one session per chain plus the shared key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Musig2Record {
    pub local_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_pub: Option<String>,
    /// Ephemeral private key (hex). Omitted under a no-key-at-rest policy;
    /// such swaps load read-only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_priv: Option<String>,
    #[serde(default)]
    pub wallet_addrs: HashMap<String, String>,
    pub offer_session: Musig2ChainRecord,
    pub request_session: Musig2ChainRecord,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret: Option<[u8; 32]>,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<[u8; 32]>,
}

/// Per-chain HTLC escrow state that survives a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HtlcChainRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub htlc_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeem_script: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_blocks: Option<u16>,
}

/// UTXO-HTLC method data for both chains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinHtlcRecord {
    pub local_pub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_priv: Option<String>,
    #[serde(default)]
    pub wallet_addrs: HashMap<String, String>,
    pub offer_htlc: HtlcChainRecord,
    pub request_htlc: HtlcChainRecord,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret: Option<[u8; 32]>,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<[u8; 32]>,
}

/// Per-chain EVM contract escrow state that survives a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmChainRecord {
    pub chain_id: u64,
    /// Contract address (0x hex).
    pub contract: String,
    /// Contract-side swap id (hex of keccak(trade_id)).
    pub swap_id: String,
    pub htlc_state: EvmHtlcState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<EvmSwapParams>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fund_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_tx: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_tx: Option<String>,
}

/// EVM-HTLC method data: one contract escrow per chain plus the shared key
/// material.
///
/// The field names differ from the UTXO pair on purpose: variant detection
/// is by field presence, so `offer_contract` must not collide with
/// `offer_htlc` or `offer_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmHtlcRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_pub: Option<String>,
    #[serde(default)]
    pub wallet_addrs: HashMap<String, String>,
    pub offer_contract: EvmChainRecord,
    pub request_contract: EvmChainRecord,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret: Option<[u8; 32]>,
    #[serde(default, with = "hex_bytes32_opt", skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<[u8; 32]>,
}

/// Cross-chain method data: UTXO HTLC on one side, EVM HTLC on the other.
/// Keys, secrets and wallet addresses live in `bitcoin_htlc`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossChainRecord {
    pub bitcoin_htlc: BitcoinHtlcRecord,
    pub evm_htlc: EvmChainRecord,
}

/// Method-specific swap data. Detection on load is by field presence:
/// `bitcoin_htlc`+`evm_htlc` means cross-chain, `offer_session` MuSig2,
/// `offer_htlc` UTXO HTLC, and `offer_contract` EVM HTLC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MethodData {
    CrossChain(CrossChainRecord),
    Musig2(Musig2Record),
    BitcoinHtlc(BitcoinHtlcRecord),
    EvmHtlc(EvmHtlcRecord),
}

impl MethodData {
    pub fn method(&self) -> SwapMethod {
        match self {
            MethodData::Musig2(_) => SwapMethod::Musig2,
            _ => SwapMethod::Htlc,
        }
    }
}

/// The persisted swap record (JSON, compact stable field names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapRecord {
    pub trade_id: String,
    pub order_id: String,
    pub our_role: Role,
    pub is_maker: bool,
    pub network: Network,
    pub offer_chain: String,
    pub offer_amount: u64,
    pub request_chain: String,
    pub request_amount: u64,
    pub state: SwapState,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_funding_tx_id: Option<String>,
    #[serde(default)]
    pub local_funding_vout: u32,
    #[serde(default)]
    pub local_funding_confs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_funding_tx_id: Option<String>,
    #[serde(default)]
    pub remote_funding_vout: u32,
    #[serde(default)]
    pub remote_funding_confs: u32,
    #[serde(default)]
    pub start_height: u64,
    pub timeout_height: u64,
    #[serde(default)]
    pub request_start_height: u64,
    pub request_timeout_height: u64,
    pub method_data: MethodData,
}

// ---------------------------------------------------------------------------
// Order / trade records (gossip-synced)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Expired,
}

/// An order as gossiped between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub id: String,
    pub maker_peer: String,
    pub offer_chain: String,
    pub offer_amount: u64,
    pub request_chain: String,
    pub request_amount: u64,
    pub method: SwapMethod,
    pub status: OrderStatus,
    pub created_at: i64,
    pub updated_at: i64,
    /// True for orders this node authored; never overwritten by sync.
    #[serde(default)]
    pub is_local: bool,
}

/// Trade lifecycle as gossiped between participants. Sync only advances a
/// trade to a strictly later state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeState {
    Init,
    Accepted,
    Funding,
    Funded,
    Redeemed,
    Refunded,
    Failed,
    Aborted,
}

impl TradeState {
    /// Position in the terminal order
    /// `init < accepted < funding < funded < {redeemed, refunded, failed, aborted}`.
    pub fn rank(self) -> u8 {
        match self {
            TradeState::Init => 0,
            TradeState::Accepted => 1,
            TradeState::Funding => 2,
            TradeState::Funded => 3,
            TradeState::Redeemed
            | TradeState::Refunded
            | TradeState::Failed
            | TradeState::Aborted => 4,
        }
    }

    pub fn is_strictly_later_than(self, other: TradeState) -> bool {
        self.rank() > other.rank()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub order_id: String,
    pub maker_peer: String,
    pub taker_peer: String,
    pub state: TradeState,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A derived wallet address, persisted so indices are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAddressRecord {
    pub chain: String,
    pub account: u32,
    pub change: u32,
    pub address_index: u32,
    pub address: String,
}

// ---------------------------------------------------------------------------
// Storage traits
// ---------------------------------------------------------------------------

/// Query for [`OrderStore::list_orders`].
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    /// Only records with `created_at > since`.
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

/// Query for [`TradeStore::list_trades`].
#[derive(Debug, Clone, Default)]
pub struct TradeFilter {
    /// Only trades where this peer is maker or taker.
    pub participant: Option<String>,
    pub since: Option<i64>,
    pub limit: Option<usize>,
}

pub trait SwapStore: Send + Sync {
    /// Upsert a swap record (transactional per record).
    fn save_swap(&self, record: &SwapRecord) -> StoreFuture<'_, ()>;

    fn get_swap(&self, trade_id: &str) -> StoreFuture<'_, Option<SwapRecord>>;

    /// All swaps in a non-terminal state.
    fn get_pending_swaps(&self) -> StoreFuture<'_, Vec<SwapRecord>>;

    fn list_swaps(&self, limit: usize, include_completed: bool)
    -> StoreFuture<'_, Vec<SwapRecord>>;
}

pub trait OrderStore: Send + Sync {
    /// Insert a new order; fails if the id exists.
    fn create_order(&self, record: &OrderRecord) -> StoreFuture<'_, ()>;

    /// Upsert an order record.
    fn save_order(&self, record: &OrderRecord) -> StoreFuture<'_, ()>;

    fn get_order(&self, id: &str) -> StoreFuture<'_, Option<OrderRecord>>;

    fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<OrderRecord>>;
}

pub trait TradeStore: Send + Sync {
    fn create_trade(&self, record: &TradeRecord) -> StoreFuture<'_, ()>;

    fn get_trade(&self, id: &str) -> StoreFuture<'_, Option<TradeRecord>>;

    fn update_trade_state(&self, id: &str, state: TradeState) -> StoreFuture<'_, ()>;

    fn list_trades(&self, filter: TradeFilter) -> StoreFuture<'_, Vec<TradeRecord>>;
}

pub trait AddressIndexStore: Send + Sync {
    /// Allocate the next derivation index for `(chain, account, change)`.
    /// Allocation is monotone: an index is never handed out twice.
    fn next_address_index(&self, chain: &str, account: u32, change: u32)
    -> StoreFuture<'_, u32>;

    fn save_wallet_address(&self, record: &WalletAddressRecord) -> StoreFuture<'_, ()>;
}

/// The full persistence surface the engine consumes.
pub trait Store: SwapStore + OrderStore + TradeStore + AddressIndexStore {}

impl<T: SwapStore + OrderStore + TradeStore + AddressIndexStore> Store for T {}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// In-memory store used by tests and local development.
pub mod memory {
    use super::*;
    use crate::error::Error;
    use std::sync::RwLock;

    /// Simple in-memory store; every collection behind its own lock.
    #[derive(Default)]
    pub struct MemoryStore {
        swaps: RwLock<HashMap<String, SwapRecord>>,
        orders: RwLock<HashMap<String, OrderRecord>>,
        trades: RwLock<HashMap<String, TradeRecord>>,
        indices: RwLock<HashMap<(String, u32, u32), u32>>,
        addresses: RwLock<Vec<WalletAddressRecord>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl SwapStore for MemoryStore {
        fn save_swap(&self, record: &SwapRecord) -> StoreFuture<'_, ()> {
            let record = record.clone();
            Box::pin(async move {
                self.swaps
                    .write()
                    .unwrap()
                    .insert(record.trade_id.clone(), record);
                Ok(())
            })
        }

        fn get_swap(&self, trade_id: &str) -> StoreFuture<'_, Option<SwapRecord>> {
            let trade_id = trade_id.to_string();
            Box::pin(async move { Ok(self.swaps.read().unwrap().get(&trade_id).cloned()) })
        }

        fn get_pending_swaps(&self) -> StoreFuture<'_, Vec<SwapRecord>> {
            Box::pin(async move {
                Ok(self
                    .swaps
                    .read()
                    .unwrap()
                    .values()
                    .filter(|r| !r.state.is_terminal())
                    .cloned()
                    .collect())
            })
        }

        fn list_swaps(
            &self,
            limit: usize,
            include_completed: bool,
        ) -> StoreFuture<'_, Vec<SwapRecord>> {
            Box::pin(async move {
                let swaps = self.swaps.read().unwrap();
                let mut records: Vec<SwapRecord> = swaps
                    .values()
                    .filter(|r| include_completed || !r.state.is_terminal())
                    .cloned()
                    .collect();
                records.sort_by_key(|r| std::cmp::Reverse(r.created_at));
                records.truncate(limit);
                Ok(records)
            })
        }
    }

    impl OrderStore for MemoryStore {
        fn create_order(&self, record: &OrderRecord) -> StoreFuture<'_, ()> {
            let record = record.clone();
            Box::pin(async move {
                let mut orders = self.orders.write().unwrap();
                if orders.contains_key(&record.id) {
                    return Err(Error::StoreIO(format!("order {} exists", record.id)));
                }
                orders.insert(record.id.clone(), record);
                Ok(())
            })
        }

        fn save_order(&self, record: &OrderRecord) -> StoreFuture<'_, ()> {
            let record = record.clone();
            Box::pin(async move {
                self.orders
                    .write()
                    .unwrap()
                    .insert(record.id.clone(), record);
                Ok(())
            })
        }

        fn get_order(&self, id: &str) -> StoreFuture<'_, Option<OrderRecord>> {
            let id = id.to_string();
            Box::pin(async move { Ok(self.orders.read().unwrap().get(&id).cloned()) })
        }

        fn list_orders(&self, filter: OrderFilter) -> StoreFuture<'_, Vec<OrderRecord>> {
            Box::pin(async move {
                let orders = self.orders.read().unwrap();
                let mut records: Vec<OrderRecord> = orders
                    .values()
                    .filter(|o| filter.status.is_none_or(|s| o.status == s))
                    .filter(|o| filter.since.is_none_or(|t| o.created_at > t))
                    .cloned()
                    .collect();
                records.sort_by_key(|o| o.created_at);
                if let Some(limit) = filter.limit {
                    records.truncate(limit);
                }
                Ok(records)
            })
        }
    }

    impl TradeStore for MemoryStore {
        fn create_trade(&self, record: &TradeRecord) -> StoreFuture<'_, ()> {
            let record = record.clone();
            Box::pin(async move {
                let mut trades = self.trades.write().unwrap();
                if trades.contains_key(&record.id) {
                    return Err(Error::StoreIO(format!("trade {} exists", record.id)));
                }
                trades.insert(record.id.clone(), record);
                Ok(())
            })
        }

        fn get_trade(&self, id: &str) -> StoreFuture<'_, Option<TradeRecord>> {
            let id = id.to_string();
            Box::pin(async move { Ok(self.trades.read().unwrap().get(&id).cloned()) })
        }

        fn update_trade_state(&self, id: &str, state: TradeState) -> StoreFuture<'_, ()> {
            let id = id.to_string();
            Box::pin(async move {
                let mut trades = self.trades.write().unwrap();
                let trade = trades
                    .get_mut(&id)
                    .ok_or_else(|| Error::StoreIO(format!("trade {id} not found")))?;
                trade.state = state;
                trade.updated_at = time::OffsetDateTime::now_utc().unix_timestamp();
                Ok(())
            })
        }

        fn list_trades(&self, filter: TradeFilter) -> StoreFuture<'_, Vec<TradeRecord>> {
            Box::pin(async move {
                let trades = self.trades.read().unwrap();
                let mut records: Vec<TradeRecord> = trades
                    .values()
                    .filter(|t| {
                        filter
                            .participant
                            .as_ref()
                            .is_none_or(|p| &t.maker_peer == p || &t.taker_peer == p)
                    })
                    .filter(|t| filter.since.is_none_or(|s| t.created_at > s))
                    .cloned()
                    .collect();
                records.sort_by_key(|t| t.created_at);
                if let Some(limit) = filter.limit {
                    records.truncate(limit);
                }
                Ok(records)
            })
        }
    }

    impl AddressIndexStore for MemoryStore {
        fn next_address_index(
            &self,
            chain: &str,
            account: u32,
            change: u32,
        ) -> StoreFuture<'_, u32> {
            let chain = chain.to_string();
            Box::pin(async move {
                let mut indices = self.indices.write().unwrap();
                let counter = indices.entry((chain, account, change)).or_insert(0);
                let index = *counter;
                *counter += 1;
                Ok(index)
            })
        }

        fn save_wallet_address(&self, record: &WalletAddressRecord) -> StoreFuture<'_, ()> {
            let record = record.clone();
            Box::pin(async move {
                self.addresses.write().unwrap().push(record);
                Ok(())
            })
        }
    }
}
