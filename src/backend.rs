//! External collaborator contracts: chain backend and wallet.
//!
//! The engine consumes these by interface only. Implementations (Esplora,
//! Core RPC, hardware wallets, ...) live outside the core; futures are boxed
//! so the traits stay object-safe for `Arc<dyn ...>` sharing.

use crate::error::{Error, Result};
use crate::txbuilder::AddressType;
use bitcoin::secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Type alias for backend futures (Send, for multi-threaded runtimes).
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Default deadline for confirmation polls and other short backend calls.
pub const BACKEND_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// A transaction as the backend sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxInfo {
    pub hex: String,
    pub confirmations: u32,
}

/// An unspent output on some address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressUtxo {
    pub tx_id: String,
    pub vout: u32,
    pub amount: u64,
    pub address: String,
    pub address_type: AddressType,
}

/// Fee estimates in sat/vB.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeEstimates {
    pub fastest_fee: Option<u64>,
    pub half_hour_fee: Option<u64>,
    pub hour_fee: Option<u64>,
}

/// One input of a transaction in an address's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTxInput {
    /// Address of the previous output this input spends, if known.
    pub prev_out_address: Option<String>,
    /// Witness stack items.
    pub witness: Vec<Vec<u8>>,
}

/// A transaction touching a watched address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTx {
    pub tx_id: String,
    pub inputs: Vec<HistoryTxInput>,
}

/// Chain access for one UTXO chain.
pub trait ChainBackend: Send + Sync {
    fn get_block_height(&self) -> BackendFuture<'_, u64>;

    /// Returns `Ok(None)` for unknown transactions.
    fn get_transaction(&self, tx_id: &str) -> BackendFuture<'_, Option<TxInfo>>;

    fn get_address_utxos(&self, address: &str) -> BackendFuture<'_, Vec<AddressUtxo>>;

    /// Transactions spending from or paying to `address`, newest first.
    fn get_address_txs(&self, address: &str) -> BackendFuture<'_, Vec<HistoryTx>>;

    fn get_fee_estimates(&self) -> BackendFuture<'_, FeeEstimates>;

    /// Broadcast a raw transaction; returns the txid.
    fn broadcast_transaction(&self, tx_hex: &str) -> BackendFuture<'_, String>;
}

/// A wallet UTXO with its HD derivation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletUtxo {
    pub tx_id: String,
    pub vout: u32,
    pub amount: u64,
    pub address: String,
    pub address_type: AddressType,
    pub account: u32,
    /// 0 = external, 1 = change.
    pub change: u32,
    pub address_index: u32,
}

/// HD wallet access: key derivation and UTXO enumeration.
pub trait WalletProvider: Send + Sync {
    fn derive_address(
        &self,
        chain: &str,
        account: u32,
        change: u32,
        index: u32,
    ) -> BackendFuture<'_, String>;

    fn derive_private_key(
        &self,
        chain: &str,
        account: u32,
        change: u32,
        index: u32,
    ) -> BackendFuture<'_, SecretKey>;

    fn list_all_utxos(&self, chain: &str) -> BackendFuture<'_, Vec<WalletUtxo>>;
}

/// Wrap a backend call with a deadline; the error names the operation.
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::ChainIO(format!("{operation}: deadline exceeded")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_surfaces_as_chain_io() {
        let err = with_deadline("get_block_height", Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1u64)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ChainIO(_)));
    }

    #[tokio::test]
    async fn deadline_passes_fast_results_through() {
        let height = with_deadline("get_block_height", Duration::from_secs(1), async { Ok(42u64) })
            .await
            .unwrap();
        assert_eq!(height, 42);
    }
}
