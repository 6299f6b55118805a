//! EVM HTLC escrow.
//!
//! The account-chain side of a cross-chain swap is an on-chain HTLC vault
//! contract. This module owns the ABI-typed interface to that contract, a
//! per-swap session that tracks contract state and transaction hashes, and
//! the `EvmRpc` transport trait with an HTTP JSON-RPC implementation.
//!
//! Transaction signing and nonce management live behind the RPC boundary
//! (`eth_sendTransaction` against a wallet-backed node or external signer);
//! the core produces calldata and decodes logs.

use crate::chains::{self, ChainParams};
use crate::error::{Error, Result};
use crate::types::{Network, sha256};
use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_sol_types::{SolCall, SolEvent, sol};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

sol! {
    /// HTLC vault contract shared by all EVM swaps.
    interface HtlcVault {
        function newSwap(bytes32 swapId, address receiver, bytes32 secretHash, uint256 timelock) external payable;
        function claim(bytes32 swapId, bytes32 secret) external;
        function refund(bytes32 swapId) external;

        event Claimed(bytes32 indexed swapId, bytes32 secret);
        event Refunded(bytes32 indexed swapId);
    }
}

/// Type alias for RPC futures (Send, for multi-threaded runtimes).
pub type RpcFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Log query for [`EvmRpc::get_logs`].
#[derive(Debug, Clone)]
pub struct LogFilter {
    pub address: Address,
    /// Topic values matched positionally (topic0 = event signature).
    pub topics: Vec<B256>,
    pub from_block: u64,
}

/// One log returned by the node.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub tx_hash: B256,
    pub block_number: u64,
}

/// Minimal JSON-RPC surface the EVM escrow consumes.
pub trait EvmRpc: Send + Sync {
    fn block_number(&self) -> RpcFuture<'_, u64>;
    fn call(&self, to: Address, data: Vec<u8>) -> RpcFuture<'_, Vec<u8>>;
    fn send_transaction(&self, to: Address, data: Vec<u8>, value: U256) -> RpcFuture<'_, B256>;
    fn get_logs(&self, filter: LogFilter) -> RpcFuture<'_, Vec<LogEntry>>;
    /// Confirmations of a mined transaction; 0 while pending or unknown.
    fn transaction_confirmations(&self, tx_hash: B256) -> RpcFuture<'_, u32>;
}

/// Lifecycle of the contract-side escrow for one swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvmHtlcState {
    Created,
    Funded,
    Claimed,
    Refunded,
}

/// Parameters the contract escrow was (or will be) opened with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvmSwapParams {
    pub receiver: Address,
    pub amount: U256,
    /// Block height after which the funder may refund.
    pub timelock: u64,
}

/// Per-chain HTLC state holder (EVM variant).
pub struct EvmHtlcSession {
    chain: &'static ChainParams,
    #[allow(dead_code)]
    network: Network,
    chain_id: u64,
    contract: Address,
    swap_id: B256,
    secret: Option<[u8; 32]>,
    secret_hash: Option<[u8; 32]>,
    params: Option<EvmSwapParams>,
    state: EvmHtlcState,
    fund_tx: Option<B256>,
    claim_tx: Option<B256>,
    refund_tx: Option<B256>,
    rpc: Arc<dyn EvmRpc>,
}

impl EvmHtlcSession {
    pub fn new(
        symbol: &str,
        network: Network,
        chain_id: u64,
        contract: Address,
        trade_id: &str,
        rpc: Arc<dyn EvmRpc>,
    ) -> Result<Self> {
        let chain = chains::get(symbol)?;
        if !chain.is_evm() {
            return Err(Error::UnsupportedChain(format!(
                "{} is not an EVM chain",
                chain.symbol
            )));
        }

        Ok(Self {
            chain,
            network,
            chain_id,
            contract,
            swap_id: keccak256(trade_id.as_bytes()),
            secret: None,
            secret_hash: None,
            params: None,
            state: EvmHtlcState::Created,
            fund_tx: None,
            claim_tx: None,
            refund_tx: None,
            rpc,
        })
    }

    pub fn chain_symbol(&self) -> &'static str {
        self.chain.symbol
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    pub fn swap_id(&self) -> B256 {
        self.swap_id
    }

    pub fn state(&self) -> EvmHtlcState {
        self.state
    }

    pub fn fund_tx(&self) -> Option<B256> {
        self.fund_tx
    }

    pub fn claim_tx(&self) -> Option<B256> {
        self.claim_tx
    }

    pub fn refund_tx(&self) -> Option<B256> {
        self.refund_tx
    }

    pub fn params(&self) -> Option<&EvmSwapParams> {
        self.params.as_ref()
    }

    pub fn secret(&self) -> Option<[u8; 32]> {
        self.secret
    }

    pub fn secret_hash(&self) -> Option<[u8; 32]> {
        self.secret_hash
    }

    pub fn set_secret_hash(&mut self, hash: [u8; 32]) -> Result<()> {
        if let Some(secret) = self.secret {
            if sha256(&secret) != hash {
                return Err(Error::SecretMismatch);
            }
        }
        self.secret_hash = Some(hash);
        Ok(())
    }

    pub fn set_secret(&mut self, secret: [u8; 32]) -> Result<()> {
        let hash = sha256(&secret);
        match self.secret_hash {
            Some(expected) if expected != hash => return Err(Error::SecretMismatch),
            _ => {}
        }
        self.secret = Some(secret);
        self.secret_hash = Some(hash);
        Ok(())
    }

    /// Open the contract escrow: lock `amount` for `receiver` until `timelock`.
    pub async fn fund(&mut self, receiver: Address, amount: U256, timelock: u64) -> Result<B256> {
        if self.fund_tx.is_some() {
            return Err(Error::AlreadyFunded(hex::encode(self.swap_id)));
        }
        let hash = self
            .secret_hash
            .ok_or_else(|| Error::NotReadyToSign("secret hash not set".to_string()))?;

        let data = HtlcVault::newSwapCall {
            swapId: self.swap_id,
            receiver,
            secretHash: B256::from(hash),
            timelock: U256::from(timelock),
        }
        .abi_encode();

        let tx = self.rpc.send_transaction(self.contract, data, amount).await?;
        self.params = Some(EvmSwapParams {
            receiver,
            amount,
            timelock,
        });
        self.fund_tx = Some(tx);
        self.state = EvmHtlcState::Funded;
        log::info!(
            "funded EVM HTLC {} on {} (tx {tx})",
            hex::encode(self.swap_id),
            self.chain.symbol
        );
        Ok(tx)
    }

    /// Claim the escrow by revealing the preimage.
    pub async fn claim(&mut self, secret: [u8; 32]) -> Result<B256> {
        self.set_secret(secret)?;

        let data = HtlcVault::claimCall {
            swapId: self.swap_id,
            secret: B256::from(secret),
        }
        .abi_encode();

        let tx = self
            .rpc
            .send_transaction(self.contract, data, U256::ZERO)
            .await?;
        self.claim_tx = Some(tx);
        self.state = EvmHtlcState::Claimed;
        Ok(tx)
    }

    /// Refund the escrow after the timelock elapsed.
    pub async fn refund(&mut self) -> Result<B256> {
        let data = HtlcVault::refundCall {
            swapId: self.swap_id,
        }
        .abi_encode();

        let tx = self
            .rpc
            .send_transaction(self.contract, data, U256::ZERO)
            .await?;
        self.refund_tx = Some(tx);
        self.state = EvmHtlcState::Refunded;
        Ok(tx)
    }

    /// Look for a `Claimed` event for this swap and extract the preimage.
    ///
    /// Returns `Ok(None)` while no claim has landed. A preimage whose SHA-256
    /// does not match the expected hash is a hard error.
    pub async fn poll_claimed(&self, from_block: u64) -> Result<Option<([u8; 32], B256)>> {
        let logs = self
            .rpc
            .get_logs(LogFilter {
                address: self.contract,
                topics: vec![HtlcVault::Claimed::SIGNATURE_HASH, self.swap_id],
                from_block,
            })
            .await?;

        for log in logs {
            if log.data.len() < 32 {
                continue;
            }
            let mut secret = [0u8; 32];
            secret.copy_from_slice(&log.data[..32]);
            if let Some(expected) = self.secret_hash {
                if sha256(&secret) != expected {
                    return Err(Error::SecretMismatch);
                }
            }
            return Ok(Some((secret, log.tx_hash)));
        }
        Ok(None)
    }

    /// Restore persisted session state after a process restart.
    pub fn restore(
        &mut self,
        state: EvmHtlcState,
        params: Option<EvmSwapParams>,
        fund_tx: Option<B256>,
        claim_tx: Option<B256>,
        refund_tx: Option<B256>,
    ) {
        self.state = state;
        self.params = params;
        self.fund_tx = fund_tx;
        self.claim_tx = claim_tx;
        self.refund_tx = refund_tx;
    }
}

/// HTTP JSON-RPC client for EVM nodes.
pub struct HttpEvmRpc {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpEvmRpc {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }

    async fn request(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ChainIO(format!("{method}: {e}")))?;

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::ChainIO(format!("{method}: {e}")))?;

        if let Some(err) = value.get("error") {
            return Err(Error::ChainIO(format!("{method}: {err}")));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| Error::ChainIO(format!("{method}: missing result")))
    }

    fn parse_quantity(value: &serde_json::Value) -> Result<u64> {
        let s = value
            .as_str()
            .ok_or_else(|| Error::ChainIO("expected hex quantity".to_string()))?;
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|e| Error::ChainIO(format!("hex quantity: {e}")))
    }

    fn parse_b256(value: &serde_json::Value) -> Result<B256> {
        let s = value
            .as_str()
            .ok_or_else(|| Error::ChainIO("expected 32-byte hex".to_string()))?;
        s.parse::<B256>()
            .map_err(|e| Error::ChainIO(format!("hex hash: {e}")))
    }
}

impl EvmRpc for HttpEvmRpc {
    fn block_number(&self) -> RpcFuture<'_, u64> {
        Box::pin(async move {
            let result = self.request("eth_blockNumber", json!([])).await?;
            Self::parse_quantity(&result)
        })
    }

    fn call(&self, to: Address, data: Vec<u8>) -> RpcFuture<'_, Vec<u8>> {
        Box::pin(async move {
            let params = json!([{ "to": to, "data": format!("0x{}", hex::encode(&data)) }, "latest"]);
            let result = self.request("eth_call", params).await?;
            let s = result
                .as_str()
                .ok_or_else(|| Error::ChainIO("eth_call: expected hex data".to_string()))?;
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| Error::ChainIO(format!("eth_call: {e}")))
        })
    }

    fn send_transaction(&self, to: Address, data: Vec<u8>, value: U256) -> RpcFuture<'_, B256> {
        Box::pin(async move {
            let params = json!([{
                "to": to,
                "data": format!("0x{}", hex::encode(&data)),
                "value": format!("0x{value:x}"),
            }]);
            let result = self.request("eth_sendTransaction", params).await?;
            Self::parse_b256(&result)
        })
    }

    fn transaction_confirmations(&self, tx_hash: B256) -> RpcFuture<'_, u32> {
        Box::pin(async move {
            let receipt = self
                .request("eth_getTransactionReceipt", json!([tx_hash]))
                .await?;
            let mined_at = match receipt.get("blockNumber") {
                Some(v) if !v.is_null() => Self::parse_quantity(v)?,
                _ => return Ok(0),
            };
            let tip = Self::parse_quantity(&self.request("eth_blockNumber", json!([])).await?)?;
            Ok(tip.saturating_sub(mined_at) as u32 + 1)
        })
    }

    fn get_logs(&self, filter: LogFilter) -> RpcFuture<'_, Vec<LogEntry>> {
        Box::pin(async move {
            let params = json!([{
                "address": filter.address,
                "topics": filter.topics,
                "fromBlock": format!("0x{:x}", filter.from_block),
                "toBlock": "latest",
            }]);
            let result = self.request("eth_getLogs", params).await?;
            let logs = result
                .as_array()
                .ok_or_else(|| Error::ChainIO("eth_getLogs: expected array".to_string()))?;

            let mut entries = Vec::with_capacity(logs.len());
            for log in logs {
                let topics = log
                    .get("topics")
                    .and_then(|t| t.as_array())
                    .map(|t| t.iter().map(Self::parse_b256).collect::<Result<Vec<_>>>())
                    .transpose()?
                    .unwrap_or_default();
                let data = log
                    .get("data")
                    .and_then(|d| d.as_str())
                    .map(|s| hex::decode(s.trim_start_matches("0x")))
                    .transpose()
                    .map_err(|e| Error::ChainIO(format!("eth_getLogs: {e}")))?
                    .unwrap_or_default();
                let tx_hash = log
                    .get("transactionHash")
                    .map(Self::parse_b256)
                    .transpose()?
                    .unwrap_or_default();
                let block_number = log
                    .get("blockNumber")
                    .map(Self::parse_quantity)
                    .transpose()?
                    .unwrap_or_default();
                entries.push(LogEntry {
                    topics,
                    data,
                    tx_hash,
                    block_number,
                });
            }
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::generate_secret;
    use std::sync::Mutex;

    /// Scripted RPC double that records sent calldata and replays logs.
    struct ScriptedRpc {
        sent: Mutex<Vec<(Address, Vec<u8>, U256)>>,
        logs: Mutex<Vec<LogEntry>>,
    }

    impl ScriptedRpc {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
            }
        }
    }

    impl EvmRpc for ScriptedRpc {
        fn block_number(&self) -> RpcFuture<'_, u64> {
            Box::pin(async move { Ok(100) })
        }

        fn call(&self, _to: Address, _data: Vec<u8>) -> RpcFuture<'_, Vec<u8>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn send_transaction(&self, to: Address, data: Vec<u8>, value: U256) -> RpcFuture<'_, B256> {
            Box::pin(async move {
                self.sent.lock().unwrap().push((to, data, value));
                Ok(B256::repeat_byte(0xab))
            })
        }

        fn get_logs(&self, _filter: LogFilter) -> RpcFuture<'_, Vec<LogEntry>> {
            Box::pin(async move { Ok(self.logs.lock().unwrap().clone()) })
        }

        fn transaction_confirmations(&self, _tx_hash: B256) -> RpcFuture<'_, u32> {
            Box::pin(async move { Ok(1) })
        }
    }

    fn session(rpc: Arc<ScriptedRpc>) -> EvmHtlcSession {
        EvmHtlcSession::new(
            "ETH",
            Network::Testnet,
            11155111,
            Address::repeat_byte(0x42),
            "trade-1",
            rpc,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn fund_encodes_new_swap_call() {
        let rpc = Arc::new(ScriptedRpc::new());
        let mut sess = session(rpc.clone());
        let (_, hash) = generate_secret();
        sess.set_secret_hash(hash).unwrap();

        let receiver = Address::repeat_byte(0x07);
        sess.fund(receiver, U256::from(1_000_000u64), 9_000)
            .await
            .unwrap();

        let sent = rpc.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (to, data, value) = &sent[0];
        assert_eq!(*to, Address::repeat_byte(0x42));
        assert_eq!(*value, U256::from(1_000_000u64));
        assert_eq!(&data[..4], HtlcVault::newSwapCall::SELECTOR);
        assert_eq!(sess.state(), EvmHtlcState::Funded);

        // A second fund call is a precondition error.
        let mut sess2 = sess;
        assert!(matches!(
            sess2.fund(receiver, U256::from(1u64), 9_000).await,
            Err(Error::AlreadyFunded(_))
        ));
    }

    #[tokio::test]
    async fn claim_rejects_wrong_secret() {
        let rpc = Arc::new(ScriptedRpc::new());
        let mut sess = session(rpc);
        let (_, hash) = generate_secret();
        sess.set_secret_hash(hash).unwrap();

        assert!(matches!(
            sess.claim([0u8; 32]).await,
            Err(Error::SecretMismatch)
        ));
    }

    #[tokio::test]
    async fn poll_claimed_extracts_preimage() {
        let rpc = Arc::new(ScriptedRpc::new());
        let mut sess = session(rpc.clone());
        let (secret, hash) = generate_secret();
        sess.set_secret_hash(hash).unwrap();

        // No claim yet.
        assert!(sess.poll_claimed(0).await.unwrap().is_none());

        rpc.logs.lock().unwrap().push(LogEntry {
            topics: vec![HtlcVault::Claimed::SIGNATURE_HASH, sess.swap_id()],
            data: secret.to_vec(),
            tx_hash: B256::repeat_byte(0x11),
            block_number: 101,
        });

        let (found, tx) = sess.poll_claimed(0).await.unwrap().unwrap();
        assert_eq!(found, secret);
        assert_eq!(tx, B256::repeat_byte(0x11));
    }

    #[tokio::test]
    async fn poll_claimed_rejects_mismatched_preimage() {
        let rpc = Arc::new(ScriptedRpc::new());
        let mut sess = session(rpc.clone());
        let (_, hash) = generate_secret();
        sess.set_secret_hash(hash).unwrap();

        rpc.logs.lock().unwrap().push(LogEntry {
            topics: vec![HtlcVault::Claimed::SIGNATURE_HASH, sess.swap_id()],
            data: vec![0u8; 32],
            tx_hash: B256::repeat_byte(0x11),
            block_number: 101,
        });

        assert!(matches!(
            sess.poll_claimed(0).await,
            Err(Error::SecretMismatch)
        ));
    }
}
