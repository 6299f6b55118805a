//! The swap coordinator: single authority over live swaps.
//!
//! All mutations serialize on one readers-writer lock around the active-swap
//! map. Operations are keyed by trade id; the coordinator validates state,
//! delegates crypto to the per-chain sessions and transaction construction to
//! the builder, broadcasts through the chain backends, persists after every
//! mutation and emits events out-of-band.

use crate::backend::{BACKEND_CALL_TIMEOUT, ChainBackend, WalletProvider, with_deadline};
use crate::chains;
use crate::error::{Error, Result};
use crate::evm::{EvmHtlcSession, EvmRpc};
use crate::htlc::HtlcSession;
use crate::musig::{Musig2Session, PUB_NONCE_LEN};
use crate::script;
use crate::store::{
    BitcoinHtlcRecord, CrossChainRecord, EvmChainRecord, EvmHtlcRecord, HtlcChainRecord,
    MethodData, Musig2ChainRecord, Musig2Record, Store, SwapRecord,
};
use crate::swap::{ChainSide, FundingStatus, Offer, SAFETY_MARGIN_BLOCKS, Swap, SwapState};
use crate::txbuilder::{
    EscrowUtxo, FeePolicy, SpendableUtxo, build_funding_tx, build_htlc_claim_tx,
    build_htlc_refund_tx, build_scriptpath_refund, resolve_fee_rate,
};
use crate::types::{Network, Role, SwapMethod, generate_secret, sha256};
use alloy_primitives::{Address as EvmAddress, B256, U256};
use alloy_sol_types::SolEvent;
use bitcoin::consensus::encode as consensus;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, Transaction, Txid};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{RwLock, watch};

/// Event emitted after every successful mutating operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SwapEvent {
    pub trade_id: String,
    pub event_type: SwapEventType,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapEventType {
    SwapInitiated,
    SwapResponded,
    RemotePubkeySet,
    NoncesGenerated,
    SwapFunded,
    FundingConfirmed,
    SignaturesCreated,
    SwapRedeemed,
    SwapRefunded,
    SecretRevealed,
    SwapCancelled,
    SwapFailed,
}

/// Registered event sink; invoked on a fresh task per event.
pub type EventHandler = Arc<dyn Fn(SwapEvent) + Send + Sync>;

/// Where a revealed preimage was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretSource {
    /// A 32-byte witness element spending a UTXO HTLC escrow.
    UtxoWitness,
    /// The `Claimed` event of an EVM HTLC contract.
    EvmEvent,
    /// Handed over directly by the counterparty.
    Peer,
}

/// MuSig2 sessions for both chains of a swap.
pub struct Musig2Data {
    pub offer: Musig2Session,
    pub request: Musig2Session,
}

/// UTXO HTLC sessions for both chains of a swap.
pub struct HtlcData {
    pub offer: HtlcSession,
    pub request: HtlcSession,
}

/// Method-specific runtime sessions.
pub enum SwapSessions {
    Musig2(Musig2Data),
    HtlcUtxo(HtlcData),
    HtlcEvm {
        offer: EvmHtlcSession,
        request: EvmHtlcSession,
    },
    Cross {
        /// Which chain side the UTXO leg sits on.
        utxo_side: ChainSide,
        utxo: HtlcSession,
        evm: EvmHtlcSession,
    },
}

/// In-memory runtime envelope around a durable [`Swap`].
pub struct ActiveSwap {
    pub swap: Swap,
    /// `None` when the swap was rehydrated without its ephemeral private key;
    /// such swaps are read-only.
    pub sessions: Option<SwapSessions>,
    /// Ephemeral private key for this swap's sessions.
    pub local_priv: Option<SecretKey>,
    /// Escrow addresses per chain side, once derived.
    pub offer_escrow_addr: Option<String>,
    pub request_escrow_addr: Option<String>,
    /// Chains whose key-path signature has been combined (MuSig2).
    combined_offer: bool,
    combined_request: bool,
}

impl ActiveSwap {
    fn sessions_mut(&mut self) -> Result<&mut SwapSessions> {
        self.sessions.as_mut().ok_or_else(|| {
            Error::NotReadyToSign(
                "swap was recovered without key material and is read-only".to_string(),
            )
        })
    }

    fn escrow_addr(&self, side: ChainSide) -> Option<&str> {
        match side {
            ChainSide::Offer => self.offer_escrow_addr.as_deref(),
            ChainSide::Request => self.request_escrow_addr.as_deref(),
        }
    }
}

/// Per-EVM-chain configuration: contract address and transport.
#[derive(Clone)]
pub struct EvmChainConfig {
    pub chain_id: u64,
    pub contract: EvmAddress,
    pub rpc: Arc<dyn EvmRpc>,
}

/// Coordinator construction parameters.
#[derive(Clone)]
pub struct CoordinatorConfig {
    pub network: Network,
    pub safety_margin_blocks: u64,
    pub fee_policy: FeePolicy,
    /// Wallet account used for change and redeem addresses.
    pub wallet_account: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            safety_margin_blocks: SAFETY_MARGIN_BLOCKS,
            fee_policy: FeePolicy::default(),
            wallet_account: 0,
        }
    }
}

/// The single mutating entry point for live swaps.
pub struct Coordinator<S: Store> {
    config: CoordinatorConfig,
    store: Arc<S>,
    backends: HashMap<String, Arc<dyn ChainBackend>>,
    evm_chains: HashMap<String, EvmChainConfig>,
    wallet: Option<Arc<dyn WalletProvider>>,
    swaps: Arc<RwLock<HashMap<String, ActiveSwap>>>,
    handlers: std::sync::RwLock<Vec<EventHandler>>,
    shutdown: watch::Sender<bool>,
}

impl<S: Store> Coordinator<S> {
    pub fn new(config: CoordinatorConfig, store: Arc<S>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            store,
            backends: HashMap::new(),
            evm_chains: HashMap::new(),
            wallet: None,
            swaps: Arc::new(RwLock::new(HashMap::new())),
            handlers: std::sync::RwLock::new(Vec::new()),
            shutdown,
        }
    }

    pub fn register_backend(&mut self, symbol: &str, backend: Arc<dyn ChainBackend>) {
        self.backends.insert(symbol.to_uppercase(), backend);
    }

    pub fn register_evm_chain(&mut self, symbol: &str, config: EvmChainConfig) {
        self.evm_chains.insert(symbol.to_uppercase(), config);
    }

    pub fn set_wallet(&mut self, wallet: Arc<dyn WalletProvider>) {
        self.wallet = Some(wallet);
    }

    /// Register an event handler. Handlers run on detached tasks and cannot
    /// block the coordinator.
    pub fn subscribe(&self, handler: EventHandler) {
        self.handlers.write().unwrap().push(handler);
    }

    /// Receiver monitors select on to observe shutdown.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Signal all monitors and in-flight tasks to unwind.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn check_cancelled(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, trade_id: &str, event_type: SwapEventType, data: serde_json::Value) {
        let event = SwapEvent {
            trade_id: trade_id.to_string(),
            event_type,
            data,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        };
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            let event = event.clone();
            tokio::spawn(async move { handler(event) });
        }
    }

    fn backend(&self, symbol: &str) -> Result<Arc<dyn ChainBackend>> {
        self.backends
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| Error::BackendMissing(symbol.to_string()))
    }

    fn evm_chain(&self, symbol: &str) -> Result<&EvmChainConfig> {
        self.evm_chains
            .get(&symbol.to_uppercase())
            .ok_or_else(|| Error::BackendMissing(symbol.to_string()))
    }

    fn wallet(&self) -> Result<Arc<dyn WalletProvider>> {
        self.wallet.clone().ok_or(Error::NoWallet)
    }

    /// Current tip of `symbol`, whichever family it belongs to.
    async fn chain_height(&self, symbol: &str) -> Result<u64> {
        let chain = chains::get(symbol)?;
        if chain.is_evm() {
            let rpc = self.evm_chain(symbol)?.rpc.clone();
            with_deadline("block_number", BACKEND_CALL_TIMEOUT, rpc.block_number()).await
        } else {
            let backend = self.backend(symbol)?;
            with_deadline(
                "get_block_height",
                BACKEND_CALL_TIMEOUT,
                backend.get_block_height(),
            )
            .await
        }
    }

    /// Persist the swap; failures are logged and do not roll back in-memory
    /// state (the next mutation re-persists).
    async fn persist(&self, active: &ActiveSwap) {
        let record = self.to_record(active);
        if let Err(e) = self.store.save_swap(&record).await {
            log::warn!("failed to persist swap {}: {e}", active.swap.id);
        }
    }

    // -----------------------------------------------------------------------
    // Swap creation
    // -----------------------------------------------------------------------

    /// Create sessions for both chains of `swap`, keyed by chain kind.
    fn build_sessions(
        &self,
        swap: &Swap,
        local_priv: SecretKey,
        trade_id: &str,
    ) -> Result<SwapSessions> {
        let offer_chain = chains::get(&swap.offer.offer_chain)?;
        let request_chain = chains::get(&swap.offer.request_chain)?;
        let network = swap.network;

        let sessions = match swap.method {
            SwapMethod::Musig2 => {
                if !offer_chain.is_utxo() || !request_chain.is_utxo() {
                    return Err(Error::MethodNotSupported(
                        "musig2 swaps require taproot UTXO chains on both sides".to_string(),
                    ));
                }
                SwapSessions::Musig2(Musig2Data {
                    offer: Musig2Session::new(offer_chain.symbol, network, local_priv)?,
                    request: Musig2Session::new(request_chain.symbol, network, local_priv)?,
                })
            }
            SwapMethod::Htlc => match (offer_chain.is_utxo(), request_chain.is_utxo()) {
                (true, true) => SwapSessions::HtlcUtxo(HtlcData {
                    offer: HtlcSession::new(
                        offer_chain.symbol,
                        network,
                        local_priv,
                        swap.is_maker(),
                    )?,
                    request: HtlcSession::new(
                        request_chain.symbol,
                        network,
                        local_priv,
                        !swap.is_maker(),
                    )?,
                }),
                (true, false) => {
                    let evm = self.evm_chain(request_chain.symbol)?;
                    SwapSessions::Cross {
                        utxo_side: ChainSide::Offer,
                        utxo: HtlcSession::new(
                            offer_chain.symbol,
                            network,
                            local_priv,
                            swap.is_maker(),
                        )?,
                        evm: EvmHtlcSession::new(
                            request_chain.symbol,
                            network,
                            evm.chain_id,
                            evm.contract,
                            trade_id,
                            evm.rpc.clone(),
                        )?,
                    }
                }
                (false, true) => {
                    let evm = self.evm_chain(offer_chain.symbol)?;
                    SwapSessions::Cross {
                        utxo_side: ChainSide::Request,
                        utxo: HtlcSession::new(
                            request_chain.symbol,
                            network,
                            local_priv,
                            !swap.is_maker(),
                        )?,
                        evm: EvmHtlcSession::new(
                            offer_chain.symbol,
                            network,
                            evm.chain_id,
                            evm.contract,
                            trade_id,
                            evm.rpc.clone(),
                        )?,
                    }
                }
                (false, false) => {
                    let offer_cfg = self.evm_chain(offer_chain.symbol)?;
                    let request_cfg = self.evm_chain(request_chain.symbol)?;
                    SwapSessions::HtlcEvm {
                        offer: EvmHtlcSession::new(
                            offer_chain.symbol,
                            network,
                            offer_cfg.chain_id,
                            offer_cfg.contract,
                            trade_id,
                            offer_cfg.rpc.clone(),
                        )?,
                        request: EvmHtlcSession::new(
                            request_chain.symbol,
                            network,
                            request_cfg.chain_id,
                            request_cfg.contract,
                            trade_id,
                            request_cfg.rpc.clone(),
                        )?,
                    }
                }
            },
        };
        Ok(sessions)
    }

    fn seed_secret_hash(sessions: &mut SwapSessions, hash: [u8; 32]) -> Result<()> {
        match sessions {
            SwapSessions::Musig2(_) => Ok(()),
            SwapSessions::HtlcUtxo(data) => {
                data.offer.set_secret_hash(hash)?;
                data.request.set_secret_hash(hash)
            }
            SwapSessions::HtlcEvm { offer, request } => {
                offer.set_secret_hash(hash)?;
                request.set_secret_hash(hash)
            }
            SwapSessions::Cross { utxo, evm, .. } => {
                utxo.set_secret_hash(hash)?;
                evm.set_secret_hash(hash)
            }
        }
    }

    fn seed_secret(sessions: &mut SwapSessions, secret: [u8; 32]) -> Result<()> {
        match sessions {
            SwapSessions::Musig2(_) => Ok(()),
            SwapSessions::HtlcUtxo(data) => {
                data.offer.set_secret(secret)?;
                data.request.set_secret(secret)
            }
            SwapSessions::HtlcEvm { offer, request } => {
                offer.set_secret(secret)?;
                request.set_secret(secret)
            }
            SwapSessions::Cross { utxo, evm, .. } => {
                utxo.set_secret(secret)?;
                evm.set_secret(secret)
            }
        }
    }

    async fn create_swap(
        &self,
        trade_id: String,
        order_id: String,
        offer: Offer,
        role: Role,
        remote_pub: Option<PublicKey>,
        secret_hash: Option<[u8; 32]>,
    ) -> Result<String> {
        self.check_cancelled()?;

        let mut swaps = self.swaps.write().await;
        if swaps.contains_key(&trade_id) {
            return Err(Error::SwapExists(trade_id));
        }
        if self.store.get_swap(&trade_id).await?.is_some() {
            return Err(Error::SwapExists(trade_id));
        }

        let mut swap = Swap::new(trade_id.clone(), order_id, offer, role, self.config.network)?;

        let secp = Secp256k1::new();
        let local_priv = SecretKey::new(&mut rand::rngs::OsRng);
        swap.local_pub = Some(local_priv.public_key(&secp));
        swap.remote_pub = remote_pub;

        let offer_height = self.chain_height(&swap.offer.offer_chain).await?;
        let request_height = self.chain_height(&swap.offer.request_chain).await?;
        swap.set_block_heights(offer_height, request_height)?;

        match role {
            Role::Initiator => {
                let (secret, hash) = generate_secret();
                swap.secret = Some(secret);
                swap.secret_hash = Some(hash);
            }
            Role::Responder => {
                swap.secret_hash = secret_hash;
            }
        }

        let mut sessions = self.build_sessions(&swap, local_priv, &trade_id)?;
        if let Some(hash) = swap.secret_hash {
            Self::seed_secret_hash(&mut sessions, hash)?;
        }
        if let Some(secret) = swap.secret {
            // The initiator's sessions know the preimage from the start.
            Self::seed_secret(&mut sessions, secret)?;
        }
        if let Some(remote) = remote_pub {
            Self::bind_remote_pub(&mut sessions, remote)?;
        }

        let active = ActiveSwap {
            swap,
            sessions: Some(sessions),
            local_priv: Some(local_priv),
            offer_escrow_addr: None,
            request_escrow_addr: None,
            combined_offer: false,
            combined_request: false,
        };
        self.persist(&active).await;

        let event_type = match role {
            Role::Initiator => SwapEventType::SwapInitiated,
            Role::Responder => SwapEventType::SwapResponded,
        };
        let data = json!({
            "offer_chain": active.swap.offer.offer_chain,
            "request_chain": active.swap.offer.request_chain,
            "method": active.swap.method.to_string(),
            "role": active.swap.role.to_string(),
        });
        swaps.insert(trade_id.clone(), active);
        drop(swaps);

        self.emit(&trade_id, event_type, data);
        Ok(trade_id)
    }

    /// Create a swap with role = initiator. The initiator generates the
    /// secret pair. An empty `trade_id` gets a generated 16-byte id.
    pub async fn initiate_swap(
        &self,
        trade_id: &str,
        order_id: &str,
        offer: Offer,
    ) -> Result<String> {
        let trade_id = if trade_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            trade_id.to_string()
        };
        self.create_swap(
            trade_id,
            order_id.to_string(),
            offer,
            Role::Initiator,
            None,
            None,
        )
        .await
    }

    /// Create a swap with role = responder, binding the initiator's public
    /// key and (for HTLC methods) the secret hash.
    pub async fn respond_to_swap(
        &self,
        trade_id: &str,
        order_id: &str,
        offer: Offer,
        remote_pub: PublicKey,
        secret_hash: Option<[u8; 32]>,
    ) -> Result<String> {
        self.create_swap(
            trade_id.to_string(),
            order_id.to_string(),
            offer,
            Role::Responder,
            Some(remote_pub),
            secret_hash,
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Key / nonce exchange
    // -----------------------------------------------------------------------

    fn bind_remote_pub(sessions: &mut SwapSessions, remote: PublicKey) -> Result<()> {
        match sessions {
            SwapSessions::Musig2(data) => {
                data.offer.set_remote_pub(remote)?;
                data.request.set_remote_pub(remote)
            }
            SwapSessions::HtlcUtxo(data) => {
                data.offer.set_remote_pub(remote)?;
                data.request.set_remote_pub(remote)
            }
            SwapSessions::HtlcEvm { .. } => Ok(()),
            SwapSessions::Cross { utxo, .. } => utxo.set_remote_pub(remote),
        }
    }

    /// Bind the counterparty key and derive both chains' escrow addresses.
    ///
    /// MuSig2: Taproot addresses with the funder's key on each chain's refund
    /// leaf. HTLC: P2WSH addresses with role-specific sender/receiver. On
    /// the offer chain the maker is sender and the taker receiver; on the
    /// request chain the roles flip.
    pub async fn set_remote_pubkey(&self, trade_id: &str, remote_pub: PublicKey) -> Result<()> {
        self.check_cancelled()?;
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        active.swap.remote_pub = Some(remote_pub);
        let swap = active.swap.clone();
        let sessions = active.sessions_mut()?;
        Self::bind_remote_pub(sessions, remote_pub)?;

        let offer_timeout = swap.timeout_blocks(ChainSide::Offer)?;
        let request_timeout = swap.timeout_blocks(ChainSide::Request)?;

        let (offer_addr, request_addr) = match sessions {
            SwapSessions::Musig2(data) => {
                // Refund keys: the funder of each chain. Maker funds the
                // offer chain, taker the request chain.
                let (local_x, _) = swap
                    .local_pub
                    .ok_or_else(|| Error::NotReadyToSign("local key missing".to_string()))?
                    .x_only_public_key();
                let (remote_x, _) = remote_pub.x_only_public_key();
                let (offer_refund, request_refund) = if swap.is_maker() {
                    (local_x, remote_x)
                } else {
                    (remote_x, local_x)
                };
                let offer_addr = data
                    .offer
                    .taproot_address_with_refund(offer_refund, offer_timeout)?;
                let request_addr = data
                    .request
                    .taproot_address_with_refund(request_refund, request_timeout)?;
                (Some(offer_addr), Some(request_addr))
            }
            SwapSessions::HtlcUtxo(data) => {
                let offer_addr = data.offer.build_escrow(!swap.is_maker(), offer_timeout)?;
                let request_addr = data.request.build_escrow(swap.is_maker(), request_timeout)?;
                (Some(offer_addr), Some(request_addr))
            }
            SwapSessions::HtlcEvm { .. } => (None, None),
            SwapSessions::Cross {
                utxo_side, utxo, ..
            } => {
                // Receiver on the offer chain is the taker; on the request
                // chain the maker.
                let (local_is_receiver, timeout) = match utxo_side {
                    ChainSide::Offer => (!swap.is_maker(), offer_timeout),
                    ChainSide::Request => (swap.is_maker(), request_timeout),
                };
                let addr = utxo.build_escrow(local_is_receiver, timeout)?;
                match utxo_side {
                    ChainSide::Offer => (Some(addr), None),
                    ChainSide::Request => (None, Some(addr)),
                }
            }
        };

        active.offer_escrow_addr = offer_addr;
        active.request_escrow_addr = request_addr;
        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::RemotePubkeySet,
            json!({
                "offer_escrow": active.offer_escrow_addr,
                "request_escrow": active.request_escrow_addr,
            }),
        );
        Ok(())
    }

    /// Record a redemption destination for `chain`.
    pub async fn set_redeem_address(
        &self,
        trade_id: &str,
        chain: &str,
        address: &str,
        is_local: bool,
    ) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        let map = if is_local {
            &mut active.swap.local_redeem_addresses
        } else {
            &mut active.swap.remote_redeem_addresses
        };
        map.insert(chain.to_uppercase(), address.to_string());
        self.persist(active).await;
        Ok(())
    }

    /// Generate fresh MuSig2 nonces on both chains.
    pub async fn generate_nonces(
        &self,
        trade_id: &str,
    ) -> Result<([u8; PUB_NONCE_LEN], [u8; PUB_NONCE_LEN])> {
        self.check_cancelled()?;
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        let SwapSessions::Musig2(data) = active.sessions_mut()? else {
            return Err(Error::MethodNotSupported(
                "nonce exchange applies to musig2 swaps".to_string(),
            ));
        };
        let offer_nonce = data.offer.generate_nonces()?;
        let request_nonce = data.request.generate_nonces()?;

        self.persist(active).await;
        self.emit(trade_id, SwapEventType::NoncesGenerated, json!({}));
        Ok((offer_nonce, request_nonce))
    }

    /// Record the counterparty's nonces and bind both signing contexts.
    pub async fn set_remote_nonces(
        &self,
        trade_id: &str,
        offer_nonce: &[u8],
        request_nonce: &[u8],
    ) -> Result<()> {
        self.check_cancelled()?;
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        let SwapSessions::Musig2(data) = active.sessions_mut()? else {
            return Err(Error::MethodNotSupported(
                "nonce exchange applies to musig2 swaps".to_string(),
            ));
        };
        data.offer.set_remote_nonce(offer_nonce)?;
        data.request.set_remote_nonce(request_nonce)?;
        data.offer.init_signing_session()?;
        data.request.init_signing_session()?;

        self.persist(active).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signing
    // -----------------------------------------------------------------------

    /// Produce partial signatures for the key-path spends of both chains.
    ///
    /// Rejected unless the swap is funded and both chains are outside the
    /// safety margin of their timeouts.
    pub async fn create_partial_signatures(
        &self,
        trade_id: &str,
        offer_sighash: [u8; 32],
        request_sighash: [u8; 32],
    ) -> Result<([u8; 32], [u8; 32])> {
        self.check_cancelled()?;

        // Heights are fetched before taking the write lock; RPC must not run
        // under it.
        let (offer_chain, request_chain) = {
            let swaps = self.swaps.read().await;
            let active = swaps
                .get(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            (
                active.swap.offer.offer_chain.clone(),
                active.swap.offer.request_chain.clone(),
            )
        };
        let offer_height = self.chain_height(&offer_chain).await?;
        let request_height = self.chain_height(&request_chain).await?;

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        if active.swap.state != SwapState::Funded {
            return Err(Error::NotReadyToSign(format!(
                "swap is {}, must be funded",
                active.swap.state
            )));
        }
        active.swap.is_safe_to_complete(
            offer_height,
            request_height,
            self.config.safety_margin_blocks,
        )?;

        let SwapSessions::Musig2(data) = active.sessions_mut()? else {
            return Err(Error::MethodNotSupported(
                "partial signatures apply to musig2 swaps".to_string(),
            ));
        };
        let offer_partial = data.offer.sign(offer_sighash)?;
        let request_partial = data.request.sign(request_sighash)?;

        self.persist(active).await;
        self.emit(trade_id, SwapEventType::SignaturesCreated, json!({}));
        Ok((offer_partial, request_partial))
    }

    /// Combine our partial with the counterparty's for `chain`; once both
    /// chains are combined the swap is redeemed.
    pub async fn combine_signatures(
        &self,
        trade_id: &str,
        chain: &str,
        remote_partial: [u8; 32],
    ) -> Result<[u8; 64]> {
        self.check_cancelled()?;
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        let side = side_of(&active.swap, chain)?;
        let SwapSessions::Musig2(data) = active.sessions_mut()? else {
            return Err(Error::MethodNotSupported(
                "signature combination applies to musig2 swaps".to_string(),
            ));
        };
        let session = match side {
            ChainSide::Offer => &mut data.offer,
            ChainSide::Request => &mut data.request,
        };
        let local_partial = session
            .partial_sig()
            .ok_or_else(|| Error::NotReadyToSign("no local partial signature".to_string()))?;
        let signature = session.combine(local_partial, remote_partial)?;

        match side {
            ChainSide::Offer => active.combined_offer = true,
            ChainSide::Request => active.combined_request = true,
        }
        if active.combined_offer && active.combined_request {
            active.swap.transition(SwapState::Redeemed)?;
            self.persist(active).await;
            self.emit(trade_id, SwapEventType::SwapRedeemed, json!({}));
        } else {
            self.persist(active).await;
        }
        Ok(signature)
    }

    // -----------------------------------------------------------------------
    // Funding
    // -----------------------------------------------------------------------

    /// Fund the local side of the swap: select wallet UTXOs, build, sign and
    /// broadcast the funding transaction (or open the EVM contract escrow).
    pub async fn fund_swap(&self, trade_id: &str) -> Result<String> {
        self.check_cancelled()?;

        // Snapshot what we need, then do wallet/chain I/O without the lock.
        let (funding_chain, side, escrow_addr, amount, timeout_height, remote_redeem, is_evm, is_maker) = {
            let swaps = self.swaps.read().await;
            let active = swaps
                .get(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            if active.swap.local_funding.tx_id.is_some() {
                return Err(Error::AlreadyFunded(trade_id.to_string()));
            }
            if active.swap.state != SwapState::Init && active.swap.state != SwapState::Funding {
                return Err(Error::InvalidState {
                    from: active.swap.state.to_string(),
                    to: SwapState::Funding.to_string(),
                });
            }
            let side = active.swap.funding_side();
            let chain = active.swap.funding_chain().to_string();
            let amount = match side {
                ChainSide::Offer => active.swap.offer.offer_amount,
                ChainSide::Request => active.swap.offer.request_amount,
            };
            (
                chain.clone(),
                side,
                active.escrow_addr(side).map(str::to_string),
                amount,
                active.swap.timeout_height(side),
                active
                    .swap
                    .remote_redeem_addresses
                    .get(&chain.to_uppercase())
                    .cloned(),
                chains::get(&chain)?.is_evm(),
                active.swap.is_maker(),
            )
        };

        let tx_id = if is_evm {
            let receiver = remote_redeem
                .ok_or_else(|| {
                    Error::NotReadyToSign("remote redeem address not collected".to_string())
                })?
                .parse::<EvmAddress>()
                .map_err(|e| Error::InvalidPubKey(format!("EVM address: {e}")))?;

            let mut swaps = self.swaps.write().await;
            let active = swaps
                .get_mut(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            let session = evm_session_mut(active.sessions_mut()?, side)?;
            let tx = session
                .fund(receiver, U256::from(amount), timeout_height)
                .await?;
            format!("{tx:#x}")
        } else {
            let escrow_addr = escrow_addr
                .ok_or_else(|| Error::NotReadyToSign("escrow address not derived".to_string()))?;
            let escrow_spk = script::address_to_script_pubkey(&escrow_addr)?;

            let wallet = self.wallet()?;
            let backend = self.backend(&funding_chain)?;

            let utxos = wallet.list_all_utxos(&funding_chain).await?;
            let mut spendable = Vec::with_capacity(utxos.len());
            for utxo in &utxos {
                let key = wallet
                    .derive_private_key(&funding_chain, utxo.account, utxo.change, utxo.address_index)
                    .await?;
                spendable.push(SpendableUtxo {
                    outpoint: OutPoint {
                        txid: Txid::from_str(&utxo.tx_id)
                            .map_err(|e| Error::InvalidTxId(e.to_string()))?,
                        vout: utxo.vout,
                    },
                    amount: utxo.amount,
                    address_type: utxo.address_type,
                    secret_key: key,
                });
            }

            let estimates = backend.get_fee_estimates().await.unwrap_or_default();
            let fee_rate = resolve_fee_rate(estimates.half_hour_fee.or(estimates.hour_fee));

            // Fresh change address; the index allocation is monotone.
            let change_index = self
                .store
                .next_address_index(&funding_chain, self.config.wallet_account, 1)
                .await?;
            let change_addr = wallet
                .derive_address(&funding_chain, self.config.wallet_account, 1, change_index)
                .await?;
            self.store
                .save_wallet_address(&crate::store::WalletAddressRecord {
                    chain: funding_chain.clone(),
                    account: self.config.wallet_account,
                    change: 1,
                    address_index: change_index,
                    address: change_addr.clone(),
                })
                .await?;
            let change_spk = script::address_to_script_pubkey(&change_addr)?;

            let dao_output = self.config.fee_policy.dao_output(amount, is_maker);

            let funding =
                build_funding_tx(&spendable, escrow_spk, amount, dao_output, change_spk, fee_rate)?;
            with_deadline(
                "broadcast_transaction",
                BACKEND_CALL_TIMEOUT,
                backend.broadcast_transaction(&funding.to_hex()),
            )
            .await
            .map_err(|e| match e {
                Error::ChainIO(msg) => Error::BroadcastRejected(msg),
                other => other,
            })?
        };

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        if active.swap.local_funding.tx_id.is_some() {
            // A concurrent caller won the race after our snapshot.
            return Err(Error::AlreadyFunded(trade_id.to_string()));
        }
        active.swap.local_funding = FundingStatus {
            tx_id: Some(tx_id.clone()),
            vout: 0,
            confirmations: 0,
        };
        if active.swap.state == SwapState::Init {
            active.swap.transition(SwapState::Funding)?;
        }
        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::SwapFunded,
            json!({ "chain": funding_chain, "tx_id": tx_id }),
        );
        Ok(tx_id)
    }

    /// Record a funding transaction observed out-of-band (counterparty
    /// funding, or an external observer confirming ours).
    pub async fn set_funding_tx(
        &self,
        trade_id: &str,
        tx_id: &str,
        vout: u32,
        is_local: bool,
    ) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        let status = FundingStatus {
            tx_id: Some(tx_id.to_string()),
            vout,
            confirmations: 0,
        };
        if is_local {
            active.swap.local_funding = status;
        } else {
            active.swap.remote_funding = status;
        }
        if active.swap.state == SwapState::Init {
            active.swap.transition(SwapState::Funding)?;
        }
        self.persist(active).await;
        Ok(())
    }

    /// Poll both funding transactions and advance `funding -> funded` when
    /// both cross their chain-specific confirmation minimum.
    pub async fn update_confirmations(&self, trade_id: &str) -> Result<()> {
        self.check_cancelled()?;

        let (local_chain, remote_chain, local_tx, remote_tx) = {
            let swaps = self.swaps.read().await;
            let active = swaps
                .get(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            let side = active.swap.funding_side();
            (
                active.swap.chain_symbol(side).to_string(),
                active.swap.chain_symbol(side.other()).to_string(),
                active.swap.local_funding.tx_id.clone(),
                active.swap.remote_funding.tx_id.clone(),
            )
        };

        let local_confs = match &local_tx {
            Some(tx) => Some(self.tx_confirmations(&local_chain, tx).await?),
            None => None,
        };
        let remote_confs = match &remote_tx {
            Some(tx) => Some(self.tx_confirmations(&remote_chain, tx).await?),
            None => None,
        };

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        if let Some(confs) = local_confs {
            active.swap.local_funding.confirmations = confs;
        }
        if let Some(confs) = remote_confs {
            active.swap.remote_funding.confirmations = confs;
        }

        if active.swap.state == SwapState::Funding && active.swap.confirmations_final()? {
            active.swap.transition(SwapState::Funded)?;
            self.persist(active).await;
            self.emit(
                trade_id,
                SwapEventType::FundingConfirmed,
                json!({
                    "local_confirmations": active.swap.local_funding.confirmations,
                    "remote_confirmations": active.swap.remote_funding.confirmations,
                }),
            );
        } else {
            self.persist(active).await;
        }
        Ok(())
    }

    async fn tx_confirmations(&self, chain: &str, tx_id: &str) -> Result<u32> {
        if chains::get(chain)?.is_evm() {
            let rpc = self.evm_chain(chain)?.rpc.clone();
            let hash = tx_id
                .parse::<B256>()
                .map_err(|e| Error::InvalidTxId(e.to_string()))?;
            with_deadline(
                "transaction_confirmations",
                BACKEND_CALL_TIMEOUT,
                rpc.transaction_confirmations(hash),
            )
            .await
        } else {
            let backend = self.backend(chain)?;
            let info = with_deadline(
                "get_transaction",
                BACKEND_CALL_TIMEOUT,
                backend.get_transaction(tx_id),
            )
            .await?;
            Ok(info.map(|t| t.confirmations).unwrap_or(0))
        }
    }

    // -----------------------------------------------------------------------
    // HTLC claim / refund
    // -----------------------------------------------------------------------

    /// Claim the counterparty's HTLC escrow on `chain` using the known
    /// secret.
    pub async fn claim_htlc(&self, trade_id: &str, chain: &str) -> Result<String> {
        self.check_cancelled()?;
        let fee_rate = self.utxo_fee_rate(chain).await.ok();

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        let side = side_of(&active.swap, chain)?;
        let swap = active.swap.clone();

        let tx_id = if chains::get(chain)?.is_evm() {
            let session = evm_session_mut(active.sessions_mut()?, side)?;
            let secret = session
                .secret()
                .or(swap.secret)
                .ok_or_else(|| Error::NotReadyToSign("secret unknown".to_string()))?;
            let tx = session.claim(secret).await?;
            format!("{tx:#x}")
        } else {
            let escrow = self.escrow_utxo(active, side)?;
            let session = utxo_session_mut(active.sessions_mut()?, side)?;
            let secret = session
                .secret()
                .or(swap.secret)
                .ok_or_else(|| Error::NotReadyToSign("secret unknown".to_string()))?;
            let redeem_script = session
                .redeem_script()
                .ok_or_else(|| Error::NotReadyToSign("escrow not built".to_string()))?
                .clone();
            let key = session.local_priv();

            let destination = swap
                .local_redeem_addresses
                .get(&chain.to_uppercase())
                .ok_or_else(|| {
                    Error::NotReadyToSign("local redeem address not set".to_string())
                })?;
            let destination_spk = script::address_to_script_pubkey(destination)?;
            let amount = match side {
                ChainSide::Offer => swap.offer.offer_amount,
                ChainSide::Request => swap.offer.request_amount,
            };
            let dao_output = self.config.fee_policy.dao_output(amount, swap.is_maker());

            let tx = build_htlc_claim_tx(
                &escrow,
                &redeem_script,
                &secret,
                &key,
                destination_spk,
                dao_output,
                resolve_fee_rate(fee_rate),
            )?;
            self.broadcast(chain, &tx).await?
        };

        if active.swap.state == SwapState::Funded {
            active.swap.transition(SwapState::Redeemed)?;
        }
        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::SwapRedeemed,
            json!({ "chain": chain, "tx_id": tx_id }),
        );
        Ok(tx_id)
    }

    /// Refund our own HTLC escrow on `chain` after its CSV timeout elapsed.
    pub async fn refund_htlc(&self, trade_id: &str, chain: &str) -> Result<String> {
        self.check_cancelled()?;
        let fee_rate = self.utxo_fee_rate(chain).await.ok();

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        let side = side_of(&active.swap, chain)?;
        let swap = active.swap.clone();

        let tx_id = if chains::get(chain)?.is_evm() {
            let session = evm_session_mut(active.sessions_mut()?, side)?;
            let tx = session.refund().await?;
            format!("{tx:#x}")
        } else {
            let escrow = self.escrow_utxo(active, side)?;
            let timeout_blocks = swap.timeout_blocks(side)?;
            let session = utxo_session_mut(active.sessions_mut()?, side)?;
            let redeem_script = session
                .redeem_script()
                .ok_or_else(|| Error::NotReadyToSign("escrow not built".to_string()))?
                .clone();
            let key = session.local_priv();

            let destination = swap
                .local_redeem_addresses
                .get(&chain.to_uppercase())
                .ok_or_else(|| {
                    Error::NotReadyToSign("local redeem address not set".to_string())
                })?;
            let destination_spk = script::address_to_script_pubkey(destination)?;

            let tx = build_htlc_refund_tx(
                &escrow,
                &redeem_script,
                &key,
                destination_spk,
                timeout_blocks,
                resolve_fee_rate(fee_rate),
            )?;
            self.broadcast(chain, &tx).await?
        };

        active.swap.transition(SwapState::Refunded)?;
        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::SwapRefunded,
            json!({ "chain": chain, "tx_id": tx_id }),
        );
        Ok(tx_id)
    }

    async fn utxo_fee_rate(&self, chain: &str) -> Result<u64> {
        let backend = self.backend(chain)?;
        let estimates = backend.get_fee_estimates().await?;
        Ok(resolve_fee_rate(
            estimates.half_hour_fee.or(estimates.hour_fee),
        ))
    }

    async fn broadcast(&self, chain: &str, tx: &Transaction) -> Result<String> {
        let backend = self.backend(chain)?;
        let hex = consensus::serialize_hex(tx);
        with_deadline(
            "broadcast_transaction",
            BACKEND_CALL_TIMEOUT,
            backend.broadcast_transaction(&hex),
        )
        .await
        .map_err(|e| match e {
            Error::ChainIO(msg) => Error::BroadcastRejected(msg),
            other => other,
        })
    }

    /// The escrow outpoint on `side`: the funder's recorded funding anchor.
    fn escrow_utxo(&self, active: &ActiveSwap, side: ChainSide) -> Result<EscrowUtxo> {
        let swap = &active.swap;
        let funding = if side == swap.funding_side() {
            &swap.local_funding
        } else {
            &swap.remote_funding
        };
        let tx_id = funding
            .tx_id
            .as_ref()
            .ok_or_else(|| Error::NotReadyToSign("escrow not funded".to_string()))?;
        let address = active
            .escrow_addr(side)
            .ok_or_else(|| Error::NotReadyToSign("escrow address not derived".to_string()))?;
        let amount = match side {
            ChainSide::Offer => swap.offer.offer_amount,
            ChainSide::Request => swap.offer.request_amount,
        };
        Ok(EscrowUtxo {
            outpoint: OutPoint {
                txid: Txid::from_str(tx_id).map_err(|e| Error::InvalidTxId(e.to_string()))?,
                vout: funding.vout,
            },
            amount,
            script_pubkey: script::address_to_script_pubkey(address)?,
        })
    }

    // -----------------------------------------------------------------------
    // Secret extraction
    // -----------------------------------------------------------------------

    /// Fetch `tx_id` from `chain`, locate the witness spending our HTLC
    /// escrow, and extract the 32-byte preimage.
    pub async fn extract_secret_from_tx(
        &self,
        trade_id: &str,
        tx_id: &str,
        chain: &str,
    ) -> Result<[u8; 32]> {
        self.check_cancelled()?;

        let expected_hash = {
            let swaps = self.swaps.read().await;
            let active = swaps
                .get(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            active
                .swap
                .secret_hash
                .ok_or_else(|| Error::NotReadyToSign("secret hash unknown".to_string()))?
        };

        let backend = self.backend(chain)?;
        let info = with_deadline(
            "get_transaction",
            BACKEND_CALL_TIMEOUT,
            backend.get_transaction(tx_id),
        )
        .await?
        .ok_or_else(|| Error::InvalidTxId(format!("{tx_id} not found on {chain}")))?;

        let raw = hex::decode(&info.hex).map_err(|e| Error::ChainIO(format!("tx hex: {e}")))?;
        let tx: Transaction = consensus::deserialize(&raw)
            .map_err(|e| Error::ChainIO(format!("tx decode: {e}")))?;

        let secret = extract_secret_from_witnesses(&tx, &expected_hash)
            .ok_or(Error::SecretMismatch)?;

        self.apply_revealed_secret(trade_id, secret, SecretSource::UtxoWitness, chain, tx_id)
            .await?;
        Ok(secret)
    }

    /// Store a revealed preimage into the swap and every session sharing it.
    pub async fn apply_revealed_secret(
        &self,
        trade_id: &str,
        secret: [u8; 32],
        source: SecretSource,
        source_chain: &str,
        source_tx: &str,
    ) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;

        if let Some(expected) = active.swap.secret_hash {
            if sha256(&secret) != expected {
                return Err(Error::SecretMismatch);
            }
        }
        active.swap.secret = Some(secret);

        if let Ok(sessions) = active.sessions_mut() {
            match sessions {
                SwapSessions::Musig2(_) => {}
                SwapSessions::HtlcUtxo(data) => {
                    data.offer.set_secret(secret)?;
                    data.request.set_secret(secret)?;
                }
                SwapSessions::HtlcEvm { offer, request } => {
                    offer.set_secret(secret)?;
                    request.set_secret(secret)?;
                }
                SwapSessions::Cross { utxo, evm, .. } => {
                    utxo.set_secret(secret)?;
                    evm.set_secret(secret)?;
                }
            }
        }

        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::SecretRevealed,
            json!({
                "secret_hash": hex::encode(sha256(&secret)),
                "source": source,
                "chain": source_chain,
                "tx": source_tx,
            }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timeout handling
    // -----------------------------------------------------------------------

    /// Scan all non-terminal swaps; refund every escrow we funded whose
    /// timeout height has passed. Per-swap errors are collected and do not
    /// stop the pass.
    pub async fn check_timeouts(&self) -> Vec<(String, Error)> {
        let mut errors = Vec::new();

        let trade_ids: Vec<String> = {
            let swaps = self.swaps.read().await;
            swaps
                .iter()
                .filter(|(_, a)| {
                    matches!(a.swap.state, SwapState::Funding | SwapState::Funded)
                })
                .map(|(id, _)| id.clone())
                .collect()
        };

        for trade_id in trade_ids {
            if self.check_cancelled().is_err() {
                break;
            }
            if let Err(e) = self.try_refund_expired(&trade_id).await {
                match e {
                    // Not yet expired or already resolved; nothing to log.
                    Error::SwapNotFound(_) => {}
                    other => {
                        log::warn!("timeout pass: swap {trade_id}: {other}");
                        errors.push((trade_id, other));
                    }
                }
            }
        }
        errors
    }

    /// Refund the local funding escrow of `trade_id` if its timeout passed.
    async fn try_refund_expired(&self, trade_id: &str) -> Result<()> {
        let (chain, timeout_height, method) = {
            let swaps = self.swaps.read().await;
            let active = swaps
                .get(trade_id)
                .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
            if active.swap.local_funding.tx_id.is_none() {
                return Ok(());
            }
            let side = active.swap.funding_side();
            let chain = active.swap.chain_symbol(side).to_string();
            (chain, active.swap.timeout_height(side), active.swap.method)
        };

        let height = self.chain_height(&chain).await?;
        if timeout_height == 0 || height < timeout_height {
            return Ok(());
        }

        log::info!("swap {trade_id}: timeout reached on {chain} (height {height}), refunding");
        match method {
            SwapMethod::Htlc => {
                self.refund_htlc(trade_id, &chain).await?;
            }
            SwapMethod::Musig2 => {
                self.refund_musig2(trade_id, &chain).await?;
            }
        }
        Ok(())
    }

    /// Script-path refund of our MuSig2 escrow through the CSV leaf.
    pub async fn refund_musig2(&self, trade_id: &str, chain: &str) -> Result<String> {
        self.check_cancelled()?;
        let fee_rate = self.utxo_fee_rate(chain).await.ok();

        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        let side = side_of(&active.swap, chain)?;
        let swap = active.swap.clone();
        let escrow = self.escrow_utxo(active, side)?;
        let local_priv = active
            .local_priv
            .ok_or_else(|| Error::NotReadyToSign("private key not recovered".to_string()))?;
        let timeout_blocks = swap.timeout_blocks(side)?;

        let SwapSessions::Musig2(data) = active.sessions_mut()? else {
            return Err(Error::MethodNotSupported(
                "script-path refund applies to musig2 swaps".to_string(),
            ));
        };
        let session = match side {
            ChainSide::Offer => &mut data.offer,
            ChainSide::Request => &mut data.request,
        };

        // Recompute the script tree if the cache did not survive a restart.
        if session.refund_tree().is_none() {
            let (refund_x, _) = local_priv.public_key(&Secp256k1::new()).x_only_public_key();
            session.restore_refund_tree(refund_x, timeout_blocks)?;
        }
        let tree = session.refund_tree().expect("just restored").clone();
        let spend_info = session.taproot_spend_info()?;
        let control_block = script::refund_control_block(&spend_info, &tree.leaf)?;

        let destination = swap
            .local_redeem_addresses
            .get(&chain.to_uppercase())
            .ok_or_else(|| Error::NotReadyToSign("local redeem address not set".to_string()))?;
        let destination_spk = script::address_to_script_pubkey(destination)?;

        let tx = build_scriptpath_refund(
            &escrow,
            &tree.leaf,
            &control_block,
            &local_priv,
            destination_spk,
            timeout_blocks,
            resolve_fee_rate(fee_rate),
        )?;
        let tx_id = self.broadcast(chain, &tx).await?;

        active.swap.transition(SwapState::Refunded)?;
        self.persist(active).await;
        self.emit(
            trade_id,
            SwapEventType::SwapRefunded,
            json!({ "chain": chain, "tx_id": tx_id }),
        );
        Ok(tx_id)
    }

    /// Cancel a swap that never started funding.
    pub async fn cancel_swap(&self, trade_id: &str) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        let active = swaps
            .get_mut(trade_id)
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        active.swap.transition(SwapState::Cancelled)?;
        self.persist(active).await;
        self.emit(trade_id, SwapEventType::SwapCancelled, json!({}));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read-only access
    // -----------------------------------------------------------------------

    pub async fn get_swap(&self, trade_id: &str) -> Result<Swap> {
        let swaps = self.swaps.read().await;
        swaps
            .get(trade_id)
            .map(|a| a.swap.clone())
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))
    }

    pub async fn list_swaps(&self) -> Vec<Swap> {
        let swaps = self.swaps.read().await;
        swaps.values().map(|a| a.swap.clone()).collect()
    }

    /// Trade ids of all live swaps (monitor snapshot).
    pub async fn active_trade_ids(&self) -> Vec<String> {
        let swaps = self.swaps.read().await;
        swaps.keys().cloned().collect()
    }

    /// Escrow watch points for the secret monitor: `(trade_id, chain,
    /// escrow_address, secret_hash)` per UTXO HTLC escrow of live swaps.
    pub async fn htlc_watch_points(&self) -> Vec<(String, String, String, [u8; 32])> {
        let swaps = self.swaps.read().await;
        let mut points = Vec::new();
        for (id, active) in swaps.iter() {
            if active.swap.state.is_terminal() || active.swap.method != SwapMethod::Htlc {
                continue;
            }
            let Some(hash) = active.swap.secret_hash else {
                continue;
            };
            for side in [ChainSide::Offer, ChainSide::Request] {
                let chain = active.swap.chain_symbol(side);
                if chains::get(chain).map(|c| c.is_utxo()).unwrap_or(false) {
                    if let Some(addr) = active.escrow_addr(side) {
                        points.push((id.clone(), chain.to_string(), addr.to_string(), hash));
                    }
                }
            }
        }
        points
    }

    /// One pass of the secret monitor: scan escrow spends on UTXO chains and
    /// `Claimed` events on EVM chains, propagating any preimage found into
    /// the owning swap. Per-swap errors are collected, not fatal.
    pub async fn scan_revealed_secrets(&self) -> Vec<(String, Error)> {
        let mut errors = Vec::new();

        // UTXO side: transactions spending the escrow output carry the
        // preimage in their witness.
        for (trade_id, chain, address, hash) in self.htlc_watch_points().await {
            if self.check_cancelled().is_err() {
                return errors;
            }
            if let Err(e) = self
                .scan_escrow_history(&trade_id, &chain, &address, &hash)
                .await
            {
                errors.push((trade_id, e));
            }
        }

        // EVM side: the contract logs the preimage on claim.
        for (trade_id, chain, swap_id, hash, from_block) in self.evm_watch_points().await {
            if self.check_cancelled().is_err() {
                return errors;
            }
            let result: Result<()> = async {
                let cfg = self.evm_chain(&chain)?;
                let logs = cfg
                    .rpc
                    .get_logs(crate::evm::LogFilter {
                        address: cfg.contract,
                        topics: vec![crate::evm::HtlcVault::Claimed::SIGNATURE_HASH, swap_id],
                        from_block,
                    })
                    .await?;
                for log in logs {
                    if log.data.len() < 32 {
                        continue;
                    }
                    let mut secret = [0u8; 32];
                    secret.copy_from_slice(&log.data[..32]);
                    if sha256(&secret) != hash {
                        continue;
                    }
                    self.apply_revealed_secret(
                        &trade_id,
                        secret,
                        SecretSource::EvmEvent,
                        &chain,
                        &format!("{:#x}", log.tx_hash),
                    )
                    .await?;
                    break;
                }
                Ok(())
            }
            .await;
            if let Err(e) = result {
                errors.push((trade_id, e));
            }
        }
        errors
    }

    /// EVM escrows whose preimage we are still waiting for:
    /// `(trade_id, chain, contract swap id, secret_hash, from_block)`.
    async fn evm_watch_points(&self) -> Vec<(String, String, B256, [u8; 32], u64)> {
        let swaps = self.swaps.read().await;
        let mut points = Vec::new();
        for (id, active) in swaps.iter() {
            if active.swap.state.is_terminal() || active.swap.secret.is_some() {
                continue;
            }
            let Some(hash) = active.swap.secret_hash else {
                continue;
            };
            let sessions = match &active.sessions {
                Some(s) => s,
                None => continue,
            };
            let evm_sides: Vec<(&EvmHtlcSession, ChainSide)> = match sessions {
                SwapSessions::HtlcEvm { offer, request } => {
                    vec![(offer, ChainSide::Offer), (request, ChainSide::Request)]
                }
                SwapSessions::Cross {
                    utxo_side, evm, ..
                } => vec![(evm, utxo_side.other())],
                _ => continue,
            };
            for (session, side) in evm_sides {
                let from_block = match side {
                    ChainSide::Offer => active.swap.offer_chain_start_height,
                    ChainSide::Request => active.swap.request_chain_start_height,
                };
                points.push((
                    id.clone(),
                    session.chain_symbol().to_string(),
                    session.swap_id(),
                    hash,
                    from_block,
                ));
            }
        }
        points
    }

    /// Scan one escrow address's history for a spend revealing the preimage.
    async fn scan_escrow_history(
        &self,
        trade_id: &str,
        chain: &str,
        address: &str,
        expected_hash: &[u8; 32],
    ) -> Result<()> {
        {
            let swaps = self.swaps.read().await;
            if let Some(active) = swaps.get(trade_id) {
                if active.swap.secret.is_some() {
                    return Ok(());
                }
            }
        }

        let backend = self.backend(chain)?;
        let txs = with_deadline(
            "get_address_txs",
            BACKEND_CALL_TIMEOUT,
            backend.get_address_txs(address),
        )
        .await?;

        for tx in txs {
            for input in &tx.inputs {
                // Only inputs that spend the escrow output itself.
                if input.prev_out_address.as_deref() != Some(address) {
                    continue;
                }
                for item in &input.witness {
                    if item.len() != 32 {
                        continue;
                    }
                    let mut secret = [0u8; 32];
                    secret.copy_from_slice(item);
                    if sha256(&secret) == *expected_hash {
                        self.apply_revealed_secret(
                            trade_id,
                            secret,
                            SecretSource::UtxoWitness,
                            chain,
                            &tx.tx_id,
                        )
                        .await?;
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Persistence / recovery
    // -----------------------------------------------------------------------

    fn to_record(&self, active: &ActiveSwap) -> SwapRecord {
        let swap = &active.swap;
        let method_data = match &active.sessions {
            Some(SwapSessions::Musig2(data)) => MethodData::Musig2(Musig2Record {
                local_pub: swap
                    .local_pub
                    .map(|p| hex::encode(p.serialize()))
                    .unwrap_or_default(),
                remote_pub: swap.remote_pub.map(|p| hex::encode(p.serialize())),
                local_priv: active.local_priv.map(|k| hex::encode(k.secret_bytes())),
                wallet_addrs: swap.local_redeem_addresses.clone(),
                offer_session: musig_chain_record(
                    &data.offer,
                    active.offer_escrow_addr.as_deref(),
                ),
                request_session: musig_chain_record(
                    &data.request,
                    active.request_escrow_addr.as_deref(),
                ),
                secret: swap.secret,
                secret_hash: swap.secret_hash,
            }),
            Some(SwapSessions::HtlcUtxo(data)) => MethodData::BitcoinHtlc(BitcoinHtlcRecord {
                local_pub: swap
                    .local_pub
                    .map(|p| hex::encode(p.serialize()))
                    .unwrap_or_default(),
                remote_pub: swap.remote_pub.map(|p| hex::encode(p.serialize())),
                local_priv: active.local_priv.map(|k| hex::encode(k.secret_bytes())),
                wallet_addrs: swap.local_redeem_addresses.clone(),
                offer_htlc: htlc_chain_record(&data.offer, active.offer_escrow_addr.as_deref()),
                request_htlc: htlc_chain_record(
                    &data.request,
                    active.request_escrow_addr.as_deref(),
                ),
                secret: swap.secret,
                secret_hash: swap.secret_hash,
            }),
            Some(SwapSessions::HtlcEvm { offer, request }) => {
                MethodData::EvmHtlc(EvmHtlcRecord {
                    local_pub: swap.local_pub.map(|p| hex::encode(p.serialize())),
                    remote_pub: swap.remote_pub.map(|p| hex::encode(p.serialize())),
                    wallet_addrs: swap.local_redeem_addresses.clone(),
                    offer_contract: evm_chain_record(offer),
                    request_contract: evm_chain_record(request),
                    secret: swap.secret,
                    secret_hash: swap.secret_hash,
                })
            }
            Some(SwapSessions::Cross {
                utxo_side, utxo, evm,
            }) => {
                let (offer_htlc, request_htlc) = match utxo_side {
                    ChainSide::Offer => (
                        htlc_chain_record(utxo, active.offer_escrow_addr.as_deref()),
                        HtlcChainRecord::default(),
                    ),
                    ChainSide::Request => (
                        HtlcChainRecord::default(),
                        htlc_chain_record(utxo, active.request_escrow_addr.as_deref()),
                    ),
                };
                MethodData::CrossChain(CrossChainRecord {
                    bitcoin_htlc: BitcoinHtlcRecord {
                        local_pub: swap
                            .local_pub
                            .map(|p| hex::encode(p.serialize()))
                            .unwrap_or_default(),
                        remote_pub: swap.remote_pub.map(|p| hex::encode(p.serialize())),
                        local_priv: active.local_priv.map(|k| hex::encode(k.secret_bytes())),
                        wallet_addrs: swap.local_redeem_addresses.clone(),
                        offer_htlc,
                        request_htlc,
                        secret: swap.secret,
                        secret_hash: swap.secret_hash,
                    },
                    evm_htlc: evm_chain_record(evm),
                })
            }
            // Read-only swap: re-serialize what we loaded.
            None => MethodData::BitcoinHtlc(BitcoinHtlcRecord {
                local_pub: swap
                    .local_pub
                    .map(|p| hex::encode(p.serialize()))
                    .unwrap_or_default(),
                remote_pub: swap.remote_pub.map(|p| hex::encode(p.serialize())),
                local_priv: None,
                wallet_addrs: swap.local_redeem_addresses.clone(),
                offer_htlc: HtlcChainRecord::default(),
                request_htlc: HtlcChainRecord::default(),
                secret: swap.secret,
                secret_hash: swap.secret_hash,
            }),
        };

        SwapRecord {
            trade_id: swap.id.clone(),
            order_id: swap.order_id.clone(),
            our_role: swap.role,
            is_maker: swap.is_maker(),
            network: swap.network,
            offer_chain: swap.offer.offer_chain.clone(),
            offer_amount: swap.offer.offer_amount,
            request_chain: swap.offer.request_chain.clone(),
            request_amount: swap.offer.request_amount,
            state: swap.state,
            created_at: swap.created_at,
            expires_at: swap.offer.expires_at,
            local_funding_tx_id: swap.local_funding.tx_id.clone(),
            local_funding_vout: swap.local_funding.vout,
            local_funding_confs: swap.local_funding.confirmations,
            remote_funding_tx_id: swap.remote_funding.tx_id.clone(),
            remote_funding_vout: swap.remote_funding.vout,
            remote_funding_confs: swap.remote_funding.confirmations,
            start_height: swap.offer_chain_start_height,
            timeout_height: swap.offer_chain_timeout_height,
            request_start_height: swap.request_chain_start_height,
            request_timeout_height: swap.request_chain_timeout_height,
            method_data,
        }
    }

    /// Rebuild every pending swap from storage. Swaps whose key material was
    /// not persisted load read-only.
    pub async fn load_pending_swaps(&self) -> Result<usize> {
        let records = self.store.get_pending_swaps().await?;
        let mut loaded = 0;
        for record in records {
            let trade_id = record.trade_id.clone();
            match self.rehydrate(record).await {
                Ok(()) => loaded += 1,
                Err(e) => log::warn!("failed to recover swap {trade_id}: {e}"),
            }
        }
        Ok(loaded)
    }

    /// Re-hydrate one swap from its stored record.
    pub async fn recover_swap(&self, trade_id: &str) -> Result<()> {
        let record = self
            .store
            .get_swap(trade_id)
            .await?
            .ok_or_else(|| Error::SwapNotFound(trade_id.to_string()))?;
        self.rehydrate(record).await
    }

    async fn rehydrate(&self, record: SwapRecord) -> Result<()> {
        let mut swaps = self.swaps.write().await;
        if swaps.contains_key(&record.trade_id) {
            return Err(Error::SwapExists(record.trade_id));
        }

        let method = record.method_data.method();
        let offer = Offer {
            offer_chain: record.offer_chain.clone(),
            offer_amount: record.offer_amount,
            request_chain: record.request_chain.clone(),
            request_amount: record.request_amount,
            method,
            expires_at: record.expires_at,
        };
        let mut swap = Swap::new(
            record.trade_id.clone(),
            record.order_id.clone(),
            offer,
            record.our_role,
            record.network,
        )?;
        swap.state = record.state;
        swap.created_at = record.created_at;
        swap.offer_chain_start_height = record.start_height;
        swap.offer_chain_timeout_height = record.timeout_height;
        swap.request_chain_start_height = record.request_start_height;
        swap.request_chain_timeout_height = record.request_timeout_height;
        swap.local_funding = FundingStatus {
            tx_id: record.local_funding_tx_id.clone(),
            vout: record.local_funding_vout,
            confirmations: record.local_funding_confs,
        };
        swap.remote_funding = FundingStatus {
            tx_id: record.remote_funding_tx_id.clone(),
            vout: record.remote_funding_vout,
            confirmations: record.remote_funding_confs,
        };

        let rebuilt = self.rebuild_sessions(&mut swap, &record)?;
        if rebuilt.sessions.is_none() {
            log::warn!(
                "swap {} recovered without its private key; signing operations will fail",
                swap.id
            );
        }
        let active = ActiveSwap {
            swap,
            sessions: rebuilt.sessions,
            local_priv: rebuilt.local_priv,
            offer_escrow_addr: rebuilt.offer_escrow_addr,
            request_escrow_addr: rebuilt.request_escrow_addr,
            combined_offer: false,
            combined_request: false,
        };
        self.persist(&active).await;
        swaps.insert(record.trade_id.clone(), active);
        Ok(())
    }

    /// Rebuild sessions from stored method data; `sessions` stays `None`
    /// when the ephemeral key is missing.
    fn rebuild_sessions(&self, swap: &mut Swap, record: &SwapRecord) -> Result<RebuiltSessions> {
        let parse_pub = |hex_str: &str| -> Result<PublicKey> {
            PublicKey::from_slice(
                &hex::decode(hex_str).map_err(|e| Error::InvalidPubKey(e.to_string()))?,
            )
            .map_err(|e| Error::InvalidPubKey(e.to_string()))
        };
        let parse_priv = |hex_str: &str| -> Result<SecretKey> {
            SecretKey::from_slice(
                &hex::decode(hex_str).map_err(|e| Error::Signing(e.to_string()))?,
            )
            .map_err(|e| Error::Signing(e.to_string()))
        };

        let mut offer_escrow_addr = None;
        let mut request_escrow_addr = None;

        let (sessions, local_priv) = match &record.method_data {
            MethodData::Musig2(data) => {
                swap.local_pub = Some(parse_pub(&data.local_pub)?);
                swap.remote_pub = data.remote_pub.as_deref().map(parse_pub).transpose()?;
                swap.secret = data.secret;
                swap.secret_hash = data.secret_hash;
                swap.local_redeem_addresses = data.wallet_addrs.clone();
                offer_escrow_addr = data.offer_session.taproot_addr.clone();
                request_escrow_addr = data.request_session.taproot_addr.clone();

                match data.local_priv.as_deref().map(parse_priv).transpose()? {
                    None => (None, None),
                    Some(key) => {
                        let mut offer_session =
                            Musig2Session::new(&record.offer_chain, record.network, key)?;
                        let mut request_session =
                            Musig2Session::new(&record.request_chain, record.network, key)?;
                        restore_musig_session(
                            &mut offer_session,
                            &data.offer_session,
                            swap.remote_pub,
                        )?;
                        restore_musig_session(
                            &mut request_session,
                            &data.request_session,
                            swap.remote_pub,
                        )?;
                        (
                            Some(SwapSessions::Musig2(Musig2Data {
                                offer: offer_session,
                                request: request_session,
                            })),
                            Some(key),
                        )
                    }
                }
            }
            MethodData::BitcoinHtlc(data) => {
                swap.local_pub = Some(parse_pub(&data.local_pub)?);
                swap.remote_pub = data.remote_pub.as_deref().map(parse_pub).transpose()?;
                swap.secret = data.secret;
                swap.secret_hash = data.secret_hash;
                swap.local_redeem_addresses = data.wallet_addrs.clone();
                offer_escrow_addr = data.offer_htlc.htlc_addr.clone();
                request_escrow_addr = data.request_htlc.htlc_addr.clone();

                match data.local_priv.as_deref().map(parse_priv).transpose()? {
                    None => (None, None),
                    Some(key) => {
                        let mut offer_session = HtlcSession::new(
                            &record.offer_chain,
                            record.network,
                            key,
                            record.is_maker,
                        )?;
                        let mut request_session = HtlcSession::new(
                            &record.request_chain,
                            record.network,
                            key,
                            !record.is_maker,
                        )?;
                        restore_htlc_session(
                            &mut offer_session,
                            &data.offer_htlc,
                            swap.remote_pub,
                            swap.secret,
                            swap.secret_hash,
                        )?;
                        restore_htlc_session(
                            &mut request_session,
                            &data.request_htlc,
                            swap.remote_pub,
                            swap.secret,
                            swap.secret_hash,
                        )?;
                        (
                            Some(SwapSessions::HtlcUtxo(HtlcData {
                                offer: offer_session,
                                request: request_session,
                            })),
                            Some(key),
                        )
                    }
                }
            }
            MethodData::EvmHtlc(data) => {
                swap.local_pub = data.local_pub.as_deref().map(parse_pub).transpose()?;
                swap.remote_pub = data.remote_pub.as_deref().map(parse_pub).transpose()?;
                swap.secret = data.secret;
                swap.secret_hash = data.secret_hash;
                swap.local_redeem_addresses = data.wallet_addrs.clone();
                let offer_cfg = self.evm_chain(&record.offer_chain)?;
                let request_cfg = self.evm_chain(&record.request_chain)?;
                let mut offer = EvmHtlcSession::new(
                    &record.offer_chain,
                    record.network,
                    offer_cfg.chain_id,
                    offer_cfg.contract,
                    &record.trade_id,
                    offer_cfg.rpc.clone(),
                )?;
                let mut request = EvmHtlcSession::new(
                    &record.request_chain,
                    record.network,
                    request_cfg.chain_id,
                    request_cfg.contract,
                    &record.trade_id,
                    request_cfg.rpc.clone(),
                )?;
                restore_evm_session(
                    &mut offer,
                    &data.offer_contract,
                    swap.secret,
                    swap.secret_hash,
                )?;
                restore_evm_session(
                    &mut request,
                    &data.request_contract,
                    swap.secret,
                    swap.secret_hash,
                )?;
                (Some(SwapSessions::HtlcEvm { offer, request }), None)
            }
            MethodData::CrossChain(data) => {
                let btc = &data.bitcoin_htlc;
                swap.local_pub = Some(parse_pub(&btc.local_pub)?);
                swap.remote_pub = btc.remote_pub.as_deref().map(parse_pub).transpose()?;
                swap.secret = btc.secret;
                swap.secret_hash = btc.secret_hash;
                swap.local_redeem_addresses = btc.wallet_addrs.clone();

                let offer_is_utxo = chains::get(&record.offer_chain)?.is_utxo();
                let (utxo_side, utxo_chain, utxo_record, evm_chain) = if offer_is_utxo {
                    (
                        ChainSide::Offer,
                        record.offer_chain.as_str(),
                        &btc.offer_htlc,
                        record.request_chain.as_str(),
                    )
                } else {
                    (
                        ChainSide::Request,
                        record.request_chain.as_str(),
                        &btc.request_htlc,
                        record.offer_chain.as_str(),
                    )
                };
                match utxo_side {
                    ChainSide::Offer => offer_escrow_addr = utxo_record.htlc_addr.clone(),
                    ChainSide::Request => request_escrow_addr = utxo_record.htlc_addr.clone(),
                }

                match btc.local_priv.as_deref().map(parse_priv).transpose()? {
                    None => (None, None),
                    Some(key) => {
                        let funds_utxo_leg = utxo_side == ChainSide::Offer && record.is_maker
                            || utxo_side == ChainSide::Request && !record.is_maker;
                        let mut utxo_session =
                            HtlcSession::new(utxo_chain, record.network, key, funds_utxo_leg)?;
                        restore_htlc_session(
                            &mut utxo_session,
                            utxo_record,
                            swap.remote_pub,
                            swap.secret,
                            swap.secret_hash,
                        )?;
                        let evm_cfg = self.evm_chain(evm_chain)?;
                        let mut evm_session = EvmHtlcSession::new(
                            evm_chain,
                            record.network,
                            evm_cfg.chain_id,
                            evm_cfg.contract,
                            &record.trade_id,
                            evm_cfg.rpc.clone(),
                        )?;
                        restore_evm_session(
                            &mut evm_session,
                            &data.evm_htlc,
                            swap.secret,
                            swap.secret_hash,
                        )?;
                        (
                            Some(SwapSessions::Cross {
                                utxo_side,
                                utxo: utxo_session,
                                evm: evm_session,
                            }),
                            Some(key),
                        )
                    }
                }
            }
        };

        Ok(RebuiltSessions {
            sessions,
            local_priv,
            offer_escrow_addr,
            request_escrow_addr,
        })
    }
}

/// Output of [`Coordinator::rebuild_sessions`].
struct RebuiltSessions {
    sessions: Option<SwapSessions>,
    local_priv: Option<SecretKey>,
    offer_escrow_addr: Option<String>,
    request_escrow_addr: Option<String>,
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

fn side_of(swap: &Swap, chain: &str) -> Result<ChainSide> {
    if swap.offer.offer_chain.eq_ignore_ascii_case(chain) {
        Ok(ChainSide::Offer)
    } else if swap.offer.request_chain.eq_ignore_ascii_case(chain) {
        Ok(ChainSide::Request)
    } else {
        Err(Error::UnsupportedChain(format!(
            "{chain} is not part of swap {}",
            swap.id
        )))
    }
}

fn utxo_session_mut(sessions: &mut SwapSessions, side: ChainSide) -> Result<&mut HtlcSession> {
    match sessions {
        SwapSessions::HtlcUtxo(data) => Ok(match side {
            ChainSide::Offer => &mut data.offer,
            ChainSide::Request => &mut data.request,
        }),
        SwapSessions::Cross {
            utxo_side, utxo, ..
        } if *utxo_side == side => Ok(utxo),
        _ => Err(Error::MethodNotSupported(
            "no UTXO HTLC session on this chain".to_string(),
        )),
    }
}

fn evm_session_mut(sessions: &mut SwapSessions, side: ChainSide) -> Result<&mut EvmHtlcSession> {
    match sessions {
        SwapSessions::HtlcEvm { offer, request } => Ok(match side {
            ChainSide::Offer => offer,
            ChainSide::Request => request,
        }),
        SwapSessions::Cross {
            utxo_side, evm, ..
        } if *utxo_side != side => Ok(evm),
        _ => Err(Error::MethodNotSupported(
            "no EVM HTLC session on this chain".to_string(),
        )),
    }
}

/// Scan a transaction's witnesses for a 32-byte item hashing to `expected`.
pub fn extract_secret_from_witnesses(tx: &Transaction, expected: &[u8; 32]) -> Option<[u8; 32]> {
    for input in &tx.input {
        for item in input.witness.iter() {
            if item.len() == 32 {
                let mut candidate = [0u8; 32];
                candidate.copy_from_slice(item);
                if sha256(&candidate) == *expected {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

fn musig_chain_record(session: &Musig2Session, addr: Option<&str>) -> Musig2ChainRecord {
    Musig2ChainRecord {
        taproot_addr: addr.map(str::to_string),
        refund_pub: session
            .refund_tree()
            .map(|t| hex::encode(t.refund_key.serialize())),
        timeout_blocks: session.refund_tree().map(|t| t.timeout_blocks),
        pub_nonce: session.pub_nonce().map(hex::encode),
        remote_nonce: None,
        partial_sig: session.partial_sig().map(hex::encode),
        used_nonces: session.used_nonces().map(hex::encode).collect(),
        nonce_used: session.nonce_used(),
        session_invalid: session.session_invalidated(),
    }
}

fn htlc_chain_record(session: &HtlcSession, addr: Option<&str>) -> HtlcChainRecord {
    HtlcChainRecord {
        htlc_addr: addr.map(str::to_string),
        redeem_script: session
            .redeem_script()
            .map(|s| hex::encode(s.as_bytes())),
        timeout_blocks: session
            .script_parts()
            .ok()
            .map(|p| p.timeout_blocks),
    }
}

fn evm_chain_record(session: &EvmHtlcSession) -> EvmChainRecord {
    EvmChainRecord {
        chain_id: session.chain_id(),
        contract: format!("{:#x}", session.contract()),
        swap_id: hex::encode(session.swap_id()),
        htlc_state: session.state(),
        params: session.params().cloned(),
        fund_tx: session.fund_tx().map(|t| format!("{t:#x}")),
        claim_tx: session.claim_tx().map(|t| format!("{t:#x}")),
        refund_tx: session.refund_tx().map(|t| format!("{t:#x}")),
    }
}

fn restore_musig_session(
    session: &mut Musig2Session,
    record: &Musig2ChainRecord,
    remote_pub: Option<PublicKey>,
) -> Result<()> {
    if let Some(remote) = remote_pub {
        session.set_remote_pub(remote)?;
    }
    if let (Some(refund_hex), Some(timeout)) = (&record.refund_pub, record.timeout_blocks) {
        let refund = bitcoin::XOnlyPublicKey::from_slice(
            &hex::decode(refund_hex).map_err(|e| Error::InvalidPubKey(e.to_string()))?,
        )
        .map_err(|e| Error::InvalidPubKey(e.to_string()))?;
        session.restore_refund_tree(refund, timeout)?;
    }
    let mut used = Vec::new();
    for nonce_hex in &record.used_nonces {
        let bytes = hex::decode(nonce_hex).map_err(|e| Error::Signing(e.to_string()))?;
        let nonce: [u8; PUB_NONCE_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Signing("stored nonce must be 66 bytes".to_string()))?;
        used.push(nonce);
    }
    // The in-flight nonce pair did not survive; its public half joins the
    // consumed set so it can never be signed with again.
    if let Some(nonce_hex) = &record.pub_nonce {
        let bytes = hex::decode(nonce_hex).map_err(|e| Error::Signing(e.to_string()))?;
        if let Ok(nonce) = <[u8; PUB_NONCE_LEN]>::try_from(bytes) {
            used.push(nonce);
        }
    }
    session.restore_used_nonces(used);
    session.restore_flags(false, false);
    Ok(())
}

fn restore_htlc_session(
    session: &mut HtlcSession,
    record: &HtlcChainRecord,
    remote_pub: Option<PublicKey>,
    secret: Option<[u8; 32]>,
    secret_hash: Option<[u8; 32]>,
) -> Result<()> {
    if let Some(remote) = remote_pub {
        session.set_remote_pub(remote)?;
    }
    if let Some(hash) = secret_hash {
        session.set_secret_hash(hash)?;
    }
    if let Some(secret) = secret {
        session.set_secret(secret)?;
    }
    if let (Some(script_hex), Some(addr)) = (&record.redeem_script, &record.htlc_addr) {
        session.restore_escrow(script_hex, addr)?;
    }
    Ok(())
}

fn restore_evm_session(
    session: &mut EvmHtlcSession,
    record: &EvmChainRecord,
    secret: Option<[u8; 32]>,
    secret_hash: Option<[u8; 32]>,
) -> Result<()> {
    if let Some(hash) = secret_hash {
        session.set_secret_hash(hash)?;
    }
    if let Some(secret) = secret {
        session.set_secret(secret)?;
    }
    let parse_tx = |s: &Option<String>| -> Result<Option<B256>> {
        s.as_deref()
            .map(|t| t.parse::<B256>().map_err(|e| Error::InvalidTxId(e.to_string())))
            .transpose()
    };
    session.restore(
        record.htlc_state,
        record.params.clone(),
        parse_tx(&record.fund_tx)?,
        parse_tx(&record.claim_tx)?,
        parse_tx(&record.refund_tx)?,
    );
    Ok(())
}
