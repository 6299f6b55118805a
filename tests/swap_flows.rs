//! End-to-end swap scenarios against scripted chain and wallet doubles.
//!
//! Two coordinators (one per party) share simulated chains, so funding
//! transactions broadcast by one side are visible to the other.

use bitcoin::consensus::encode as consensus;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Sequence, Transaction};
use klingdex_core::backend::{
    AddressUtxo, BackendFuture, ChainBackend, FeeEstimates, HistoryTx, TxInfo, WalletProvider,
    WalletUtxo,
};
use klingdex_core::coordinator::{Coordinator, CoordinatorConfig, EvmChainConfig};
use klingdex_core::error::Error;
use klingdex_core::evm::{EvmHtlcState, EvmRpc, LogEntry, LogFilter, RpcFuture};
use klingdex_core::script;
use klingdex_core::store::SwapStore;
use klingdex_core::store::memory::MemoryStore;
use klingdex_core::swap::{ChainSide, Offer, SwapState};
use klingdex_core::txbuilder::{self, AddressType, EscrowUtxo};
use klingdex_core::types::{Network, SwapMethod, sha256};
use alloy_sol_types::SolEvent;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Doubles
// ---------------------------------------------------------------------------

/// Scripted UTXO chain shared by both parties.
struct FakeChain {
    height: AtomicU64,
    confirmations: AtomicU32,
    txs: Mutex<HashMap<String, String>>,
    broadcasts: Mutex<Vec<String>>,
    address_txs: Mutex<Vec<HistoryTx>>,
}

impl FakeChain {
    fn new(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
            confirmations: AtomicU32::new(0),
            txs: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            address_txs: Mutex::new(Vec::new()),
        })
    }

    fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    fn set_confirmations(&self, confs: u32) {
        self.confirmations.store(confs, Ordering::SeqCst);
    }

    fn last_broadcast(&self) -> Transaction {
        let hex = self.broadcasts.lock().unwrap().last().unwrap().clone();
        consensus::deserialize(&hex::decode(hex).unwrap()).unwrap()
    }
}

impl ChainBackend for FakeChain {
    fn get_block_height(&self) -> BackendFuture<'_, u64> {
        Box::pin(async move { Ok(self.height.load(Ordering::SeqCst)) })
    }

    fn get_transaction(&self, tx_id: &str) -> BackendFuture<'_, Option<TxInfo>> {
        let tx_id = tx_id.to_string();
        Box::pin(async move {
            Ok(self.txs.lock().unwrap().get(&tx_id).map(|hex| TxInfo {
                hex: hex.clone(),
                confirmations: self.confirmations.load(Ordering::SeqCst),
            }))
        })
    }

    fn get_address_utxos(&self, _address: &str) -> BackendFuture<'_, Vec<AddressUtxo>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn get_address_txs(&self, _address: &str) -> BackendFuture<'_, Vec<HistoryTx>> {
        Box::pin(async move { Ok(self.address_txs.lock().unwrap().clone()) })
    }

    fn get_fee_estimates(&self) -> BackendFuture<'_, FeeEstimates> {
        Box::pin(async move {
            Ok(FeeEstimates {
                fastest_fee: Some(20),
                half_hour_fee: Some(10),
                hour_fee: Some(5),
            })
        })
    }

    fn broadcast_transaction(&self, tx_hex: &str) -> BackendFuture<'_, String> {
        let tx_hex = tx_hex.to_string();
        Box::pin(async move {
            let tx: Transaction = consensus::deserialize(
                &hex::decode(&tx_hex).map_err(|e| Error::ChainIO(e.to_string()))?,
            )
            .map_err(|e| Error::ChainIO(e.to_string()))?;
            let txid = tx.compute_txid().to_string();
            self.txs.lock().unwrap().insert(txid.clone(), tx_hex.clone());
            self.broadcasts.lock().unwrap().push(tx_hex);
            Ok(txid)
        })
    }
}

/// Deterministic single-account wallet with one large UTXO per chain.
struct FakeWallet {
    seed: u8,
}

impl FakeWallet {
    fn new(seed: u8) -> Arc<Self> {
        Arc::new(Self { seed })
    }

    fn key(&self, chain: &str, account: u32, change: u32, index: u32) -> SecretKey {
        let mut material = vec![self.seed];
        material.extend_from_slice(chain.as_bytes());
        material.extend_from_slice(&account.to_be_bytes());
        material.extend_from_slice(&change.to_be_bytes());
        material.extend_from_slice(&index.to_be_bytes());
        SecretKey::from_slice(&sha256(&material)).unwrap()
    }

    fn address(&self, chain: &str, account: u32, change: u32, index: u32) -> String {
        let secp = bitcoin::key::Secp256k1::new();
        let key = self.key(chain, account, change, index);
        let pk = bitcoin::PublicKey::new(key.public_key(&secp));
        bitcoin::Address::p2wpkh(
            &bitcoin::CompressedPublicKey::try_from(pk).unwrap(),
            bitcoin::Network::Regtest,
        )
        .to_string()
    }
}

impl WalletProvider for FakeWallet {
    fn derive_address(
        &self,
        chain: &str,
        account: u32,
        change: u32,
        index: u32,
    ) -> BackendFuture<'_, String> {
        let chain = chain.to_string();
        Box::pin(async move { Ok(self.address(&chain, account, change, index)) })
    }

    fn derive_private_key(
        &self,
        chain: &str,
        account: u32,
        change: u32,
        index: u32,
    ) -> BackendFuture<'_, SecretKey> {
        let chain = chain.to_string();
        Box::pin(async move { Ok(self.key(&chain, account, change, index)) })
    }

    fn list_all_utxos(&self, chain: &str) -> BackendFuture<'_, Vec<WalletUtxo>> {
        let chain = chain.to_string();
        Box::pin(async move {
            let mut seed_material = vec![self.seed, 0xfe];
            seed_material.extend_from_slice(chain.as_bytes());
            Ok(vec![WalletUtxo {
                tx_id: hex::encode(sha256(&seed_material)),
                vout: 0,
                amount: 10_000_000,
                address: self.address(&chain, 0, 0, 0),
                address_type: AddressType::P2wpkh,
                account: 0,
                change: 0,
                address_index: 0,
            }])
        })
    }
}

/// Scripted EVM node shared by both parties.
struct FakeEvmRpc {
    height: AtomicU64,
    confirmations: AtomicU32,
    sent: Mutex<Vec<(alloy_primitives::Address, Vec<u8>, alloy_primitives::U256)>>,
    logs: Mutex<Vec<LogEntry>>,
}

impl FakeEvmRpc {
    fn new(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height: AtomicU64::new(height),
            confirmations: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        })
    }
}

impl EvmRpc for FakeEvmRpc {
    fn block_number(&self) -> RpcFuture<'_, u64> {
        Box::pin(async move { Ok(self.height.load(Ordering::SeqCst)) })
    }

    fn call(&self, _to: alloy_primitives::Address, _data: Vec<u8>) -> RpcFuture<'_, Vec<u8>> {
        Box::pin(async move { Ok(Vec::new()) })
    }

    fn send_transaction(
        &self,
        to: alloy_primitives::Address,
        data: Vec<u8>,
        value: alloy_primitives::U256,
    ) -> RpcFuture<'_, alloy_primitives::B256> {
        Box::pin(async move {
            let mut preimage = data.clone();
            preimage.extend_from_slice(to.as_slice());
            let hash = alloy_primitives::B256::from(sha256(&preimage));
            self.sent.lock().unwrap().push((to, data, value));
            Ok(hash)
        })
    }

    fn get_logs(&self, _filter: LogFilter) -> RpcFuture<'_, Vec<LogEntry>> {
        Box::pin(async move { Ok(self.logs.lock().unwrap().clone()) })
    }

    fn transaction_confirmations(
        &self,
        _tx_hash: alloy_primitives::B256,
    ) -> RpcFuture<'_, u32> {
        Box::pin(async move { Ok(self.confirmations.load(Ordering::SeqCst)) })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Party {
    coordinator: Arc<Coordinator<MemoryStore>>,
    store: Arc<MemoryStore>,
    wallet: Arc<FakeWallet>,
}

fn evm_config(symbol: &str, rpc: Arc<FakeEvmRpc>) -> EvmChainConfig {
    let (chain_id, contract) = match symbol {
        "ETH" => (1, alloy_primitives::Address::repeat_byte(0x42)),
        "POL" => (137, alloy_primitives::Address::repeat_byte(0x43)),
        other => panic!("unknown EVM chain {other}"),
    };
    EvmChainConfig {
        chain_id,
        contract,
        rpc,
    }
}

fn party(
    seed: u8,
    btc: &Arc<FakeChain>,
    ltc: &Arc<FakeChain>,
    evm: &[(&str, Arc<FakeEvmRpc>)],
) -> Party {
    let store = Arc::new(MemoryStore::new());
    let wallet = FakeWallet::new(seed);
    let config = CoordinatorConfig {
        network: Network::Regtest,
        ..CoordinatorConfig::default()
    };
    let mut coordinator = Coordinator::new(config, store.clone());
    coordinator.register_backend("BTC", btc.clone());
    coordinator.register_backend("LTC", ltc.clone());
    for (symbol, rpc) in evm {
        coordinator.register_evm_chain(symbol, evm_config(symbol, rpc.clone()));
    }
    coordinator.set_wallet(wallet.clone());
    Party {
        coordinator: Arc::new(coordinator),
        store,
        wallet,
    }
}

fn btc_ltc_offer(method: SwapMethod) -> Offer {
    Offer {
        offer_chain: "BTC".to_string(),
        offer_amount: 100_000,
        request_chain: "LTC".to_string(),
        request_amount: 1_000_000,
        method,
        expires_at: i64::MAX,
    }
}

/// Run key exchange and funding until both parties reach `funded`.
async fn fund_and_confirm(
    alice: &Party,
    bob: &Party,
    trade_id: &str,
    btc: &Arc<FakeChain>,
    ltc: &Arc<FakeChain>,
) -> (String, String) {
    let alice_btc_tx = alice.coordinator.fund_swap(trade_id).await.unwrap();
    let bob_ltc_tx = bob.coordinator.fund_swap(trade_id).await.unwrap();

    alice
        .coordinator
        .set_funding_tx(trade_id, &bob_ltc_tx, 0, false)
        .await
        .unwrap();
    bob.coordinator
        .set_funding_tx(trade_id, &alice_btc_tx, 0, false)
        .await
        .unwrap();

    btc.set_confirmations(3);
    ltc.set_confirmations(6);
    alice.coordinator.update_confirmations(trade_id).await.unwrap();
    bob.coordinator.update_confirmations(trade_id).await.unwrap();

    assert_eq!(
        alice.coordinator.get_swap(trade_id).await.unwrap().state,
        SwapState::Funded
    );
    assert_eq!(
        bob.coordinator.get_swap(trade_id).await.unwrap().state,
        SwapState::Funded
    );
    (alice_btc_tx, bob_ltc_tx)
}

/// Set up a swap through pubkey exchange for both parties.
async fn open_swap(alice: &Party, bob: &Party, method: SwapMethod) -> String {
    let trade_id = alice
        .coordinator
        .initiate_swap("trade-1", "order-1", btc_ltc_offer(method))
        .await
        .unwrap();

    let alice_swap = alice.coordinator.get_swap(&trade_id).await.unwrap();
    let alice_pub = alice_swap.local_pub.unwrap();

    bob.coordinator
        .respond_to_swap(
            &trade_id,
            "order-1",
            btc_ltc_offer(method),
            alice_pub,
            alice_swap.secret_hash,
        )
        .await
        .unwrap();
    let bob_pub = bob
        .coordinator
        .get_swap(&trade_id)
        .await
        .unwrap()
        .local_pub
        .unwrap();

    alice
        .coordinator
        .set_remote_pubkey(&trade_id, bob_pub)
        .await
        .unwrap();
    bob.coordinator
        .set_remote_pubkey(&trade_id, alice_pub)
        .await
        .unwrap();

    // Redemption destinations for both chains.
    for (p, is_local_for_alice) in [(alice, true), (bob, false)] {
        for chain in ["BTC", "LTC"] {
            let addr = p.wallet.address(chain, 0, 0, 7);
            alice
                .coordinator
                .set_redeem_address(&trade_id, chain, &addr, is_local_for_alice)
                .await
                .unwrap();
            bob.coordinator
                .set_redeem_address(&trade_id, chain, &addr, !is_local_for_alice)
                .await
                .unwrap();
        }
    }
    trade_id
}

/// Key-path spend sighashes over both escrows, identical for both parties.
async fn keypath_sighashes(
    alice: &Party,
    trade_id: &str,
    btc_funding: &str,
    ltc_funding: &str,
) -> ([u8; 32], [u8; 32]) {
    let swap = alice.coordinator.get_swap(trade_id).await.unwrap();
    let record = alice.store.get_swap(trade_id).await.unwrap().unwrap();
    let (offer_escrow, request_escrow) = match record.method_data {
        klingdex_core::store::MethodData::Musig2(m) => (
            m.offer_session.taproot_addr.unwrap(),
            m.request_session.taproot_addr.unwrap(),
        ),
        other => panic!("expected musig2 method data, got {other:?}"),
    };

    let dest = script::address_to_script_pubkey(
        &swap.local_redeem_addresses.get("BTC").unwrap().clone(),
    )
    .unwrap();

    let offer_spend = txbuilder::build_keypath_spend(
        &EscrowUtxo {
            outpoint: bitcoin::OutPoint {
                txid: bitcoin::Txid::from_str(btc_funding).unwrap(),
                vout: 0,
            },
            amount: swap.offer.offer_amount,
            script_pubkey: script::address_to_script_pubkey(&offer_escrow).unwrap(),
        },
        dest.clone(),
        None,
        10,
    )
    .unwrap();
    let request_spend = txbuilder::build_keypath_spend(
        &EscrowUtxo {
            outpoint: bitcoin::OutPoint {
                txid: bitcoin::Txid::from_str(ltc_funding).unwrap(),
                vout: 0,
            },
            amount: swap.offer.request_amount,
            script_pubkey: script::address_to_script_pubkey(&request_escrow).unwrap(),
        },
        dest,
        None,
        10,
    )
    .unwrap();
    (offer_spend.sighash, request_spend.sighash)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn musig2_happy_path_reaches_redeemed() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);
    let bob = party(0xb2, &btc, &ltc, &[]);

    let trade_id = open_swap(&alice, &bob, SwapMethod::Musig2).await;

    // Both parties derived the same escrow addresses.
    let alice_record = alice.store.get_swap(&trade_id).await.unwrap().unwrap();
    let bob_record = bob.store.get_swap(&trade_id).await.unwrap().unwrap();
    let (a_offer, a_request) = match &alice_record.method_data {
        klingdex_core::store::MethodData::Musig2(m) => (
            m.offer_session.taproot_addr.clone(),
            m.request_session.taproot_addr.clone(),
        ),
        _ => panic!("wrong method data"),
    };
    let (b_offer, b_request) = match &bob_record.method_data {
        klingdex_core::store::MethodData::Musig2(m) => (
            m.offer_session.taproot_addr.clone(),
            m.request_session.taproot_addr.clone(),
        ),
        _ => panic!("wrong method data"),
    };
    assert_eq!(a_offer, b_offer);
    assert_eq!(a_request, b_request);

    let (btc_tx, ltc_tx) = fund_and_confirm(&alice, &bob, &trade_id, &btc, &ltc).await;

    // Nonce exchange.
    let (a_on, a_rn) = alice.coordinator.generate_nonces(&trade_id).await.unwrap();
    let (b_on, b_rn) = bob.coordinator.generate_nonces(&trade_id).await.unwrap();
    alice
        .coordinator
        .set_remote_nonces(&trade_id, &b_on, &b_rn)
        .await
        .unwrap();
    bob.coordinator
        .set_remote_nonces(&trade_id, &a_on, &a_rn)
        .await
        .unwrap();

    // Both sign the same key-path sighashes.
    let (offer_sighash, request_sighash) =
        keypath_sighashes(&alice, &trade_id, &btc_tx, &ltc_tx).await;
    let (a_po, a_pr) = alice
        .coordinator
        .create_partial_signatures(&trade_id, offer_sighash, request_sighash)
        .await
        .unwrap();
    let (b_po, b_pr) = bob
        .coordinator
        .create_partial_signatures(&trade_id, offer_sighash, request_sighash)
        .await
        .unwrap();

    // Combination is symmetric: both parties produce identical signatures.
    let a_sig_btc = alice
        .coordinator
        .combine_signatures(&trade_id, "BTC", b_po)
        .await
        .unwrap();
    let b_sig_btc = bob
        .coordinator
        .combine_signatures(&trade_id, "BTC", a_po)
        .await
        .unwrap();
    assert_eq!(a_sig_btc, b_sig_btc);

    let a_sig_ltc = alice
        .coordinator
        .combine_signatures(&trade_id, "LTC", b_pr)
        .await
        .unwrap();
    let b_sig_ltc = bob
        .coordinator
        .combine_signatures(&trade_id, "LTC", a_pr)
        .await
        .unwrap();
    assert_eq!(a_sig_ltc, b_sig_ltc);

    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Redeemed
    );
    assert_eq!(
        bob.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Redeemed
    );
}

#[tokio::test]
async fn completion_is_rejected_inside_timeout_margin() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);
    let bob = party(0xb2, &btc, &ltc, &[]);

    let trade_id = open_swap(&alice, &bob, SwapMethod::Musig2).await;
    fund_and_confirm(&alice, &bob, &trade_id, &btc, &ltc).await;

    let (a_on, a_rn) = alice.coordinator.generate_nonces(&trade_id).await.unwrap();
    let (b_on, b_rn) = bob.coordinator.generate_nonces(&trade_id).await.unwrap();
    alice
        .coordinator
        .set_remote_nonces(&trade_id, &b_on, &b_rn)
        .await
        .unwrap();
    bob.coordinator
        .set_remote_nonces(&trade_id, &a_on, &a_rn)
        .await
        .unwrap();

    // 5 blocks left on the offer chain; margin is 6.
    let timeout = alice
        .coordinator
        .get_swap(&trade_id)
        .await
        .unwrap()
        .timeout_height(ChainSide::Offer);
    btc.set_height(timeout - 5);

    let err = alice
        .coordinator
        .create_partial_signatures(&trade_id, [1u8; 32], [2u8; 32])
        .await
        .unwrap_err();
    match err {
        Error::TimeoutRace {
            chain,
            blocks_left,
            margin,
        } => {
            assert_eq!(chain, "BTC");
            assert_eq!(blocks_left, 5);
            assert_eq!(margin, 6);
        }
        other => panic!("expected TimeoutRace, got {other}"),
    }
    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Funded
    );
}

#[tokio::test]
async fn htlc_secret_reveal_claims_both_chains() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);
    let bob = party(0xb2, &btc, &ltc, &[]);

    let trade_id = open_swap(&alice, &bob, SwapMethod::Htlc).await;
    fund_and_confirm(&alice, &bob, &trade_id, &btc, &ltc).await;

    // The initiator claims on the request chain, revealing the preimage.
    let claim_tx = alice.coordinator.claim_htlc(&trade_id, "LTC").await.unwrap();
    let witness: Vec<Vec<u8>> = ltc.last_broadcast().input[0]
        .witness
        .iter()
        .map(|w| w.to_vec())
        .collect();
    assert_eq!(witness.len(), 4);
    assert_eq!(witness[2], vec![1u8]);

    // The responder extracts the secret from the broadcast transaction.
    let secret = bob
        .coordinator
        .extract_secret_from_tx(&trade_id, &claim_tx, "LTC")
        .await
        .unwrap();
    let alice_secret = alice.coordinator.get_swap(&trade_id).await.unwrap().secret;
    assert_eq!(Some(secret), alice_secret);

    // The responder claims the offer-chain escrow with the learned preimage.
    bob.coordinator.claim_htlc(&trade_id, "BTC").await.unwrap();
    let witness: Vec<Vec<u8>> = btc.last_broadcast().input[0]
        .witness
        .iter()
        .map(|w| w.to_vec())
        .collect();
    assert_eq!(witness.len(), 4);
    assert_eq!(witness[1], secret.to_vec());

    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Redeemed
    );
    assert_eq!(
        bob.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Redeemed
    );
}

#[tokio::test]
async fn timeout_monitor_refunds_after_taker_disappears() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);
    let bob = party(0xb2, &btc, &ltc, &[]);

    let trade_id = open_swap(&alice, &bob, SwapMethod::Musig2).await;

    // Maker funds; taker never does.
    alice.coordinator.fund_swap(&trade_id).await.unwrap();
    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Funding
    );

    // Nothing happens before the timeout height.
    btc.set_height(1_000 + 143);
    assert!(alice.coordinator.check_timeouts().await.is_empty());
    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Funding
    );

    // At H0 + 144 the monitor broadcasts the script-path refund.
    btc.set_height(1_000 + 144);
    let errors = alice.coordinator.check_timeouts().await;
    assert!(errors.is_empty(), "refund pass failed: {errors:?}");

    let refund = btc.last_broadcast();
    assert_eq!(refund.input[0].sequence, Sequence(144));
    let witness: Vec<Vec<u8>> = refund.input[0].witness.iter().map(|w| w.to_vec()).collect();
    // [schnorr_sig, refund_script, control_block]
    assert_eq!(witness.len(), 3);
    assert_eq!(witness[0].len(), 64);
    assert_eq!(witness[2].len(), 33);

    assert_eq!(
        alice.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Refunded
    );
}

#[tokio::test]
async fn cross_chain_swap_propagates_secret_from_evm_event() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let eth = FakeEvmRpc::new(9_000);
    let alice = party(0xa1, &btc, &ltc, &[("ETH", eth.clone())]);
    let bob = party(0xb2, &btc, &ltc, &[("ETH", eth.clone())]);

    let offer = Offer {
        offer_chain: "BTC".to_string(),
        offer_amount: 100_000,
        request_chain: "ETH".to_string(),
        request_amount: 50_000_000,
        method: SwapMethod::Htlc,
        expires_at: i64::MAX,
    };

    let trade_id = alice
        .coordinator
        .initiate_swap("cross-1", "order-9", offer.clone())
        .await
        .unwrap();
    let alice_swap = alice.coordinator.get_swap(&trade_id).await.unwrap();
    let alice_pub = alice_swap.local_pub.unwrap();
    let secret_hash = alice_swap.secret_hash.unwrap();

    bob.coordinator
        .respond_to_swap(&trade_id, "order-9", offer, alice_pub, Some(secret_hash))
        .await
        .unwrap();
    let bob_pub = bob
        .coordinator
        .get_swap(&trade_id)
        .await
        .unwrap()
        .local_pub
        .unwrap();

    alice
        .coordinator
        .set_remote_pubkey(&trade_id, bob_pub)
        .await
        .unwrap();
    bob.coordinator
        .set_remote_pubkey(&trade_id, alice_pub)
        .await
        .unwrap();

    // Redeem destinations: BTC addresses plus Alice's EVM account.
    let alice_eth = format!("{:#x}", alloy_primitives::Address::repeat_byte(0x77));
    for p in [&alice, &bob] {
        let btc_addr = p.wallet.address("BTC", 0, 0, 7);
        let is_local = std::ptr::eq(p, &alice);
        alice
            .coordinator
            .set_redeem_address(&trade_id, "BTC", &btc_addr, is_local)
            .await
            .unwrap();
        bob.coordinator
            .set_redeem_address(&trade_id, "BTC", &btc_addr, !is_local)
            .await
            .unwrap();
    }
    alice
        .coordinator
        .set_redeem_address(&trade_id, "ETH", &alice_eth, true)
        .await
        .unwrap();
    bob.coordinator
        .set_redeem_address(&trade_id, "ETH", &alice_eth, false)
        .await
        .unwrap();

    // Maker funds BTC; taker opens the contract escrow on ETH.
    let btc_tx = alice.coordinator.fund_swap(&trade_id).await.unwrap();
    let eth_tx = bob.coordinator.fund_swap(&trade_id).await.unwrap();
    assert_eq!(eth.sent.lock().unwrap().len(), 1);

    alice
        .coordinator
        .set_funding_tx(&trade_id, &eth_tx, 0, false)
        .await
        .unwrap();
    bob.coordinator
        .set_funding_tx(&trade_id, &btc_tx, 0, false)
        .await
        .unwrap();
    btc.set_confirmations(3);
    eth.confirmations.store(12, Ordering::SeqCst);
    alice.coordinator.update_confirmations(&trade_id).await.unwrap();
    bob.coordinator.update_confirmations(&trade_id).await.unwrap();
    assert_eq!(
        bob.coordinator.get_swap(&trade_id).await.unwrap().state,
        SwapState::Funded
    );

    // The initiator claims on ETH, revealing the preimage in the contract.
    alice.coordinator.claim_htlc(&trade_id, "ETH").await.unwrap();
    let alice_secret = alice
        .coordinator
        .get_swap(&trade_id)
        .await
        .unwrap()
        .secret
        .unwrap();

    // The contract logs the claim; the responder's secret monitor picks it up.
    let swap_id = alloy_primitives::keccak256(trade_id.as_bytes());
    eth.logs.lock().unwrap().push(LogEntry {
        topics: vec![
            klingdex_core::evm::HtlcVault::Claimed::SIGNATURE_HASH,
            swap_id,
        ],
        data: alice_secret.to_vec(),
        tx_hash: alloy_primitives::B256::repeat_byte(0x33),
        block_number: 9_001,
    });
    let errors = bob.coordinator.scan_revealed_secrets().await;
    assert!(errors.is_empty(), "secret scan failed: {errors:?}");
    assert_eq!(
        bob.coordinator.get_swap(&trade_id).await.unwrap().secret,
        Some(alice_secret)
    );

    // The responder claims the BTC escrow with the same preimage.
    bob.coordinator.claim_htlc(&trade_id, "BTC").await.unwrap();
    let witness: Vec<Vec<u8>> = btc.last_broadcast().input[0]
        .witness
        .iter()
        .map(|w| w.to_vec())
        .collect();
    assert_eq!(witness[1], alice_secret.to_vec());
}

#[tokio::test]
async fn musig2_swap_survives_restart_mid_nonce_exchange() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);
    let bob = party(0xb2, &btc, &ltc, &[]);

    let trade_id = open_swap(&alice, &bob, SwapMethod::Musig2).await;
    let (btc_tx, ltc_tx) = fund_and_confirm(&alice, &bob, &trade_id, &btc, &ltc).await;

    // Alice gets through her half of the nonce exchange, then restarts.
    alice.coordinator.generate_nonces(&trade_id).await.unwrap();
    let escrow_before = alice
        .store
        .get_swap(&trade_id)
        .await
        .unwrap()
        .unwrap();

    let mut restarted = Coordinator::new(
        CoordinatorConfig {
            network: Network::Regtest,
            ..CoordinatorConfig::default()
        },
        alice.store.clone(),
    );
    restarted.register_backend("BTC", btc.clone());
    restarted.register_backend("LTC", ltc.clone());
    restarted.set_wallet(alice.wallet.clone());
    let restarted = Arc::new(restarted);

    assert_eq!(restarted.load_pending_swaps().await.unwrap(), 1);

    // The recovered sessions derive the same escrow addresses.
    let escrow_after = restarted
        .store()
        .get_swap(&trade_id)
        .await
        .unwrap()
        .unwrap();
    match (&escrow_before.method_data, &escrow_after.method_data) {
        (
            klingdex_core::store::MethodData::Musig2(before),
            klingdex_core::store::MethodData::Musig2(after),
        ) => {
            assert_eq!(
                before.offer_session.taproot_addr,
                after.offer_session.taproot_addr
            );
            assert_eq!(
                before.request_session.taproot_addr,
                after.request_session.taproot_addr
            );
            // The lost in-flight nonce joined the consumed set.
            assert!(
                after
                    .offer_session
                    .used_nonces
                    .contains(before.offer_session.pub_nonce.as_ref().unwrap())
            );
        }
        _ => panic!("wrong method data"),
    }

    // A fresh nonce exchange and signing round completes jointly with Bob.
    let (a_on, a_rn) = restarted.generate_nonces(&trade_id).await.unwrap();
    let (b_on, b_rn) = bob.coordinator.generate_nonces(&trade_id).await.unwrap();
    restarted
        .set_remote_nonces(&trade_id, &b_on, &b_rn)
        .await
        .unwrap();
    bob.coordinator
        .set_remote_nonces(&trade_id, &a_on, &a_rn)
        .await
        .unwrap();

    let (offer_sighash, request_sighash) =
        keypath_sighashes(&alice, &trade_id, &btc_tx, &ltc_tx).await;
    let (a_po, a_pr) = restarted
        .create_partial_signatures(&trade_id, offer_sighash, request_sighash)
        .await
        .unwrap();
    let (b_po, b_pr) = bob
        .coordinator
        .create_partial_signatures(&trade_id, offer_sighash, request_sighash)
        .await
        .unwrap();

    let a_sig = restarted
        .combine_signatures(&trade_id, "BTC", b_po)
        .await
        .unwrap();
    let b_sig = bob
        .coordinator
        .combine_signatures(&trade_id, "BTC", a_po)
        .await
        .unwrap();
    assert_eq!(a_sig, b_sig);

    let a_sig = restarted
        .combine_signatures(&trade_id, "LTC", b_pr)
        .await
        .unwrap();
    let b_sig = bob
        .coordinator
        .combine_signatures(&trade_id, "LTC", a_pr)
        .await
        .unwrap();
    assert_eq!(a_sig, b_sig);
}

#[tokio::test]
async fn duplicate_trade_id_is_rejected() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let alice = party(0xa1, &btc, &ltc, &[]);

    alice
        .coordinator
        .initiate_swap("dup", "o1", btc_ltc_offer(SwapMethod::Musig2))
        .await
        .unwrap();
    assert!(matches!(
        alice
            .coordinator
            .initiate_swap("dup", "o1", btc_ltc_offer(SwapMethod::Musig2))
            .await,
        Err(Error::SwapExists(_))
    ));

    // Funding twice is rejected as well.
    alice.coordinator.fund_swap("dup").await.unwrap();
    assert!(matches!(
        alice.coordinator.fund_swap("dup").await,
        Err(Error::AlreadyFunded(_))
    ));
}

#[tokio::test]
async fn evm_to_evm_swap_persists_both_contract_legs() {
    let btc = FakeChain::new(1_000);
    let ltc = FakeChain::new(2_000);
    let eth = FakeEvmRpc::new(9_000);
    let pol = FakeEvmRpc::new(40_000);
    let alice = party(
        0xa1,
        &btc,
        &ltc,
        &[("ETH", eth.clone()), ("POL", pol.clone())],
    );

    let offer = Offer {
        offer_chain: "ETH".to_string(),
        offer_amount: 50_000_000,
        request_chain: "POL".to_string(),
        request_amount: 80_000_000,
        method: SwapMethod::Htlc,
        expires_at: i64::MAX,
    };
    let trade_id = alice
        .coordinator
        .initiate_swap("evm-evm-1", "order-3", offer)
        .await
        .unwrap();

    // Counterparty's account receives the offer-chain escrow.
    let bob_evm = format!("{:#x}", alloy_primitives::Address::repeat_byte(0x55));
    alice
        .coordinator
        .set_redeem_address(&trade_id, "ETH", &bob_evm, false)
        .await
        .unwrap();

    // The maker opens the ETH escrow, then claims the (simulated) POL leg,
    // so both contract sessions carry distinct state and tx hashes.
    alice.coordinator.fund_swap(&trade_id).await.unwrap();
    assert_eq!(eth.sent.lock().unwrap().len(), 1);
    let secret = alice
        .coordinator
        .get_swap(&trade_id)
        .await
        .unwrap()
        .secret
        .unwrap();
    alice.coordinator.claim_htlc(&trade_id, "POL").await.unwrap();
    assert_eq!(pol.sent.lock().unwrap().len(), 1);

    let before = alice.store.get_swap(&trade_id).await.unwrap().unwrap();
    let before_data = match &before.method_data {
        klingdex_core::store::MethodData::EvmHtlc(d) => d.clone(),
        other => panic!("expected evm method data, got {other:?}"),
    };
    assert_eq!(before_data.offer_contract.chain_id, 1);
    assert_eq!(before_data.offer_contract.htlc_state, EvmHtlcState::Funded);
    assert!(before_data.offer_contract.fund_tx.is_some());
    assert_eq!(before_data.request_contract.chain_id, 137);
    assert_eq!(before_data.request_contract.htlc_state, EvmHtlcState::Claimed);
    assert!(before_data.request_contract.claim_tx.is_some());

    // Restart against the same store; both contract legs survive.
    let mut restarted = Coordinator::new(
        CoordinatorConfig {
            network: Network::Regtest,
            ..CoordinatorConfig::default()
        },
        alice.store.clone(),
    );
    restarted.register_backend("BTC", btc.clone());
    restarted.register_backend("LTC", ltc.clone());
    restarted.register_evm_chain("ETH", evm_config("ETH", eth.clone()));
    restarted.register_evm_chain("POL", evm_config("POL", pol.clone()));
    let restarted = Arc::new(restarted);
    assert_eq!(restarted.load_pending_swaps().await.unwrap(), 1);

    let after = restarted.store().get_swap(&trade_id).await.unwrap().unwrap();
    match &after.method_data {
        klingdex_core::store::MethodData::EvmHtlc(d) => {
            assert_eq!(d.offer_contract.htlc_state, before_data.offer_contract.htlc_state);
            assert_eq!(d.offer_contract.fund_tx, before_data.offer_contract.fund_tx);
            assert_eq!(
                d.request_contract.htlc_state,
                before_data.request_contract.htlc_state
            );
            assert_eq!(
                d.request_contract.claim_tx,
                before_data.request_contract.claim_tx
            );
            assert_eq!(d.secret, Some(secret));
        }
        other => panic!("expected evm method data, got {other:?}"),
    }
    assert_eq!(
        restarted.get_swap(&trade_id).await.unwrap().secret,
        Some(secret)
    );
}
