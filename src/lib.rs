//! Klingdex Core - peer-to-peer cross-chain atomic swap engine.
//!
//! The core of a swap node: a stateful [`Coordinator`] that walks two
//! mutually distrusting parties through an all-or-nothing exchange across
//! heterogeneous chains (Bitcoin-family UTXO chains and EVM account chains).
//! Escrows are rendered either as a two-of-two MuSig2 Taproot output with a
//! script-path refund leaf, or as an HTLC (P2WSH witness script / EVM
//! contract call). Background monitors advance confirmations, trigger
//! automated refunds after block-height timeouts, and extract revealed
//! preimages from counterparty chains. Every swap survives a process restart
//! via the pluggable store.
//!
//! Chain access, HD key derivation and persistence are consumed by trait
//! (`ChainBackend`, `WalletProvider`, `Store`), so the engine stays agnostic
//! of node flavors and storage backends.
//!
//! # Example
//!
//! ```rust,ignore
//! use klingdex_core::{Coordinator, CoordinatorConfig, Offer, SwapMethod};
//!
//! let mut coordinator = Coordinator::new(config, store);
//! coordinator.register_backend("BTC", btc_backend);
//! coordinator.register_backend("LTC", ltc_backend);
//! let coordinator = std::sync::Arc::new(coordinator);
//!
//! let trade_id = coordinator.initiate_swap("", "order-1", offer).await?;
//! coordinator.set_remote_pubkey(&trade_id, their_key).await?;
//! coordinator.fund_swap(&trade_id).await?;
//! ```

pub mod backend;
pub mod chains;
pub mod coordinator;
pub mod error;
pub mod evm;
pub mod htlc;
pub mod monitor;
pub mod musig;
pub mod script;
pub mod store;
pub mod swap;
pub mod sync;
pub mod txbuilder;
pub mod types;

pub use backend::{ChainBackend, WalletProvider};
pub use coordinator::{
    ActiveSwap, Coordinator, CoordinatorConfig, EvmChainConfig, SwapEvent, SwapEventType,
};
pub use error::{Error, Result};
pub use evm::{EvmHtlcSession, EvmRpc, HttpEvmRpc};
pub use htlc::HtlcSession;
pub use monitor::{ConfirmationMonitor, MonitorConfig, SecretMonitor, TimeoutMonitor};
pub use musig::Musig2Session;
pub use store::{Store, SwapRecord};
pub use swap::{ChainSide, Offer, Swap, SwapState};
pub use sync::{OrderSync, TradeSync};
pub use txbuilder::FeePolicy;
pub use types::{Network, Role, SwapMethod};
