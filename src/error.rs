//! Error types for the Klingdex swap engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the swap engine.
///
/// Precondition and input-validation errors surface to the caller unchanged.
/// Safety errors block the offending operation and never downgrade. External
/// errors surface from caller-initiated operations; monitors log them and
/// retry on the next tick.
#[derive(Error, Debug)]
pub enum Error {
    /// No swap with this trade id is active or stored.
    #[error("Swap not found: {0}")]
    SwapNotFound(String),

    /// No chain backend is registered for this chain.
    #[error("No chain backend registered for {0}")]
    BackendMissing(String),

    /// A swap with this trade id already exists.
    #[error("Swap already exists: {0}")]
    SwapExists(String),

    /// The local funding transaction was already broadcast.
    #[error("Swap {0} is already funded")]
    AlreadyFunded(String),

    /// A signing prerequisite (remote key, nonce, private key) is missing.
    #[error("Not ready to sign: {0}")]
    NotReadyToSign(String),

    /// The requested state transition is not in the swap state DAG.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: String, to: String },

    /// The chain is not in the registry, or lacks a required capability.
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    /// The operation does not apply to this swap's escrow method.
    #[error("Method not supported: {0}")]
    MethodNotSupported(String),

    /// No wallet provider is configured.
    #[error("No wallet available")]
    NoWallet,

    /// Public key failed to parse or has the wrong length.
    #[error("Invalid public key: {0}")]
    InvalidPubKey(String),

    /// Sighash is not exactly 32 bytes.
    #[error("Invalid sighash: {0}")]
    InvalidSighash(String),

    /// Transaction id failed to parse.
    #[error("Invalid transaction id: {0}")]
    InvalidTxId(String),

    /// The provided secret does not hash to the expected secret hash.
    #[error("Secret does not match expected hash")]
    SecretMismatch,

    /// Wallet UTXOs cannot cover the target amount plus fees.
    #[error("Insufficient funds: need {need} sat, have {have} sat")]
    InsufficientFunds { need: u64, have: u64 },

    /// Too few blocks remain before a chain's timeout to complete safely.
    #[error("Timeout race on {chain}: {blocks_left} blocks left, margin {margin}")]
    TimeoutRace {
        chain: String,
        blocks_left: u64,
        margin: u64,
    },

    /// A funding transaction has not reached the chain's confirmation minimum.
    #[error("Insufficient confirmations for {tx}: have {have}, need {need}")]
    InsufficientConfirmations { tx: String, have: u32, need: u32 },

    /// A public nonce that was already signed with appeared again.
    #[error("MuSig2 nonce reuse detected")]
    NonceReuse,

    /// The maker/taker timeout pair violates the minimum gap.
    #[error("Invalid timeout relationship: maker {maker}, taker {taker}, minimum gap {min_gap}")]
    TimeoutRelationship {
        maker: u64,
        taker: u64,
        min_gap: u64,
    },

    /// Chain backend I/O failure.
    #[error("Chain I/O error: {0}")]
    ChainIO(String),

    /// Persistent store failure.
    #[error("Store error: {0}")]
    StoreIO(String),

    /// The chain backend rejected a broadcast.
    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    /// The operation observed the coordinator's shutdown signal.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Low-level signing error.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(format!("{:#}", err))
    }
}
