//! Static chain registry.
//!
//! Maps a chain symbol to address encoding, HD-path coin type, Taproot
//! capability, chain kind and the per-chain protocol constants (confirmation
//! minimum, default timeout pair, dust limit).

use crate::error::{Error, Result};
use crate::types::Network;
use serde::{Deserialize, Serialize};

/// Broad family a chain belongs to, which decides how escrows are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    /// Bitcoin-family UTXO chain: escrows are P2WSH/P2TR outputs.
    Utxo,
    /// EVM account chain: escrows are HTLC contract calls.
    Evm,
}

/// Registry entry for one chain.
#[derive(Debug, Clone)]
pub struct ChainParams {
    /// Ticker symbol, upper case ("BTC").
    pub symbol: &'static str,
    pub name: &'static str,
    pub kind: ChainKind,
    /// BIP-44 coin type for HD derivation.
    pub coin_type: u32,
    /// Whether the chain activates Taproot (required for MuSig2 escrows).
    pub taproot: bool,
    /// Segwit HRPs for mainnet / testnet / regtest. Empty for EVM chains.
    hrps: [&'static str; 3],
    /// Confirmations required before a funding output counts as final.
    pub min_confirmations: u32,
    /// Default refund timeout in blocks for the maker's funding chain.
    pub maker_timeout_blocks: u16,
    /// Default refund timeout in blocks for the taker's funding chain.
    pub taker_timeout_blocks: u16,
    /// Outputs below this many base units are folded into the fee.
    pub dust_limit: u64,
    /// Nominal seconds per block, for advisory time-based lock durations.
    pub block_time_secs: u64,
}

impl ChainParams {
    /// Bech32 human-readable part for segwit addresses on `network`.
    pub fn hrp(&self, network: Network) -> &'static str {
        match network {
            Network::Mainnet => self.hrps[0],
            Network::Testnet => self.hrps[1],
            Network::Regtest => self.hrps[2],
        }
    }

    pub fn is_utxo(&self) -> bool {
        self.kind == ChainKind::Utxo
    }

    pub fn is_evm(&self) -> bool {
        self.kind == ChainKind::Evm
    }

    /// Fail unless the chain's registry entry declares Taproot support.
    pub fn require_taproot(&self) -> Result<()> {
        if self.taproot {
            Ok(())
        } else {
            Err(Error::UnsupportedChain(format!(
                "{} does not support taproot",
                self.symbol
            )))
        }
    }

    /// Default `(maker, taker)` refund timeout pair in blocks.
    pub fn default_timeouts(&self) -> (u16, u16) {
        (self.maker_timeout_blocks, self.taker_timeout_blocks)
    }
}

static CHAINS: &[ChainParams] = &[
    ChainParams {
        symbol: "BTC",
        name: "Bitcoin",
        kind: ChainKind::Utxo,
        coin_type: 0,
        taproot: true,
        hrps: ["bc", "tb", "bcrt"],
        min_confirmations: 3,
        maker_timeout_blocks: 144,
        taker_timeout_blocks: 72,
        dust_limit: 546,
        block_time_secs: 600,
    },
    ChainParams {
        symbol: "LTC",
        name: "Litecoin",
        kind: ChainKind::Utxo,
        coin_type: 2,
        taproot: true,
        hrps: ["ltc", "tltc", "rltc"],
        min_confirmations: 6,
        maker_timeout_blocks: 576,
        taker_timeout_blocks: 288,
        dust_limit: 546,
        block_time_secs: 150,
    },
    ChainParams {
        symbol: "ETH",
        name: "Ethereum",
        kind: ChainKind::Evm,
        coin_type: 60,
        taproot: false,
        hrps: ["", "", ""],
        min_confirmations: 12,
        maker_timeout_blocks: 7200,
        taker_timeout_blocks: 3600,
        dust_limit: 0,
        block_time_secs: 12,
    },
    ChainParams {
        symbol: "POL",
        name: "Polygon",
        kind: ChainKind::Evm,
        coin_type: 966,
        taproot: false,
        hrps: ["", "", ""],
        min_confirmations: 30,
        maker_timeout_blocks: 43200,
        taker_timeout_blocks: 21600,
        dust_limit: 0,
        block_time_secs: 2,
    },
];

/// Look up a chain by symbol (case-insensitive).
pub fn get(symbol: &str) -> Result<&'static ChainParams> {
    CHAINS
        .iter()
        .find(|c| c.symbol.eq_ignore_ascii_case(symbol))
        .ok_or_else(|| Error::UnsupportedChain(symbol.to_string()))
}

/// All registered chains.
pub fn all() -> &'static [ChainParams] {
    CHAINS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(get("btc").unwrap().symbol, "BTC");
        assert_eq!(get("Ltc").unwrap().symbol, "LTC");
    }

    #[test]
    fn unknown_symbol_is_rejected() {
        assert!(matches!(get("XYZ"), Err(Error::UnsupportedChain(_))));
    }

    #[test]
    fn evm_chains_do_not_claim_taproot() {
        assert!(get("ETH").unwrap().require_taproot().is_err());
        assert!(get("BTC").unwrap().require_taproot().is_ok());
    }

    #[test]
    fn default_timeout_pairs() {
        assert_eq!(get("BTC").unwrap().default_timeouts(), (144, 72));
        assert_eq!(get("LTC").unwrap().default_timeouts(), (576, 288));
    }
}
