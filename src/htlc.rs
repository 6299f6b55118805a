//! UTXO HTLC session state.
//!
//! One session per Bitcoin-family chain per swap. The session owns the
//! chain-local keys, the secret pair, and the cached redeem script + P2WSH
//! escrow address, so claims and refunds can be rebuilt at any point in the
//! swap (including after a restart).

use crate::chains::{self, ChainParams};
use crate::error::{Error, Result};
use crate::script::{self, HtlcScriptParts};
use crate::types::{Network, sha256};
use bitcoin::ScriptBuf;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};

/// Per-chain HTLC state holder (UTXO variant).
pub struct HtlcSession {
    chain: &'static ChainParams,
    network: Network,
    local_priv: SecretKey,
    local_pub: PublicKey,
    remote_pub: Option<PublicKey>,
    secret: Option<[u8; 32]>,
    secret_hash: Option<[u8; 32]>,
    redeem_script: Option<ScriptBuf>,
    escrow_address: Option<String>,
    /// Whether the local party is the one who locks funds on this chain.
    is_initiator: bool,
}

impl HtlcSession {
    pub fn new(
        symbol: &str,
        network: Network,
        local_priv: SecretKey,
        is_initiator: bool,
    ) -> Result<Self> {
        let chain = chains::get(symbol)?;
        if !chain.is_utxo() {
            return Err(Error::UnsupportedChain(format!(
                "{} is not a UTXO chain",
                chain.symbol
            )));
        }

        let secp = Secp256k1::new();
        let local_pub = local_priv.public_key(&secp);

        Ok(Self {
            chain,
            network,
            local_priv,
            local_pub,
            remote_pub: None,
            secret: None,
            secret_hash: None,
            redeem_script: None,
            escrow_address: None,
            is_initiator,
        })
    }

    pub fn chain_symbol(&self) -> &'static str {
        self.chain.symbol
    }

    pub fn local_priv(&self) -> SecretKey {
        self.local_priv
    }

    pub fn local_pub(&self) -> PublicKey {
        self.local_pub
    }

    pub fn remote_pub(&self) -> Option<PublicKey> {
        self.remote_pub
    }

    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    /// Record the counterparty's public key. Idempotent once set.
    pub fn set_remote_pub(&mut self, remote: PublicKey) -> Result<()> {
        match self.remote_pub {
            Some(existing) if existing == remote => Ok(()),
            Some(_) => Err(Error::InvalidPubKey(
                "remote public key already bound to a different key".to_string(),
            )),
            None => {
                self.remote_pub = Some(remote);
                Ok(())
            }
        }
    }

    /// Record the hash the escrow commits to (the responder starts here).
    pub fn set_secret_hash(&mut self, hash: [u8; 32]) -> Result<()> {
        if let Some(secret) = self.secret {
            if sha256(&secret) != hash {
                return Err(Error::SecretMismatch);
            }
        }
        self.secret_hash = Some(hash);
        Ok(())
    }

    /// Record the preimage. Fails with `SecretMismatch` unless
    /// `sha256(secret)` equals the known hash.
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

    pub fn secret(&self) -> Option<[u8; 32]> {
        self.secret
    }

    pub fn secret_hash(&self) -> Option<[u8; 32]> {
        self.secret_hash
    }

    /// Build and cache the redeem script + P2WSH escrow address.
    ///
    /// `local_is_receiver` selects which side can claim with the preimage on
    /// this chain; the other side holds the CSV refund branch.
    pub fn build_escrow(&mut self, local_is_receiver: bool, timeout_blocks: u16) -> Result<String> {
        let remote = self
            .remote_pub
            .ok_or_else(|| Error::NotReadyToSign("remote public key not set".to_string()))?;
        let hash = self
            .secret_hash
            .ok_or_else(|| Error::NotReadyToSign("secret hash not set".to_string()))?;

        let (receiver, sender) = if local_is_receiver {
            (self.local_pub, remote)
        } else {
            (remote, self.local_pub)
        };

        let redeem_script = script::build_htlc_script(&hash, &receiver, &sender, timeout_blocks)?;
        let address = script::p2wsh_address(&redeem_script, self.chain.hrp(self.network))?;

        self.redeem_script = Some(redeem_script);
        self.escrow_address = Some(address.clone());
        Ok(address)
    }

    pub fn redeem_script(&self) -> Option<&ScriptBuf> {
        self.redeem_script.as_ref()
    }

    pub fn escrow_address(&self) -> Option<&str> {
        self.escrow_address.as_deref()
    }

    /// The four script fields, from the cached redeem script.
    pub fn script_parts(&self) -> Result<HtlcScriptParts> {
        let redeem_script = self
            .redeem_script
            .as_ref()
            .ok_or_else(|| Error::NotReadyToSign("escrow not built".to_string()))?;
        script::parse_htlc_script(redeem_script)
    }

    /// Restore a cached script from storage, verifying the derived address.
    pub fn restore_escrow(&mut self, script_hex: &str, expected_address: &str) -> Result<()> {
        let bytes = hex::decode(script_hex)
            .map_err(|e| Error::Other(format!("redeem script hex: {e}")))?;
        let redeem_script = ScriptBuf::from_bytes(bytes);
        // Reject corrupted records before the script is trusted with funds.
        script::parse_htlc_script(&redeem_script)?;
        let address = script::p2wsh_address(&redeem_script, self.chain.hrp(self.network))?;
        if address != expected_address {
            return Err(Error::Other(format!(
                "stored escrow address {expected_address} does not match script ({address})"
            )));
        }
        self.redeem_script = Some(redeem_script);
        self.escrow_address = Some(address);
        Ok(())
    }
}
