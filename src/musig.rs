//! Two-party MuSig2 signing session.
//!
//! One session exists per chain per swap: MuSig2 nonces are single-use, so
//! the two chains of a swap must never share signing state. The session walks
//! `fresh -> keyed -> noncedL -> noncedLR -> ready -> used`, refuses to reuse
//! any public nonce that was ever signed with, and caches the Taproot script
//! tree so refunds can be rebuilt after a restart.

use crate::chains::{self, ChainParams};
use crate::error::{Error, Result};
use crate::script;
use crate::types::Network;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::taproot::{TapNodeHash, TapTweakHash, TaprootSpendInfo};
use bitcoin::{ScriptBuf, XOnlyPublicKey};
use musig2::{FirstRound, KeyAggContext, PubNonce, SecNonceSpices, SecondRound};
use rand::RngCore;
use std::collections::HashSet;

/// Serialized public nonce length (two compressed points).
pub const PUB_NONCE_LEN: usize = 66;

/// Cached Taproot refund tree for one escrow output.
#[derive(Clone)]
pub struct RefundTree {
    pub leaf: ScriptBuf,
    pub refund_key: XOnlyPublicKey,
    pub timeout_blocks: u16,
    pub merkle_root: TapNodeHash,
}

/// Stateful two-party MuSig2 session for one chain of one swap.
pub struct Musig2Session {
    chain: &'static ChainParams,
    network: Network,
    local_priv: SecretKey,
    local_pub: PublicKey,
    remote_pub: Option<PublicKey>,
    refund_tree: Option<RefundTree>,
    first_round: Option<FirstRound>,
    second_round: Option<SecondRound<[u8; 32]>>,
    pub_nonce: Option<[u8; PUB_NONCE_LEN]>,
    remote_nonce: Option<[u8; PUB_NONCE_LEN]>,
    used_nonces: HashSet<[u8; PUB_NONCE_LEN]>,
    partial_sig: Option<[u8; 32]>,
    nonce_used: bool,
    session_invalidated: bool,
}

impl Musig2Session {
    /// Create a session for `symbol`. Rejects chains whose registry entry
    /// does not declare Taproot support.
    pub fn new(symbol: &str, network: Network, local_priv: SecretKey) -> Result<Self> {
        let chain = chains::get(symbol)?;
        chain.require_taproot()?;

        let secp = Secp256k1::new();
        let local_pub = local_priv.public_key(&secp);

        Ok(Self {
            chain,
            network,
            local_priv,
            local_pub,
            remote_pub: None,
            refund_tree: None,
            first_round: None,
            second_round: None,
            pub_nonce: None,
            remote_nonce: None,
            used_nonces: HashSet::new(),
            partial_sig: None,
            nonce_used: false,
            session_invalidated: false,
        })
    }

    pub fn chain_symbol(&self) -> &'static str {
        self.chain.symbol
    }

    pub fn local_pub(&self) -> PublicKey {
        self.local_pub
    }

    pub fn remote_pub(&self) -> Option<PublicKey> {
        self.remote_pub
    }

    /// Record the counterparty's long-lived public key. Idempotent once set.
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

    /// Both keys in the deterministic aggregation order (sorted by
    /// serialized bytes), so both parties derive the same aggregated key.
    fn ordered_keys(&self) -> Result<[PublicKey; 2]> {
        let remote = self
            .remote_pub
            .ok_or_else(|| Error::NotReadyToSign("remote public key not set".to_string()))?;
        let mut keys = [self.local_pub, remote];
        keys.sort_by_key(|k| k.serialize());
        Ok(keys)
    }

    /// Our index into the sorted key list.
    fn signer_index(&self) -> Result<usize> {
        let keys = self.ordered_keys()?;
        Ok(keys.iter().position(|k| *k == self.local_pub).expect("local key present"))
    }

    fn key_agg_context(&self) -> Result<KeyAggContext> {
        let keys = self.ordered_keys()?;
        let pubkeys: Vec<musig2::secp256k1::PublicKey> = keys
            .iter()
            .map(|k| {
                musig2::secp256k1::PublicKey::from_slice(&k.serialize())
                    .map_err(|e| Error::InvalidPubKey(e.to_string()))
            })
            .collect::<Result<_>>()?;
        KeyAggContext::new(pubkeys).map_err(|e| Error::Signing(e.to_string()))
    }

    /// The untweaked aggregated key; this is the Taproot internal key.
    pub fn aggregated_pubkey(&self) -> Result<XOnlyPublicKey> {
        let agg: musig2::secp256k1::PublicKey = self.key_agg_context()?.aggregated_pubkey();
        let (xonly, _) = agg.x_only_public_key();
        XOnlyPublicKey::from_slice(&xonly.serialize())
            .map_err(|e| Error::InvalidPubKey(e.to_string()))
    }

    /// Aggregation context with the BIP-341 output tweak applied, matching
    /// the escrow output actually funded (with or without the refund leaf).
    fn tweaked_context(&self) -> Result<KeyAggContext> {
        let internal = self.aggregated_pubkey()?;
        let merkle_root = self.refund_tree.as_ref().map(|t| t.merkle_root);

        let tweak = TapTweakHash::from_key_and_tweak(internal, merkle_root).to_scalar();
        let tweak = musig2::secp256k1::Scalar::from_be_bytes(tweak.to_be_bytes())
            .map_err(|e| Error::Signing(format!("taproot tweak: {e}")))?;

        self.key_agg_context()?
            .with_xonly_tweak(tweak)
            .map_err(|e| Error::Signing(e.to_string()))
    }

    /// The x-only output key the escrow address commits to.
    pub fn output_key(&self) -> Result<XOnlyPublicKey> {
        let agg: musig2::secp256k1::PublicKey = self.tweaked_context()?.aggregated_pubkey();
        let (xonly, _) = agg.x_only_public_key();
        XOnlyPublicKey::from_slice(&xonly.serialize())
            .map_err(|e| Error::InvalidPubKey(e.to_string()))
    }

    /// Key-path-only P2TR address for the aggregated key.
    pub fn taproot_address(&mut self) -> Result<String> {
        self.refund_tree = None;
        let output_key = self.output_key()?;
        script::p2tr_address(&output_key, self.chain.hrp(self.network))
    }

    /// P2TR address committing to the aggregated key plus a CSV refund leaf
    /// for `refund_pub` (the funder of this chain).
    pub fn taproot_address_with_refund(
        &mut self,
        refund_pub: XOnlyPublicKey,
        timeout_blocks: u16,
    ) -> Result<String> {
        let leaf = script::refund_leaf_script(&refund_pub, timeout_blocks)?;
        let merkle_root = TapNodeHash::from_script(&leaf, bitcoin::taproot::LeafVersion::TapScript);
        self.refund_tree = Some(RefundTree {
            leaf,
            refund_key: refund_pub,
            timeout_blocks,
            merkle_root,
        });

        let output_key = self.output_key()?;
        script::p2tr_address(&output_key, self.chain.hrp(self.network))
    }

    /// The cached refund tree, if a script-path address was generated.
    pub fn refund_tree(&self) -> Option<&RefundTree> {
        self.refund_tree.as_ref()
    }

    /// Rebuild the cached refund tree (used when rehydrating from storage).
    pub fn restore_refund_tree(
        &mut self,
        refund_pub: XOnlyPublicKey,
        timeout_blocks: u16,
    ) -> Result<()> {
        let leaf = script::refund_leaf_script(&refund_pub, timeout_blocks)?;
        let merkle_root = TapNodeHash::from_script(&leaf, bitcoin::taproot::LeafVersion::TapScript);
        self.refund_tree = Some(RefundTree {
            leaf,
            refund_key: refund_pub,
            timeout_blocks,
            merkle_root,
        });
        Ok(())
    }

    /// Full taproot spend info for the escrow output (script-path refunds).
    pub fn taproot_spend_info(&self) -> Result<TaprootSpendInfo> {
        let internal = self.aggregated_pubkey()?;
        let leaf = self.refund_tree.as_ref().map(|t| t.leaf.clone());
        script::taproot_spend_info(internal, leaf)
    }

    /// Generate a fresh nonce pair and return the 66-byte public nonce.
    ///
    /// Any previously generated public nonce is moved into the consumed set
    /// first, so it can never be signed with again.
    pub fn generate_nonces(&mut self) -> Result<[u8; PUB_NONCE_LEN]> {
        if self.session_invalidated {
            return Err(Error::NotReadyToSign(
                "session invalidated; call reset_for_new_sign first".to_string(),
            ));
        }

        if let Some(previous) = self.pub_nonce.take() {
            self.used_nonces.insert(previous);
        }

        let ctx = self.tweaked_context()?;
        let index = self.signer_index()?;
        let seckey = musig2::secp256k1::SecretKey::from_slice(&self.local_priv.secret_bytes())
            .map_err(|e| Error::Signing(e.to_string()))?;

        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);

        let first_round = FirstRound::new(
            ctx,
            seed,
            index,
            SecNonceSpices::new().with_seckey(seckey),
        )
        .map_err(|e| Error::Signing(e.to_string()))?;

        let pub_nonce: [u8; PUB_NONCE_LEN] = first_round.our_public_nonce().serialize();
        if self.used_nonces.contains(&pub_nonce) {
            return Err(Error::NonceReuse);
        }

        self.first_round = Some(first_round);
        self.pub_nonce = Some(pub_nonce);
        self.remote_nonce = None;
        self.second_round = None;
        self.partial_sig = None;
        Ok(pub_nonce)
    }

    /// Our current public nonce, if one has been generated.
    pub fn pub_nonce(&self) -> Option<[u8; PUB_NONCE_LEN]> {
        self.pub_nonce
    }

    /// Record the counterparty's 66-byte public nonce.
    pub fn set_remote_nonce(&mut self, nonce: &[u8]) -> Result<()> {
        let nonce: [u8; PUB_NONCE_LEN] = nonce
            .try_into()
            .map_err(|_| Error::Signing("public nonce must be 66 bytes".to_string()))?;
        if self.used_nonces.contains(&nonce) {
            return Err(Error::NonceReuse);
        }
        // Validate the encoding eagerly so a bad nonce fails here, not at sign.
        PubNonce::from_bytes(&nonce).map_err(|e| Error::Signing(e.to_string()))?;
        self.remote_nonce = Some(nonce);
        Ok(())
    }

    /// Bind the aggregated key and both nonces into a signing context.
    pub fn init_signing_session(&mut self) -> Result<()> {
        let remote_nonce = self
            .remote_nonce
            .ok_or_else(|| Error::NotReadyToSign("remote nonce not set".to_string()))?;
        let remote_index = 1 - self.signer_index()?;
        let first_round = self
            .first_round
            .as_mut()
            .ok_or_else(|| Error::NotReadyToSign("nonces not generated".to_string()))?;

        let nonce = PubNonce::from_bytes(&remote_nonce)
            .map_err(|e| Error::Signing(e.to_string()))?;
        first_round
            .receive_nonce(remote_index, nonce)
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(())
    }

    /// Produce our 32-byte partial signature over `msg_hash`.
    ///
    /// On success the nonce is consumed and the session invalidated; a second
    /// `sign` fails until [`Self::reset_for_new_sign`].
    pub fn sign(&mut self, msg_hash: [u8; 32]) -> Result<[u8; 32]> {
        if self.nonce_used || self.session_invalidated {
            return Err(Error::NonceReuse);
        }
        let first_round = self
            .first_round
            .take()
            .ok_or_else(|| Error::NotReadyToSign("nonces not generated".to_string()))?;
        if !first_round.is_complete() {
            self.first_round = Some(first_round);
            return Err(Error::NotReadyToSign(
                "signing session not initialized".to_string(),
            ));
        }

        let seckey = musig2::secp256k1::SecretKey::from_slice(&self.local_priv.secret_bytes())
            .map_err(|e| Error::Signing(e.to_string()))?;
        let second_round = first_round
            .finalize(seckey, msg_hash)
            .map_err(|e| Error::Signing(e.to_string()))?;

        let partial: [u8; 32] = second_round.our_signature();

        if let Some(nonce) = self.pub_nonce {
            self.used_nonces.insert(nonce);
        }
        self.nonce_used = true;
        self.session_invalidated = true;
        self.second_round = Some(second_round);
        self.partial_sig = Some(partial);
        Ok(partial)
    }

    /// Our last partial signature, if `sign` succeeded.
    pub fn partial_sig(&self) -> Option<[u8; 32]> {
        self.partial_sig
    }

    /// Combine our partial with the counterparty's into the final 64-byte
    /// Schnorr signature. Both parties arrive at byte-identical output.
    pub fn combine(&mut self, local_partial: [u8; 32], remote_partial: [u8; 32]) -> Result<[u8; 64]> {
        match self.partial_sig {
            Some(ours) if ours == local_partial => {}
            Some(_) => {
                return Err(Error::Signing(
                    "local partial does not match this session's signature".to_string(),
                ));
            }
            None => return Err(Error::NotReadyToSign("sign has not been called".to_string())),
        }

        let mut second_round = self
            .second_round
            .take()
            .ok_or_else(|| Error::NotReadyToSign("sign has not been called".to_string()))?;

        // Scalar overflow in the partial decode is a hard error.
        let remote = musig2::secp::Scalar::from_slice(&remote_partial)
            .map_err(|e| Error::Signing(format!("remote partial: {e}")))?;
        let remote_index = 1 - self.signer_index()?;
        second_round
            .receive_signature(remote_index, remote)
            .map_err(|e| Error::Signing(e.to_string()))?;

        let signature: musig2::LiftedSignature = second_round
            .finalize()
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(signature.serialize())
    }

    /// Permit a fresh `generate_nonces -> sign` cycle after a completed sign.
    ///
    /// Requires a currently used nonce; the used nonce stays in the consumed
    /// set forever.
    pub fn reset_for_new_sign(&mut self) -> Result<()> {
        if !self.nonce_used {
            return Err(Error::NotReadyToSign(
                "no used nonce; nothing to reset".to_string(),
            ));
        }
        self.first_round = None;
        self.second_round = None;
        self.pub_nonce = None;
        self.remote_nonce = None;
        self.partial_sig = None;
        self.nonce_used = false;
        self.session_invalidated = false;
        Ok(())
    }

    pub fn nonce_used(&self) -> bool {
        self.nonce_used
    }

    pub fn session_invalidated(&self) -> bool {
        self.session_invalidated
    }

    /// Consumed public nonces, for persistence.
    pub fn used_nonces(&self) -> impl Iterator<Item = &[u8; PUB_NONCE_LEN]> {
        self.used_nonces.iter()
    }

    /// Restore the consumed-nonce set from storage.
    pub fn restore_used_nonces<I: IntoIterator<Item = [u8; PUB_NONCE_LEN]>>(&mut self, nonces: I) {
        self.used_nonces.extend(nonces);
    }

    /// Mark a rehydrated session invalidated (its in-flight round was lost).
    pub fn restore_flags(&mut self, nonce_used: bool, session_invalidated: bool) {
        self.nonce_used = nonce_used;
        self.session_invalidated = session_invalidated;
    }
}

/// Verify a combined Schnorr signature against the tweaked output key, the
/// same check a chain's consensus rules apply to the key-path witness.
pub fn verify_key_spend_signature(
    output_key: &XOnlyPublicKey,
    signature: &[u8; 64],
    msg_hash: &[u8; 32],
) -> Result<()> {
    let secp = Secp256k1::verification_only();
    let sig = bitcoin::secp256k1::schnorr::Signature::from_slice(signature)
        .map_err(|e| Error::Signing(e.to_string()))?;
    let msg = bitcoin::secp256k1::Message::from_digest(*msg_hash);
    secp.verify_schnorr(&sig, &msg, output_key)
        .map_err(|e| Error::Signing(e.to_string()))
}
