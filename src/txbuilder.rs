//! Transaction construction for UTXO chains.
//!
//! Builds and signs the five transaction shapes the swap engine needs:
//! funding, key-path spend, script-path refund, HTLC claim and HTLC refund.
//! Builders that feed a multi-party signing round return the unsigned
//! transaction together with its sighash so the orchestrator can drive the
//! round externally.

use crate::error::{Error, Result};
use crate::script;
use bitcoin::absolute::LockTime;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, Secp256k1, TapTweak};
use bitcoin::secp256k1::{Message, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, EcdsaSighashType, OutPoint, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn,
    TxOut, Txid, Witness,
};
use serde::{Deserialize, Serialize};

/// Dust threshold: change below this is folded into the fee.
pub const DUST_LIMIT: u64 = 546;
/// Fallback fee rate when the backend has no usable estimate (sat/vB).
pub const DEFAULT_FEE_RATE: u64 = 10;
/// Absolute floor applied to every estimate (sat/vB).
pub const MIN_FEE_RATE: u64 = 2;

/// Per-output vbytes for fee estimation.
pub const OUTPUT_VBYTES: u64 = 34;
/// Fixed transaction overhead vbytes.
pub const TX_OVERHEAD_VBYTES: u64 = 10;
/// Conservative vsize for the single-input escrow spends (claim/refund).
const SPEND_TX_VBYTES: u64 = 150;

/// RBF-enabled sequence for funding inputs (MAX - 2).
const SEQUENCE_RBF: Sequence = Sequence(0xffff_fffd);

/// Address flavor of a wallet UTXO, deciding its signing scheme and weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    P2tr,
    P2wpkh,
    P2pkh,
}

impl AddressType {
    /// Estimated vbytes one input of this type adds to a transaction.
    pub fn input_vbytes(self) -> u64 {
        match self {
            AddressType::P2tr => 58,
            AddressType::P2wpkh => 68,
            AddressType::P2pkh => 148,
        }
    }
}

/// A wallet UTXO together with the key that can spend it.
#[derive(Clone, Debug)]
pub struct SpendableUtxo {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub address_type: AddressType,
    pub secret_key: SecretKey,
}

impl SpendableUtxo {
    /// The scriptPubKey of the output being spent, derived from the key.
    fn script_pubkey(&self, secp: &Secp256k1<bitcoin::secp256k1::All>) -> Result<ScriptBuf> {
        let pubkey = self.secret_key.public_key(secp);
        match self.address_type {
            AddressType::P2wpkh => {
                let pk = bitcoin::PublicKey::new(pubkey);
                let hash = pk
                    .wpubkey_hash()
                    .map_err(|e| Error::Signing(format!("uncompressed key: {e}")))?;
                Ok(ScriptBuf::new_p2wpkh(&hash))
            }
            AddressType::P2pkh => {
                let pk = bitcoin::PublicKey::new(pubkey);
                Ok(ScriptBuf::new_p2pkh(&pk.pubkey_hash()))
            }
            AddressType::P2tr => {
                let keypair = Keypair::from_secret_key(secp, &self.secret_key);
                let (internal, _) = keypair.x_only_public_key();
                Ok(ScriptBuf::new_p2tr(secp, internal, None))
            }
        }
    }
}

/// Trade-fee policy: bps by role, with a share routed to the DAO output.
#[derive(Debug, Clone)]
pub struct FeePolicy {
    pub maker_fee_bps: u64,
    pub taker_fee_bps: u64,
    /// Fraction of the trade fee paid to the DAO address.
    pub dao_share: f64,
    /// Destination scriptPubKey for the DAO output, if fees are enabled.
    pub dao_script_pubkey: Option<ScriptBuf>,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            maker_fee_bps: 25,
            taker_fee_bps: 50,
            dao_share: 0.5,
            dao_script_pubkey: None,
        }
    }
}

impl FeePolicy {
    /// `amount * bps / 10000`, by role.
    pub fn trade_fee(&self, amount: u64, is_maker: bool) -> u64 {
        let bps = if is_maker {
            self.maker_fee_bps
        } else {
            self.taker_fee_bps
        };
        amount * bps / 10_000
    }

    /// DAO output amount: `max(546, round(trade_fee * dao_share))`.
    pub fn dao_fee(&self, amount: u64, is_maker: bool) -> u64 {
        let share = (self.trade_fee(amount, is_maker) as f64 * self.dao_share).round() as u64;
        share.max(DUST_LIMIT)
    }

    /// DAO output for the funding transaction, if a DAO address is set.
    pub fn dao_output(&self, amount: u64, is_maker: bool) -> Option<TxOut> {
        self.dao_script_pubkey.as_ref().map(|spk| TxOut {
            value: Amount::from_sat(self.dao_fee(amount, is_maker)),
            script_pubkey: spk.clone(),
        })
    }
}

/// Clamp a backend estimate into a usable fee rate.
pub fn resolve_fee_rate(estimate: Option<u64>) -> u64 {
    match estimate {
        Some(rate) if rate > 0 => rate.max(MIN_FEE_RATE),
        _ => DEFAULT_FEE_RATE,
    }
}

/// Greedy largest-first UTXO selection.
///
/// Accumulates candidates until they cover `target` plus the fee implied by
/// the selected inputs and `n_outputs` at `fee_rate` sat/vB.
pub fn select_utxos(
    candidates: &[SpendableUtxo],
    target: u64,
    fee_rate: u64,
    n_outputs: u64,
) -> Result<(Vec<SpendableUtxo>, u64)> {
    let mut sorted: Vec<&SpendableUtxo> = candidates.iter().collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    let base_fee = (TX_OVERHEAD_VBYTES + n_outputs * OUTPUT_VBYTES) * fee_rate;
    let mut selected = Vec::new();
    let mut total = 0u64;
    let mut input_fee = 0u64;

    for utxo in sorted {
        selected.push(utxo.clone());
        total += utxo.amount;
        input_fee += utxo.address_type.input_vbytes() * fee_rate;
        if total >= target + base_fee + input_fee {
            return Ok((selected, base_fee + input_fee));
        }
    }

    Err(Error::InsufficientFunds {
        need: target + base_fee + input_fee,
        have: total,
    })
}

/// A signed funding transaction ready for broadcast.
pub struct FundingTx {
    pub tx: Transaction,
    pub txid: Txid,
    /// Escrow output index; always 0 by construction.
    pub escrow_vout: u32,
    pub fee: u64,
    pub change: u64,
}

impl FundingTx {
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.tx)
    }
}

/// Build and sign the funding transaction.
///
/// Output ordering is fixed: escrow at vout 0, then the optional DAO fee
/// output, then change. Change below dust is added to the fee. Inputs are
/// RBF-enabled.
pub fn build_funding_tx(
    utxos: &[SpendableUtxo],
    escrow_script_pubkey: ScriptBuf,
    escrow_amount: u64,
    dao_output: Option<TxOut>,
    change_script_pubkey: ScriptBuf,
    fee_rate: u64,
) -> Result<FundingTx> {
    let dao_amount = dao_output.as_ref().map(|o| o.value.to_sat()).unwrap_or(0);
    let target = escrow_amount + dao_amount;
    // Reserve an output slot for escrow, DAO and change.
    let n_outputs = 2 + u64::from(dao_output.is_some());
    let (selected, fee) = select_utxos(utxos, target, fee_rate, n_outputs)?;

    let total_in: u64 = selected.iter().map(|u| u.amount).sum();
    let mut change = total_in - target - fee;

    let inputs: Vec<TxIn> = selected
        .iter()
        .map(|u| TxIn {
            previous_output: u.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: SEQUENCE_RBF,
            witness: Witness::new(),
        })
        .collect();

    let mut outputs = vec![TxOut {
        value: Amount::from_sat(escrow_amount),
        script_pubkey: escrow_script_pubkey,
    }];
    if let Some(dao) = dao_output {
        outputs.push(dao);
    }
    if change >= DUST_LIMIT {
        outputs.push(TxOut {
            value: Amount::from_sat(change),
            script_pubkey: change_script_pubkey,
        });
    } else {
        change = 0;
    }

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs,
        output: outputs,
    };

    sign_wallet_inputs(&mut tx, &selected)?;

    let txid = tx.compute_txid();
    let fee = total_in - tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>();
    Ok(FundingTx {
        tx,
        txid,
        escrow_vout: 0,
        fee,
        change,
    })
}

/// Sign every input of `tx` according to its address type.
fn sign_wallet_inputs(tx: &mut Transaction, utxos: &[SpendableUtxo]) -> Result<()> {
    let secp = Secp256k1::new();
    let prevouts: Vec<TxOut> = utxos
        .iter()
        .map(|u| {
            Ok(TxOut {
                value: Amount::from_sat(u.amount),
                script_pubkey: u.script_pubkey(&secp)?,
            })
        })
        .collect::<Result<_>>()?;

    enum InputSig {
        Witness(Witness),
        ScriptSig(ScriptBuf),
    }

    let mut sigs = Vec::with_capacity(utxos.len());
    {
        let mut cache = SighashCache::new(&*tx);
        for (i, utxo) in utxos.iter().enumerate() {
            let sig = match utxo.address_type {
                AddressType::P2wpkh => {
                    let sighash = cache
                        .p2wpkh_signature_hash(
                            i,
                            &prevouts[i].script_pubkey,
                            prevouts[i].value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| Error::Signing(e.to_string()))?;
                    let msg = Message::from(sighash);
                    let signature = secp.sign_ecdsa(&msg, &utxo.secret_key);
                    let signature = bitcoin::ecdsa::Signature {
                        signature,
                        sighash_type: EcdsaSighashType::All,
                    };
                    InputSig::Witness(Witness::p2wpkh(
                        &signature,
                        &utxo.secret_key.public_key(&secp),
                    ))
                }
                AddressType::P2tr => {
                    let sighash = cache
                        .taproot_key_spend_signature_hash(
                            i,
                            &Prevouts::All(&prevouts),
                            TapSighashType::Default,
                        )
                        .map_err(|e| Error::Signing(e.to_string()))?;
                    let msg = Message::from_digest(sighash.to_byte_array());
                    let keypair = Keypair::from_secret_key(&secp, &utxo.secret_key);
                    let tweaked = keypair.tap_tweak(&secp, None);
                    let signature = secp.sign_schnorr_no_aux_rand(&msg, &tweaked.to_inner());
                    let mut witness = Witness::new();
                    witness.push(signature.as_ref());
                    InputSig::Witness(witness)
                }
                AddressType::P2pkh => {
                    let sighash = cache
                        .legacy_signature_hash(
                            i,
                            &prevouts[i].script_pubkey,
                            EcdsaSighashType::All.to_u32(),
                        )
                        .map_err(|e| Error::Signing(e.to_string()))?;
                    let msg = Message::from(sighash);
                    let signature = secp.sign_ecdsa(&msg, &utxo.secret_key);
                    let mut sig_bytes = signature.serialize_der().to_vec();
                    sig_bytes.push(EcdsaSighashType::All.to_u32() as u8);
                    let pubkey = bitcoin::PublicKey::new(utxo.secret_key.public_key(&secp));
                    let script_sig = Builder::new()
                        .push_slice(
                            <&bitcoin::script::PushBytes>::try_from(sig_bytes.as_slice())
                                .map_err(|e| Error::Signing(format!("sig push: {e:?}")))?,
                        )
                        .push_key(&pubkey)
                        .into_script();
                    InputSig::ScriptSig(script_sig)
                }
            };
            sigs.push(sig);
        }
    }

    for (i, sig) in sigs.into_iter().enumerate() {
        match sig {
            InputSig::Witness(w) => tx.input[i].witness = w,
            InputSig::ScriptSig(s) => tx.input[i].script_sig = s,
        }
    }
    Ok(())
}

/// One escrow output being spent.
#[derive(Debug, Clone)]
pub struct EscrowUtxo {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub script_pubkey: ScriptBuf,
}

/// Unsigned transaction plus the sighash a signing round must cover.
pub struct UnsignedSpend {
    pub tx: Transaction,
    pub sighash: [u8; 32],
    pub fee: u64,
}

fn spend_fee(escrow_amount: u64, fee_rate: u64, extra_outputs: u64) -> Result<u64> {
    let fee = (SPEND_TX_VBYTES + extra_outputs * OUTPUT_VBYTES) * fee_rate;
    if fee > escrow_amount / 10 {
        return Err(Error::InsufficientFunds {
            need: fee * 10,
            have: escrow_amount,
        });
    }
    Ok(fee)
}

/// Key-path (happy-path) spend of a MuSig2 P2TR escrow.
///
/// Single input with `sequence = MAX`; outputs `[dao?, destination]`. The
/// returned sighash is the BIP-341 key-path `SIGHASH_DEFAULT` digest; after a
/// MuSig2 round, attach the combined signature with
/// [`finalize_keypath_spend`].
pub fn build_keypath_spend(
    escrow: &EscrowUtxo,
    destination_script_pubkey: ScriptBuf,
    dao_output: Option<TxOut>,
    fee_rate: u64,
) -> Result<UnsignedSpend> {
    let dao_amount = dao_output.as_ref().map(|o| o.value.to_sat()).unwrap_or(0);
    let fee = spend_fee(escrow.amount, fee_rate, u64::from(dao_output.is_some()))?;
    let dest_amount = escrow
        .amount
        .checked_sub(dao_amount + fee)
        .filter(|v| *v >= DUST_LIMIT)
        .ok_or(Error::InsufficientFunds {
            need: dao_amount + fee + DUST_LIMIT,
            have: escrow.amount,
        })?;

    let mut outputs = Vec::new();
    if let Some(dao) = dao_output {
        outputs.push(dao);
    }
    outputs.push(TxOut {
        value: Amount::from_sat(dest_amount),
        script_pubkey: destination_script_pubkey,
    });

    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    };

    let prevouts = [TxOut {
        value: Amount::from_sat(escrow.amount),
        script_pubkey: escrow.script_pubkey.clone(),
    }];
    let mut cache = SighashCache::new(&tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
        .map_err(|e| Error::Signing(e.to_string()))?;

    Ok(UnsignedSpend {
        tx,
        sighash: sighash.to_byte_array(),
        fee,
    })
}

/// Attach the combined 64-byte Schnorr signature as the sole witness element.
pub fn finalize_keypath_spend(tx: &mut Transaction, signature: &[u8; 64]) {
    let mut witness = Witness::new();
    witness.push(signature);
    tx.input[0].witness = witness;
}

/// Script-path refund of a MuSig2 P2TR escrow through its CSV leaf.
///
/// Version 2, input `sequence = timeout_blocks` (BIP-68), single output. The
/// refund key holder signs the tapscript sighash alone.
pub fn build_scriptpath_refund(
    escrow: &EscrowUtxo,
    refund_leaf: &ScriptBuf,
    control_block: &ControlBlock,
    refund_key: &SecretKey,
    destination_script_pubkey: ScriptBuf,
    timeout_blocks: u16,
    fee_rate: u64,
) -> Result<Transaction> {
    let fee = spend_fee(escrow.amount, fee_rate, 0)?;
    let dest_amount = escrow
        .amount
        .checked_sub(fee)
        .filter(|v| *v >= DUST_LIMIT)
        .ok_or(Error::InsufficientFunds {
            need: fee + DUST_LIMIT,
            have: escrow.amount,
        })?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(u32::from(timeout_blocks)),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(dest_amount),
            script_pubkey: destination_script_pubkey,
        }],
    };

    let prevouts = [TxOut {
        value: Amount::from_sat(escrow.amount),
        script_pubkey: escrow.script_pubkey.clone(),
    }];
    let leaf_hash = TapLeafHash::from_script(refund_leaf, LeafVersion::TapScript);
    let sighash = {
        let mut cache = SighashCache::new(&tx);
        cache
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .map_err(|e| Error::Signing(e.to_string()))?
    };

    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, refund_key);
    let msg = Message::from_digest(sighash.to_byte_array());
    let signature = secp.sign_schnorr_no_aux_rand(&msg, &keypair);

    let mut witness = Witness::new();
    witness.push(signature.as_ref());
    witness.push(refund_leaf.as_bytes());
    witness.push(control_block.serialize());
    tx.input[0].witness = witness;

    Ok(tx)
}

/// Claim an HTLC escrow by revealing the preimage.
///
/// Version 1, `sequence = MAX`, outputs `[dao?, destination]`, BIP-143
/// sighash over the redeem script, ECDSA `SIGHASH_ALL`.
pub fn build_htlc_claim_tx(
    escrow: &EscrowUtxo,
    redeem_script: &ScriptBuf,
    secret: &[u8; 32],
    receiver_key: &SecretKey,
    destination_script_pubkey: ScriptBuf,
    dao_output: Option<TxOut>,
    fee_rate: u64,
) -> Result<Transaction> {
    let dao_amount = dao_output.as_ref().map(|o| o.value.to_sat()).unwrap_or(0);
    let fee = spend_fee(escrow.amount, fee_rate, u64::from(dao_output.is_some()))?;
    let dest_amount = escrow
        .amount
        .checked_sub(dao_amount + fee)
        .filter(|v| *v >= DUST_LIMIT)
        .ok_or(Error::InsufficientFunds {
            need: dao_amount + fee + DUST_LIMIT,
            have: escrow.amount,
        })?;

    let mut outputs = Vec::new();
    if let Some(dao) = dao_output {
        outputs.push(dao);
    }
    outputs.push(TxOut {
        value: Amount::from_sat(dest_amount),
        script_pubkey: destination_script_pubkey,
    });

    let mut tx = Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    };

    let signature = sign_htlc_input(&tx, escrow, redeem_script, receiver_key)?;
    tx.input[0].witness = script::htlc_claim_witness(&signature, secret, redeem_script);
    Ok(tx)
}

/// Refund an HTLC escrow after its CSV timeout elapsed.
///
/// Version 2, `sequence = timeout_blocks`, single output.
pub fn build_htlc_refund_tx(
    escrow: &EscrowUtxo,
    redeem_script: &ScriptBuf,
    sender_key: &SecretKey,
    destination_script_pubkey: ScriptBuf,
    timeout_blocks: u16,
    fee_rate: u64,
) -> Result<Transaction> {
    let fee = spend_fee(escrow.amount, fee_rate, 0)?;
    let dest_amount = escrow
        .amount
        .checked_sub(fee)
        .filter(|v| *v >= DUST_LIMIT)
        .ok_or(Error::InsufficientFunds {
            need: fee + DUST_LIMIT,
            have: escrow.amount,
        })?;

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: escrow.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(u32::from(timeout_blocks)),
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(dest_amount),
            script_pubkey: destination_script_pubkey,
        }],
    };

    let signature = sign_htlc_input(&tx, escrow, redeem_script, sender_key)?;
    tx.input[0].witness = script::htlc_refund_witness(&signature, redeem_script);
    Ok(tx)
}

/// BIP-143 ECDSA signature over the redeem script, hashtype byte appended.
fn sign_htlc_input(
    tx: &Transaction,
    escrow: &EscrowUtxo,
    redeem_script: &ScriptBuf,
    key: &SecretKey,
) -> Result<Vec<u8>> {
    let secp = Secp256k1::new();
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .p2wsh_signature_hash(
            0,
            redeem_script,
            Amount::from_sat(escrow.amount),
            EcdsaSighashType::All,
        )
        .map_err(|e| Error::Signing(e.to_string()))?;
    let msg = Message::from(sighash);
    let signature = secp.sign_ecdsa(&msg, key);
    let mut bytes = signature.serialize_der().to_vec();
    bytes.push(EcdsaSighashType::All.to_u32() as u8);
    Ok(bytes)
}
