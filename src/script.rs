//! Escrow script primitives.
//!
//! Builds and parses the HTLC redeem script, assembles claim/refund witness
//! stacks, builds the Taproot refund tree used by MuSig2 escrows, and encodes
//! P2WSH / P2TR addresses under per-chain segwit HRPs.

use crate::error::{Error, Result};
use crate::types::sha256;
use bech32::Hrp;
use bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUALVERIFY, OP_IF, OP_SHA256,
};
use bitcoin::blockdata::script::{Builder, Instruction};
use bitcoin::key::Secp256k1;
use bitcoin::script::read_scriptint;
use bitcoin::secp256k1::PublicKey;
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{ScriptBuf, Witness, XOnlyPublicKey};

/// Relative timeouts are nSequence block counts; BIP-68 caps them at 16 bits.
pub const MAX_TIMEOUT_BLOCKS: u32 = 0xffff;

/// The four fields an HTLC redeem script commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtlcScriptParts {
    pub secret_hash: [u8; 32],
    pub receiver_pub: PublicKey,
    pub sender_pub: PublicKey,
    pub timeout_blocks: u16,
}

fn validate_timeout(timeout_blocks: u16) -> Result<()> {
    if timeout_blocks == 0 {
        return Err(Error::Other(
            "HTLC timeout must be in [1, 65535] blocks".to_string(),
        ));
    }
    Ok(())
}

/// Build the HTLC redeem script.
///
/// ```text
/// IF   SHA256 <secret_hash> EQUALVERIFY <receiver_pub> CHECKSIG
/// ELSE <timeout_blocks> CHECKSEQUENCEVERIFY DROP <sender_pub> CHECKSIG
/// ENDIF
/// ```
///
/// The receiver claims with the preimage; the sender refunds after the
/// relative timeout elapses.
pub fn build_htlc_script(
    secret_hash: &[u8; 32],
    receiver_pub: &PublicKey,
    sender_pub: &PublicKey,
    timeout_blocks: u16,
) -> Result<ScriptBuf> {
    validate_timeout(timeout_blocks)?;

    Ok(Builder::new()
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(secret_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_slice(receiver_pub.serialize())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(timeout_blocks))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_slice(sender_pub.serialize())
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .into_script())
}

/// Tokenize an HTLC redeem script back into its four fields.
///
/// Rejects any structural deviation from [`build_htlc_script`]: wrong opcode
/// ordering, wrong push sizes, out-of-range timeout.
pub fn parse_htlc_script(script: &ScriptBuf) -> Result<HtlcScriptParts> {
    let malformed = |what: &str| Error::Other(format!("Malformed HTLC script: {what}"));

    let mut ins = script.instructions();
    let mut next = || {
        ins.next()
            .transpose()
            .map_err(|e| malformed(&format!("script decode: {e}")))
    };

    let expect_op = |ins: Option<Instruction>, op: bitcoin::Opcode, what: &str| match ins {
        Some(Instruction::Op(o)) if o == op => Ok(()),
        _ => Err(malformed(what)),
    };

    let expect_push = |ins: Option<Instruction>, len: usize, what: &str| match ins {
        Some(Instruction::PushBytes(b)) if b.len() == len => Ok(b.as_bytes().to_vec()),
        _ => Err(malformed(what)),
    };

    expect_op(next()?, OP_IF, "expected OP_IF")?;
    expect_op(next()?, OP_SHA256, "expected OP_SHA256")?;
    let hash = expect_push(next()?, 32, "expected 32-byte hash push")?;
    expect_op(next()?, OP_EQUALVERIFY, "expected OP_EQUALVERIFY")?;
    let receiver = expect_push(next()?, 33, "expected 33-byte receiver key")?;
    expect_op(next()?, OP_CHECKSIG, "expected OP_CHECKSIG")?;
    expect_op(next()?, OP_ELSE, "expected OP_ELSE")?;

    // Timeout is a minimally-encoded script number; one-digit values come
    // through as OP_PUSHNUM opcodes.
    let timeout: i64 = match next()? {
        Some(Instruction::PushBytes(b)) => read_scriptint(b.as_bytes())
            .map_err(|e| malformed(&format!("timeout push: {e}")))?,
        Some(Instruction::Op(op)) => match op.classify(bitcoin::opcodes::ClassifyContext::Legacy) {
            bitcoin::opcodes::Class::PushNum(n) => i64::from(n),
            _ => return Err(malformed("expected timeout push")),
        },
        None => return Err(malformed("expected timeout push")),
    };
    if timeout < 1 || timeout > i64::from(MAX_TIMEOUT_BLOCKS) {
        return Err(malformed("timeout out of [1, 65535]"));
    }

    expect_op(next()?, OP_CSV, "expected OP_CHECKSEQUENCEVERIFY")?;
    expect_op(next()?, OP_DROP, "expected OP_DROP")?;
    let sender = expect_push(next()?, 33, "expected 33-byte sender key")?;
    expect_op(next()?, OP_CHECKSIG, "expected OP_CHECKSIG")?;
    expect_op(next()?, OP_ENDIF, "expected OP_ENDIF")?;
    if next()?.is_some() {
        return Err(malformed("trailing data"));
    }

    Ok(HtlcScriptParts {
        secret_hash: hash.try_into().expect("length checked"),
        receiver_pub: PublicKey::from_slice(&receiver)
            .map_err(|e| Error::InvalidPubKey(e.to_string()))?,
        sender_pub: PublicKey::from_slice(&sender)
            .map_err(|e| Error::InvalidPubKey(e.to_string()))?,
        timeout_blocks: timeout as u16,
    })
}

/// Witness stack that takes the IF (claim) branch: `[sig, secret, 0x01, script]`.
pub fn htlc_claim_witness(signature: &[u8], secret: &[u8; 32], script: &ScriptBuf) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature);
    witness.push(secret);
    witness.push([1u8]);
    witness.push(script.as_bytes());
    witness
}

/// Witness stack that takes the ELSE (refund) branch: `[sig, <empty>, script]`.
pub fn htlc_refund_witness(signature: &[u8], script: &ScriptBuf) -> Witness {
    let mut witness = Witness::new();
    witness.push(signature);
    witness.push([0u8; 0]);
    witness.push(script.as_bytes());
    witness
}

/// Build the single Taproot refund leaf: `<timeout> CSV DROP <refund_key> CHECKSIG`.
///
/// The refund key belongs to the funder of the chain the escrow sits on.
pub fn refund_leaf_script(refund_key: &XOnlyPublicKey, timeout_blocks: u16) -> Result<ScriptBuf> {
    validate_timeout(timeout_blocks)?;

    Ok(Builder::new()
        .push_int(i64::from(timeout_blocks))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_x_only_key(refund_key)
        .push_opcode(OP_CHECKSIG)
        .into_script())
}

/// Commit `internal_key` (and optionally one refund leaf) into a Taproot
/// output, yielding the tweaked key, merkle root and control blocks.
pub fn taproot_spend_info(
    internal_key: XOnlyPublicKey,
    refund_leaf: Option<ScriptBuf>,
) -> Result<TaprootSpendInfo> {
    let secp = Secp256k1::verification_only();
    let builder = match refund_leaf {
        Some(leaf) => TaprootBuilder::new()
            .add_leaf(0, leaf)
            .map_err(|e| Error::Other(format!("taproot leaf: {e}")))?,
        None => TaprootBuilder::new(),
    };
    builder
        .finalize(&secp, internal_key)
        .map_err(|_| Error::Other("taproot finalize failed".to_string()))
}

/// Control block for spending `spend_info` through its refund leaf.
pub fn refund_control_block(
    spend_info: &TaprootSpendInfo,
    leaf: &ScriptBuf,
) -> Result<ControlBlock> {
    spend_info
        .control_block(&(leaf.clone(), LeafVersion::TapScript))
        .ok_or_else(|| Error::Other("refund leaf not in taproot tree".to_string()))
}

/// P2WSH address: bech32 of `SHA256(script)` under the chain's segwit HRP.
pub fn p2wsh_address(script: &ScriptBuf, hrp: &str) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| Error::Other(format!("invalid HRP: {e}")))?;
    let program = sha256(script.as_bytes());
    bech32::segwit::encode(hrp, bech32::segwit::VERSION_0, &program)
        .map_err(|e| Error::Other(format!("bech32 encode: {e}")))
}

/// P2TR address: bech32m of the 32-byte x-only tweaked output key.
pub fn p2tr_address(output_key: &XOnlyPublicKey, hrp: &str) -> Result<String> {
    let hrp = Hrp::parse(hrp).map_err(|e| Error::Other(format!("invalid HRP: {e}")))?;
    bech32::segwit::encode(hrp, bech32::segwit::VERSION_1, &output_key.serialize())
        .map_err(|e| Error::Other(format!("bech32 encode: {e}")))
}

/// Decode a segwit address (any registry HRP) into its scriptPubKey.
pub fn address_to_script_pubkey(address: &str) -> Result<ScriptBuf> {
    let (_, version, program) = bech32::segwit::decode(address)
        .map_err(|e| Error::Other(format!("invalid segwit address {address}: {e}")))?;
    let version =
        bitcoin::blockdata::script::witness_version::WitnessVersion::try_from(version.to_u8())
            .map_err(|e| Error::Other(format!("witness version: {e}")))?;
    let program = bitcoin::blockdata::script::witness_program::WitnessProgram::new(version, &program)
        .map_err(|e| Error::Other(format!("witness program: {e}")))?;
    Ok(ScriptBuf::new_witness_program(&program))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::SecretKey;

    fn test_keys() -> (PublicKey, PublicKey) {
        let secp = Secp256k1::new();
        let a = SecretKey::from_slice(&[0x11; 32]).unwrap();
        let b = SecretKey::from_slice(&[0x22; 32]).unwrap();
        (a.public_key(&secp), b.public_key(&secp))
    }

    #[test]
    fn htlc_script_round_trips() {
        let (receiver, sender) = test_keys();
        let hash = sha256(b"preimage");
        for timeout in [1u16, 16, 72, 144, 576, 65535] {
            let script = build_htlc_script(&hash, &receiver, &sender, timeout).unwrap();
            let parts = parse_htlc_script(&script).unwrap();
            assert_eq!(
                parts,
                HtlcScriptParts {
                    secret_hash: hash,
                    receiver_pub: receiver,
                    sender_pub: sender,
                    timeout_blocks: timeout,
                }
            );
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let (receiver, sender) = test_keys();
        assert!(build_htlc_script(&sha256(b"x"), &receiver, &sender, 0).is_err());
    }

    #[test]
    fn parser_rejects_structural_deviation() {
        let (receiver, sender) = test_keys();
        let script = build_htlc_script(&sha256(b"x"), &receiver, &sender, 144).unwrap();

        // Truncated script.
        let bytes = script.as_bytes();
        let truncated = ScriptBuf::from_bytes(bytes[..bytes.len() - 1].to_vec());
        assert!(parse_htlc_script(&truncated).is_err());

        // Trailing opcode.
        let mut extended = bytes.to_vec();
        extended.push(OP_DROP.to_u8());
        assert!(parse_htlc_script(&ScriptBuf::from_bytes(extended)).is_err());

        // A plain p2wpkh-ish script is not an HTLC.
        assert!(parse_htlc_script(&ScriptBuf::new()).is_err());
    }

    #[test]
    fn claim_witness_shape() {
        let (receiver, sender) = test_keys();
        let secret = [7u8; 32];
        let script = build_htlc_script(&sha256(&secret), &receiver, &sender, 72).unwrap();
        let witness = htlc_claim_witness(&[0xaa; 71], &secret, &script);

        assert_eq!(witness.len(), 4);
        let items: Vec<_> = witness.iter().collect();
        assert_eq!(items[1], secret);
        assert_eq!(items[2], [1u8]);
        assert_eq!(items[3], script.as_bytes());
    }

    #[test]
    fn refund_witness_shape() {
        let (receiver, sender) = test_keys();
        let script = build_htlc_script(&sha256(b"x"), &receiver, &sender, 72).unwrap();
        let witness = htlc_refund_witness(&[0xaa; 71], &script);

        assert_eq!(witness.len(), 3);
        let items: Vec<_> = witness.iter().collect();
        assert!(items[1].is_empty());
        assert_eq!(items[2], script.as_bytes());
    }

    #[test]
    fn p2wsh_address_matches_bitcoin_crate() {
        let (receiver, sender) = test_keys();
        let script = build_htlc_script(&sha256(b"x"), &receiver, &sender, 144).unwrap();

        let ours = p2wsh_address(&script, "bc").unwrap();
        let reference = bitcoin::Address::p2wsh(&script, bitcoin::Network::Bitcoin).to_string();
        assert_eq!(ours, reference);
    }

    #[test]
    fn p2tr_address_matches_bitcoin_crate() {
        let secp = Secp256k1::new();
        let keypair =
            bitcoin::key::Keypair::from_seckey_slice(&secp, &[0x33; 32]).unwrap();
        let (internal, _) = keypair.x_only_public_key();

        let spend_info = taproot_spend_info(internal, None).unwrap();
        let ours = p2tr_address(&spend_info.output_key().to_x_only_public_key(), "bc").unwrap();
        let reference =
            bitcoin::Address::p2tr(&secp, internal, None, bitcoin::Network::Bitcoin).to_string();
        assert_eq!(ours, reference);
    }

    #[test]
    fn refund_leaf_yields_control_block() {
        let secp = Secp256k1::new();
        let keypair = bitcoin::key::Keypair::from_seckey_slice(&secp, &[0x44; 32]).unwrap();
        let (internal, _) = keypair.x_only_public_key();
        let refund_kp = bitcoin::key::Keypair::from_seckey_slice(&secp, &[0x55; 32]).unwrap();
        let (refund_key, _) = refund_kp.x_only_public_key();

        let leaf = refund_leaf_script(&refund_key, 144).unwrap();
        let spend_info = taproot_spend_info(internal, Some(leaf.clone())).unwrap();
        let control = refund_control_block(&spend_info, &leaf).unwrap();

        // leaf version | parity byte, then the 32-byte internal key.
        assert_eq!(control.serialize().len(), 33);
        assert!(spend_info.merkle_root().is_some());
    }
}
