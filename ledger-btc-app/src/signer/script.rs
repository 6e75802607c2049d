// SPDX-License-Identifier: Apache-2.0

//! Script forms of spent outputs and unlocking stack assembly

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{CompressedPublicKey, OutPoint, Script, ScriptBuf, TxIn, TxOut, Witness};

use crate::errors::{BtcAppError, BtcAppResult};
use crate::types::LedgerInput;

/// Shape of the output an input spends, resolved once per signer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptForm {
    /// Bare script such as pay-to-pubkey-hash, hashed as is
    Plain(ScriptBuf),
    /// Pay-to-script-hash
    ScriptHash {
        /// Redeem script
        redeem: ScriptBuf,
    },
    /// Native pay-to-witness-pubkey-hash
    WitnessPubkeyHash,
    /// Pay-to-witness-pubkey-hash nested in pay-to-script-hash
    NestedWitnessPubkeyHash,
    /// Native pay-to-witness-script-hash
    WitnessScriptHash {
        /// Witness script
        witness_script: ScriptBuf,
    },
    /// Pay-to-witness-script-hash nested in pay-to-script-hash
    NestedWitnessScriptHash {
        /// Witness script
        witness_script: ScriptBuf,
    },
}

impl ScriptForm {
    /// Whether signatures for this form commit to the spent value (witness flow)
    pub fn is_witness(&self) -> bool {
        !matches!(self, ScriptForm::Plain(_) | ScriptForm::ScriptHash { .. })
    }

    /// Script committed in place of the input's unlocking script when hashing
    pub fn script_code(&self, public_key: &CompressedPublicKey) -> ScriptBuf {
        match self {
            ScriptForm::Plain(script) => script.clone(),
            ScriptForm::ScriptHash { redeem } => redeem.clone(),
            ScriptForm::WitnessPubkeyHash | ScriptForm::NestedWitnessPubkeyHash => {
                ScriptBuf::new_p2pkh(&public_key.pubkey_hash())
            }
            ScriptForm::WitnessScriptHash { witness_script }
            | ScriptForm::NestedWitnessScriptHash { witness_script } => witness_script.clone(),
        }
    }
}

/// Work out the form of the output spent by `txin`
///
/// The spent script comes from the signer's previous output. A script-hash
/// program is taken from the signer's redeem script, or from the last push of
/// the input's current unlocking script; a witness script from the redeem
/// script or from the last witness item.
pub fn resolve_form<E: std::error::Error>(
    input: &LedgerInput,
    txin: &TxIn,
    spent: Option<&TxOut>,
) -> BtcAppResult<ScriptForm, E> {
    let outpoint = input.outpoint;
    let redeem = input.redeem_script.clone();

    let Some(spent) = spent else {
        // Without the spent output only a supplied redeem script tells the shape
        return match redeem {
            Some(redeem) if !input.witness && !redeem.is_witness_program() => {
                Ok(ScriptForm::ScriptHash { redeem })
            }
            _ => Err(BtcAppError::MissingPreviousOutput(outpoint)),
        };
    };
    let spk = &spent.script_pubkey;

    let form = if spk.is_p2sh() {
        let program = redeem
            .clone()
            .or_else(|| last_push(&txin.script_sig).map(ScriptBuf::from_bytes))
            .ok_or(BtcAppError::<E>::MissingRedeemScript(outpoint))?;

        if program.is_p2wpkh() && &ScriptBuf::new_p2sh(&program.script_hash()) == spk {
            ScriptForm::NestedWitnessPubkeyHash
        } else if program.is_p2wsh() && &ScriptBuf::new_p2sh(&program.script_hash()) == spk {
            let witness_script = txin
                .witness
                .last()
                .map(|w| ScriptBuf::from_bytes(w.to_vec()))
                .ok_or(BtcAppError::<E>::MissingRedeemScript(outpoint))?;
            check_wsh::<E>(outpoint, &witness_script, &program)?;
            ScriptForm::NestedWitnessScriptHash { witness_script }
        } else if &ScriptBuf::new_p2sh(&program.script_hash()) == spk {
            ScriptForm::ScriptHash { redeem: program }
        } else {
            // A redeem script given as the witness script of a nested program
            let nested = ScriptBuf::new_p2wsh(&program.wscript_hash());
            if &ScriptBuf::new_p2sh(&nested.script_hash()) != spk {
                return Err(mismatch(outpoint, "redeem script does not hash to the output"));
            }
            ScriptForm::NestedWitnessScriptHash {
                witness_script: program,
            }
        }
    } else if spk.is_p2wpkh() {
        ScriptForm::WitnessPubkeyHash
    } else if spk.is_p2wsh() {
        let witness_script = redeem
            .or_else(|| {
                txin.witness
                    .last()
                    .map(|w| ScriptBuf::from_bytes(w.to_vec()))
            })
            .ok_or(BtcAppError::<E>::MissingRedeemScript(outpoint))?;
        check_wsh::<E>(outpoint, &witness_script, spk)?;
        ScriptForm::WitnessScriptHash { witness_script }
    } else if spk.is_witness_program() {
        return Err(mismatch(outpoint, "unsupported witness program"));
    } else {
        ScriptForm::Plain(spk.clone())
    };

    if form.is_witness() != input.witness {
        let reason = if input.witness {
            "witness signing requested for a non-witness output"
        } else {
            "witness output signed with the legacy flow"
        };
        return Err(mismatch(outpoint, reason));
    }

    Ok(form)
}

/// Check that `public_key` can sign for `form`
pub fn check_signer<E: std::error::Error>(
    outpoint: OutPoint,
    form: &ScriptForm,
    spent: Option<&TxOut>,
    public_key: &CompressedPublicKey,
) -> BtcAppResult<(), E> {
    let expected = match form {
        ScriptForm::Plain(spk) if spk.is_p2pkh() => {
            Some(ScriptBuf::new_p2pkh(&public_key.pubkey_hash()))
        }
        ScriptForm::Plain(_) => None,
        ScriptForm::WitnessPubkeyHash => Some(ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash())),
        ScriptForm::NestedWitnessPubkeyHash => {
            let program = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
            Some(ScriptBuf::new_p2sh(&program.script_hash()))
        }
        ScriptForm::ScriptHash { redeem }
        | ScriptForm::WitnessScriptHash {
            witness_script: redeem,
        }
        | ScriptForm::NestedWitnessScriptHash {
            witness_script: redeem,
        } => {
            if !script_mentions_key(redeem, public_key) {
                return Err(BtcAppError::UnresolvedSigner(outpoint));
            }
            None
        }
    };

    match (expected, spent) {
        (Some(expected), Some(spent)) if expected != spent.script_pubkey => {
            Err(mismatch(outpoint, "public key does not match the output"))
        }
        _ => Ok(()),
    }
}

/// Write a signature into `txin`
pub fn apply_signature<E: std::error::Error>(
    txin: &mut TxIn,
    form: &ScriptForm,
    public_key: &CompressedPublicKey,
    signature: Vec<u8>,
) -> BtcAppResult<(), E> {
    let key = public_key.to_bytes().to_vec();

    match form {
        ScriptForm::Plain(_) => {
            txin.script_sig = build_script_sig::<E>(&[signature, key])?;
        }
        ScriptForm::WitnessPubkeyHash => {
            txin.script_sig = ScriptBuf::new();
            txin.witness = Witness::from_slice(&[signature, key]);
        }
        ScriptForm::NestedWitnessPubkeyHash => {
            let program = ScriptBuf::new_p2wpkh(&public_key.wpubkey_hash());
            txin.script_sig = build_script_sig::<E>(&[program.into_bytes()])?;
            txin.witness = Witness::from_slice(&[signature, key]);
        }
        ScriptForm::ScriptHash { redeem } => {
            let current = script_pushes(&txin.script_sig);
            let stack = redeem_stack::<E>(redeem, current, public_key, signature)?;
            txin.script_sig = build_script_sig::<E>(&stack)?;
        }
        ScriptForm::WitnessScriptHash { witness_script } => {
            let stack = redeem_stack::<E>(
                witness_script,
                Some(txin.witness.to_vec()),
                public_key,
                signature,
            )?;
            txin.script_sig = ScriptBuf::new();
            txin.witness = Witness::from_slice(&stack);
        }
        ScriptForm::NestedWitnessScriptHash { witness_script } => {
            let stack = redeem_stack::<E>(
                witness_script,
                Some(txin.witness.to_vec()),
                public_key,
                signature,
            )?;
            let program = ScriptBuf::new_p2wsh(&witness_script.wscript_hash());
            txin.script_sig = build_script_sig::<E>(&[program.into_bytes()])?;
            txin.witness = Witness::from_slice(&stack);
        }
    }
    Ok(())
}

/// Threshold and keys of an `m <keys> n OP_CHECKMULTISIG` script
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Multisig {
    /// Signatures required
    pub threshold: usize,
    /// Keys in script order
    pub keys: Vec<Vec<u8>>,
}

/// Recognize a bare multisig script
pub fn parse_multisig(script: &Script) -> Option<Multisig> {
    let items = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    let (first, rest) = items.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, keys) = rest.split_last()?;

    let threshold = small_int(first)?;
    if small_int(count)? != keys.len() || *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    if threshold == 0 || threshold > keys.len() {
        return None;
    }

    let keys = keys
        .iter()
        .map(|item| match item {
            Instruction::PushBytes(bytes) if matches!(bytes.len(), 33 | 65) => {
                Some(bytes.as_bytes().to_vec())
            }
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    Some(Multisig { threshold, keys })
}

/// Build the unlocking stack of a redeem or witness script
///
/// Multisig stacks are `[empty, slot per key, script]` with each signature in
/// the slot of its key. Empty slots are dropped once the threshold is met.
fn redeem_stack<E: std::error::Error>(
    script: &Script,
    current: Option<Vec<Vec<u8>>>,
    public_key: &CompressedPublicKey,
    signature: Vec<u8>,
) -> BtcAppResult<Vec<Vec<u8>>, E> {
    let script_bytes = script.as_bytes().to_vec();

    let Some(multisig) = parse_multisig(script) else {
        return Ok(vec![signature, script_bytes]);
    };

    let position = multisig
        .keys
        .iter()
        .position(|k| key_matches(k, public_key))
        .ok_or_else(|| {
            BtcAppError::<E>::InvalidScript("signing key not in multisig script".to_string())
        })?;

    let n = multisig.keys.len();
    let current = current.unwrap_or_default();
    let ours = matches!(
        current.as_slice(),
        [first, .., last] if first.is_empty() && *last == script_bytes
    );
    let inner = if ours { &current[1..current.len() - 1] } else { &[][..] };

    let mut slots = if ours && inner.len() == n {
        inner.to_vec()
    } else if ours && inner.len() >= multisig.threshold && inner.iter().all(|s| !s.is_empty()) {
        // Threshold already met, nothing left to add
        return Ok(current);
    } else {
        vec![Vec::new(); n]
    };
    slots[position] = signature;

    let filled = slots.iter().filter(|s| !s.is_empty()).count();
    if filled >= multisig.threshold {
        slots.retain(|s| !s.is_empty());
    }

    let mut stack = Vec::with_capacity(slots.len() + 2);
    stack.push(Vec::new());
    stack.extend(slots);
    stack.push(script_bytes);
    Ok(stack)
}

fn small_int(item: &Instruction<'_>) -> Option<usize> {
    match item {
        Instruction::Op(op) => match op.to_u8() {
            n @ 0x51..=0x60 => Some((n - 0x50) as usize),
            _ => None,
        },
        Instruction::PushBytes(bytes) if bytes.is_empty() => Some(0),
        _ => None,
    }
}

fn key_matches(candidate: &[u8], public_key: &CompressedPublicKey) -> bool {
    candidate == public_key.to_bytes() || candidate == public_key.0.serialize_uncompressed()
}

/// Whether `script` pushes the key or its HASH160
fn script_mentions_key(script: &Script, public_key: &CompressedPublicKey) -> bool {
    let hash = public_key.pubkey_hash().to_byte_array();
    script.instructions().flatten().any(|item| match item {
        Instruction::PushBytes(bytes) => {
            key_matches(bytes.as_bytes(), public_key) || bytes.as_bytes()[..] == hash[..]
        }
        Instruction::Op(_) => false,
    })
}

fn last_push(script: &Script) -> Option<Vec<u8>> {
    script_pushes(script)?.pop().filter(|item| !item.is_empty())
}

/// Data pushes of an unlocking script, `None` if it contains anything else
fn script_pushes(script: &Script) -> Option<Vec<Vec<u8>>> {
    script
        .instructions()
        .map(|item| match item {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

fn build_script_sig<E: std::error::Error>(stack: &[Vec<u8>]) -> BtcAppResult<ScriptBuf, E> {
    let mut builder = Builder::new();
    for item in stack {
        let push = PushBytesBuf::try_from(item.clone())
            .map_err(|_| BtcAppError::<E>::InvalidScript("stack item too large".to_string()))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

fn check_wsh<E: std::error::Error>(
    outpoint: OutPoint,
    witness_script: &Script,
    program: &Script,
) -> BtcAppResult<(), E> {
    if ScriptBuf::new_p2wsh(&witness_script.wscript_hash()) != *program {
        return Err(mismatch(outpoint, "witness script does not hash to the program"));
    }
    Ok(())
}

fn mismatch<E: std::error::Error>(outpoint: OutPoint, reason: &str) -> BtcAppError<E> {
    BtcAppError::ScriptMismatch(outpoint, reason.to_string())
}
