// SPDX-License-Identifier: Apache-2.0

//! Transaction signing on top of the hash session commands
//!
//! Every signer is validated and resolved to a [`ScriptForm`] before the
//! device is touched. Witness signers share one hash session (one start over
//! all inputs, one output commitment, one sign request each); legacy signers
//! restart the session for every input with all other unlocking scripts
//! blanked.

pub mod script;

use std::collections::HashMap;

use bitcoin::{CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Transaction, TxOut};
use ledger_device_base::LedgerDevice;
use ledger_transport::Exchange;
use log::{debug, info, warn};

pub use self::script::ScriptForm;
use crate::commands::{GetPublicKey, GetTrustedInput, HashInputStart, HashOutputFinalize, HashSign};
use crate::errors::{BtcAppError, BtcAppResult};
use crate::path::BipPath;
use crate::session::HashSession;
use crate::types::{
    GetPublicKeyParams, HashInput, InputReference, LedgerInput, Signature, StartMode, TrustedInput,
};
use crate::BtcApp;

/// Hash session commands guarded by the host-side state machine
///
/// The state only advances once the device accepted the command.
pub(crate) struct SessionDriver<'a, E> {
    device: &'a LedgerDevice<E>,
    session: &'a mut HashSession,
}

impl<'a, E> SessionDriver<'a, E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    pub(crate) fn new(device: &'a LedgerDevice<E>, session: &'a mut HashSession) -> Self {
        SessionDriver { device, session }
    }

    /// Stream `inputs` with UNTRUSTED HASH TRANSACTION INPUT START
    ///
    /// Refused without a frame when `mode` does not fit the current state.
    pub(crate) async fn start(
        &mut self,
        version: i32,
        inputs: &[HashInput],
        mode: StartMode,
    ) -> BtcAppResult<(), E::Error> {
        let mut next = *self.session;
        next.start::<E::Error>(mode)?;
        <BtcApp as HashInputStart<E>>::hash_input_start(self.device, version, inputs, mode).await?;
        *self.session = next;
        Ok(())
    }

    /// Commit `outputs`, only once inputs were streamed
    pub(crate) async fn finalize(&mut self, outputs: &[TxOut]) -> BtcAppResult<(), E::Error> {
        let mut next = *self.session;
        next.finalize_outputs::<E::Error>()?;
        <BtcApp as HashOutputFinalize<E>>::hash_output_finalize(self.device, outputs).await?;
        *self.session = next;
        Ok(())
    }

    /// Request a signature over the committed hash state
    pub(crate) async fn sign(
        &mut self,
        path: &BipPath,
        lock_time: u32,
        sighash_type: EcdsaSighashType,
    ) -> BtcAppResult<Signature, E::Error> {
        let mut next = *self.session;
        next.sign::<E::Error>()?;
        let signature =
            <BtcApp as HashSign<E>>::hash_sign(self.device, path, lock_time, sighash_type).await?;
        *self.session = next;
        Ok(signature)
    }

    /// Close the session; the next start must open a new one
    pub(crate) fn finish(&mut self) {
        self.session.finish();
    }
}

/// A signer checked against the transaction
struct Signer<'a> {
    input: &'a LedgerInput,
    position: usize,
    form: ScriptForm,
    public_key: CompressedPublicKey,
    script_code: ScriptBuf,
}

/// Sign `tx` in place
///
/// Signatures already written stay in the transaction when a later step fails.
pub async fn sign_transaction<E>(
    device: &LedgerDevice<E>,
    session: &mut HashSession,
    tx: &mut Transaction,
    inputs: &[LedgerInput],
) -> BtcAppResult<(), E::Error>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    if session.is_open() {
        debug!("closing unfinished hash session {session:?}");
        session.finish();
    }

    let mut planned = Vec::with_capacity(inputs.len());
    for input in inputs {
        planned.push(plan::<E::Error>(tx, input)?);
    }

    // The witness session hashes the value of every input, signed or not
    let values = if planned.iter().any(|(_, _, form)| form.is_witness()) {
        spent_values::<E::Error>(tx, &planned)?
    } else {
        Vec::new()
    };

    let mut keys: HashMap<&BipPath, CompressedPublicKey> = HashMap::new();
    let mut signers = Vec::with_capacity(planned.len());
    for (input, position, form) in planned {
        let public_key = match input.public_key.or_else(|| keys.get(&input.path).copied()) {
            Some(public_key) => public_key,
            None => {
                let params = GetPublicKeyParams::new(input.path.clone());
                let info = <BtcApp as GetPublicKey<E>>::get_public_key(device, params).await?;
                keys.insert(&input.path, info.public_key);
                info.public_key
            }
        };
        script::check_signer::<E::Error>(
            input.outpoint,
            &form,
            input.previous_output(),
            &public_key,
        )?;

        signers.push(Signer {
            input,
            position,
            script_code: form.script_code(&public_key),
            form,
            public_key,
        });
    }

    let mut trusted: HashMap<OutPoint, TrustedInput> = HashMap::new();
    for signer in signers.iter().filter(|s| !s.form.is_witness()) {
        let outpoint = signer.input.outpoint;
        let Some(previous_tx) = &signer.input.previous_transaction else {
            continue;
        };
        if trusted.contains_key(&outpoint) {
            continue;
        }
        let token = <BtcApp as GetTrustedInput<E>>::get_trusted_input(
            device,
            previous_tx,
            outpoint.vout,
        )
        .await?;
        trusted.insert(outpoint, token);
    }

    let witness_count = signers.iter().filter(|s| s.form.is_witness()).count();
    info!(
        "signing {} inputs ({} witness, {} legacy)",
        signers.len(),
        witness_count,
        signers.len() - witness_count
    );

    let mut driver = SessionDriver::new(device, session);
    let mut signed = 0;

    let result = sign_witness(&mut driver, tx, &signers, &values, &mut signed).await;
    let result = match result {
        Ok(()) => sign_legacy(&mut driver, tx, &signers, &trusted, &mut signed).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) => driver.finish(),
        Err(e) if signed > 0 => warn!("signing stopped after {signed} signatures: {e}"),
        Err(_) => {}
    }
    result
}

/// Local checks for one signer: input position, previous output and script form
fn plan<'a, E: std::error::Error>(
    tx: &Transaction,
    input: &'a LedgerInput,
) -> BtcAppResult<(&'a LedgerInput, usize, ScriptForm), E> {
    input.path.validate()?;

    let position = tx
        .input
        .iter()
        .position(|txin| txin.previous_output == input.outpoint)
        .ok_or(BtcAppError::<E>::InputNotFound(input.outpoint))?;

    if let Some(previous_tx) = &input.previous_transaction {
        if previous_tx.compute_txid() != input.outpoint.txid {
            return Err(BtcAppError::MissingPreviousOutput(input.outpoint));
        }
    }

    let form = script::resolve_form::<E>(input, &tx.input[position], input.previous_output())?;

    // Legacy signers without a redeem script are only accepted with a trusted input
    let needs_trusted_input = !form.is_witness() && !matches!(form, ScriptForm::ScriptHash { .. });
    if needs_trusted_input && input.previous_transaction.is_none() {
        return Err(BtcAppError::MissingPreviousOutput(input.outpoint));
    }

    Ok((input, position, form))
}

/// Value spent by every input of `tx`, taken from the signers at that position
fn spent_values<E: std::error::Error>(
    tx: &Transaction,
    planned: &[(&LedgerInput, usize, ScriptForm)],
) -> BtcAppResult<Vec<u64>, E> {
    tx.input
        .iter()
        .enumerate()
        .map(|(position, txin)| {
            planned
                .iter()
                .filter(|(_, p, _)| *p == position)
                .find_map(|(input, _, _)| input.previous_output())
                .map(|output| output.value.to_sat())
                .ok_or(BtcAppError::MissingPreviousOutput(txin.previous_output))
        })
        .collect()
}

async fn sign_witness<E>(
    driver: &mut SessionDriver<'_, E>,
    tx: &mut Transaction,
    signers: &[Signer<'_>],
    values: &[u64],
    signed: &mut usize,
) -> BtcAppResult<(), E::Error>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    let witness: Vec<&Signer<'_>> = signers.iter().filter(|s| s.form.is_witness()).collect();
    if witness.is_empty() {
        return Ok(());
    }

    let inputs: Vec<HashInput> = tx
        .input
        .iter()
        .enumerate()
        .zip(values)
        .map(|((position, txin), value)| {
            let reference = InputReference::Witness(txin.previous_output, *value);
            let script = witness
                .iter()
                .find(|s| s.position == position)
                .map(|s| s.script_code.clone())
                .unwrap_or_default();

            HashInput {
                reference,
                script,
                sequence: txin.sequence.0,
            }
        })
        .collect();

    driver
        .start(tx.version.0, &inputs, StartMode::NewWitness)
        .await?;
    driver.finalize(&tx.output).await?;

    let lock_time = tx.lock_time.to_consensus_u32();
    for signer in witness {
        debug!("witness signature for {}", signer.input.outpoint);
        let signature = driver
            .sign(&signer.input.path, lock_time, signer.input.sighash_type)
            .await?;
        script::apply_signature::<E::Error>(
            &mut tx.input[signer.position],
            &signer.form,
            &signer.public_key,
            signature.to_stack_item(),
        )?;
        *signed += 1;
    }

    // Legacy signers that follow open their own session
    driver.finish();
    Ok(())
}

async fn sign_legacy<E>(
    driver: &mut SessionDriver<'_, E>,
    tx: &mut Transaction,
    signers: &[Signer<'_>],
    trusted: &HashMap<OutPoint, TrustedInput>,
    signed: &mut usize,
) -> BtcAppResult<(), E::Error>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    let lock_time = tx.lock_time.to_consensus_u32();

    for (round, signer) in signers.iter().filter(|s| !s.form.is_witness()).enumerate() {
        let inputs: Vec<HashInput> = tx
            .input
            .iter()
            .enumerate()
            .map(|(position, txin)| {
                let reference = match trusted.get(&txin.previous_output) {
                    Some(token) => InputReference::Trusted(token.clone()),
                    None => InputReference::Untrusted(txin.previous_output),
                };
                let script = if position == signer.position {
                    signer.script_code.clone()
                } else {
                    ScriptBuf::new()
                };

                HashInput {
                    reference,
                    script,
                    sequence: txin.sequence.0,
                }
            })
            .collect();

        let mode = if round == 0 {
            StartMode::NewLegacy
        } else {
            StartMode::Continue
        };

        debug!("legacy signature for {}", signer.input.outpoint);
        driver.start(tx.version.0, &inputs, mode).await?;
        driver.finalize(&tx.output).await?;
        let signature = driver
            .sign(&signer.input.path, lock_time, signer.input.sighash_type)
            .await?;
        script::apply_signature::<E::Error>(
            &mut tx.input[signer.position],
            &signer.form,
            &signer.public_key,
            signature.to_stack_item(),
        )?;
        *signed += 1;
    }

    Ok(())
}
