// SPDX-License-Identifier: Apache-2.0

//! GET TRUSTED INPUT command implementation

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use bitcoin::{OutPoint, Transaction};
use ledger_device_base::{
    AppExt, ChunkRule, ChunkedInstruction, LedgerAppError, LedgerDevice, ResponseMode,
};
use ledger_transport::Exchange;
use log::debug;

use crate::errors::{BtcAppError, BtcAppResult};
use crate::instructions::{ins, length, p1_stream};
use crate::types::TrustedInput;
use crate::utils::{encode_varint, push_script_blocks};
use crate::BtcApp;

#[async_trait]
pub trait GetTrustedInput<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Stream `previous_tx` to the device and get a token for output `index`
    async fn get_trusted_input(
        device: &LedgerDevice<E>,
        previous_tx: &Transaction,
        index: u32,
    ) -> BtcAppResult<TrustedInput, E::Error>;
}

#[async_trait]
impl<E> GetTrustedInput<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn get_trusted_input(
        device: &LedgerDevice<E>,
        previous_tx: &Transaction,
        index: u32,
    ) -> BtcAppResult<TrustedInput, E::Error> {
        let txid = previous_tx.compute_txid();
        if index as usize >= previous_tx.output.len() {
            return Err(BtcAppError::MissingPreviousOutput(OutPoint::new(txid, index)));
        }

        let instruction = ChunkedInstruction {
            ins: ins::GET_TRUSTED_INPUT,
            p2: 0x00,
            rule: ChunkRule::FirstThenNext {
                first: p1_stream::FIRST,
                next: p1_stream::NEXT,
            },
            response: ResponseMode::LastFrame,
        };

        debug!("get trusted input for {txid}:{index}");
        let token = <BtcApp as AppExt<E>>::send_chunks(
            device,
            instruction,
            trusted_input_frames(previous_tx, index),
        )
        .await
        .map_err(|e| match e {
            LedgerAppError::WrongData => BtcAppError::TrustedInputUnavailable,
            e => BtcAppError::from(e),
        })?;

        if token.len() != length::TRUSTED_INPUT_LEN {
            return Err(BtcAppError::MalformedResponse(format!(
                "trusted input of {} bytes (expected {})",
                token.len(),
                length::TRUSTED_INPUT_LEN
            )));
        }

        Ok(TrustedInput::new(token))
    }
}

/// Split a transaction into the frames GET TRUSTED INPUT expects
///
/// Witness data is never sent, the device hashes the legacy serialization.
pub(crate) fn trusted_input_frames(tx: &Transaction, index: u32) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    let mut header = index.to_be_bytes().to_vec();
    header.extend_from_slice(&tx.version.0.to_le_bytes());
    header.extend_from_slice(&encode_varint(tx.input.len()));
    frames.push(header);

    for input in &tx.input {
        let mut frame = serialize(&input.previous_output);
        frame.extend_from_slice(&encode_varint(input.script_sig.len()));
        frames.push(frame);
        push_script_blocks(&mut frames, input.script_sig.as_bytes(), input.sequence.0);
    }

    frames.push(encode_varint(tx.output.len()));
    frames.extend(tx.output.iter().map(serialize));

    frames.push(tx.lock_time.to_consensus_u32().to_le_bytes().to_vec());
    frames
}
