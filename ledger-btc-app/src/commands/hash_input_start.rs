// SPDX-License-Identifier: Apache-2.0

//! UNTRUSTED HASH TRANSACTION INPUT START command implementation

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize;
use ledger_device_base::{AppExt, ChunkRule, ChunkedInstruction, LedgerDevice, ResponseMode};
use ledger_transport::Exchange;
use log::debug;

use crate::errors::{BtcAppError, BtcAppResult};
use crate::instructions::{input_tag, ins, p1_stream, p2_hash_start};
use crate::types::{HashInput, InputReference, StartMode};
use crate::utils::{encode_varint, push_script_blocks};
use crate::BtcApp;

#[async_trait]
pub trait HashInputStart<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Stream the transaction inputs into the device hash session
    async fn hash_input_start(
        device: &LedgerDevice<E>,
        version: i32,
        inputs: &[HashInput],
        mode: StartMode,
    ) -> BtcAppResult<(), E::Error>;
}

#[async_trait]
impl<E> HashInputStart<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn hash_input_start(
        device: &LedgerDevice<E>,
        version: i32,
        inputs: &[HashInput],
        mode: StartMode,
    ) -> BtcAppResult<(), E::Error> {
        if inputs.is_empty() {
            return Err(BtcAppError::InvalidRequest(
                "transaction has no inputs".to_string(),
            ));
        }

        let p2 = match mode {
            StartMode::NewLegacy => p2_hash_start::NEW_LEGACY,
            StartMode::NewWitness => p2_hash_start::NEW_WITNESS,
            StartMode::Continue => p2_hash_start::CONTINUE,
        };

        let instruction = ChunkedInstruction {
            ins: ins::UNTRUSTED_HASH_TRANSACTION_INPUT_START,
            p2,
            rule: ChunkRule::FirstThenNext {
                first: p1_stream::FIRST,
                next: p1_stream::NEXT,
            },
            response: ResponseMode::LastFrame,
        };

        debug!("hash input start ({mode:?}, {} inputs)", inputs.len());
        <BtcApp as AppExt<E>>::send_chunks(device, instruction, start_frames(version, inputs))
            .await?;
        Ok(())
    }
}

/// `version || varint(n_in)`, then per input its reference frame and script blocks
pub(crate) fn start_frames(version: i32, inputs: &[HashInput]) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();

    let mut header = version.to_le_bytes().to_vec();
    header.extend_from_slice(&encode_varint(inputs.len()));
    frames.push(header);

    for input in inputs {
        let mut frame = match &input.reference {
            InputReference::Trusted(token) => {
                let mut frame = vec![input_tag::TRUSTED, token.as_bytes().len() as u8];
                frame.extend_from_slice(token.as_bytes());
                frame
            }
            InputReference::Witness(outpoint, value) => {
                let mut frame = vec![input_tag::WITNESS];
                frame.extend_from_slice(&serialize(outpoint));
                frame.extend_from_slice(&value.to_le_bytes());
                frame
            }
            InputReference::Untrusted(outpoint) => {
                let mut frame = vec![input_tag::UNTRUSTED];
                frame.extend_from_slice(&serialize(outpoint));
                frame
            }
        };
        frame.extend_from_slice(&encode_varint(input.script.len()));
        frames.push(frame);

        push_script_blocks(&mut frames, input.script.as_bytes(), input.sequence);
    }

    frames
}
