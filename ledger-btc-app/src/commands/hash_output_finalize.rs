// SPDX-License-Identifier: Apache-2.0

//! UNTRUSTED HASH TRANSACTION INPUT FINALIZE FULL command implementation

use async_trait::async_trait;
use bitcoin::TxOut;
use ledger_device_base::{AppExt, ChunkRule, ChunkedInstruction, LedgerDevice, ResponseMode};
use ledger_transport::Exchange;
use log::debug;

use crate::errors::BtcAppResult;
use crate::instructions::{ins, length, p1_finalize};
use crate::utils::serialize_outputs;
use crate::BtcApp;

#[async_trait]
pub trait HashOutputFinalize<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Commit the transaction outputs to the open hash session
    async fn hash_output_finalize(
        device: &LedgerDevice<E>,
        outputs: &[TxOut],
    ) -> BtcAppResult<(), E::Error>;
}

#[async_trait]
impl<E> HashOutputFinalize<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn hash_output_finalize(
        device: &LedgerDevice<E>,
        outputs: &[TxOut],
    ) -> BtcAppResult<(), E::Error> {
        let instruction = ChunkedInstruction {
            ins: ins::UNTRUSTED_HASH_TRANSACTION_INPUT_FINALIZE_FULL,
            p2: 0x00,
            rule: ChunkRule::MoreThenLast {
                more: p1_finalize::MORE,
                last: p1_finalize::LAST,
            },
            response: ResponseMode::LastFrame,
        };

        debug!("hash output finalize ({} outputs)", outputs.len());
        // The answer only carries user-validation flags
        <BtcApp as AppExt<E>>::send_chunks(device, instruction, finalize_frames(outputs)).await?;
        Ok(())
    }
}

pub(crate) fn finalize_frames(outputs: &[TxOut]) -> Vec<Vec<u8>> {
    serialize_outputs(outputs)
        .chunks(length::MAX_SCRIPT_BLOCK)
        .map(|block| block.to_vec())
        .collect()
}
