// SPDX-License-Identifier: Apache-2.0

//! UNTRUSTED HASH SIGN command implementation

use async_trait::async_trait;
use bitcoin::EcdsaSighashType;
use ledger_device_base::{App, AppExt, LedgerDevice};
use ledger_transport::{APDUCommand, Exchange};
use log::debug;

use crate::errors::BtcAppResult;
use crate::instructions::ins;
use crate::path::BipPath;
use crate::types::Signature;
use crate::utils::normalize_der_signature;
use crate::BtcApp;

#[async_trait]
pub trait HashSign<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Sign the committed hash state with the key at `path`
    async fn hash_sign(
        device: &LedgerDevice<E>,
        path: &BipPath,
        lock_time: u32,
        sighash_type: EcdsaSighashType,
    ) -> BtcAppResult<Signature, E::Error>;
}

#[async_trait]
impl<E> HashSign<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn hash_sign(
        device: &LedgerDevice<E>,
        path: &BipPath,
        lock_time: u32,
        sighash_type: EcdsaSighashType,
    ) -> BtcAppResult<Signature, E::Error> {
        path.validate()?;

        let command = APDUCommand {
            cla: Self::CLA,
            ins: ins::UNTRUSTED_HASH_SIGN,
            p1: 0x00,
            p2: 0x00,
            data: sign_payload(path, lock_time, sighash_type),
        };

        debug!("hash sign with {path}");
        let response = device.exchange(&command).await?;
        <BtcApp as AppExt<E>>::handle_response_error_signature(&response)?;

        Ok(Signature {
            der: normalize_der_signature(response.data().to_vec()),
            sighash_type,
        })
    }
}

/// `path || 0x00 || locktime_be || sighash`, the zero being an empty user validation code
pub(crate) fn sign_payload(
    path: &BipPath,
    lock_time: u32,
    sighash_type: EcdsaSighashType,
) -> Vec<u8> {
    let mut data = path.encode();
    data.push(0x00);
    data.extend_from_slice(&lock_time.to_be_bytes());
    data.push(sighash_type.to_u32() as u8);
    data
}
