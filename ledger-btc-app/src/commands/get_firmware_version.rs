// SPDX-License-Identifier: Apache-2.0

//! GET FIRMWARE VERSION command implementation

use async_trait::async_trait;
use ledger_device_base::{App, AppExt, LedgerDevice};
use ledger_transport::{APDUCommand, Exchange};

use crate::errors::BtcAppResult;
use crate::instructions::ins;
use crate::types::FirmwareVersion;
use crate::utils::ResponseReader;
use crate::BtcApp;

#[async_trait]
pub trait GetFirmwareVersion<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Get the Bitcoin application version
    async fn get_firmware_version(
        device: &LedgerDevice<E>,
    ) -> BtcAppResult<FirmwareVersion, E::Error>;
}

#[async_trait]
impl<E> GetFirmwareVersion<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn get_firmware_version(
        device: &LedgerDevice<E>,
    ) -> BtcAppResult<FirmwareVersion, E::Error> {
        let command = APDUCommand {
            cla: Self::CLA,
            ins: ins::GET_FIRMWARE_VERSION,
            p1: 0x00,
            p2: 0x00,
            data: Vec::new(),
        };

        let response = <BtcApp as AppExt<E>>::send_single(device, command).await?;
        parse_firmware_version::<E::Error>(response.data())
    }
}

/// `features || arch || major || minor || patch`, loader version ignored
fn parse_firmware_version<E: std::error::Error>(
    data: &[u8],
) -> BtcAppResult<FirmwareVersion, E> {
    let mut reader = ResponseReader::new(data);
    Ok(FirmwareVersion {
        features: reader.take_u8::<E>("features")?,
        architecture: reader.take_u8::<E>("architecture")?,
        major: reader.take_u8::<E>("major version")?,
        minor: reader.take_u8::<E>("minor version")?,
        patch: reader.take_u8::<E>("patch version")?,
    })
}
