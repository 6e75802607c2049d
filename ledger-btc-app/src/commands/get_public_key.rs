// SPDX-License-Identifier: Apache-2.0

//! GET WALLET PUBLIC KEY command implementation

use async_trait::async_trait;
use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint, Xpub};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{CompressedPublicKey, Network, NetworkKind};
use ledger_device_base::{App, AppExt, LedgerDevice};
use ledger_transport::{APDUCommand, Exchange};
use log::debug;

use crate::errors::{BtcAppError, BtcAppResult};
use crate::instructions::{ins, length, p1_get_public_key};
use crate::path::BipPath;
use crate::types::{GetPublicKeyParams, PublicKeyInfo};
use crate::utils::ResponseReader;
use crate::BtcApp;

#[async_trait]
pub trait GetPublicKey<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Get the public key, address and chain code for the given BIP 32 path
    async fn get_public_key(
        device: &LedgerDevice<E>,
        params: GetPublicKeyParams,
    ) -> BtcAppResult<PublicKeyInfo, E::Error>;

    /// Build the extended public key at `path`
    ///
    /// The parent key is fetched as well to compute the fingerprint, except at
    /// depth one where the parent is the master key.
    async fn get_extended_public_key(
        device: &LedgerDevice<E>,
        path: &BipPath,
        network: Network,
    ) -> BtcAppResult<Xpub, E::Error>;
}

#[async_trait]
impl<E> GetPublicKey<E> for BtcApp
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    async fn get_public_key(
        device: &LedgerDevice<E>,
        params: GetPublicKeyParams,
    ) -> BtcAppResult<PublicKeyInfo, E::Error> {
        params.path.validate()?;

        let p1 = if params.display {
            p1_get_public_key::DISPLAY
        } else {
            p1_get_public_key::SILENT
        };

        let command = APDUCommand {
            cla: Self::CLA,
            ins: ins::GET_WALLET_PUBLIC_KEY,
            p1,
            p2: params.format.p2(),
            data: params.path.encode(),
        };

        debug!("get public key for {}", params.path);
        let response = <BtcApp as AppExt<E>>::send_single(device, command).await?;

        parse_public_key_response::<E::Error>(response.data())
    }

    async fn get_extended_public_key(
        device: &LedgerDevice<E>,
        path: &BipPath,
        network: Network,
    ) -> BtcAppResult<Xpub, E::Error> {
        let child_number = path
            .last()
            .map(ChildNumber::from)
            .ok_or_else(|| BtcAppError::<E::Error>::InvalidPath("empty path".to_string()))?;

        let child = Self::get_public_key(device, GetPublicKeyParams::new(path.clone())).await?;

        let parent_fingerprint = match path.parent().filter(|p| !p.indices.is_empty()) {
            Some(parent) => {
                let parent = Self::get_public_key(device, GetPublicKeyParams::new(parent)).await?;
                fingerprint(&parent.public_key)
            }
            None => Fingerprint::from([0u8; 4]),
        };

        Ok(Xpub {
            network: NetworkKind::from(network),
            depth: path.depth() as u8,
            parent_fingerprint,
            child_number,
            public_key: child.public_key.0,
            chain_code: ChainCode::from(child.chain_code),
        })
    }
}

/// First four bytes of HASH160 of the compressed key
fn fingerprint(public_key: &CompressedPublicKey) -> Fingerprint {
    let hash = public_key.pubkey_hash().to_byte_array();
    Fingerprint::from([hash[0], hash[1], hash[2], hash[3]])
}

/// Parse `pk_len || pk || addr_len || addr || chain_code`
fn parse_public_key_response<E: std::error::Error>(
    data: &[u8],
) -> BtcAppResult<PublicKeyInfo, E> {
    let mut reader = ResponseReader::new(data);

    let raw_public_key = reader.take_lv::<E>("public key")?;
    if raw_public_key.len() != length::UNCOMPRESSED_PUBKEY_LEN
        && raw_public_key.len() != length::COMPRESSED_PUBKEY_LEN
    {
        return Err(BtcAppError::MalformedResponse(format!(
            "invalid public key length: {}",
            raw_public_key.len()
        )));
    }
    let public_key = PublicKey::from_slice(raw_public_key)
        .map_err(|e| BtcAppError::<E>::MalformedResponse(format!("invalid public key: {e}")))?;

    let address = reader.take_lv::<E>("address")?;
    let address = String::from_utf8(address.to_vec())
        .map_err(|_| BtcAppError::<E>::MalformedResponse("address is not UTF-8".to_string()))?;

    let chain_code = reader.take::<E>(length::CHAIN_CODE_LEN, "chain code")?;
    let mut chain = [0u8; length::CHAIN_CODE_LEN];
    chain.copy_from_slice(chain_code);

    Ok(PublicKeyInfo {
        raw_public_key: raw_public_key.to_vec(),
        public_key: CompressedPublicKey(public_key),
        address,
        chain_code: chain,
    })
}
