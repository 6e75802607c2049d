// SPDX-License-Identifier: Apache-2.0

//! Ledger Bitcoin Application SDK
//!
//! Host-side driver for the Bitcoin application on Ledger hardware wallets.
//! Private keys never leave the device: the host streams previous
//! transactions and the transaction being signed into the device hash engine
//! and collects one signature per input.
//!
//! ## Features
//!
//! - **Public keys**: raw keys, addresses and extended public keys for BIP32 paths
//! - **Trusted inputs**: device-authenticated references to previous outputs
//! - **Hash session**: start, finalize and sign commands with a host-side state machine
//! - **Signing**: legacy, P2SH, native and nested segwit inputs, multisig included
//! - **Exclusive access**: one signing call at a time per device, later callers wait in order

use bitcoin::bip32::Xpub;
use bitcoin::{EcdsaSighashType, Network, Transaction, TxOut};
use ledger_device_base::{App, AppExt, AppInfo, LedgerDevice};
use ledger_transport::Exchange;
use tokio::sync::Mutex;

pub mod commands;
pub mod errors;
pub mod instructions;
pub mod path;
pub mod session;
pub mod signer;
pub mod types;
pub mod utils;

pub use commands::*;
pub use errors::*;
pub use path::{parse_path, BipPath, PathError};
pub use session::HashSession;
pub use signer::ScriptForm;
pub use types::*;

use crate::signer::SessionDriver;

/// Bitcoin app marker implementing `App` trait CLA.
#[derive(Debug, Clone)]
pub struct BtcApp;

impl App for BtcApp {
    /// CLA for Bitcoin app on Ledger (0xE0)
    const CLA: u8 = 0xE0;
}

/// High-level Bitcoin application client
///
/// Owns the device connection and the host-side view of its hash session.
/// Every operation holds exclusive access to the device while it runs, so
/// concurrent callers are served one after the other in arrival order.
#[derive(Debug)]
pub struct BitcoinApp<E> {
    device: LedgerDevice<E>,
    session: Mutex<HashSession>,
}

impl<E> BitcoinApp<E> {
    /// Create a new Bitcoin application client
    pub fn new(device: LedgerDevice<E>) -> Self {
        Self {
            device,
            session: Mutex::new(HashSession::New),
        }
    }

    /// Get a reference to the underlying device
    pub fn device(&self) -> &LedgerDevice<E> {
        &self.device
    }
}

impl<E> BitcoinApp<E>
where
    E: Exchange + Send + Sync,
    E::Error: std::error::Error,
{
    /// Get the public key, address and chain code for a BIP32 path
    pub async fn get_public_key(
        &self,
        params: GetPublicKeyParams,
    ) -> BtcAppResult<PublicKeyInfo, E::Error> {
        let _guard = self.session.lock().await;
        BtcApp::get_public_key(&self.device, params).await
    }

    /// Get the extended public key for a BIP32 path
    pub async fn get_extended_public_key(
        &self,
        path: &BipPath,
        network: Network,
    ) -> BtcAppResult<Xpub, E::Error> {
        let _guard = self.session.lock().await;
        BtcApp::get_extended_public_key(&self.device, path, network).await
    }

    /// Get a trusted input for output `index` of `previous_tx`
    pub async fn get_trusted_input(
        &self,
        previous_tx: &Transaction,
        index: u32,
    ) -> BtcAppResult<TrustedInput, E::Error> {
        let _guard = self.session.lock().await;
        BtcApp::get_trusted_input(&self.device, previous_tx, index).await
    }

    /// Get the Bitcoin application version
    pub async fn get_firmware_version(&self) -> BtcAppResult<FirmwareVersion, E::Error> {
        let _guard = self.session.lock().await;
        BtcApp::get_firmware_version(&self.device).await
    }

    /// Get name, version and flags of the running app
    pub async fn get_app_info(&self) -> BtcAppResult<AppInfo, E::Error> {
        let _guard = self.session.lock().await;
        Ok(<BtcApp as AppExt<E>>::get_app_info(&self.device).await?)
    }

    /// Stream inputs into the device hash session
    ///
    /// `StartMode::Continue` requires a legacy session that already signed.
    /// Opening a new session while one is open fails with `SessionConflict`;
    /// call [`BitcoinApp::end_hash_session`] first.
    pub async fn hash_transaction_start(
        &self,
        version: i32,
        inputs: &[HashInput],
        mode: StartMode,
    ) -> BtcAppResult<(), E::Error> {
        let mut session = self.session.lock().await;
        SessionDriver::new(&self.device, &mut session)
            .start(version, inputs, mode)
            .await
    }

    /// Commit outputs to the open hash session
    pub async fn hash_output_finalize(&self, outputs: &[TxOut]) -> BtcAppResult<(), E::Error> {
        let mut session = self.session.lock().await;
        SessionDriver::new(&self.device, &mut session)
            .finalize(outputs)
            .await
    }

    /// Sign the committed hash state, fails with `SessionExpired` when no session is ready
    pub async fn hash_sign(
        &self,
        path: &BipPath,
        lock_time: u32,
        sighash_type: EcdsaSighashType,
    ) -> BtcAppResult<Signature, E::Error> {
        let mut session = self.session.lock().await;
        SessionDriver::new(&self.device, &mut session)
            .sign(path, lock_time, sighash_type)
            .await
    }

    /// Close the hash session so a new one can be opened
    pub async fn end_hash_session(&self) {
        self.session.lock().await.finish();
    }

    /// Sign the inputs described by `inputs`, writing scripts and witnesses into `tx`
    ///
    /// Waits for any operation already running on the device. If a step fails
    /// the signatures produced so far are left in `tx`.
    pub async fn sign_transaction(
        &self,
        tx: &mut Transaction,
        inputs: &[LedgerInput],
    ) -> BtcAppResult<(), E::Error> {
        let mut session = self.session.lock().await;
        signer::sign_transaction(&self.device, &mut session, tx, inputs).await
    }

    /// Same as [`BitcoinApp::sign_transaction`] but fails with `SessionConflict`
    /// instead of waiting when the device is busy
    pub async fn try_sign_transaction(
        &self,
        tx: &mut Transaction,
        inputs: &[LedgerInput],
    ) -> BtcAppResult<(), E::Error> {
        let mut session = self
            .session
            .try_lock()
            .map_err(|_| BtcAppError::<E::Error>::SessionConflict)?;
        signer::sign_transaction(&self.device, &mut session, tx, inputs).await
    }

    /// Host-side state of the device hash session
    pub async fn session_state(&self) -> HashSession {
        *self.session.lock().await
    }
}
