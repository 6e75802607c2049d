// SPDX-License-Identifier: Apache-2.0

//! Type definitions for the Bitcoin application

use std::fmt;

use bitcoin::{CompressedPublicKey, EcdsaSighashType, OutPoint, ScriptBuf, Transaction, TxOut};
use serde::{Deserialize, Serialize};

use crate::instructions::p2_get_public_key;
use crate::path::BipPath;

/// Address format requested from GET WALLET PUBLIC KEY
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFormat {
    /// Base58 pay-to-pubkey-hash
    #[default]
    Legacy,
    /// Segwit nested in pay-to-script-hash
    P2shSegwit,
    /// Native segwit
    Bech32,
}

impl AddressFormat {
    /// P2 value carried by the request
    pub fn p2(self) -> u8 {
        match self {
            AddressFormat::Legacy => p2_get_public_key::LEGACY,
            AddressFormat::P2shSegwit => p2_get_public_key::P2SH_SEGWIT,
            AddressFormat::Bech32 => p2_get_public_key::BECH32,
        }
    }
}

/// Parameters for GET WALLET PUBLIC KEY
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetPublicKeyParams {
    /// Derivation path
    pub path: BipPath,
    /// Show the address on the device and wait for confirmation
    pub display: bool,
    /// Format of the returned address
    pub format: AddressFormat,
}

impl GetPublicKeyParams {
    /// Create new parameters for a silent, legacy-format request
    pub fn new(path: BipPath) -> Self {
        GetPublicKeyParams {
            path,
            display: false,
            format: AddressFormat::Legacy,
        }
    }

    /// Enable display and confirmation on device
    pub fn with_display(mut self) -> Self {
        self.display = true;
        self
    }

    /// Pick the address format
    pub fn with_format(mut self, format: AddressFormat) -> Self {
        self.format = format;
        self
    }
}

/// Key material returned by GET WALLET PUBLIC KEY
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    /// Key as sent by the device (65 bytes, uncompressed)
    #[serde(with = "hex::serde")]
    pub raw_public_key: Vec<u8>,
    /// Compressed form, the one used in scripts
    pub public_key: CompressedPublicKey,
    /// Address string computed by the device
    pub address: String,
    /// BIP32 chain code
    #[serde(with = "hex::serde")]
    pub chain_code: [u8; 32],
}

/// Opaque token the device hands out for an authenticated previous output
///
/// Only meaningful to the device session that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct TrustedInput(Vec<u8>);

impl TrustedInput {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        TrustedInput(bytes)
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TrustedInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrustedInput({})", hex::encode(&self.0))
    }
}

/// How one input is presented to UNTRUSTED HASH TRANSACTION INPUT START
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputReference {
    /// Bare previous-output reference
    Untrusted(OutPoint),
    /// Authenticated previous output
    Trusted(TrustedInput),
    /// Previous-output reference plus the spent amount
    Witness(OutPoint, u64),
}

/// One input streamed into the hash session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashInput {
    /// How the device identifies the input
    pub reference: InputReference,
    /// Script committed for this input, empty when nullified
    pub script: ScriptBuf,
    /// Input sequence number
    pub sequence: u32,
}

/// Variant of UNTRUSTED HASH TRANSACTION INPUT START
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartMode {
    /// Open a new legacy session
    NewLegacy,
    /// Open a new witness session
    NewWitness,
    /// Keep hashing into the open session
    Continue,
}

impl StartMode {
    /// Whether the request opens a new session
    pub fn is_new(self) -> bool {
        !matches!(self, StartMode::Continue)
    }
}

/// Signature returned by UNTRUSTED HASH SIGN
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    /// DER encoded signature
    pub der: Vec<u8>,
    /// Sighash type the device committed to
    pub sighash_type: EcdsaSighashType,
}

impl Signature {
    /// DER signature followed by the sighash byte, as pushed onto a stack
    pub fn to_stack_item(&self) -> Vec<u8> {
        let mut item = Vec::with_capacity(self.der.len() + 1);
        item.extend_from_slice(&self.der);
        item.push(self.sighash_type.to_u32() as u8);
        item
    }
}

/// Firmware and app version reported by GET FIRMWARE VERSION
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    /// Feature flags
    pub features: u8,
    /// Architecture identifier
    pub architecture: u8,
    /// Version Major
    pub major: u8,
    /// Version Minor
    pub minor: u8,
    /// Version Patch
    pub patch: u8,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Describes one input the device should sign
///
/// The previous transaction is needed for trusted inputs; witness inputs only
/// need the spent output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerInput {
    /// Output being spent
    pub outpoint: OutPoint,
    /// Key path on the device
    pub path: BipPath,
    /// Full transaction that created the output
    pub previous_transaction: Option<Transaction>,
    /// Spent output, when the previous transaction is not at hand
    pub spent_output: Option<TxOut>,
    /// Signing key, fetched from the device when absent
    pub public_key: Option<CompressedPublicKey>,
    /// Redeem or witness script
    pub redeem_script: Option<ScriptBuf>,
    /// Sign with the witness flow
    pub witness: bool,
    /// Sighash type
    pub sighash_type: EcdsaSighashType,
}

impl LedgerInput {
    /// Create a descriptor for a legacy, SIGHASH_ALL input
    pub fn new(outpoint: OutPoint, path: BipPath) -> Self {
        LedgerInput {
            outpoint,
            path,
            previous_transaction: None,
            spent_output: None,
            public_key: None,
            redeem_script: None,
            witness: false,
            sighash_type: EcdsaSighashType::All,
        }
    }

    /// Attach the transaction that created the output
    pub fn with_previous_transaction(mut self, tx: Transaction) -> Self {
        self.previous_transaction = Some(tx);
        self
    }

    /// Attach the spent output directly
    pub fn with_spent_output(mut self, output: TxOut) -> Self {
        self.spent_output = Some(output);
        self
    }

    /// Skip the public key lookup
    pub fn with_public_key(mut self, public_key: CompressedPublicKey) -> Self {
        self.public_key = Some(public_key);
        self
    }

    /// Set the redeem (or witness) script
    pub fn with_redeem_script(mut self, script: ScriptBuf) -> Self {
        self.redeem_script = Some(script);
        self
    }

    /// Select the witness flow
    pub fn with_witness(mut self, witness: bool) -> Self {
        self.witness = witness;
        self
    }

    /// Override the sighash type
    pub fn with_sighash_type(mut self, sighash_type: EcdsaSighashType) -> Self {
        self.sighash_type = sighash_type;
        self
    }

    /// Spent output, from the explicit value or the previous transaction
    pub fn previous_output(&self) -> Option<&TxOut> {
        self.spent_output.as_ref().or_else(|| {
            self.previous_transaction
                .as_ref()
                .and_then(|tx| tx.output.get(self.outpoint.vout as usize))
        })
    }
}
