// SPDX-License-Identifier: Apache-2.0

//! Error types for the Bitcoin application

use std::time::Duration;

use bitcoin::OutPoint;
use ledger_device_base::LedgerAppError;
use thiserror::Error;

/// Bitcoin application specific errors
#[derive(Debug, Error)]
pub enum BtcAppError<E: std::error::Error> {
    /// The device did not answer within the per-exchange timeout
    #[error("device did not answer within {0:?}")]
    DeviceTimeout(Duration),

    /// The transport failed, usually because the device went away
    #[error("device disconnected: {0}")]
    DeviceDisconnected(#[source] E),

    /// The user declined on the device
    #[error("operation rejected on the device")]
    DeviceRejected,

    /// The device refused a payload built by the host
    #[error("device reported invalid data in the command payload")]
    WrongData,

    /// The device is locked or not in the expected state
    #[error("device conditions not satisfied (SW 0x{0:04X})")]
    ConditionsNotSatisfied(u16),

    /// Any other non-success status word
    #[error("device error: SW 0x{0:04X}")]
    DeviceError(u16),

    /// The device could not parse the previous transaction
    #[error("device could not build a trusted input from the previous transaction")]
    TrustedInputUnavailable,

    /// Derivation path text or indices are not acceptable
    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    /// A device answer does not have the expected layout
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A script-hash input has no redeem script, neither supplied nor found on the input
    #[error("missing redeem script for input {0}")]
    MissingRedeemScript(OutPoint),

    /// Neither the previous transaction nor the spent output is known for an input
    #[error("previous output unknown for input {0}")]
    MissingPreviousOutput(OutPoint),

    /// No public key can be matched to the signer
    #[error("unable to resolve the signing key for input {0}")]
    UnresolvedSigner(OutPoint),

    /// The referenced previous output is not spent by the transaction
    #[error("input {0} not found in transaction")]
    InputNotFound(OutPoint),

    /// The spent script does not have the shape the signer expects
    #[error("script mismatch for input {0}: {1}")]
    ScriptMismatch(OutPoint, String),

    /// A script could not be decoded or built
    #[error("invalid script: {0}")]
    InvalidScript(String),

    /// A request the host should never build, such as an empty stream
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Hash session operation attempted without an open session
    #[error("no hash session open on the device")]
    SessionExpired,

    /// The device is owned by another call, or a hash session is already open
    #[error("another hash session is in progress")]
    SessionConflict,
}

impl<E: std::error::Error> From<LedgerAppError<E>> for BtcAppError<E> {
    fn from(err: LedgerAppError<E>) -> Self {
        match err {
            LedgerAppError::Transport(e) => BtcAppError::DeviceDisconnected(e),
            LedgerAppError::Timeout(d) => BtcAppError::DeviceTimeout(d),
            LedgerAppError::UserRejected => BtcAppError::DeviceRejected,
            LedgerAppError::WrongData => BtcAppError::WrongData,
            LedgerAppError::ConditionsNotSatisfied(sw) => BtcAppError::ConditionsNotSatisfied(sw),
            LedgerAppError::AppSpecific(sw, _) | LedgerAppError::Unknown(sw) => {
                BtcAppError::DeviceError(sw)
            }
            LedgerAppError::MalformedResponse(msg) => BtcAppError::MalformedResponse(msg),
            LedgerAppError::NoSignature => {
                BtcAppError::MalformedResponse("empty signature".to_string())
            }
            LedgerAppError::Utf8 => BtcAppError::MalformedResponse("invalid UTF-8".to_string()),
            LedgerAppError::InvalidFormatID => {
                BtcAppError::MalformedResponse("unknown format identifier".to_string())
            }
            e @ (LedgerAppError::InvalidEmptyMessage | LedgerAppError::InvalidMessageSize) => {
                BtcAppError::InvalidRequest(e.to_string())
            }
        }
    }
}

impl<E: std::error::Error> BtcAppError<E> {
    /// Check if error is due to user rejection
    pub fn is_user_rejected(&self) -> bool {
        matches!(self, BtcAppError::DeviceRejected)
    }

    /// Check if error is due to transport/communication issues
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            BtcAppError::DeviceTimeout(_) | BtcAppError::DeviceDisconnected(_)
        )
    }

    /// Check if error was raised locally, before anything reached the device
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            BtcAppError::InvalidPath(_)
                | BtcAppError::MissingRedeemScript(_)
                | BtcAppError::MissingPreviousOutput(_)
                | BtcAppError::UnresolvedSigner(_)
                | BtcAppError::InputNotFound(_)
                | BtcAppError::ScriptMismatch(..)
                | BtcAppError::InvalidScript(_)
        )
    }

    /// Status word reported by the device, when there is one
    pub fn status_word(&self) -> Option<u16> {
        match self {
            BtcAppError::DeviceRejected => Some(0x6985),
            BtcAppError::WrongData | BtcAppError::TrustedInputUnavailable => Some(0x6A80),
            BtcAppError::ConditionsNotSatisfied(sw) | BtcAppError::DeviceError(sw) => Some(*sw),
            _ => None,
        }
    }
}

/// Result type alias for Bitcoin application operations
pub type BtcAppResult<T, E> = Result<T, BtcAppError<E>>;
