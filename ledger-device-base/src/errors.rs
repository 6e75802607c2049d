// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Errors shared by every Ledger application built on top of [`crate::LedgerDevice`]
#[derive(Error, Debug)]
pub enum LedgerAppError<E: std::error::Error> {
    /// The transport failed to deliver the frame or read the answer
    #[error("Transport | {0}")]
    Transport(#[from] E),

    /// The device did not answer within the configured timeout
    #[error("device did not answer within {0:?}")]
    Timeout(Duration),

    /// The user declined the operation on the device (SW 0x6985)
    #[error("operation rejected on the device")]
    UserRejected,

    /// The device refused the payload sent by the host (SW 0x6A80)
    #[error("device reported invalid data in the command payload")]
    WrongData,

    /// The device is locked or not in a state that allows the command
    #[error("device conditions not satisfied (SW 0x{0:04X})")]
    ConditionsNotSatisfied(u16),

    /// A known status word without a dedicated variant
    #[error("App Error: | 0x{0:04X} {1}")]
    AppSpecific(u16, String),

    /// A status word this crate does not recognize
    #[error("Unknown error: 0x{0:04X}")]
    Unknown(u16),

    /// The answer could not be decoded
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The device answered successfully but without the expected signature
    #[error("received no signature back")]
    NoSignature,

    /// A string returned by the device is not valid UTF-8
    #[error("Utf8 conversion error")]
    Utf8,

    /// The response format identifier is not recognized
    #[error("response format ID not recognized")]
    InvalidFormatID,

    /// Nothing to send
    #[error("message cannot be empty")]
    InvalidEmptyMessage,

    /// A single frame exceeds the APDU payload limit
    #[error("message size is invalid (too big)")]
    InvalidMessageSize,
}

impl<E: std::error::Error> LedgerAppError<E> {
    /// Status word reported by the device, when the error originates from one
    pub fn status_word(&self) -> Option<u16> {
        match self {
            LedgerAppError::UserRejected => Some(0x6985),
            LedgerAppError::WrongData => Some(0x6A80),
            LedgerAppError::ConditionsNotSatisfied(sw)
            | LedgerAppError::AppSpecific(sw, _)
            | LedgerAppError::Unknown(sw) => Some(*sw),
            _ => None,
        }
    }
}
