// SPDX-License-Identifier: Apache-2.0

//! Host-side model of the device hash session
//!
//! The device keeps one incremental hashing context and does not expose it.
//! [`HashSession`] mirrors it so that out-of-order requests are refused before
//! they reach the device.

use serde::{Deserialize, Serialize};

use crate::errors::{BtcAppError, BtcAppResult};
use crate::types::StartMode;

/// State of the hash session open on the device
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashSession {
    /// Nothing streamed yet
    #[default]
    New,
    /// Inputs streamed
    Started {
        /// Session opened by the witness flow
        witness: bool,
    },
    /// Outputs committed, ready to sign
    OutputsFinalized {
        /// Session opened by the witness flow
        witness: bool,
    },
    /// At least one signature produced
    Signed {
        /// Session opened by the witness flow
        witness: bool,
    },
    /// Signing call completed
    Done,
}

impl HashSession {
    /// Whether the device holds an open session
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            HashSession::Started { .. }
                | HashSession::OutputsFinalized { .. }
                | HashSession::Signed { .. }
        )
    }

    /// Transition for UNTRUSTED HASH TRANSACTION INPUT START
    ///
    /// A new session is refused while another one is open. Continuing requires
    /// a legacy session that already produced a signature.
    pub fn start<E: std::error::Error>(&mut self, mode: StartMode) -> BtcAppResult<(), E> {
        if mode.is_new() && self.is_open() {
            return Err(BtcAppError::SessionConflict);
        }
        *self = match (mode, *self) {
            (StartMode::NewLegacy, _) => HashSession::Started { witness: false },
            (StartMode::NewWitness, _) => HashSession::Started { witness: true },
            (StartMode::Continue, HashSession::Signed { witness: false }) => {
                HashSession::Started { witness: false }
            }
            (StartMode::Continue, _) => return Err(BtcAppError::SessionExpired),
        };
        Ok(())
    }

    /// Transition for UNTRUSTED HASH TRANSACTION INPUT FINALIZE FULL
    pub fn finalize_outputs<E: std::error::Error>(&mut self) -> BtcAppResult<(), E> {
        match *self {
            HashSession::Started { witness } => {
                *self = HashSession::OutputsFinalized { witness };
                Ok(())
            }
            _ => Err(BtcAppError::SessionExpired),
        }
    }

    /// Transition for UNTRUSTED HASH SIGN
    ///
    /// A witness session signs any number of inputs once outputs are committed.
    /// A legacy session signs once per start.
    pub fn sign<E: std::error::Error>(&mut self) -> BtcAppResult<(), E> {
        match *self {
            HashSession::OutputsFinalized { witness }
            | HashSession::Signed {
                witness: witness @ true,
            } => {
                *self = HashSession::Signed { witness };
                Ok(())
            }
            _ => Err(BtcAppError::SessionExpired),
        }
    }

    /// Close the session at the end of a signing call
    pub fn finish(&mut self) {
        *self = HashSession::Done;
    }
}
