// SPDX-License-Identifier: Apache-2.0

//! APDU framing for Ledger devices
//!
//! A command frame is laid out as `CLA || INS || P1 || P2 || LC || DATA` and an
//! answer frame as `DATA || SW1 || SW2`. Nothing in this crate performs I/O:
//! payloads larger than a single frame are split by the caller before they
//! reach [`APDUCommand::serialize`].

#![no_std]
#![deny(missing_docs)]

extern crate no_std_compat as std;

use core::ops::Deref;
use std::convert::{TryFrom, TryInto};
use std::vec::Vec;

use snafu::prelude::*;

/// Maximum payload carried by a single command frame
pub const MAX_DATA_LEN: usize = 255;

/// Length of the trailing status word in every answer
pub const STATUS_WORD_LEN: usize = 2;

/// An APDU command sent to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDUCommand<B> {
    /// Instruction class
    pub cla: u8,
    /// Instruction code
    pub ins: u8,
    /// First instruction parameter
    pub p1: u8,
    /// Second instruction parameter
    pub p2: u8,
    /// Payload
    pub data: B,
}

/// Errors raised while framing a command
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum APDUCommandError {
    /// Payload does not fit the one-byte length field
    #[snafu(display("APDU payload of {len} bytes exceeds the 255 byte frame limit"))]
    DataTooLong {
        /// Offending payload length
        len: usize,
    },
}

impl<B> APDUCommand<B>
where
    B: Deref<Target = [u8]>,
{
    /// Encode the command into its wire representation
    pub fn serialize(&self) -> Result<Vec<u8>, APDUCommandError> {
        let len = self.data.len();
        ensure!(len <= MAX_DATA_LEN, DataTooLongSnafu { len });

        let mut v = Vec::with_capacity(5 + len);
        v.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, len as u8]);
        v.extend_from_slice(&self.data);
        Ok(v)
    }
}

/// An APDU answer received from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct APDUAnswer<B> {
    data: B,
    retcode: u16,
}

/// Errors raised while decoding an answer
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum APDUAnswerError {
    /// The answer does not even hold a status word
    #[snafu(display("answer too short (< 2 bytes)"))]
    TooShort,
}

impl<B> APDUAnswer<B>
where
    B: Deref<Target = [u8]>,
{
    /// Decode a raw answer frame, payload followed by the status word
    pub fn from_answer(answer: B) -> Result<Self, APDUAnswerError> {
        ensure!(answer.len() >= STATUS_WORD_LEN, TooShortSnafu);
        let retcode = arrayref::array_ref!(answer, answer.len() - STATUS_WORD_LEN, 2);
        let retcode = u16::from_be_bytes(*retcode);

        Ok(APDUAnswer {
            data: answer,
            retcode,
        })
    }

    /// Payload of the answer, without the status word
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data.len() - STATUS_WORD_LEN]
    }

    /// Complete answer frame, status word included
    #[inline(always)]
    pub fn apdu(&self) -> &[u8] {
        &self.data
    }

    /// Raw status word
    #[inline(always)]
    pub fn retcode(&self) -> u16 {
        self.retcode
    }

    /// Status word as a known [`APDUErrorCode`], or the raw value if it is not one
    pub fn error_code(&self) -> Result<APDUErrorCode, u16> {
        self.retcode.try_into().map_err(|_| self.retcode)
    }

    /// Whether the device reported `0x9000`
    pub fn is_success(&self) -> bool {
        self.retcode == APDUErrorCode::NoError as u16
    }

    /// Release the underlying buffer
    pub fn into_inner(self) -> B {
        self.data
    }
}

/// Status words commonly returned by Ledger applications
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum APDUErrorCode {
    /// Success
    NoError = 0x9000,
    /// Execution error
    ExecutionError = 0x6400,
    /// Wrong length
    WrongLength = 0x6700,
    /// Security status not satisfied, device locked
    SecurityStatusNotSatisfied = 0x6982,
    /// Conditions of use not satisfied, the user declined
    ConditionsOfUseNotSatisfied = 0x6985,
    /// Command not allowed in the current state
    CommandNotAllowed = 0x6986,
    /// Incorrect data in the command payload
    IncorrectData = 0x6A80,
    /// Not enough memory space
    NotEnoughMemory = 0x6A84,
    /// Referenced data not found
    ReferencedDataNotFound = 0x6A88,
    /// Wrong P1 or P2
    InvalidP1P2 = 0x6B00,
    /// Instruction not supported
    InsNotSupported = 0x6D00,
    /// Class not supported
    ClaNotSupported = 0x6E00,
    /// Technical problem
    TechnicalProblem = 0x6F00,
    /// Device halted
    Halted = 0x6FAA,
}

impl TryFrom<u16> for APDUErrorCode {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let this = match value {
            0x9000 => Self::NoError,
            0x6400 => Self::ExecutionError,
            0x6700 => Self::WrongLength,
            0x6982 => Self::SecurityStatusNotSatisfied,
            0x6985 => Self::ConditionsOfUseNotSatisfied,
            0x6986 => Self::CommandNotAllowed,
            0x6A80 => Self::IncorrectData,
            0x6A84 => Self::NotEnoughMemory,
            0x6A88 => Self::ReferencedDataNotFound,
            0x6B00 => Self::InvalidP1P2,
            0x6D00 => Self::InsNotSupported,
            0x6E00 => Self::ClaNotSupported,
            0x6F00 => Self::TechnicalProblem,
            0x6FAA => Self::Halted,
            _ => return Err(()),
        };

        Ok(this)
    }
}

impl APDUErrorCode {
    /// Human readable tag for the status word
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoError => "[APDU_CODE_NOERROR]",
            Self::ExecutionError => "[APDU_CODE_EXECUTION_ERROR] No information given (NV-Ram not changed)",
            Self::WrongLength => "[APDU_CODE_WRONG_LENGTH] Wrong length",
            Self::SecurityStatusNotSatisfied => "[APDU_CODE_SECURITY_STATUS] Security status not satisfied, is the device unlocked?",
            Self::ConditionsOfUseNotSatisfied => "[APDU_CODE_CONDITIONS_NOT_SATISFIED] Conditions of use not satisfied",
            Self::CommandNotAllowed => "[APDU_CODE_COMMAND_NOT_ALLOWED] Command not allowed",
            Self::IncorrectData => "[APDU_CODE_DATA_INVALID] Incorrect data",
            Self::NotEnoughMemory => "[APDU_CODE_NOT_ENOUGH_MEMORY] Not enough memory space",
            Self::ReferencedDataNotFound => "[APDU_CODE_DATA_NOT_FOUND] Referenced data not found",
            Self::InvalidP1P2 => "[APDU_CODE_INVALIDP1P2] Wrong parameter(s) P1-P2",
            Self::InsNotSupported => "[APDU_CODE_INS_NOT_SUPPORTED] Instruction code not supported or invalid",
            Self::ClaNotSupported => "[APDU_CODE_CLA_NOT_SUPPORTED] Class not supported, is the right app open?",
            Self::TechnicalProblem => "[APDU_CODE_TECHNICAL_PROBLEM] Technical problem",
            Self::Halted => "[APDU_CODE_HALTED] Device halted",
        }
    }
}

impl core::fmt::Display for APDUErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:04X} {}", *self as u16, self.description())
    }
}
