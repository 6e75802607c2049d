// SPDX-License-Identifier: Apache-2.0

//! Utility functions for the Bitcoin application

use bitcoin::consensus::encode::{serialize, VarInt};
use bitcoin::TxOut;

use crate::errors::{BtcAppError, BtcAppResult};
use crate::instructions::{der, length};

/// Bitcoin variable length integer
pub fn encode_varint(value: usize) -> Vec<u8> {
    serialize(&VarInt(value as u64))
}

/// Append `script` as blocks of at most 50 bytes, with `sequence` (LE) closing the last one
///
/// An empty script still produces one frame holding only the sequence.
pub fn push_script_blocks(frames: &mut Vec<Vec<u8>>, script: &[u8], sequence: u32) {
    let mut blocks: Vec<Vec<u8>> = script
        .chunks(length::MAX_SCRIPT_BLOCK)
        .map(|block| block.to_vec())
        .collect();

    match blocks.last_mut() {
        Some(last) => last.extend_from_slice(&sequence.to_le_bytes()),
        None => blocks.push(sequence.to_le_bytes().to_vec()),
    }

    frames.extend(blocks);
}

/// `varint(n_out) || outputs` in consensus encoding
pub fn serialize_outputs(outputs: &[TxOut]) -> Vec<u8> {
    let mut data = encode_varint(outputs.len());
    for output in outputs {
        data.extend_from_slice(&serialize(output));
    }
    data
}

/// Clear the parity flag the device may set on the DER sequence tag
pub fn normalize_der_signature(mut signature: Vec<u8>) -> Vec<u8> {
    if let Some(tag) = signature.first_mut() {
        if *tag == der::SEQUENCE_WITH_PARITY {
            *tag = der::SEQUENCE;
        }
    }
    signature
}

/// Bounds-checked cursor over a device answer
pub struct ResponseReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ResponseReader<'a> {
    /// Start reading at the beginning of `data`
    pub fn new(data: &'a [u8]) -> Self {
        ResponseReader { data, offset: 0 }
    }

    /// Take the next `len` bytes
    pub fn take<E: std::error::Error>(
        &mut self,
        len: usize,
        what: &str,
    ) -> BtcAppResult<&'a [u8], E> {
        let end = self.offset.checked_add(len).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(BtcAppError::MalformedResponse(format!(
                "insufficient data for {what}: available {}, needed {len}",
                self.remaining()
            )));
        };
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Take a single byte
    pub fn take_u8<E: std::error::Error>(&mut self, what: &str) -> BtcAppResult<u8, E> {
        Ok(self.take::<E>(1, what)?[0])
    }

    /// Take a one-byte length prefixed field
    pub fn take_lv<E: std::error::Error>(&mut self, what: &str) -> BtcAppResult<&'a [u8], E> {
        let len = self.take_u8::<E>(what)? as usize;
        self.take(len, what)
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}
