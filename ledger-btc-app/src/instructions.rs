// SPDX-License-Identifier: Apache-2.0

//! APDU instruction constants for the Bitcoin application

/// APDU instruction codes for the Bitcoin application
pub mod ins {
    /// GET WALLET PUBLIC KEY
    pub const GET_WALLET_PUBLIC_KEY: u8 = 0x40;
    /// GET TRUSTED INPUT
    pub const GET_TRUSTED_INPUT: u8 = 0x42;
    /// UNTRUSTED HASH TRANSACTION INPUT START
    pub const UNTRUSTED_HASH_TRANSACTION_INPUT_START: u8 = 0x44;
    /// UNTRUSTED HASH SIGN
    pub const UNTRUSTED_HASH_SIGN: u8 = 0x48;
    /// UNTRUSTED HASH TRANSACTION INPUT FINALIZE FULL
    pub const UNTRUSTED_HASH_TRANSACTION_INPUT_FINALIZE_FULL: u8 = 0x4A;
    /// GET FIRMWARE VERSION
    pub const GET_FIRMWARE_VERSION: u8 = 0xC4;
}

/// P1 values for GET WALLET PUBLIC KEY
pub mod p1_get_public_key {
    /// Return the key without user interaction
    pub const SILENT: u8 = 0x00;
    /// Display the address and wait for confirmation
    pub const DISPLAY: u8 = 0x01;
}

/// P2 values for GET WALLET PUBLIC KEY (address format)
pub mod p2_get_public_key {
    /// Base58 pay-to-pubkey-hash
    pub const LEGACY: u8 = 0x00;
    /// Segwit nested in pay-to-script-hash
    pub const P2SH_SEGWIT: u8 = 0x01;
    /// Native segwit, bech32
    pub const BECH32: u8 = 0x02;
}

/// P1 values shared by streamed instructions (trusted input, hash input start)
pub mod p1_stream {
    /// First frame of the stream
    pub const FIRST: u8 = 0x00;
    /// Any following frame
    pub const NEXT: u8 = 0x80;
}

/// P2 values for UNTRUSTED HASH TRANSACTION INPUT START
pub mod p2_hash_start {
    /// Open a new legacy hash session
    pub const NEW_LEGACY: u8 = 0x00;
    /// Open a new witness hash session
    pub const NEW_WITNESS: u8 = 0x02;
    /// Keep hashing into the open session
    pub const CONTINUE: u8 = 0x80;
}

/// P1 values for UNTRUSTED HASH TRANSACTION INPUT FINALIZE FULL
pub mod p1_finalize {
    /// More output data follows
    pub const MORE: u8 = 0x00;
    /// Last block of output data
    pub const LAST: u8 = 0x80;
}

/// Input descriptor tags used in UNTRUSTED HASH TRANSACTION INPUT START
pub mod input_tag {
    /// Bare previous-output reference
    pub const UNTRUSTED: u8 = 0x00;
    /// Trusted input token
    pub const TRUSTED: u8 = 0x01;
    /// Previous-output reference followed by the spent amount
    pub const WITNESS: u8 = 0x02;
}

/// Data length constants
pub mod length {
    /// Maximum BIP32 path depth accepted by the device
    pub const MAX_BIP32_PATH_DEPTH: usize = 10;
    /// Size of each BIP32 index in bytes
    pub const BIP32_INDEX_SIZE: usize = 4;
    /// Scripts and outputs are streamed in blocks of at most this size
    pub const MAX_SCRIPT_BLOCK: usize = 50;
    /// Size of a trusted input token
    pub const TRUSTED_INPUT_LEN: usize = 56;
    /// Size of a serialized previous-output reference (txid + index)
    pub const OUTPOINT_LEN: usize = 36;
    /// Size of an uncompressed secp256k1 public key
    pub const UNCOMPRESSED_PUBKEY_LEN: usize = 65;
    /// Size of a compressed secp256k1 public key
    pub const COMPRESSED_PUBKEY_LEN: usize = 33;
    /// Size of a BIP32 chain code
    pub const CHAIN_CODE_LEN: usize = 32;
}

/// DER sequence tag, also the tag the device uses when it sets the parity flag
pub mod der {
    /// Standard DER sequence tag
    pub const SEQUENCE: u8 = 0x30;
    /// Sequence tag with the parity bit set
    pub const SEQUENCE_WITH_PARITY: u8 = 0x31;
}
