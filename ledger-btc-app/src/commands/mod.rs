// SPDX-License-Identifier: Apache-2.0

//! Command implementations for the Bitcoin application

pub mod get_firmware_version;
pub mod get_public_key;
pub mod get_trusted_input;
pub mod hash_input_start;
pub mod hash_output_finalize;
pub mod hash_sign;

pub use get_firmware_version::*;
pub use get_public_key::*;
pub use get_trusted_input::*;
pub use hash_input_start::*;
pub use hash_output_finalize::*;
pub use hash_sign::*;
