// SPDX-License-Identifier: Apache-2.0

//! BIP32 derivation paths

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::BtcAppError;
use crate::instructions::length;

/// Hardened flag of a BIP32 index
pub const HARDENED: u32 = 0x8000_0000;

/// Levels that must be hardened under the BIP44 convention (purpose, coin type, account)
const ACCOUNT_DEPTH: usize = 3;

/// Rejected derivation path
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PathError(String);

impl<E: std::error::Error> From<PathError> for BtcAppError<E> {
    fn from(err: PathError) -> Self {
        BtcAppError::InvalidPath(err.0)
    }
}

/// BIP32 derivation path
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BipPath {
    /// Derivation indices, hardened ones carry the high bit
    pub indices: Vec<u32>,
}

impl BipPath {
    /// Create a path from raw indices
    pub fn new(indices: Vec<u32>) -> Result<Self, PathError> {
        let path = BipPath { indices };
        path.validate()?;
        Ok(path)
    }

    /// Standard BIP44 path `m/44'/coin'/account'/change/index`
    pub fn bip44(coin: u32, account: u32, change: u32, index: u32) -> Result<Self, PathError> {
        for (name, value) in [("coin type", coin), ("account", account)] {
            if value >= HARDENED {
                return Err(PathError(format!("{name} {value} does not fit in 31 bits")));
            }
        }
        BipPath::new(vec![
            44 | HARDENED,
            coin | HARDENED,
            account | HARDENED,
            change,
            index,
        ])
    }

    /// Depth of the path
    pub fn depth(&self) -> usize {
        self.indices.len()
    }

    /// Last index, `None` for an empty path
    pub fn last(&self) -> Option<u32> {
        self.indices.last().copied()
    }

    /// Path of the parent key, `None` at the root
    pub fn parent(&self) -> Option<BipPath> {
        let (_, parent) = self.indices.split_last()?;
        Some(BipPath {
            indices: parent.to_vec(),
        })
    }

    /// Check depth bounds
    pub fn validate(&self) -> Result<(), PathError> {
        if self.indices.is_empty() {
            return Err(PathError("empty path".to_string()));
        }
        if self.indices.len() > length::MAX_BIP32_PATH_DEPTH {
            return Err(PathError(format!(
                "path too deep: {} (max {})",
                self.indices.len(),
                length::MAX_BIP32_PATH_DEPTH
            )));
        }
        Ok(())
    }

    /// Require the purpose, coin type and account levels to be hardened
    pub fn account_level_hardened(&self) -> Result<(), PathError> {
        for (depth, index) in self.indices.iter().take(ACCOUNT_DEPTH).enumerate() {
            if index & HARDENED == 0 {
                return Err(PathError(format!(
                    "index {index} at depth {} must be hardened",
                    depth + 1
                )));
            }
        }
        Ok(())
    }

    /// Encode as `depth || index_be*`, the layout every instruction expects
    pub fn encode(&self) -> Vec<u8> {
        let mut encoded = Vec::with_capacity(self.encoded_len());
        encoded.push(self.indices.len() as u8);
        for index in &self.indices {
            encoded.extend_from_slice(&index.to_be_bytes());
        }
        encoded
    }

    /// Get the encoded length for APDU
    pub fn encoded_len(&self) -> usize {
        1 + self.indices.len() * length::BIP32_INDEX_SIZE
    }
}

/// Parse a textual path such as `m/44'/0'/0'/0/1`
///
/// The leading `m` is optional and both `'` and `h` mark a hardened level.
/// With `require_hardened` set, the first three levels must be hardened.
pub fn parse_path(text: &str, require_hardened: bool) -> Result<BipPath, PathError> {
    let text = text.trim();
    let body = match text.strip_prefix('m') {
        Some("") => return Err(PathError("path has no components".to_string())),
        Some(rest) => rest
            .strip_prefix('/')
            .ok_or_else(|| PathError(format!("unexpected text after root marker: {text}")))?,
        None => text,
    };
    if body.is_empty() {
        return Err(PathError("empty path".to_string()));
    }

    let mut indices = Vec::new();
    for part in body.split('/') {
        let (digits, hardened) = match part.strip_suffix('\'').or_else(|| part.strip_suffix('h')) {
            Some(digits) => (digits, true),
            None => (part, false),
        };
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PathError(format!("invalid path component {part:?}")));
        }
        let index: u32 = digits
            .parse()
            .map_err(|_| PathError(format!("index {digits} out of range")))?;
        if index >= HARDENED {
            return Err(PathError(format!("index {index} does not fit in 31 bits")));
        }
        indices.push(if hardened { index | HARDENED } else { index });
    }

    let path = BipPath::new(indices)?;
    if require_hardened {
        path.account_level_hardened()?;
    }
    Ok(path)
}

impl FromStr for BipPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_path(s, false)
    }
}

impl TryFrom<String> for BipPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BipPath> for String {
    fn from(path: BipPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for BipPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m")?;
        for index in &self.indices {
            if *index >= HARDENED {
                write!(f, "/{}'", index - HARDENED)?;
            } else {
                write!(f, "/{}", index)?;
            }
        }
        Ok(())
    }
}
