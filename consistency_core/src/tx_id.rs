// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Transaction identifiers.
//!
//! Ids are rendered as `TXN_` followed by twelve lowercase hex digits taken
//! from a v4 UUID. Forty-eight random bits keep collisions negligible for the
//! lifetime of a cluster while staying short enough to read in logs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by every generated id.
pub const TX_ID_PREFIX: &str = "TXN_";

const RANDOM_HEX_LEN: usize = 12;

/// Globally unique transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(String);

impl TxId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        TxId(format!("{TX_ID_PREFIX}{}", &hex[..RANDOM_HEX_LEN]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True if the id has the shape produced by [`TxId::generate`].
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.0
            .strip_prefix(TX_ID_PREFIX)
            .is_some_and(|rest| {
                rest.len() == RANDOM_HEX_LEN
                    && rest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
            })
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxId {
    fn from(s: &str) -> Self {
        TxId(s.to_string())
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        TxId(s)
    }
}
