//! NFSe access key (`chaveAcesso`).
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Number of digits in an access key.
pub const ACCESS_KEY_LEN: usize = 50;

const NUMBER_RANGE: std::ops::Range<usize> = 28..38;

/// Error returned when a string is not a well-formed access key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessKeyError {
    #[error("access key must have {ACCESS_KEY_LEN} digits, got {0}")]
    Length(usize),
    #[error("access key must contain only ASCII digits: {0}")]
    NonDigit(String),
}

/// The 50-digit key the authority assigns to an issued NFSe. Query and
/// cancel requests address invoices by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccessKey(String);

impl AccessKey {
    pub fn new(value: impl Into<String>) -> Result<Self, AccessKeyError> {
        let value = value.into();
        if value.len() != ACCESS_KEY_LEN {
            return Err(AccessKeyError::Length(value.chars().count()));
        }
        if !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AccessKeyError::NonDigit(value));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// NFSe number embedded in the key, without leading zeros.
    pub fn nfse_number(&self) -> String {
        nfse_number_from_key(&self.0).unwrap_or_default()
    }
}

/// Extract the NFSe number from a possibly partial key.
///
/// Returns `None` when the key is too short to contain the number field.
pub fn nfse_number_from_key(key: &str) -> Option<String> {
    let digits = key.get(NUMBER_RANGE)?;
    let trimmed = digits.trim_start_matches('0');
    Some(if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    })
}

impl FromStr for AccessKey {
    type Err = AccessKeyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessKey::new(s.trim())
    }
}

impl TryFrom<String> for AccessKey {
    type Error = AccessKeyError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        AccessKey::new(value)
    }
}

impl From<AccessKey> for String {
    fn from(key: AccessKey) -> Self {
        key.0
    }
}

impl fmt::Display for AccessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AccessKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
