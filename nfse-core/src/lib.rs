//! Rust client for Brazil's NFSe Nacional (DPS building, XML-DSig signing,
//! transport encoding, the issue/query/cancel API and DANFSe rendering).
//!
//! # Examples
//! ```rust
//! use nfse_core::config::{Config, EnvironmentType};
//!
//! let config = Config::new(EnvironmentType::Staging);
//! assert_eq!(config.env().tp_amb(), 2);
//! ```
pub mod access_key;
pub mod api;
pub mod c14n;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod danfse;
pub mod document;
pub mod dps;
pub mod event;
pub mod nfse;
pub mod sign;

use thiserror::Error;

/// Top-level error wrapper for core operations.
#[derive(Debug, Error)]
pub enum NfseError {
    #[error(transparent)]
    Build(#[from] dps::BuildError),
    #[error(transparent)]
    Canonicalization(#[from] c14n::CanonicalizationError),
    #[error(transparent)]
    Credential(#[from] credentials::CredentialError),
    #[error(transparent)]
    SignatureVerification(#[from] sign::SignatureVerificationError),
    #[error(transparent)]
    Codec(#[from] codec::CodecError),
    #[error(transparent)]
    Parse(#[from] nfse::ParseError),
    #[error(transparent)]
    Danfse(#[from] danfse::DanfseError),
    #[error(transparent)]
    XmlValidation(#[from] dps::validation::XmlValidationError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    AccessKey(#[from] access_key::AccessKeyError),
    #[error("transport failure: {0}")]
    Transport(api::TransportFailure),
    #[error("rejected by the authority: {0}")]
    BusinessRejection(api::Rejection),
    #[error("client state error: {0}")]
    ClientState(String),
}

impl NfseError {
    /// Whether the failure happened before anything was sent.
    pub fn is_pre_network(&self) -> bool {
        matches!(
            self,
            NfseError::Build(_)
                | NfseError::Canonicalization(_)
                | NfseError::Credential(_)
                | NfseError::Codec(_)
                | NfseError::ClientState(_)
                | NfseError::Config(_)
                | NfseError::XmlValidation(_)
        )
    }
}
