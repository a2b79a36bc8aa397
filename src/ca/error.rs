//! Certificate authority error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while generating, signing or storing certificates.
///
/// Any of these aborts the TLS handshake that asked for the certificate;
/// the connection is closed rather than downgraded to plaintext.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to set file permissions on the CA directory or key.
    #[error("Failed to set permissions: {0}")]
    Permissions(#[source] std::io::Error),

    /// Failed to generate a key pair.
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Failed to build or self-sign the root certificate.
    #[error("Failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Failed to sign a leaf certificate with the root key.
    #[error("Failed to sign certificate: {0}")]
    Signing(String),

    /// The hostname cannot be placed in a certificate.
    #[error("Invalid hostname '{0}' for certificate")]
    InvalidHostname(String),

    /// The signing key could not be loaded into rustls.
    #[error("Unsupported signing key: {0}")]
    SigningKey(String),

    /// Failed to write CA material.
    #[error("Failed to write file: {0}")]
    WriteFile(#[source] std::io::Error),

    /// Failed to read CA material.
    #[error("Failed to read file: {0}")]
    ReadFile(#[source] std::io::Error),

    /// Stored CA material exists but cannot be used.
    #[error("Invalid CA material in {path}: {message}")]
    InvalidStore {
        /// Directory holding the stored root.
        path: PathBuf,
        /// What is wrong with it.
        message: String,
    },
}
