//! Traits and implementations for the cryptographic pieces the dispatcher needs
//!
//! The dispatcher never completes a handshake itself. It only needs a keyed MAC for stateless
//! reset tokens and the version-specific Initial keys, which let it read a client's first flight
//! and close a connection before any session exists.

/// Cryptography interface based on *ring*
pub(crate) mod ring;
/// Initial packet protection based on rustls
pub mod rustls;

/// A key for signing with HMAC-based algorithms
pub trait HmacKey: Send + Sync {
    /// Method for signing a message
    fn sign(&self, data: &[u8], signature_out: &mut [u8]);
    /// Length of `sign`'s output
    fn signature_len(&self) -> usize;
    /// Method for verifying a message
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError>;
}

/// Generic crypto errors
#[derive(Debug)]
pub struct CryptoError;

/// Error indicating that the specified QUIC version is not supported
#[derive(Debug)]
pub struct UnsupportedVersion;
