//! # Signer
//!
//! The one seam through which the issuer reaches the CA private key.
use thiserror::Error;

use super::descriptor::CertificateDescriptor;

/// The signing capability refused or failed to sign.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SigningError(pub String);

impl From<ssh_key::Error> for SigningError {
    fn from(e: ssh_key::Error) -> Self {
        SigningError(e.to_string())
    }
}

/// Signs a public key according to a descriptor.
pub trait CertificateSigner: Send + Sync {
    /// Returns the certificate in OpenSSH authorized-key compatible form.
    ///
    /// # Arguments
    ///
    /// * `public_key` - The key to certify, as authorized-key text.
    /// * `descriptor` - The constraints to encode into the certificate.
    fn sign(
        &self,
        public_key: &[u8],
        descriptor: &CertificateDescriptor,
    ) -> Result<Vec<u8>, SigningError>;
}
