//! # Certificate Authority
//!
//! This module holds the CA private key and signs user certificates from
//! [`CertificateDescriptor`]s. It also defines the messages exchanged with the
//! CA service over its Unix socket.
use std::fs::File;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
#[cfg(feature = "arbitrary")]
use arbitrary::Arbitrary;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use ssh_key::rand_core::{OsRng, RngCore};
use ssh_key::{HashAlg, PublicKey, certificate::Builder as CertBuilder, private::PrivateKey};
use zeroize::Zeroizing;

use crate::issuance::descriptor::CertificateDescriptor;
use crate::issuance::fingerprint::parse_authorized_key;
use crate::issuance::request::IssuanceRequest;
use crate::issuance::signer::{CertificateSigner, SigningError};
use crate::issuance::{IssuanceError, IssuanceStage, IssuedCertificate};

/// Maximum size (in bytes) for a single IPC message on the Unix socket.
/// Both client and server enforce this limit.
pub const MAX_MESSAGE_SIZE: u32 = 65_536;

/// Client for communicating with the CA server over a Unix socket.
pub mod ca_client;
/// CA server that listens for issuance requests on a Unix socket.
pub mod ca_server;
/// Configuration types for the Certificate Authority.
pub mod config;

/// Represents the Certificate Authority.
pub struct CertificateAuthority {
    private_key: PrivateKey,
}

impl CertificateAuthority {
    /// Creates a new `CertificateAuthority` from the key named in the configuration.
    ///
    /// # Arguments
    ///
    /// * `ca_config` - The configuration for the CA.
    pub fn new(ca_config: &config::Ca) -> Result<Self> {
        let mut key_file = File::open(&ca_config.ca_key)?;
        let mut key_buffer = Zeroizing::new(Vec::new());
        key_file.read_to_end(&mut key_buffer)?;

        let private_key = PrivateKey::from_openssh(key_buffer.as_slice())?;
        info!(
            "loaded CA key {}",
            private_key.public_key().fingerprint(HashAlg::Sha256)
        );
        Ok(Self::from_private_key(private_key))
    }

    pub fn from_private_key(private_key: PrivateKey) -> Self {
        CertificateAuthority { private_key }
    }

    /// The CA public key, as trusted by `TrustedUserCAKeys` on target hosts.
    pub fn public_key(&self) -> &PublicKey {
        self.private_key.public_key()
    }
}

fn unix_seconds(time: SystemTime) -> Result<u64, SigningError> {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| SigningError("certificate validity lies before the unix epoch".to_string()))
}

impl CertificateSigner for CertificateAuthority {
    fn sign(
        &self,
        public_key: &[u8],
        descriptor: &CertificateDescriptor,
    ) -> Result<Vec<u8>, SigningError> {
        let public_key =
            parse_authorized_key(public_key).map_err(|e| SigningError(e.to_string()))?;
        let valid_after = unix_seconds(descriptor.valid_after)?;
        let valid_before = unix_seconds(descriptor.valid_before)?;

        let mut cert_builder = CertBuilder::new_with_random_nonce(
            &mut OsRng,
            public_key.key_data().clone(),
            valid_after,
            valid_before,
        )?;
        cert_builder.serial(OsRng.next_u64())?;
        cert_builder.key_id(&descriptor.key_id)?;
        cert_builder.cert_type(descriptor.cert_type)?;
        for principal in &descriptor.principals {
            debug!("adding principal: {}", principal);
            cert_builder.valid_principal(principal)?;
        }
        if let Some(command) = &descriptor.force_command {
            cert_builder.critical_option("force-command", command)?;
        }
        cert_builder.critical_option("source-address", descriptor.source_address.to_string())?;
        for extension in &descriptor.extensions {
            cert_builder.extension(extension, "")?;
        }
        cert_builder.comment(public_key.comment())?;

        let cert = cert_builder.sign(&self.private_key)?;
        Ok(cert.to_openssh()?.into_bytes())
    }
}

/// Represents a request to the Certificate Authority.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[cfg_attr(feature = "arbitrary", derive(Arbitrary))]
pub enum CaRequest {
    /// A request to issue a user certificate.
    IssueCertificate(IssuanceRequest),
}

/// Represents a response from the Certificate Authority.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub enum CaResponse {
    /// A successfully issued certificate.
    SignedCertificate { certificate: String, key_id: String },
    /// The issuance pipeline refused the request.
    Rejected {
        stage: IssuanceStage,
        reason: String,
    },
    /// The request envelope was not accepted.
    Error(String),
}

impl CaResponse {
    /// Turns the outcome of an issuance into the response sent to the caller.
    pub fn from_issuance(outcome: Result<IssuedCertificate, IssuanceError>) -> Self {
        match outcome {
            Ok(issued) => CaResponse::SignedCertificate {
                certificate: String::from_utf8_lossy(&issued.certificate).into_owned(),
                key_id: issued.key_id,
            },
            Err(e) => CaResponse::Rejected {
                stage: e.stage(),
                reason: e.public_message(),
            },
        }
    }
}

/// An authenticated wrapper around [`CaRequest`] that provides bearer-token
/// authentication and monotonic-counter replay protection for the IPC channel.
#[derive(Serialize, Deserialize, Debug)]
pub struct AuthenticatedRequest {
    /// Shared secret token read from the service configuration.
    pub token: String,
    /// Strictly increasing counter; the server rejects any value ≤ the last accepted one.
    pub counter: u64,
    /// The inner CA request to execute after authentication succeeds.
    pub request: CaRequest,
}
