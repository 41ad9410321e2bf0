//! # Issuance
//!
//! The issuance pipeline: a request relayed by a bastion is validated, its key
//! fingerprinted and checked against the replay guard, a certificate
//! descriptor is built and handed to the signer. Every step short-circuits on
//! failure, and exactly one audit line is written per request.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Time source used by the pipeline.
pub mod clock;
/// Certificate descriptors built from validated requests.
pub mod descriptor;
/// Public key fingerprints.
pub mod fingerprint;
/// Process-wide issuance policy.
pub mod policy;
/// Key age tracking.
pub mod replay_guard;
/// Requests and their validation.
pub mod request;
/// The signing capability.
pub mod signer;

use clock::Clock;
use descriptor::CertificateDescriptor;
use fingerprint::KeyFingerprint;
use policy::IssuancePolicy;
use replay_guard::{Decision, ReplayGuard};
use request::{IssuanceRequest, ValidationFailure};
use signer::CertificateSigner;

/// The pipeline stage a failure is attributed to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IssuanceStage {
    Validation,
    Replay,
    Signing,
}

impl fmt::Display for IssuanceStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceStage::Validation => f.write_str("validation"),
            IssuanceStage::Replay => f.write_str("replay"),
            IssuanceStage::Signing => f.write_str("signing"),
        }
    }
}

/// Why a certificate was not issued.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("unable to parse authorized key: {0}")]
    MalformedKey(String),
    #[error("{0}")]
    Validation(#[from] ValidationFailure),
    #[error("submitted key {fingerprint} was first seen {age:?} ago")]
    ReplayExpired {
        fingerprint: KeyFingerprint,
        age: Duration,
    },
    #[error("signing failed: {0}")]
    SigningFailure(String),
}

impl IssuanceError {
    pub fn stage(&self) -> IssuanceStage {
        match self {
            IssuanceError::MalformedKey(_) | IssuanceError::Validation(_) => {
                IssuanceStage::Validation
            }
            IssuanceError::ReplayExpired { .. } => IssuanceStage::Replay,
            IssuanceError::SigningFailure(_) => IssuanceStage::Signing,
        }
    }

    /// Message that may be shown to the caller. Signing failures are not
    /// detailed so that nothing about the CA leaks.
    pub fn public_message(&self) -> String {
        match self {
            IssuanceError::MalformedKey(_) => "Unable to parse authorized key".to_string(),
            IssuanceError::Validation(reason) => format!("Param validation failure: {}", reason),
            IssuanceError::ReplayExpired { .. } => {
                "Submitted pubkey is too old. Please generate new key.".to_string()
            }
            IssuanceError::SigningFailure(_) => "Server error".to_string(),
        }
    }
}

/// A certificate that was signed and audited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// The certificate in OpenSSH authorized-key compatible form.
    pub certificate: Vec<u8>,
    /// The audit token embedded in the certificate.
    pub key_id: String,
}

/// Runs the issuance pipeline.
///
/// An `Issuer` owns its replay guard, so independent issuers in one process
/// do not share key history. It is `Sync` and meant to be shared across
/// request handlers.
pub struct Issuer {
    policy: IssuancePolicy,
    replay_guard: ReplayGuard,
    signer: Box<dyn CertificateSigner>,
    clock: Arc<dyn Clock>,
}

impl Issuer {
    /// Creates a new `Issuer`.
    ///
    /// # Arguments
    ///
    /// * `policy` - The issuance policy.
    /// * `replay_guard` - Key age tracking for this issuer.
    /// * `signer` - The CA signing capability.
    /// * `clock` - Time source for certificate validity.
    pub fn new(
        policy: IssuancePolicy,
        replay_guard: ReplayGuard,
        signer: Box<dyn CertificateSigner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Issuer {
            policy,
            replay_guard,
            signer,
            clock,
        }
    }

    pub fn policy(&self) -> &IssuancePolicy {
        &self.policy
    }

    pub fn replay_guard(&self) -> &ReplayGuard {
        &self.replay_guard
    }

    /// Issues a certificate for `request`, or explains why not.
    ///
    /// The outcome is logged exactly once on the `audit` target: the key id
    /// and the key's age after a successful signature, or the failing stage
    /// and reason.
    pub fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        match self.run(request) {
            Ok((issued, key_age)) => {
                info!(
                    target: "audit",
                    "issued certificate: {:?}, key age {}",
                    issued.key_id,
                    humantime::format_duration(Duration::from_secs(key_age.as_secs()))
                );
                Ok(issued)
            }
            Err(e) => {
                match e.stage() {
                    IssuanceStage::Signing => error!(
                        target: "audit",
                        "{} failure for user {:?} via {:?}: {}",
                        e.stage(),
                        request.bastion_user,
                        request.bastion_ip,
                        e
                    ),
                    _ => warn!(
                        target: "audit",
                        "{} failure for user {:?} via {:?}: {}",
                        e.stage(),
                        request.bastion_user,
                        request.bastion_ip,
                        e
                    ),
                }
                Err(e)
            }
        }
    }

    /// Runs the pipeline and returns the certificate with the key's age.
    fn run(
        &self,
        request: &IssuanceRequest,
    ) -> Result<(IssuedCertificate, Duration), IssuanceError> {
        let validated = request::validate(request, &self.policy)?;
        debug!("request validated");

        let fingerprint = fingerprint::fingerprint(validated.key.as_bytes())?;

        let key_age = match self.replay_guard.observe(&fingerprint) {
            Decision::Expired(age) => {
                return Err(IssuanceError::ReplayExpired { fingerprint, age });
            }
            Decision::Aged(age) => age,
            Decision::Fresh => {
                debug!("key {} is new", fingerprint);
                Duration::ZERO
            }
        };

        let descriptor =
            CertificateDescriptor::build(&validated, &fingerprint, self.clock.now(), &self.policy);
        debug!("descriptor built: {}", descriptor.key_id);

        let certificate = self
            .signer
            .sign(validated.key.as_bytes(), &descriptor)
            .map_err(|e| IssuanceError::SigningFailure(e.to_string()))?;

        Ok((
            IssuedCertificate {
                certificate,
                key_id: descriptor.key_id,
            },
            key_age,
        ))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::issuance::clock::ManualClock;
    use crate::issuance::policy::PolicyConfig;
    use crate::issuance::signer::SigningError;
    use ssh_key::rand_core::OsRng;
    use ssh_key::{Algorithm, private::PrivateKey};
    use std::sync::Mutex;
    use std::time::UNIX_EPOCH;

    /// Records every descriptor it is asked to sign.
    #[derive(Default)]
    struct RecordingSigner {
        calls: Mutex<Vec<CertificateDescriptor>>,
        fail: bool,
    }

    impl CertificateSigner for Arc<RecordingSigner> {
        fn sign(
            &self,
            _public_key: &[u8],
            descriptor: &CertificateDescriptor,
        ) -> Result<Vec<u8>, SigningError> {
            self.calls.lock().unwrap().push(descriptor.clone());
            if self.fail {
                return Err(SigningError("hsm unreachable".to_string()));
            }
            Ok(format!("cert for {}", descriptor.key_id).into_bytes())
        }
    }

    struct Fixture {
        issuer: Issuer,
        signer: Arc<RecordingSigner>,
        clock: Arc<ManualClock>,
    }

    fn fixture(force_command: bool, fail: bool) -> Fixture {
        let policy = IssuancePolicy::new(PolicyConfig {
            force_command,
            require_client_ip: true,
            user_pattern: r"^[a-z_][a-z0-9_-]*$".to_string(),
            user_header: "X-Remote-User".to_string(),
            certificate_lifetime: Duration::from_secs(300),
            max_key_age: Duration::from_secs(3600),
            replay_retention: None,
            extensions: vec!["permit-pty".to_string()],
        })
        .unwrap();
        let clock = Arc::new(ManualClock::new(
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        ));
        let signer = Arc::new(RecordingSigner {
            fail,
            ..Default::default()
        });
        let issuer = Issuer::new(
            policy.clone(),
            policy.replay_guard(clock.clone()),
            Box::new(signer.clone()),
            clock.clone(),
        );
        Fixture {
            issuer,
            signer,
            clock,
        }
    }

    fn request() -> IssuanceRequest {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        IssuanceRequest {
            bastion_ip: "10.0.0.5".to_string(),
            bastion_user: "alice".to_string(),
            command: String::new(),
            key: key.public_key().to_openssh().unwrap(),
            remote_user: "deploy".to_string(),
            user_ip: "203.0.113.9".to_string(),
        }
    }

    #[test]
    fn fresh_key_is_signed() {
        let f = fixture(false, false);
        let issued = f.issuer.issue(&request()).unwrap();

        let calls = f.signer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let descriptor = &calls[0];
        assert_eq!(descriptor.principals, vec!["deploy".to_string()]);
        assert_eq!(descriptor.source_address.to_string(), "10.0.0.5");
        assert_eq!(descriptor.valid_after, f.clock.now());
        assert_eq!(
            descriptor.valid_before,
            f.clock.now() + Duration::from_secs(300)
        );
        assert_eq!(issued.key_id, descriptor.key_id);
        assert!(issued.key_id.starts_with("user[alice] from[203.0.113.9]"));
    }

    #[test]
    fn missing_command_stops_before_signing() {
        let f = fixture(true, false);
        let err = f.issuer.issue(&request()).unwrap_err();
        assert_eq!(err.stage(), IssuanceStage::Validation);
        assert_eq!(err.to_string(), "cmd missing from request");
        assert!(f.signer.calls.lock().unwrap().is_empty());
        assert_eq!(f.issuer.replay_guard().tracked_keys(), 0);
    }

    #[test]
    fn malformed_key_is_a_validation_failure() {
        let f = fixture(false, false);
        let mut req = request();
        req.key = "ssh-ed25519 garbage".to_string();
        let err = f.issuer.issue(&req).unwrap_err();
        assert!(matches!(err, IssuanceError::MalformedKey(_)));
        assert_eq!(err.stage(), IssuanceStage::Validation);
        assert!(f.signer.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn key_reused_within_max_age_is_signed_again() {
        let f = fixture(false, false);
        let req = request();
        f.issuer.issue(&req).unwrap();
        f.clock.advance(Duration::from_secs(1800));
        f.issuer.issue(&req).unwrap();
        assert_eq!(f.signer.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn expired_key_is_refused_without_signing() {
        let f = fixture(false, false);
        let req = request();
        f.issuer.issue(&req).unwrap();
        f.clock.advance(Duration::from_secs(3601));

        let err = f.issuer.issue(&req).unwrap_err();
        assert!(matches!(err, IssuanceError::ReplayExpired { .. }));
        assert_eq!(err.stage(), IssuanceStage::Replay);
        assert_eq!(
            err.public_message(),
            "Submitted pubkey is too old. Please generate new key."
        );
        assert_eq!(f.signer.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn signing_failure_is_opaque_to_the_caller() {
        let f = fixture(false, true);
        let err = f.issuer.issue(&request()).unwrap_err();
        assert_eq!(err.stage(), IssuanceStage::Signing);
        assert!(err.to_string().contains("hsm unreachable"));
        assert_eq!(err.public_message(), "Server error");
    }

    #[test]
    fn stage_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&IssuanceStage::Replay).unwrap(),
            "\"replay\""
        );
        assert_eq!(IssuanceStage::Signing.to_string(), "signing");
    }
}
