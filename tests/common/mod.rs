#![allow(dead_code)]

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bastion_ssh_ca::certificate_authority::CertificateAuthority;
use bastion_ssh_ca::issuance::descriptor::CertificateDescriptor;
use bastion_ssh_ca::issuance::policy::{IssuancePolicy, PolicyConfig};
use bastion_ssh_ca::issuance::request::IssuanceRequest;
use bastion_ssh_ca::issuance::signer::{CertificateSigner, SigningError};
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, private::PrivateKey};

pub fn init_logging() {
    if env::var("RUST_LOG").is_err() {
        unsafe {
            env::set_var("RUST_LOG", "info");
        }
    }
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn policy_config(force_command: bool, require_client_ip: bool) -> PolicyConfig {
    PolicyConfig {
        force_command,
        require_client_ip,
        user_pattern: r"^[a-z_][a-z0-9_-]*$".to_string(),
        user_header: "X-Remote-User".to_string(),
        certificate_lifetime: Duration::from_secs(3600),
        max_key_age: Duration::from_secs(7 * 86400),
        replay_retention: Some(Duration::from_secs(30 * 86400)),
        extensions: vec!["permit-pty".to_string()],
    }
}

pub fn policy(force_command: bool, require_client_ip: bool) -> IssuancePolicy {
    IssuancePolicy::new(policy_config(force_command, require_client_ip)).unwrap()
}

pub fn random_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

/// Writes a fresh CA key in OpenSSH format to `path` and returns it.
pub fn write_ca_key(path: &Path) -> PrivateKey {
    let ca_key = random_key();
    std::fs::write(
        path,
        ca_key
            .to_openssh(ssh_key::LineEnding::LF)
            .unwrap()
            .as_bytes(),
    )
    .unwrap();
    ca_key
}

/// The worked example: alice on bastion 10.0.0.5 asking for `deploy`.
pub fn example_request(key: &PrivateKey) -> IssuanceRequest {
    IssuanceRequest {
        bastion_ip: "10.0.0.5".to_string(),
        bastion_user: "alice".to_string(),
        command: String::new(),
        key: key.public_key().to_openssh().unwrap(),
        remote_user: "deploy".to_string(),
        user_ip: "203.0.113.9".to_string(),
    }
}

/// Wraps the real CA and counts how often it is asked to sign.
pub struct CountingSigner {
    pub inner: CertificateAuthority,
    pub calls: Arc<AtomicUsize>,
}

impl CountingSigner {
    pub fn new(ca_key: PrivateKey) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            CountingSigner {
                inner: CertificateAuthority::from_private_key(ca_key),
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl CertificateSigner for CountingSigner {
    fn sign(
        &self,
        public_key: &[u8],
        descriptor: &CertificateDescriptor,
    ) -> Result<Vec<u8>, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sign(public_key, descriptor)
    }
}
