//! # Certificate Descriptor
//!
//! Everything the signer needs to know about the certificate besides the key
//! itself. Built fresh for every request and consumed once.
use std::net::IpAddr;
use std::time::SystemTime;

use ssh_key::certificate::CertType;

use super::fingerprint::KeyFingerprint;
use super::policy::IssuancePolicy;
use super::request::ValidatedRequest;

/// The constraints encoded into a signed certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDescriptor {
    pub cert_type: CertType,
    /// Becomes the `force-command` critical option when set.
    pub force_command: Option<String>,
    /// Extension names, each granted with empty data.
    pub extensions: Vec<String>,
    /// Audit token identifying this issuance.
    pub key_id: String,
    pub principals: Vec<String>,
    /// Becomes the `source-address` critical option.
    pub source_address: IpAddr,
    pub valid_after: SystemTime,
    pub valid_before: SystemTime,
}

impl CertificateDescriptor {
    /// Builds the descriptor for a validated request.
    ///
    /// The certificate is bound to the bastion's address, not to the client
    /// address the bastion reports: the certificate is presented by the bastion
    /// and the client address is not authenticated. The client address only
    /// appears in the key id.
    pub fn build(
        request: &ValidatedRequest<'_>,
        fingerprint: &KeyFingerprint,
        valid_after: SystemTime,
        policy: &IssuancePolicy,
    ) -> Self {
        let valid_before = valid_after + policy.certificate_lifetime;
        let key_id = format_key_id(request, fingerprint, valid_before);
        CertificateDescriptor {
            cert_type: CertType::User,
            force_command: request.command.map(str::to_string),
            extensions: policy.extensions.clone(),
            key_id,
            principals: vec![request.remote_user.to_string()],
            source_address: request.bastion_ip,
            valid_after,
            valid_before,
        }
    }
}

/// Escapes a request field for the key id. Brackets and backslashes are
/// prefixed with a backslash, control characters are written as escapes, so
/// a field can neither close its own segment nor start a new log line.
fn escape_field(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '[' | ']' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            c if c.is_control() => escaped.extend(c.escape_default()),
            c => escaped.push(c),
        }
    }
    escaped
}

/// `user[..] from[..] via[..] command[..] sshKey[..] valid to[..]`
fn format_key_id(
    request: &ValidatedRequest<'_>,
    fingerprint: &KeyFingerprint,
    valid_before: SystemTime,
) -> String {
    format!(
        "user[{}] from[{}] via[{}] command[{}] sshKey[{}] valid to[{}]",
        escape_field(request.bastion_user),
        escape_field(request.user_ip_raw),
        request.bastion_ip,
        escape_field(request.command.unwrap_or_default()),
        fingerprint,
        humantime::format_rfc3339_seconds(valid_before),
    )
}
