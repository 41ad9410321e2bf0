//! # Fingerprinter
//!
//! Derives the identity of a submitted public key. The fingerprint is the join
//! key between incoming requests and the replay guard.
use std::fmt;

use log::debug;
use serde::{Deserialize, Serialize};
use ssh_key::{HashAlg, PublicKey};

use super::IssuanceError;

/// SHA-256 fingerprint of a public key, in the `SHA256:<base64>` form printed
/// by `ssh-keygen -l`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyFingerprint(String);

impl KeyFingerprint {
    /// Fingerprints an already parsed key.
    pub fn of(public_key: &PublicKey) -> Self {
        KeyFingerprint(public_key.fingerprint(HashAlg::Sha256).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parses raw authorized-key text (`<algorithm> <base64> [comment]`) into a
/// public key.
pub fn parse_authorized_key(raw_key: &[u8]) -> Result<PublicKey, IssuanceError> {
    let text = std::str::from_utf8(raw_key)
        .map_err(|e| IssuanceError::MalformedKey(format!("key is not valid UTF-8: {}", e)))?;
    PublicKey::from_openssh(text.trim()).map_err(|e| IssuanceError::MalformedKey(e.to_string()))
}

/// Parses `raw_key` and returns its fingerprint.
///
/// The comment is not part of the digest, so the same key submitted with a
/// different comment maps to the same fingerprint.
pub fn fingerprint(raw_key: &[u8]) -> Result<KeyFingerprint, IssuanceError> {
    let public_key = parse_authorized_key(raw_key)?;
    let fp = KeyFingerprint::of(&public_key);
    debug!("fingerprint of {} key: {}", public_key.algorithm(), fp);
    Ok(fp)
}
