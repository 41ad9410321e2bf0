//! # Issuance Requests
//!
//! The request as relayed by the bastion, and the validator that turns it into
//! a [`ValidatedRequest`] before any cryptographic work is done.
use std::net::IpAddr;

#[cfg(feature = "arbitrary")]
use arbitrary::Arbitrary;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::policy::{IssuancePolicy, MAX_USERNAME_LENGTH};

/// A certificate request relayed by a bastion.
///
/// All fields are kept exactly as received; an empty string means the field
/// was not supplied.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(Arbitrary))]
pub struct IssuanceRequest {
    /// Address of the bastion presenting the request.
    #[serde(default)]
    pub bastion_ip: String,
    /// User name the bastion authenticated.
    #[serde(default)]
    pub bastion_user: String,
    /// Command to force on the certificate.
    #[serde(default)]
    pub command: String,
    /// Public key to certify, in authorized-key text form.
    #[serde(default)]
    pub key: String,
    /// Principal the certificate is valid for on the target host.
    #[serde(default)]
    pub remote_user: String,
    /// Address the end user connected to the bastion from.
    #[serde(default)]
    pub user_ip: String,
}

/// Why a request was refused before signing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("cmd missing from request")]
    MissingCommand,
    #[error("bastionIP is invalid")]
    InvalidBastionIp,
    #[error("{header} missing from request")]
    MissingUser { header: String },
    #[error("username is invalid")]
    InvalidUser,
    #[error("key missing from request")]
    MissingKey,
    #[error("remoteUser missing from request")]
    MissingRemoteUser,
    #[error("invalid userIP")]
    InvalidUserIp,
}

/// A request that passed validation, with its addresses parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest<'a> {
    pub bastion_ip: IpAddr,
    pub bastion_user: &'a str,
    pub command: Option<&'a str>,
    pub key: &'a str,
    pub remote_user: &'a str,
    /// Parsed client address, if one was supplied and parses.
    pub user_ip: Option<IpAddr>,
    /// Client address exactly as supplied, for the audit record.
    pub user_ip_raw: &'a str,
}

/// Checks `request` against `policy`.
///
/// Cheap checks run first and the first failing check is reported. Parsing of
/// the key itself is left to the fingerprinter; only its absence is checked
/// here.
pub fn validate<'a>(
    request: &'a IssuanceRequest,
    policy: &IssuancePolicy,
) -> Result<ValidatedRequest<'a>, ValidationFailure> {
    if policy.force_command && request.command.is_empty() {
        return Err(ValidationFailure::MissingCommand);
    }

    let bastion_ip: IpAddr = request
        .bastion_ip
        .parse()
        .map_err(|_| ValidationFailure::InvalidBastionIp)?;

    if request.bastion_user.is_empty() {
        return Err(ValidationFailure::MissingUser {
            header: policy.user_header.clone(),
        });
    }
    if request.bastion_user.chars().count() > MAX_USERNAME_LENGTH
        || !policy.user_pattern.is_match(&request.bastion_user)
    {
        return Err(ValidationFailure::InvalidUser);
    }

    if request.key.is_empty() {
        return Err(ValidationFailure::MissingKey);
    }
    if request.remote_user.is_empty() {
        return Err(ValidationFailure::MissingRemoteUser);
    }

    let user_ip = request.user_ip.parse::<IpAddr>().ok();
    if policy.require_client_ip && user_ip.is_none() {
        return Err(ValidationFailure::InvalidUserIp);
    }

    Ok(ValidatedRequest {
        bastion_ip,
        bastion_user: &request.bastion_user,
        command: Some(request.command.as_str()).filter(|c| !c.is_empty()),
        key: &request.key,
        remote_user: &request.remote_user,
        user_ip,
        user_ip_raw: &request.user_ip,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::issuance::policy::PolicyConfig;
    use std::time::Duration;

    fn policy(force_command: bool, require_client_ip: bool) -> IssuancePolicy {
        IssuancePolicy::new(PolicyConfig {
            force_command,
            require_client_ip,
            user_pattern: r"^[a-z_][a-z0-9_-]*$".to_string(),
            user_header: "X-Remote-User".to_string(),
            certificate_lifetime: Duration::from_secs(300),
            max_key_age: Duration::from_secs(86400),
            replay_retention: None,
            extensions: vec![],
        })
        .unwrap()
    }

    fn request() -> IssuanceRequest {
        IssuanceRequest {
            bastion_ip: "10.0.0.5".to_string(),
            bastion_user: "alice".to_string(),
            command: String::new(),
            key: "ssh-ed25519 AAAA".to_string(),
            remote_user: "deploy".to_string(),
            user_ip: "203.0.113.9".to_string(),
        }
    }

    #[test]
    fn valid_request_is_parsed() {
        let req = request();
        let validated = validate(&req, &policy(false, true)).unwrap();
        assert_eq!(validated.bastion_ip, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(validated.bastion_user, "alice");
        assert_eq!(validated.command, None);
        assert_eq!(validated.remote_user, "deploy");
        assert_eq!(validated.user_ip, Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn ipv6_addresses_are_accepted() {
        let mut req = request();
        req.bastion_ip = "2001:db8::5".to_string();
        req.user_ip = "2001:db8::9".to_string();
        assert!(validate(&req, &policy(false, true)).is_ok());
    }

    #[test]
    fn forced_command_must_be_present() {
        let req = request();
        assert_eq!(
            validate(&req, &policy(true, false)),
            Err(ValidationFailure::MissingCommand)
        );
        assert_eq!(
            ValidationFailure::MissingCommand.to_string(),
            "cmd missing from request"
        );

        let mut req = request();
        req.command = "/usr/bin/backup".to_string();
        let validated = validate(&req, &policy(true, false)).unwrap();
        assert_eq!(validated.command, Some("/usr/bin/backup"));
    }

    #[test]
    fn bastion_ip_must_be_an_address() {
        for bad in ["", "bastion.example.com", "10.0.0.256", "10.0.0.0/24"] {
            let mut req = request();
            req.bastion_ip = bad.to_string();
            assert_eq!(
                validate(&req, &policy(false, false)),
                Err(ValidationFailure::InvalidBastionIp),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn missing_user_names_the_header() {
        let mut req = request();
        req.bastion_user.clear();
        let err = validate(&req, &policy(false, false)).unwrap_err();
        assert_eq!(err.to_string(), "X-Remote-User missing from request");
    }

    #[test]
    fn user_name_is_bounded_and_matched() {
        let p = policy(false, false);
        let mut req = request();

        req.bastion_user = "a".repeat(32);
        assert!(validate(&req, &p).is_ok());

        req.bastion_user = "a".repeat(33);
        assert_eq!(validate(&req, &p), Err(ValidationFailure::InvalidUser));

        for bad in ["Alice", "alice smith", "alice;rm", "1alice"] {
            req.bastion_user = bad.to_string();
            assert_eq!(
                validate(&req, &p),
                Err(ValidationFailure::InvalidUser),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn key_and_remote_user_are_mandatory() {
        let p = policy(false, false);

        let mut req = request();
        req.key.clear();
        assert_eq!(validate(&req, &p), Err(ValidationFailure::MissingKey));

        let mut req = request();
        req.remote_user.clear();
        assert_eq!(validate(&req, &p), Err(ValidationFailure::MissingRemoteUser));
    }

    #[test]
    fn client_ip_only_checked_when_required() {
        let mut req = request();
        req.user_ip = "not-an-ip".to_string();

        let validated = validate(&req, &policy(false, false)).unwrap();
        assert_eq!(validated.user_ip, None);
        assert_eq!(validated.user_ip_raw, "not-an-ip");

        assert_eq!(
            validate(&req, &policy(false, true)),
            Err(ValidationFailure::InvalidUserIp)
        );
        req.user_ip.clear();
        assert_eq!(
            validate(&req, &policy(false, true)),
            Err(ValidationFailure::InvalidUserIp)
        );
    }

    #[test]
    fn request_deserializes_with_missing_fields() {
        let req: IssuanceRequest =
            serde_json::from_str(r#"{"bastion_ip":"10.0.0.5","key":"ssh-ed25519 AAAA"}"#).unwrap();
        assert_eq!(req.bastion_ip, "10.0.0.5");
        assert!(req.command.is_empty());
        assert!(req.user_ip.is_empty());
    }
}
