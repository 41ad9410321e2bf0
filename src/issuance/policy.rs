//! # Issuance Policy
//!
//! Process-wide rules applied to every request: which fields are mandatory,
//! how user names look, how long certificates live and which extensions they
//! carry.
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use super::clock::Clock;
use super::replay_guard::ReplayGuard;
use crate::config::{deserialize_duration, deserialize_optional_duration};

/// Longest bastion user name accepted, in characters.
pub const MAX_USERNAME_LENGTH: usize = 32;

/// Longest certificate lifetime a policy may configure.
pub const MAX_CERTIFICATE_LIFETIME: Duration = Duration::from_secs(366 * 86400);

fn default_user_pattern() -> String {
    r"^[a-z_][a-z0-9_.-]*$".to_string()
}

fn default_user_header() -> String {
    "X-Remote-User".to_string()
}

/// Policy section of the configuration file, as written by the operator.
#[derive(Deserialize, Debug, Clone)]
pub struct PolicyConfig {
    /// Every certificate must carry a forced command.
    #[serde(default)]
    pub force_command: bool,
    /// Requests must name the originating client address.
    #[serde(default)]
    pub require_client_ip: bool,
    /// Pattern bastion user names must match. Not anchored implicitly.
    #[serde(default = "default_user_pattern")]
    pub user_pattern: String,
    /// Name of the header the bastion user is taken from, used in error messages.
    #[serde(default = "default_user_header")]
    pub user_header: String,
    /// How long issued certificates are valid, e.g. `"5m"`.
    #[serde(deserialize_with = "deserialize_duration")]
    pub certificate_lifetime: Duration,
    /// How long after its first sighting a key may still be certified.
    #[serde(deserialize_with = "deserialize_duration")]
    pub max_key_age: Duration,
    /// How long replay records are kept. Records are kept forever when unset.
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub replay_retention: Option<Duration>,
    /// Extensions granted by every certificate, e.g. `permit-pty`.
    #[serde(default)]
    pub extensions: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid user pattern: {0}")]
    InvalidUserPattern(#[from] regex::Error),
    #[error("certificate lifetime {0:?} is shorter than one second")]
    LifetimeTooShort(Duration),
    #[error("certificate lifetime {0:?} exceeds {max:?}", max = MAX_CERTIFICATE_LIFETIME)]
    LifetimeTooLong(Duration),
    #[error("replay retention {retention:?} is shorter than the maximum key age {max_key_age:?}")]
    RetentionTooShort {
        retention: Duration,
        max_key_age: Duration,
    },
}

/// Compiled, validated policy.
#[derive(Debug, Clone)]
pub struct IssuancePolicy {
    pub(crate) force_command: bool,
    pub(crate) require_client_ip: bool,
    pub(crate) user_pattern: Regex,
    pub(crate) user_header: String,
    pub(crate) certificate_lifetime: Duration,
    pub(crate) max_key_age: Duration,
    pub(crate) replay_retention: Option<Duration>,
    pub(crate) extensions: Vec<String>,
}

impl IssuancePolicy {
    /// Compiles the user pattern and checks the durations for consistency.
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        if config.certificate_lifetime < Duration::from_secs(1) {
            return Err(PolicyError::LifetimeTooShort(config.certificate_lifetime));
        }
        if config.certificate_lifetime > MAX_CERTIFICATE_LIFETIME {
            return Err(PolicyError::LifetimeTooLong(config.certificate_lifetime));
        }
        if let Some(retention) = config.replay_retention {
            if retention < config.max_key_age {
                return Err(PolicyError::RetentionTooShort {
                    retention,
                    max_key_age: config.max_key_age,
                });
            }
        }
        let user_pattern = Regex::new(&config.user_pattern)?;
        Ok(IssuancePolicy {
            force_command: config.force_command,
            require_client_ip: config.require_client_ip,
            user_pattern,
            user_header: config.user_header,
            certificate_lifetime: config.certificate_lifetime,
            max_key_age: config.max_key_age,
            replay_retention: config.replay_retention,
            extensions: config.extensions,
        })
    }

    pub fn certificate_lifetime(&self) -> Duration {
        self.certificate_lifetime
    }

    pub fn user_header(&self) -> &str {
        &self.user_header
    }

    /// Builds an in-memory replay guard with this policy's age and retention.
    pub fn replay_guard(&self, clock: Arc<dyn Clock>) -> ReplayGuard {
        ReplayGuard::in_memory(clock, self.max_key_age, self.replay_retention)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(text: &str) -> PolicyConfig {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let config = parse(
            r#"
certificate_lifetime = "5m"
max_key_age = "30days"
"#,
        );
        assert!(!config.force_command);
        assert!(!config.require_client_ip);
        assert_eq!(config.user_header, "X-Remote-User");
        assert_eq!(config.replay_retention, None);
        assert!(config.extensions.is_empty());

        let policy = IssuancePolicy::new(config).unwrap();
        assert_eq!(policy.certificate_lifetime(), Duration::from_secs(300));
        assert_eq!(policy.max_key_age, Duration::from_secs(30 * 86400));
        assert!(policy.user_pattern.is_match("deploy_bot"));
        assert!(!policy.user_pattern.is_match("Alice"));
    }

    #[test]
    fn full_policy_parses() {
        let config = parse(
            r#"
force_command = true
require_client_ip = true
user_pattern = "^[a-z]+$"
user_header = "X-Forwarded-User"
certificate_lifetime = "1h 30m"
max_key_age = "7days"
replay_retention = "21days"
extensions = ["permit-pty", "permit-agent-forwarding"]
"#,
        );
        let policy = IssuancePolicy::new(config).unwrap();
        assert!(policy.force_command);
        assert!(policy.require_client_ip);
        assert_eq!(policy.user_header(), "X-Forwarded-User");
        assert_eq!(policy.certificate_lifetime(), Duration::from_secs(5400));
        assert_eq!(policy.replay_retention, Some(Duration::from_secs(21 * 86400)));
        assert_eq!(policy.extensions.len(), 2);
    }

    #[test]
    fn bad_duration_is_rejected() {
        let result: Result<PolicyConfig, _> = toml::from_str(
            r#"
certificate_lifetime = "forever"
max_key_age = "7days"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_policies_are_rejected() {
        let mut config = parse(
            r#"
certificate_lifetime = "5m"
max_key_age = "7days"
"#,
        );

        config.user_pattern = "([a-z".to_string();
        assert!(matches!(
            IssuancePolicy::new(config.clone()),
            Err(PolicyError::InvalidUserPattern(_))
        ));

        config.user_pattern = default_user_pattern();
        config.certificate_lifetime = Duration::from_millis(500);
        assert!(matches!(
            IssuancePolicy::new(config.clone()),
            Err(PolicyError::LifetimeTooShort(_))
        ));

        config.certificate_lifetime = Duration::from_secs(u64::MAX);
        assert!(matches!(
            IssuancePolicy::new(config.clone()),
            Err(PolicyError::LifetimeTooLong(_))
        ));
        config.certificate_lifetime = MAX_CERTIFICATE_LIFETIME;
        assert!(IssuancePolicy::new(config.clone()).is_ok());

        config.certificate_lifetime = Duration::from_secs(60);
        config.replay_retention = Some(Duration::from_secs(86400));
        assert!(matches!(
            IssuancePolicy::new(config),
            Err(PolicyError::RetentionTooShort { .. })
        ));
    }
}
