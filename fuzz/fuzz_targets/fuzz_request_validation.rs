#![no_main]

use std::sync::LazyLock;
use std::time::Duration;

use bastion_ssh_ca::issuance::fingerprint::fingerprint;
use bastion_ssh_ca::issuance::policy::{IssuancePolicy, PolicyConfig};
use bastion_ssh_ca::issuance::request::{IssuanceRequest, validate};
use libfuzzer_sys::fuzz_target;

static POLICY: LazyLock<IssuancePolicy> = LazyLock::new(|| {
    IssuancePolicy::new(PolicyConfig {
        force_command: true,
        require_client_ip: true,
        user_pattern: r"^[a-z_][a-z0-9_.-]*$".to_string(),
        user_header: "X-Remote-User".to_string(),
        certificate_lifetime: Duration::from_secs(120),
        max_key_age: Duration::from_secs(86400),
        replay_retention: None,
        extensions: vec![],
    })
    .unwrap()
});

fuzz_target!(|request: IssuanceRequest| {
    if let Ok(validated) = validate(&request, &POLICY) {
        assert!(!validated.bastion_user.is_empty());
        assert!(validated.bastion_user.chars().count() <= 32);
        assert!(validated.command.is_some());
        assert!(validated.user_ip.is_some());
    }
    let _ = fingerprint(request.key.as_bytes());
});
