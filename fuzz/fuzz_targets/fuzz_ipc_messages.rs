#![no_main]

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bastion_ssh_ca::certificate_authority::ca_server::CaServer;
use bastion_ssh_ca::certificate_authority::{
    AuthenticatedRequest, CaResponse, CertificateAuthority,
};
use bastion_ssh_ca::issuance::Issuer;
use bastion_ssh_ca::issuance::clock::SystemClock;
use bastion_ssh_ca::issuance::policy::{IssuancePolicy, PolicyConfig};
use libfuzzer_sys::fuzz_target;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, private::PrivateKey};
use zeroize::Zeroizing;

const TOKEN: &str = "fuzz-token";

static SERVER: LazyLock<CaServer> = LazyLock::new(|| {
    let policy = IssuancePolicy::new(PolicyConfig {
        force_command: false,
        require_client_ip: false,
        user_pattern: r"^[a-z_][a-z0-9_.-]*$".to_string(),
        user_header: "X-Remote-User".to_string(),
        certificate_lifetime: Duration::from_secs(120),
        max_key_age: Duration::from_secs(86400),
        replay_retention: None,
        extensions: vec!["permit-pty".to_string()],
    })
    .unwrap();
    let clock = Arc::new(SystemClock);
    let ca = CertificateAuthority::from_private_key(
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap(),
    );
    let issuer = Issuer::new(
        policy.clone(),
        policy.replay_guard(clock.clone()),
        Box::new(ca),
        clock,
    );
    CaServer::new(
        "unused.sock".to_string(),
        issuer,
        Zeroizing::new(TOKEN.to_string()),
        Duration::from_secs(3600),
    )
});

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<CaResponse>(data);

    // the server decodes UTF-8 before authenticating the envelope
    if let Ok(request_json) = std::str::from_utf8(data) {
        let envelope = serde_json::from_str::<AuthenticatedRequest>(request_json);
        let response = SERVER.process(request_json);
        // nothing but a valid token may reach the issuer
        if !matches!(&envelope, Ok(e) if e.token == TOKEN) {
            assert!(matches!(response, CaResponse::Error(_)));
        }
    }
});
