#![no_main]

use bastion_ssh_ca::config::Config;
use bastion_ssh_ca::issuance::policy::IssuancePolicy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<Config>(s) {
            let _ = IssuancePolicy::new(config.policy);
        }
    }
});
