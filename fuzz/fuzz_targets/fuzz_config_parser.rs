#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Config files are user-edited; malformed TOML must be an error, never a panic
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = cinder_core::config::Config::parse_str(s) {
            let _ = config.validate();
        }
    }
});
