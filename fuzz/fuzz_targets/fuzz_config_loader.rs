#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors and validation errors are both fine; panics are not.
    if let Ok(cfg) = mppt_config::load_toml(data) {
        if cfg.validate().is_ok() {
            // A validated config must always seed a sealable image.
            let seed = mppt_core::ControllerConfig::from(&cfg).sealed();
            assert!(seed.is_sealed());
        }
    }
});
