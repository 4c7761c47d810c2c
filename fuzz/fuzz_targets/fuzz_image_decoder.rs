#![no_main]
use libfuzzer_sys::fuzz_target;
use mppt_core::ControllerConfig;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode to the same bytes.
    if let Ok(cfg) = ControllerConfig::from_bytes(data) {
        assert!(cfg.is_sealed());
        assert_eq!(&cfg.to_bytes()[..], data);
    }
});
