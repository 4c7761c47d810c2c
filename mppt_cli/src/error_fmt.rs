//! Human-readable error descriptions and structured JSON error formatting.

use mppt_core::error::{BuildError, ConfigError, MpptError};

fn config_error_text(ce: &ConfigError) -> String {
    match ce {
        ConfigError::OutOfRange { param, value } => format!(
            "What happened: {param} = {value} is outside its allowed range.\nLikely causes: Typo in the value or wrong unit (voltages and periods are in milli-units).\nHow to fix: Run `mppt config show` for current values and retry with a value inside the bounds."
        ),
        ConfigError::UnknownAlgorithm(id) => format!(
            "What happened: Algorithm id {id} is not known.\nLikely causes: The id is reserved or mistyped.\nHow to fix: Use openloop (0), pando (1), ivsweep (3) or manual (4)."
        ),
        other => format!(
            "What happened: The stored configuration image is unusable ({other}).\nLikely causes: Interrupted write, disk corruption, or a file from another tool.\nHow to fix: Run `mppt config reset` to write first-run defaults."
        ),
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingStore => {
                "What happened: No configuration store was provided to the controller.\nLikely causes: [store].path missing from the config.\nHow to fix: Add a [store] section with the image path.".to_string()
            }
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Out-of-range [runtime] rates in the TOML.\nHow to fix: Edit the config file, then rerun. See etc/mppt_config.toml for a sample."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<ConfigError>() {
        return config_error_text(ce);
    }

    if let Some(me) = err.downcast_ref::<MpptError>() {
        return match me {
            MpptError::ConfigCorrupt(ce) => format!(
                "What happened: Persisted configuration failed its integrity check ({ce}); the power stage was held off.\nLikely causes: Interrupted write, disk corruption, or a file from another tool.\nHow to fix: Run `mppt config reset` to write first-run defaults."
            ),
            MpptError::Timeout => {
                let ctx = err.to_string();
                format!(
                    "What happened: {ctx}.\nLikely causes: The simulated panel is too slow for the timeout, or the run was interrupted.\nHow to fix: Raise --timeout-ms or use a coarser ivsweep_step_mv."
                )
            }
            MpptError::Config(msg) => format!(
                "What happened: {msg}.\nLikely causes: Unknown parameter name, malformed value, or an empty store.\nHow to fix: Check `mppt config --help`; parameter names match `mppt config show`."
            ),
            MpptError::Hardware(_) | MpptError::HardwareFault(_) => format!(
                "What happened: {me}.\nLikely causes: The power stage refused a command or its fault latch is set.\nHow to fix: Re-run with --log-level=debug; check the [simulation] section."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from config loading
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("calibration csv must have headers") {
        return "Invalid headers in calibration CSV. Expected 'channel,raw,milli'.".to_string();
    }

    if lower.contains("failed to parse config") || lower.contains("must be") {
        let detail = err
            .chain()
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| msg.clone());
        return format!(
            "What happened: Configuration is invalid or incomplete ({detail}).\nLikely causes: Missing [store] section, a typo in a key, or an out-of-range value.\nHow to fix: Edit the TOML config and try again."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes; anything not listed returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return 4;
    }
    match err.downcast_ref::<MpptError>() {
        Some(MpptError::ConfigCorrupt(_)) => 3,
        Some(MpptError::Config(_)) => 4,
        Some(MpptError::Timeout) => 5,
        Some(MpptError::Hardware(_) | MpptError::HardwareFault(_)) => 6,
        _ => 1,
    }
}

fn reason_name(err: &eyre::Report) -> &'static str {
    if let Some(ce) = err.downcast_ref::<ConfigError>() {
        return match ce {
            ConfigError::OutOfRange { .. } => "OutOfRange",
            ConfigError::UnknownAlgorithm(_) => "UnknownAlgorithm",
            _ => "ConfigCorrupt",
        };
    }
    match err.downcast_ref::<MpptError>() {
        Some(MpptError::ConfigCorrupt(_)) => "ConfigCorrupt",
        Some(MpptError::Config(_)) => "Config",
        Some(MpptError::Timeout) => "Timeout",
        Some(MpptError::Hardware(_) | MpptError::HardwareFault(_)) => "Hardware",
        _ => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let details = match (err.downcast_ref::<ConfigError>(), err.downcast_ref::<MpptError>()) {
        (Some(ConfigError::OutOfRange { param, value }), _) => {
            Some(json!({ "param": param, "value": value }))
        }
        (_, Some(MpptError::ConfigCorrupt(ce))) => Some(json!({ "integrity": ce.to_string() })),
        _ => None,
    };
    let reason = reason_name(err);
    let msg = humanize(err);
    match details {
        Some(d) => json!({ "reason": reason, "details": d, "message": msg }),
        None => json!({ "reason": reason, "message": msg }),
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(eyre::Report::new(MpptError::ConfigCorrupt(ConfigError::Magic(0))), 3, "ConfigCorrupt")]
    #[case(eyre::Report::new(ConfigError::OutOfRange { param: "min_vin_mv", value: 1 }), 4, "OutOfRange")]
    #[case(eyre::Report::new(MpptError::Config("unknown parameter 'x'".into())), 4, "Config")]
    #[case(eyre::Report::new(MpptError::Timeout), 5, "Timeout")]
    #[case(eyre::eyre!("boom"), 1, "Error")]
    fn codes_and_reasons_are_stable(
        #[case] err: eyre::Report,
        #[case] code: i32,
        #[case] reason: &str,
    ) {
        assert_eq!(exit_code_for_error(&err), code);
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["reason"], reason);
        assert!(v["message"].as_str().unwrap().len() > 10);
    }

    #[test]
    fn wrapped_timeout_keeps_its_code() {
        use eyre::WrapErr;
        let err = Err::<(), _>(eyre::Report::new(MpptError::Timeout))
            .wrap_err("IV sweep did not finish within 10 ms")
            .unwrap_err();
        assert_eq!(exit_code_for_error(&err), 5);
        assert!(humanize(&err).contains("IV sweep did not finish"));
    }

    #[test]
    fn out_of_range_json_carries_details() {
        let err = eyre::Report::new(ConfigError::OutOfRange {
            param: "max_vout_mv",
            value: 999_999,
        });
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&err)).unwrap();
        assert_eq!(v["details"]["param"], "max_vout_mv");
        assert_eq!(v["details"]["value"], 999_999);
    }
}
