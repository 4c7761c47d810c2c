//! Maps `Box<dyn Error>` from trait boundaries to typed `MpptError`.
//!
//! The traits in `mppt_traits` use `Box<dyn Error + Send + Sync>`; this module
//! converts those to our typed error enum, with an optional feature-gated path
//! for `mppt_hardware::error::HwError` downcasting.

use crate::error::MpptError;

/// Map a trait-boundary error to a typed `MpptError`.
///
/// Known hardware error types are downcast first, then string heuristics apply.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> MpptError {
    #[cfg(feature = "hardware-errors")]
    {
        use mppt_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => MpptError::Timeout,
                HwError::Io(io) => MpptError::Io(io.to_string()),
                other => MpptError::HardwareFault(other.to_string()),
            };
        }
    }

    if let Some(io) = e.downcast_ref::<std::io::Error>() {
        return MpptError::Io(io.to_string());
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        MpptError::Timeout
    } else {
        MpptError::Hardware(s)
    }
}

/// Convenience for `map_err` on boxed trait results.
pub fn boxed(e: &mppt_traits::BoxError) -> MpptError {
    map_hw_error(e.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_category() {
        let e = std::io::Error::other("disk gone");
        assert!(matches!(map_hw_error(&e), MpptError::Io(_)));
    }

    #[test]
    fn timeout_text_maps_to_timeout() {
        let e: mppt_traits::BoxError = "adc Timeout on channel 3".into();
        assert!(matches!(boxed(&e), MpptError::Timeout));
    }

    #[cfg(feature = "hardware-errors")]
    #[test]
    fn hw_fault_latched_is_a_hardware_fault() {
        let e: mppt_traits::BoxError = Box::new(mppt_hardware::error::HwError::FaultLatched);
        assert!(matches!(boxed(&e), MpptError::HardwareFault(_)));
    }
}
