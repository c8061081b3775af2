//! Crate-wide error and exit types.
//!
//! Every fallible path in the shaper surfaces a [`ShaperError`]. The variants
//! are deliberately coarse: the controller only distinguishes "the tenancy
//! query failed" from "the sampler failed" from "the config is unusable", and
//! each maps to a documented recovery policy.

use thiserror::Error;

/// All errors surfaced by the shaper core.
///
/// The enum is `Clone` because the controller keeps the most recent query and
/// sampler errors in its runtime state, and the sampler embeds errors in the
/// observation stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShaperError {
    /// Configuration rejected at construction. `key` names the violated
    /// config entry in file notation (e.g. `controller.suppressThreshold`)
    /// so the operator can find it without reading source.
    #[error("invalid configuration: {key} {reason}")]
    ConfigInvalid { key: String, reason: String },

    /// The tenancy metrics client failed for any transport or authorization
    /// reason. The controller enters the fallback state and retries on the
    /// next slow tick.
    #[error("tenancy metric query failed: {0}")]
    MetricsQueryFailed(String),

    /// The tenancy metrics provider has no datapoints for the resource.
    /// Treated like [`ShaperError::MetricsQueryFailed`] for state purposes.
    #[error("tenancy metric query returned no datapoints")]
    NoMetricsData,

    /// A host-load snapshot could not be taken or parsed.
    #[error("host load sampler failed: {0}")]
    SamplerFailed(String),

    /// `Sampler::run` was called a second time on the same sampler.
    #[error("sampler already started")]
    AlreadyStarted,

    /// Socket-level failure from the metrics endpoint or worker start hooks.
    #[error("i/o error: {0}")]
    Io(String),
}

impl ShaperError {
    /// Build a `ConfigInvalid` without repeating the struct syntax at every
    /// validation site.
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ShaperError::ConfigInvalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Process exit classification returned by the top-level `run` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Clean shutdown, including cancellation and an elapsed shutdown deadline.
    Success,
    /// Configuration was rejected before any task was spawned.
    ConfigError,
    /// The runtime failed after startup.
    RuntimeError,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::RuntimeError => 1,
            ExitStatus::ConfigError => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_invalid_message_names_key() {
        let err = ShaperError::config(
            "controller.suppressResume",
            "must be greater than controller.targetMax",
        );
        assert_eq!(
            err.to_string(),
            "invalid configuration: controller.suppressResume must be greater than controller.targetMax"
        );
    }

    #[test]
    fn test_no_metrics_data_message() {
        assert_eq!(
            ShaperError::NoMetricsData.to_string(),
            "tenancy metric query returned no datapoints"
        );
    }

    #[test]
    fn test_errors_are_cloneable_and_comparable() {
        let err = ShaperError::MetricsQueryFailed("timeout".into());
        assert_eq!(err.clone(), err);
        assert_ne!(err, ShaperError::NoMetricsData);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Success.code(), 0);
        assert_eq!(ExitStatus::RuntimeError.code(), 1);
        assert_eq!(ExitStatus::ConfigError.code(), 2);
    }
}
