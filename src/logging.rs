//! Diagnostic logging set-up for the `hatch` binary.
//!
//! Logs go to stderr so command output on stdout stays machine readable.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Environment variable holding an explicit filter directive.
pub const LOG_ENV: &str = "HATCH_LOG";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// `HATCH_LOG` did not parse as a filter directive.
    #[error("invalid {LOG_ENV} value: {0}")]
    Filter(String),
    /// A global subscriber was already installed.
    #[error("failed to install log subscriber: {0}")]
    Install(String),
}

/// Maps the `-v` count to a default level.
#[must_use]
pub const fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Builds the filter, preferring `HATCH_LOG` over the verbosity default.
///
/// # Errors
///
/// Returns [`LoggingError::Filter`] when `HATCH_LOG` is set but malformed.
pub fn filter(verbosity: u8) -> Result<EnvFilter, LoggingError> {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => {
            EnvFilter::try_new(directive).map_err(|err| LoggingError::Filter(err.to_string()))
        }
        _ => EnvFilter::try_new(level_for(verbosity))
            .map_err(|err| LoggingError::Filter(err.to_string())),
    }
}

/// Installs the global stderr subscriber.
///
/// # Errors
///
/// Returns [`LoggingError`] when the filter is invalid or a subscriber is
/// already installed.
pub fn init(verbosity: u8) -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(verbosity)?)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LoggingError::Install(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[rstest]
    #[case(0, "warn")]
    #[case(1, "info")]
    #[case(2, "debug")]
    #[case(5, "trace")]
    fn verbosity_raises_the_level(#[case] verbosity: u8, #[case] expected: &str) {
        assert_eq!(level_for(verbosity), expected);
    }

    #[tokio::test]
    async fn explicit_directive_wins() {
        let _guard = EnvGuard::set_vars(&[(LOG_ENV, "hatch=trace")]).await;
        let built = filter(0).expect("valid directive");
        assert!(built.to_string().contains("hatch=trace"));
    }

    #[tokio::test]
    async fn malformed_directive_is_rejected() {
        let _guard = EnvGuard::set_vars(&[(LOG_ENV, "hatch=loud")]).await;
        let err = filter(0).expect_err("bad level");
        assert!(err.to_string().contains(LOG_ENV));
    }
}
