//! Conditions callers need to tell apart from ordinary failures.
//!
//! Most functions in this crate return `anyhow::Result`. The variants here
//! are wrapped into those errors where a caller has to branch on them, and
//! are recovered with [`is_no_config_source`] and [`is_cancelled`] no matter
//! how much context was layered on top.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The platform has no machine configuration to offer right now.
    #[error("no configuration source")]
    NoConfigSource,

    #[error("operation cancelled")]
    Cancelled,

    #[error("network-config metadata version={0} is not supported")]
    UnsupportedVersion(u32),

    #[error("failed to fetch {key:?}: {reason}")]
    Fetch { key: String, reason: String },

    #[error("invalid hostname {name:?}: {reason}")]
    InvalidHostname { name: String, reason: String },

    #[error("unable to mount {device} on {target}: {reason}")]
    Mount {
        device: String,
        target: String,
        reason: String,
    },

    #[error("unable to unmount {target}: {reason}")]
    Unmount { target: String, reason: String },
}

fn find(err: &anyhow::Error) -> impl Iterator<Item = &PlatformError> {
    err.chain()
        .filter_map(|e| e.downcast_ref::<PlatformError>())
}

pub fn is_no_config_source(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, PlatformError::NoConfigSource))
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, PlatformError::Cancelled))
}

pub fn is_unsupported_version(err: &anyhow::Error) -> bool {
    find(err).any(|e| matches!(e, PlatformError::UnsupportedVersion(_)))
}

#[cfg(test)]
mod test {
    use anyhow::{Context, anyhow};

    use super::*;

    #[test]
    fn test_is_no_config_source_through_context() {
        let err = Err::<(), _>(anyhow::Error::from(PlatformError::NoConfigSource))
            .context("unable to get user data")
            .unwrap_err();
        assert!(is_no_config_source(&err));
        assert!(!is_cancelled(&err));
    }

    #[test]
    fn test_is_cancelled() {
        let err = anyhow::Error::from(PlatformError::Cancelled).context("fetching hostname");
        assert!(is_cancelled(&err));
        assert!(!is_no_config_source(&err));
    }

    #[test]
    fn test_plain_error_matches_nothing() {
        let err = anyhow!("connection refused");
        assert!(!is_cancelled(&err));
        assert!(!is_no_config_source(&err));
        assert!(!is_unsupported_version(&err));
    }

    #[test]
    fn test_unsupported_version_message() {
        let err = PlatformError::UnsupportedVersion(3);
        assert_eq!(
            err.to_string(),
            "network-config metadata version=3 is not supported"
        );
    }
}
