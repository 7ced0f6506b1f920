use std::path::PathBuf;

use thiserror::Error as ThisError;

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error kinds surfaced by the image layering engine.
///
/// Functions return `anyhow::Result`; these values travel inside the `anyhow::Error` and can be
/// recovered with [`Error::find`].
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid name {0:?}")]
    InvalidName(String),

    #[error("no bases found")]
    NoBases,

    #[error("no valid layout: {0}")]
    NoValidLayout(String),

    #[error("unknown hook {0:?}")]
    UnknownHook(String),

    #[error("hook {name:?} expects {expected} arguments but got {got}")]
    ArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("filesystem not supported: {0}")]
    FilesystemNotSupported(String),

    #[error("logical volume {0} is not part of a thin pool")]
    MissingThinPool(String),

    #[error("command {argv:?} failed with exit code {}: {stderr}", exit.map(|c| c.to_string()).unwrap_or_else(|| "<signal>".into()))]
    CommandFailed {
        argv: Vec<String>,
        exit: Option<i32>,
        stderr: String,
    },

    #[error("update failed during {phase}")]
    UpdateFailed {
        phase: String,
        #[source]
        source: BoxedError,
    },

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("garbage collection failed to remove: {}", failed.join(", "))]
    GcFailed { failed: Vec<String> },

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("no boot entry found for {0}")]
    BootEntryMissing(String),

    #[error("layer out of order: {0}")]
    LayerOutOfOrder(String),

    #[error("thin pool metadata of {pool} is too small: {size} bytes, at least {minimum} bytes required")]
    ThinPoolMetadataTooSmall {
        pool: String,
        size: u64,
        minimum: u64,
    },

    #[error("{0:?} is not a volume")]
    NotAVolume(PathBuf),

    #[error("{0:?} is already a volume")]
    AlreadyAVolume(PathBuf),
}

impl Error {
    /// Find the first [`Error`] in the cause chain of `error`.
    pub fn find(error: &anyhow::Error) -> Option<&Error> {
        error.chain().find_map(|cause| cause.downcast_ref::<Error>())
    }

    pub fn update_failed(phase: impl Into<String>, source: anyhow::Error) -> Self {
        Error::UpdateFailed {
            phase: phase.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context as _;

    use super::*;

    #[test]
    fn test_find_through_context() {
        let error = Err::<(), _>(anyhow::Error::from(Error::NoBases))
            .context("Failed to load layout")
            .unwrap_err();

        assert!(matches!(Error::find(&error), Some(Error::NoBases)));
    }

    #[test]
    fn test_update_failed_keeps_cause() {
        let cause = anyhow::Error::from(Error::CommandFailed {
            argv: vec!["lvcreate".into()],
            exit: Some(5),
            stderr: "Insufficient free space".into(),
        });
        let error = anyhow::Error::from(Error::update_failed("creating base", cause));

        let messages = error.chain().map(|e| e.to_string()).collect::<Vec<_>>();
        assert_eq!(messages[0], "update failed during creating base");
        assert!(messages[1].contains("Insufficient free space"));
    }
}
