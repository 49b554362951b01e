//! Error types for imaging operations.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal errors an imaging operation can end with.
///
/// Only the validating and copying stages can fail an operation; unmount and
/// shrink problems are demoted to warnings by the controller and never appear
/// here.
#[derive(Debug, Error)]
pub enum Error {
    /// Elevated privileges could not be obtained.
    #[error("authentication failed: elevated privileges are required for raw device access")]
    Privilege,

    /// The backup source device does not exist.
    #[error("source device not available: {path}")]
    SourceUnavailable { path: PathBuf },

    /// The copy tool exited non-zero. The reason is the last non-progress
    /// stderr line it printed, or an exit-code message when it printed none.
    #[error("{reason}")]
    Copy { reason: String },

    /// An executable could not be started at all. Distinct from a non-zero
    /// exit: the stage never began.
    #[error("failed to launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The user confirmed cancellation mid-operation.
    #[error("cancelled by user")]
    Cancelled,

    /// A second operation was started while one was still running.
    #[error("an operation is already in progress")]
    Busy,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short reason string surfaced to the user in the terminal failure event.
    pub fn reason(&self) -> String {
        self.to_string()
    }
}
