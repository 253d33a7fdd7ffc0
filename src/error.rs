//! Error types for spawning and starting the supervised pair

use crate::process::ChildName;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The OS refused to create a child process
#[derive(Debug, Error)]
#[error("failed to spawn {name} ({}): {source}", .path.display())]
pub struct SpawnError {
    pub name: ChildName,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl SpawnError {
    /// Kind of the underlying OS error (e.g. `NotFound` for a missing binary)
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// Why a start request did not reach `Running`
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("{step} did not become ready within {timeout:?}")]
    NotReady { step: ChildName, timeout: Duration },

    #[error("{step} exited during startup (code {code:?})")]
    ExitedDuringStartup { step: ChildName, code: Option<i32> },

    #[error("start of {step} aborted by a stop request")]
    Aborted { step: ChildName },

    #[error("supervisor is no longer running")]
    SupervisorGone,
}

impl StartError {
    /// The child whose startup step failed, if any
    pub fn step(&self) -> Option<ChildName> {
        match self {
            StartError::Spawn(e) => Some(e.name),
            StartError::NotReady { step, .. }
            | StartError::ExitedDuringStartup { step, .. }
            | StartError::Aborted { step } => Some(*step),
            StartError::SupervisorGone => None,
        }
    }
}
