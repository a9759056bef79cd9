//! Domain error taxonomy.
//!
//! One variant per error kind in the harness's error-handling design: most
//! are fatal at a specific stage (config load, environment validation,
//! topology probing, MSR access, partition resolution, spawn), and
//! `Exhausted` is the normal-termination signal threaded back up through
//! the scheduler rather than a true failure.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("environment requirement not met: {0}")]
    EnvironmentUnmet(String),

    #[error("CPU topology unavailable: {0}")]
    TopologyUnavailable(String),

    #[error("CPU topology inconsistent: {0}")]
    TopologyInconsistent(String),

    #[error("SMT requested but not enabled in hardware")]
    SmtMismatch,

    #[error("cannot open MSR device for core {core_id}: {source}")]
    MsrUnavailable {
        core_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid core id {core_id}: only {num_logical_cores} logical cores are present")]
    InvalidCore {
        core_id: usize,
        num_logical_cores: usize,
    },

    #[error("MSR write is not supported")]
    NotSupported,

    #[error("core {core_id} reports 0 visible MCA banks")]
    NoBanks { core_id: usize },

    #[error("partition helper {path} failed: {reason}")]
    HelperFailed { path: PathBuf, reason: String },

    #[error("failed to spawn command '{cmdline}': {source}")]
    ExecSpawnFailed {
        cmdline: String,
        #[source]
        source: std::io::Error,
    },

    #[error("odometer exhausted")]
    Exhausted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HarnessError>;
