//! Error types for the dispatcher hook.
//!
//! Only two kinds of failure are recovered from: a connect failure (the
//! machine is disabled for the rest of the process and placement reruns)
//! and upload-lock starvation (handled inside the lock module). Everything
//! else either decides the reply to the parent or terminates the process.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure to load the static machine registry.
///
/// A missing file is not an error (the registry is simply empty and every
/// request is declined); anything else here aborts startup.
#[derive(Debug, Error)]
pub enum MachinesError {
    /// The machines file exists but could not be read.
    #[error("cannot read machines file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A line of the machines file does not parse.
    #[error("machines file line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

/// Failure while connecting to or driving a remote worker.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The SSH transport could not be established or greeted. The caller
    /// disables the machine for this process and retries placement.
    #[error("cannot connect to '{host}': {reason}")]
    Connect { host: String, reason: String },

    /// The worker reported a nonzero build status. The message format is
    /// part of the parent contract; the status becomes the exit code.
    #[error("error: {msg} on '{host}'")]
    RemoteBuildFailed { host: String, status: u64, msg: String },

    /// Channel or lock failure after the build was accepted. Fatal.
    #[error("remote session with '{host}' failed: {source}")]
    Io {
        host: String,
        #[source]
        source: io::Error,
    },
}
