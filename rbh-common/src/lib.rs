//! Shared building blocks for the remote-build dispatcher hook.
//!
//! The `rbh` binary is a short-lived, single-threaded process spawned by the
//! local build daemon, one per build request. Everything that has to agree
//! across concurrently running hook processes lives in this crate: the
//! machine registry, the advisory-lock primitives in the shared state
//! directory, the placement engine that picks a slot under the global
//! admission lock, and the wire codec spoken to remote workers.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod locks;
pub mod machines;
pub mod mock_worker;
pub mod placement;
pub mod wire;

pub use config::HookEnv;
pub use errors::{MachinesError, SessionError};
pub use machines::Machine;
pub use placement::{BuildRequest, PlacedBuild, Placement};
