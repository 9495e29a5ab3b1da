//! Environment-driven configuration.
//!
//! The hook takes everything except its four positional arguments from the
//! environment, with compiled-in defaults matching the surrounding system.

use std::env;
use std::path::PathBuf;

/// Default state directory holding all lock files.
pub const DEFAULT_STATE_DIR: &str = "/run/nix/current-load";
/// Default machines file.
pub const DEFAULT_MACHINES_FILE: &str = "/etc/nix/machines";
/// Default configuration directory (signing key lookup).
pub const DEFAULT_CONF_DIR: &str = "/etc/nix";
/// Name of the signing key inside the configuration directory.
pub const SIGNING_KEY_FILE: &str = "signing-key.sec";

/// Resolved hook environment.
#[derive(Debug, Clone)]
pub struct HookEnv {
    /// `NIX_CURRENT_LOAD`: directory for slot, main, and upload locks.
    pub state_dir: PathBuf,
    /// `NIX_REMOTE_SYSTEMS`: machines config file.
    pub machines_file: PathBuf,
    /// `NIX_CONF_DIR`: where the signing key is looked for.
    pub conf_dir: PathBuf,
    /// `NIX_SSHOPTS`: extra arguments for every ssh invocation.
    pub ssh_opts: Vec<String>,
    /// `NIX_DEBUG_HOOK`: log per-candidate placement state.
    pub debug_hook: bool,
}

impl HookEnv {
    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Resolve from an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            state_dir: lookup("NIX_CURRENT_LOAD")
                .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string())
                .into(),
            machines_file: lookup("NIX_REMOTE_SYSTEMS")
                .unwrap_or_else(|| DEFAULT_MACHINES_FILE.to_string())
                .into(),
            conf_dir: lookup("NIX_CONF_DIR")
                .unwrap_or_else(|| DEFAULT_CONF_DIR.to_string())
                .into(),
            ssh_opts: lookup("NIX_SSHOPTS")
                .map(|opts| opts.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            debug_hook: lookup("NIX_DEBUG_HOOK").is_some(),
        }
    }

    /// Path of the upload signing key.
    pub fn signing_key(&self) -> PathBuf {
        self.conf_dir.join(SIGNING_KEY_FILE)
    }

    /// Uploads are signed iff the signing key exists.
    pub fn wants_signing(&self) -> bool {
        self.signing_key().exists()
    }
}

/// Environment overrides applied to every spawned child so that downstream
/// ssh never stops for an interactive prompt.
pub fn neutral_child_env() -> [(&'static str, &'static str); 2] {
    [("DISPLAY", ""), ("SSH_ASKPASS", "")]
}
