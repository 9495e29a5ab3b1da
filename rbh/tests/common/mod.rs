//! Shared fixtures for the binary integration tests.

use rbh_common::locks::{HeldLock, LockFile};
use rbh_common::machines::{self, Machine};
use std::fs;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Once;
use tempfile::TempDir;

#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        eprintln!("[test] {}", format!($($arg)*));
    };
}

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

const SSH_SHIM: &str = r#"#!/bin/sh
if [ -n "${RBH_TEST_FAIL_HOST:-}" ]; then
    for arg in "$@"; do
        if [ "$arg" = "$RBH_TEST_FAIL_HOST" ]; then
            exit 255
        fi
    done
fi
exec "$RBH_TEST_MOCK_WORKER" serve
"#;

const STORE_SHIM: &str = r#"#!/bin/sh
exec "$RBH_TEST_MOCK_WORKER" store "$@"
"#;

/// A hook sandbox: state directory, machines file, and a `PATH` whose `ssh`
/// and `nix-store` are shims into the mock worker.
pub struct HookFixture {
    #[allow(dead_code)] // owns the tempdir for the fixture's lifetime
    dir: TempDir,
    pub state_dir: PathBuf,
    pub machines_file: PathBuf,
    pub conf_dir: PathBuf,
    bin_dir: PathBuf,
}

impl HookFixture {
    pub fn new(machines: &str) -> Self {
        let dir = TempDir::new().expect("create fixture dir");
        let state_dir = dir.path().join("current-load");
        let conf_dir = dir.path().join("conf");
        let bin_dir = dir.path().join("bin");
        fs::create_dir_all(&conf_dir).expect("create conf dir");
        fs::create_dir_all(&bin_dir).expect("create bin dir");

        let machines_file = dir.path().join("machines");
        fs::write(&machines_file, machines).expect("write machines file");

        write_shim(&bin_dir.join("ssh"), SSH_SHIM);
        write_shim(&bin_dir.join("nix-store"), STORE_SHIM);

        Self {
            dir,
            state_dir,
            machines_file,
            conf_dir,
            bin_dir,
        }
    }

    /// The nth machine of the fixture's registry.
    pub fn machine(&self, index: usize) -> Machine {
        machines::load_machines(&self.machines_file)
            .expect("parse fixture machines")
            .remove(index)
    }

    /// Hold a slot lock from the test process, as another hook would.
    pub fn hold_slot(&self, machine: &Machine, slot: u32) -> HeldLock {
        LockFile::open(&self.state_dir.join(machine.slot_lock_file(slot)))
            .expect("open slot lock")
            .try_exclusive()
            .expect("flock slot lock")
            .expect("slot lock already held")
    }

    pub fn slot_is_locked(&self, machine: &Machine, slot: u32) -> bool {
        rbh_common::locks::probe_busy(&self.state_dir.join(machine.slot_lock_file(slot)))
            .expect("probe slot lock")
    }

    /// A preconfigured `rbh` command: `<local_system> 3600 1 7200` with the
    /// sandbox environment and piped stdio.
    pub fn command(&self, local_system: &str) -> Command {
        let path = format!(
            "{}:{}",
            self.bin_dir.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_rbh"));
        cmd.args([local_system, "3600", "1", "7200"])
            .env("NIX_CURRENT_LOAD", &self.state_dir)
            .env("NIX_REMOTE_SYSTEMS", &self.machines_file)
            .env("NIX_CONF_DIR", &self.conf_dir)
            .env("RBH_TEST_MOCK_WORKER", env!("CARGO_BIN_EXE_rbh-mock-worker"))
            .env("PATH", path)
            .env_remove("RUST_LOG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Run the hook to completion, feeding `stdin_lines` and closing stdin.
    pub fn run(
        &self,
        local_system: &str,
        stdin_lines: &[&str],
        extra_env: &[(&str, &str)],
    ) -> Output {
        let mut cmd = self.command(local_system);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        let mut child = cmd.spawn().expect("spawn rbh");
        {
            let mut stdin = child.stdin.take().expect("rbh stdin");
            for line in stdin_lines {
                writeln!(stdin, "{line}").expect("write to rbh");
            }
        }
        child.wait_with_output().expect("collect rbh output")
    }
}

fn write_shim(path: &Path, content: &str) {
    fs::write(path, content).expect("write shim");
    let mut perms = fs::metadata(path).expect("shim metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("make shim executable");
}

/// Reply lines (`# ...`) scraped from stderr, in order.
pub fn replies(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .filter(|line| line.starts_with("# "))
        .map(str::to_string)
        .collect()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
