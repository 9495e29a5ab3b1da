//! Remote-build dispatcher hook.
//!
//! The local build daemon spawns one `rbh` process per build request and
//! talks to it over stdin/stderr: request lines come in on stdin, one-line
//! `# accept` / `# postpone` / `# decline` replies go out on stderr. An
//! accepted build is driven to completion on a remote worker and the
//! process exits; rejected requests loop until the parent closes stdin.

#![forbid(unsafe_code)]

mod hook;
mod session;

use anyhow::{Context, Result};
use clap::Parser;
use rbh_common::config::HookEnv;
use rbh_common::machines;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rbh")]
#[command(author, version, about = "Remote build dispatcher hook")]
struct Cli {
    /// Platform identifier of the local machine (e.g. x86_64-linux).
    local_system: String,

    /// Seconds of build silence after which the worker gives up.
    max_silent_time: u64,

    /// Emit an `@ build-remote` trace line on stderr for accepted builds.
    print_build_trace: String,

    /// Seconds after which the worker aborts the build outright.
    build_timeout: u64,
}

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("rbh: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let env = HookEnv::from_env();
    init_logging(env.debug_hook);

    let machines = machines::load_machines(&env.machines_file)
        .with_context(|| format!("loading {}", env.machines_file.display()))?;
    debug!(
        machines = machines.len(),
        state_dir = %env.state_dir.display(),
        "registry loaded"
    );

    let invocation = hook::Invocation {
        local_system: cli.local_system,
        max_silent_time: cli.max_silent_time,
        print_build_trace: is_truthy(&cli.print_build_trace),
        build_timeout: cli.build_timeout,
    };
    hook::run(&invocation, &env, &machines)
}

/// Logs go to stderr; the parent forwards any stderr line that does not
/// start with `# ` as build output, so log formatting never collides with
/// the reply channel.
fn init_logging(debug_hook: bool) {
    let default = if debug_hook { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();
}

fn is_truthy(s: &str) -> bool {
    !matches!(s.trim(), "" | "0" | "false" | "no" | "off")
}
