//! SSH transport and the remote build driver.
//!
//! A session is an `ssh` child process running the worker command on the
//! chosen host; its stdin/stdout are the protocol channel and its stderr is
//! inherited, so remote build output streams straight through to the
//! parent. The driver uploads the closure (serialized per host by the
//! upload lock), runs the build, and imports whatever outputs the local
//! store is missing.

use rbh_common::config::{self, HookEnv};
use rbh_common::errors::SessionError;
use rbh_common::locks;
use rbh_common::machines::Machine;
use rbh_common::wire;
use std::collections::HashSet;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, info};
use which::which;

/// An established protocol channel to a remote worker.
pub struct WorkerChannel {
    host: String,
    child: Child,
    to: BufWriter<ChildStdin>,
    from: BufReader<ChildStdout>,
}

/// Knobs forwarded to the worker for one build.
pub struct BuildOptions {
    pub max_silent_time: u64,
    pub build_timeout: u64,
    pub sign: bool,
}

fn connect_err(host: &str, reason: impl std::fmt::Display) -> SessionError {
    SessionError::Connect {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

fn chan_err(host: &str, source: io::Error) -> SessionError {
    SessionError::Io {
        host: host.to_string(),
        source,
    }
}

// =========================================================================
// Connecting
// =========================================================================

/// Open an SSH channel to `machine` and exchange the worker greeting.
///
/// Any failure up to and including the greeting is a connect failure; the
/// request loop reacts by disabling the machine and re-running placement.
pub fn connect(machine: &Machine, env: &HookEnv) -> Result<WorkerChannel, SessionError> {
    let host = machine.host_name.as_str();
    let ssh = which("ssh").map_err(|e| connect_err(host, format!("ssh not found: {e}")))?;

    let mut command = Command::new(ssh);
    command
        .args(&env.ssh_opts)
        .arg("-i")
        .arg(&machine.ssh_keys)
        .arg("-x")
        .arg("-a")
        .arg(&machine.host_name)
        .args(["nix-store", "--serve", "--write"])
        .envs(config::neutral_child_env())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());

    let mut child = command.spawn().map_err(|e| connect_err(host, e))?;
    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(connect_err(host, "child pipes were not captured"));
    };

    let mut channel = WorkerChannel {
        host: host.to_string(),
        child,
        to: BufWriter::new(stdin),
        from: BufReader::new(stdout),
    };
    if let Err(e) = channel.greet() {
        let _ = channel.child.kill();
        let _ = channel.child.wait();
        return Err(connect_err(host, e));
    }
    Ok(channel)
}

impl WorkerChannel {
    fn greet(&mut self) -> io::Result<()> {
        wire::write_u64(&mut self.to, wire::WORKER_MAGIC_1)?;
        wire::write_u64(&mut self.to, wire::PROTOCOL_VERSION)?;
        self.to.flush()?;

        let magic = wire::read_u64(&mut self.from)?;
        if magic != wire::WORKER_MAGIC_2 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected worker magic {magic:#x}"),
            ));
        }
        let version = wire::read_u64(&mut self.from)?;
        if wire::major_version(version) != wire::major_version(wire::PROTOCOL_VERSION) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("incompatible worker protocol version {version:#x}"),
            ));
        }
        debug!(host = %self.host, version = %format_args!("{version:#x}"), "worker greeted");
        Ok(())
    }
}

// =========================================================================
// Driving a build
// =========================================================================

/// Upload the closure, run the build, and import missing outputs.
///
/// Consumes the channel: the output import hands the worker stream to the
/// import process wholesale.
pub fn run_build(
    mut channel: WorkerChannel,
    env: &HookEnv,
    drv_path: &str,
    inputs: &[String],
    outputs: &[String],
    options: &BuildOptions,
) -> Result<(), SessionError> {
    let host = channel.host.clone();

    upload_closure(&mut channel, env, drv_path, inputs, options.sign)?;

    (|| {
        wire::write_u64(&mut channel.to, wire::CMD_BUILD_PATHS)?;
        wire::write_strings(&mut channel.to, &[drv_path])?;
        wire::write_u64(&mut channel.to, options.max_silent_time)?;
        wire::write_u64(&mut channel.to, options.build_timeout)?;
        channel.to.flush()
    })()
    .map_err(|e| chan_err(&host, e))?;

    let status = wire::read_u64(&mut channel.from).map_err(|e| chan_err(&host, e))?;
    if status != 0 {
        let msg = wire::read_string(&mut channel.from).map_err(|e| chan_err(&host, e))?;
        return Err(SessionError::RemoteBuildFailed { host, status, msg });
    }
    info!(host = %host, drv = drv_path, "remote build finished");

    let store = nix_store().map_err(|e| chan_err(&host, e))?;
    let mut wanted = Vec::with_capacity(outputs.len());
    for path in outputs {
        if !is_valid_locally(&store, path).map_err(|e| chan_err(&host, e))? {
            wanted.push(path.clone());
        }
    }
    if wanted.is_empty() {
        debug!(host = %host, "all outputs already valid locally");
        return Ok(());
    }

    (|| {
        wire::write_u64(&mut channel.to, wire::CMD_EXPORT_PATHS)?;
        wire::write_u64(&mut channel.to, 0)?;
        wire::write_strings(&mut channel.to, &wanted)?;
        channel.to.flush()
    })()
    .map_err(|e| chan_err(&host, e))?;

    import_outputs(channel, &store, &wanted)
}

// =========================================================================
// Closure upload (serialized per host)
// =========================================================================

fn upload_closure(
    channel: &mut WorkerChannel,
    env: &HookEnv,
    drv_path: &str,
    inputs: &[String],
    sign: bool,
) -> Result<(), SessionError> {
    let host = channel.host.clone();
    let guard = locks::acquire_upload(&env.state_dir, &host, locks::UPLOAD_LOCK_TIMEOUT)
        .map_err(|e| chan_err(&host, e))?;
    let result = copy_closure(channel, drv_path, inputs, sign);
    drop(guard);
    result
}

fn copy_closure(
    channel: &mut WorkerChannel,
    drv_path: &str,
    inputs: &[String],
    sign: bool,
) -> Result<(), SessionError> {
    let host = channel.host.clone();
    let mut paths: Vec<&str> = Vec::with_capacity(inputs.len() + 1);
    paths.push(drv_path);
    paths.extend(inputs.iter().map(String::as_str));

    (|| {
        wire::write_u64(&mut channel.to, wire::CMD_QUERY_VALID_PATHS)?;
        wire::write_u64(&mut channel.to, 1)?; // lock the paths remotely
        wire::write_u64(&mut channel.to, 0)?; // no substitution
        wire::write_strings(&mut channel.to, &paths)?;
        channel.to.flush()
    })()
    .map_err(|e| chan_err(&host, e))?;

    let valid = wire::read_strings(&mut channel.from).map_err(|e| chan_err(&host, e))?;
    let valid: HashSet<&str> = valid.iter().map(String::as_str).collect();
    let missing: Vec<&str> = paths.iter().copied().filter(|p| !valid.contains(p)).collect();
    if missing.is_empty() {
        debug!(host = %host, "worker already has the whole closure");
        return Ok(());
    }
    debug!(host = %host, missing = missing.len(), sign, "uploading closure");

    stream_export(channel, &missing, sign).map_err(|e| chan_err(&host, e))?;

    let confirm = wire::read_u64(&mut channel.from).map_err(|e| chan_err(&host, e))?;
    if confirm != 1 {
        return Err(chan_err(
            &host,
            io::Error::other("worker did not confirm the import"),
        ));
    }
    Ok(())
}

/// Pipe `nix-store --export` of the missing paths into the worker.
fn stream_export(channel: &mut WorkerChannel, missing: &[&str], sign: bool) -> io::Result<()> {
    wire::write_u64(&mut channel.to, wire::CMD_IMPORT_PATHS)?;
    channel.to.flush()?;

    let mut command = Command::new(nix_store()?);
    command.arg("--export");
    if sign {
        command.arg("--sign");
    }
    command
        .args(missing)
        .stdin(Stdio::null())
        .stdout(Stdio::piped());
    let mut child = command.spawn()?;
    let Some(mut export) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return Err(io::Error::other("export pipe was not captured"));
    };
    io::copy(&mut export, &mut channel.to)?;
    channel.to.flush()?;

    let status = child.wait()?;
    if !status.success() {
        return Err(io::Error::other(format!(
            "nix-store --export failed with {status}"
        )));
    }
    Ok(())
}

// =========================================================================
// Output import
// =========================================================================

/// Feed the worker's export stream into `nix-store --import`.
///
/// The worker stream is handed to the import process as its stdin; the
/// stream is self-delimiting, so the import exits on its own while the
/// channel stays open.
fn import_outputs(
    channel: WorkerChannel,
    store: &Path,
    paths: &[String],
) -> Result<(), SessionError> {
    let WorkerChannel {
        host,
        child: ssh,
        to,
        from,
    } = channel;

    // The worker sends nothing unsolicited, so every byte it has written so
    // far was consumed by the replies above and the buffer must be empty.
    if !from.buffer().is_empty() {
        return Err(chan_err(
            &host,
            io::Error::other("unread worker data ahead of the export stream"),
        ));
    }
    let from = from.into_inner();

    let status = Command::new(store)
        .arg("--import")
        .env("NIX_HELD_LOCKS", paths.join(" "))
        .envs(config::neutral_child_env())
        .stdin(Stdio::from(from))
        .stdout(Stdio::null())
        .status()
        .map_err(|e| chan_err(&host, e))?;
    if !status.success() {
        return Err(chan_err(
            &host,
            io::Error::other(format!("importing outputs failed with {status}")),
        ));
    }
    info!(host = %host, outputs = paths.len(), "outputs imported");

    // Closing our end tells the worker the session is over; the process is
    // about to exit, so the ssh child is not waited on.
    drop(to);
    drop(ssh);
    Ok(())
}

// =========================================================================
// Local store helpers
// =========================================================================

fn nix_store() -> io::Result<PathBuf> {
    which("nix-store").map_err(|e| io::Error::other(format!("nix-store not found: {e}")))
}

fn is_valid_locally(store: &Path, path: &str) -> io::Result<bool> {
    let status = Command::new(store)
        .args(["--check-validity", path])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    Ok(status.success())
}
