//! The request loop.
//!
//! Two nested loops: the outer one reads request lines from the parent and
//! replies; the inner one retries placement against the remaining machines
//! when the SSH connect to a selected host fails. The main lock is taken
//! afresh inside `placement::place` for every inner iteration, so it is
//! never held across network traffic.

use crate::session;
use anyhow::{Context, Result, anyhow};
use rbh_common::config::HookEnv;
use rbh_common::errors::SessionError;
use rbh_common::machines::Machine;
use rbh_common::placement::{self, BuildRequest, PlacedBuild, Placement};
use std::collections::HashSet;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

/// The four positional arguments of the hook.
pub struct Invocation {
    pub local_system: String,
    pub max_silent_time: u64,
    pub print_build_trace: bool,
    pub build_timeout: u64,
}

/// Reply tokens on the stderr channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
    Accept,
    Decline,
    Postpone,
}

impl Reply {
    fn token(self) -> &'static str {
        match self {
            Reply::Accept => "accept",
            Reply::Decline => "decline",
            Reply::Postpone => "postpone",
        }
    }
}

fn send_reply(reply: Reply) -> io::Result<()> {
    let mut stderr = io::stderr().lock();
    writeln!(stderr, "# {}", reply.token())?;
    stderr.flush()
}

fn next_line(input: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut buf = String::new();
    if input.read_line(&mut buf)? == 0 {
        return Ok(None);
    }
    while buf.ends_with(['\n', '\r']) {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Run the hook until the parent closes stdin or a build is accepted.
/// Returns the process exit code.
pub fn run(invocation: &Invocation, env: &HookEnv, machines: &[Machine]) -> Result<i32> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut disabled: HashSet<String> = HashSet::new();

    loop {
        let Some(line) = next_line(&mut input)? else {
            // Parent is done with us.
            return Ok(0);
        };
        let req = BuildRequest::parse(&line)
            .ok_or_else(|| anyhow!("malformed request line from parent: {line:?}"))?;
        let can_build_locally = req.am_willing && invocation.local_system == req.needed_system;

        // Inner loop: placement, then connect; a connect failure disables
        // the machine for the rest of this process and tries the next one.
        let accepted = loop {
            let decision =
                placement::place(machines, &disabled, &req, can_build_locally, &env.state_dir)
                    .context("placement failed")?;
            match decision {
                Placement::Decline => {
                    send_reply(Reply::Decline)?;
                    break None;
                }
                Placement::Postpone => {
                    send_reply(Reply::Postpone)?;
                    break None;
                }
                Placement::Accept(placed) => match session::connect(&placed.machine, env) {
                    Ok(channel) => break Some((placed, channel)),
                    Err(err) => {
                        warn!(
                            host = %placed.machine.host_name,
                            %err,
                            "connect failed, disabling machine for this process"
                        );
                        disabled.insert(placed.machine.host_name.clone());
                        // Dropping `placed` releases the slot for others.
                    }
                },
            }
        };
        let Some((placed, channel)) = accepted else {
            continue;
        };

        return drive_accepted_build(invocation, env, &req, placed, channel, &mut input);
    }
}

/// Everything after the accept reply. The slot lock inside `placed` stays
/// held until the process exits.
fn drive_accepted_build(
    invocation: &Invocation,
    env: &HookEnv,
    req: &BuildRequest,
    placed: PlacedBuild,
    channel: session::WorkerChannel,
    input: &mut impl BufRead,
) -> Result<i32> {
    send_reply(Reply::Accept)?;

    let inputs = read_path_line(input).context("reading input paths from parent")?;
    let outputs = read_path_line(input).context("reading output paths from parent")?;

    if invocation.print_build_trace {
        eprintln!("@ build-remote {} {}", req.drv_path, placed.machine.host_name);
    }
    info!(
        host = %placed.machine.host_name,
        slot = placed.slot,
        drv = %req.drv_path,
        inputs = inputs.len(),
        outputs = outputs.len(),
        "building remotely"
    );

    let options = session::BuildOptions {
        max_silent_time: invocation.max_silent_time,
        build_timeout: invocation.build_timeout,
        sign: env.wants_signing(),
    };
    match session::run_build(channel, env, &req.drv_path, &inputs, &outputs, &options) {
        Ok(()) => Ok(0),
        Err(err) => {
            if let SessionError::RemoteBuildFailed { status, .. } = &err {
                // The Display impl is the parent-facing error line.
                eprintln!("{err}");
                Ok(exit_code_for(*status))
            } else {
                Err(err.into())
            }
        }
    }
}

fn read_path_line(input: &mut impl BufRead) -> Result<Vec<String>> {
    let line = next_line(input)?.ok_or_else(|| anyhow!("parent closed stdin mid-build"))?;
    Ok(line.split_whitespace().map(str::to_string).collect())
}

/// A worker status is a u64, an exit code is not; nonzero saturates into
/// the byte a parent process can actually observe.
fn exit_code_for(status: u64) -> i32 {
    status.clamp(1, 255) as i32
}
