//! Worker stand-in for tests.
//!
//! Speaks the wire protocol on stdin/stdout so integration tests can run
//! the hook end to end without SSH or a real store. Behavior is scripted
//! through `RBH_MOCK_*` environment variables; the `rbh-mock-worker` binary
//! is what the fake `ssh` and `nix-store` shims on `PATH` exec into.
//!
//! Export streams use a toy self-delimiting framing (`1 <path>` records,
//! `0` terminator). The hook never parses export data, so the only parties
//! that must agree on it are this module's `serve`, `export`, and `import`
//! modes.

use crate::wire;
use std::io::{self, BufReader, BufWriter, Read, Write};

/// Scripted behavior, resolved from `RBH_MOCK_*` variables by the binary.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Status returned for a build command (`RBH_MOCK_BUILD_STATUS`).
    pub build_status: u64,
    /// Error message sent with a nonzero status (`RBH_MOCK_BUILD_ERROR`).
    pub build_error: String,
    /// Paths the worker claims to already have (`RBH_MOCK_REMOTE_VALID`,
    /// comma-joined). `None` means everything is valid.
    pub remote_valid: Option<Vec<String>>,
    /// Paths the fake local store claims valid (`RBH_MOCK_LOCAL_VALID`).
    pub local_valid: Vec<String>,
}

impl MockBehavior {
    pub fn success() -> Self {
        Self {
            build_status: 0,
            build_error: "mock build failure".to_string(),
            remote_valid: None,
            local_valid: Vec::new(),
        }
    }

    pub fn from_env() -> Self {
        let mut behavior = Self::success();
        if let Ok(status) = std::env::var("RBH_MOCK_BUILD_STATUS") {
            behavior.build_status = status.parse().unwrap_or(0);
        }
        if let Ok(msg) = std::env::var("RBH_MOCK_BUILD_ERROR") {
            behavior.build_error = msg;
        }
        if let Ok(valid) = std::env::var("RBH_MOCK_REMOTE_VALID") {
            behavior.remote_valid = Some(split_list(&valid));
        }
        if let Ok(valid) = std::env::var("RBH_MOCK_LOCAL_VALID") {
            behavior.local_valid = split_list(&valid);
        }
        behavior
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn bad_stream(what: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.into())
}

/// Run a worker session: greeting, then commands until end of stream.
pub fn serve<R: Read, W: Write>(behavior: &MockBehavior, input: R, output: W) -> io::Result<()> {
    let mut from = BufReader::new(input);
    let mut to = BufWriter::new(output);

    let magic = wire::read_u64(&mut from)?;
    if magic != wire::WORKER_MAGIC_1 {
        return Err(bad_stream(format!("unexpected client magic {magic:#x}")));
    }
    let client_version = wire::read_u64(&mut from)?;
    if wire::major_version(client_version) != wire::major_version(wire::PROTOCOL_VERSION) {
        return Err(bad_stream(format!(
            "unsupported client version {client_version:#x}"
        )));
    }
    wire::write_u64(&mut to, wire::WORKER_MAGIC_2)?;
    wire::write_u64(&mut to, wire::PROTOCOL_VERSION)?;
    to.flush()?;

    loop {
        let cmd = match wire::read_u64(&mut from) {
            Ok(cmd) => cmd,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match cmd {
            wire::CMD_QUERY_VALID_PATHS => {
                let _lock = wire::read_u64(&mut from)?;
                let _substitute = wire::read_u64(&mut from)?;
                let paths = wire::read_strings(&mut from)?;
                let valid: Vec<String> = match &behavior.remote_valid {
                    None => paths,
                    Some(known) => paths
                        .into_iter()
                        .filter(|p| known.contains(p))
                        .collect(),
                };
                wire::write_strings(&mut to, &valid)?;
                to.flush()?;
            }
            wire::CMD_IMPORT_PATHS => {
                consume_export_stream(&mut from)?;
                wire::write_u64(&mut to, 1)?;
                to.flush()?;
            }
            wire::CMD_EXPORT_PATHS => {
                let _sign = wire::read_u64(&mut from)?;
                let paths = wire::read_strings(&mut from)?;
                write_export_stream(&mut to, &paths)?;
                to.flush()?;
            }
            wire::CMD_BUILD_PATHS => {
                let _drvs = wire::read_strings(&mut from)?;
                let _max_silent_time = wire::read_u64(&mut from)?;
                let _build_timeout = wire::read_u64(&mut from)?;
                wire::write_u64(&mut to, behavior.build_status)?;
                if behavior.build_status != 0 {
                    wire::write_string(&mut to, &behavior.build_error)?;
                }
                to.flush()?;
            }
            other => return Err(bad_stream(format!("unknown command {other}"))),
        }
    }
}

/// Write the toy export stream for `paths`.
pub fn write_export_stream<W: Write>(w: &mut W, paths: &[String]) -> io::Result<()> {
    for path in paths {
        wire::write_u64(w, 1)?;
        wire::write_string(w, path)?;
    }
    wire::write_u64(w, 0)
}

/// Consume a toy export stream, returning the paths it carried.
pub fn consume_export_stream<R: Read>(r: &mut R) -> io::Result<Vec<String>> {
    let mut paths = Vec::new();
    loop {
        match wire::read_u64(r)? {
            0 => return Ok(paths),
            1 => paths.push(wire::read_string(r)?),
            other => return Err(bad_stream(format!("bad export marker {other}"))),
        }
    }
}

/// Entry point for the fake `nix-store` shim: handles `--check-validity`,
/// `--export [--sign]`, and `--import`, returning the process exit code.
pub fn store_main(behavior: &MockBehavior, args: &[String]) -> io::Result<i32> {
    match args.first().map(String::as_str) {
        Some("--check-validity") => {
            let path = args.get(1).ok_or_else(|| bad_stream("missing path"))?;
            Ok(if behavior.local_valid.contains(path) { 0 } else { 1 })
        }
        Some("--export") => {
            let paths: Vec<String> = args[1..]
                .iter()
                .filter(|a| *a != "--sign")
                .cloned()
                .collect();
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            write_export_stream(&mut out, &paths)?;
            out.flush()?;
            Ok(0)
        }
        Some("--import") => {
            let stdin = io::stdin();
            let mut input = BufReader::new(stdin.lock());
            let paths = consume_export_stream(&mut input)?;
            // Real imports print the imported paths; tests scrape this.
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for path in &paths {
                writeln!(out, "{path}")?;
            }
            Ok(0)
        }
        other => Err(bad_stream(format!("unsupported store operation {other:?}"))),
    }
}
