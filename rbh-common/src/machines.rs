//! The static worker list.
//!
//! Machines are read once at startup from a plain-text file: one machine
//! per line, whitespace-separated fields, `#` starting a comment that runs
//! to end of line. Fields are `hostName systemTypes sshKeys maxJobs
//! [speedFactor] [supportedFeatures] [mandatoryFeatures]`, with the comma
//! lists optional.

use crate::errors::MachinesError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;

/// A remote worker as declared in the machines file.
///
/// Immutable after load. Whether a machine is still worth talking to in
/// this process is tracked by the request loop, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    /// SSH host name.
    pub host_name: String,
    /// Platform identifiers this machine can build for (non-empty, file order).
    pub system_types: Vec<String>,
    /// Path to the SSH identity file.
    pub ssh_keys: String,
    /// Number of concurrent build slots.
    pub max_jobs: u32,
    /// Relative throughput weight; preferred at equal load.
    pub speed_factor: f64,
    /// Feature tags the machine advertises. Always contains every
    /// mandatory feature.
    pub supported_features: Vec<String>,
    /// Features a build must explicitly request to land here.
    pub mandatory_features: Vec<String>,
}

impl Machine {
    /// Whether this machine can build for `system`.
    pub fn builds_for(&self, system: &str) -> bool {
        self.system_types.iter().any(|s| s == system)
    }

    pub fn supports(&self, feature: &str) -> bool {
        self.supported_features.iter().any(|f| f == feature)
    }

    /// File name of the lock guarding `slot` on this machine, relative to
    /// the state directory: `<systemA+systemB>-<host>-<slot>`.
    pub fn slot_lock_file(&self, slot: u32) -> String {
        format!("{}-{}-{}", self.system_types.join("+"), self.host_name, slot)
    }

    /// Render the machine back into its config-file line. Optional fields
    /// are omitted when empty; parsing the result yields this machine back.
    pub fn to_config_line(&self) -> String {
        let mut line = format!(
            "{} {} {} {} {}",
            self.host_name,
            self.system_types.join(","),
            self.ssh_keys,
            self.max_jobs,
            format_speed(self.speed_factor),
        );
        if !self.supported_features.is_empty() {
            line.push(' ');
            line.push_str(&self.supported_features.join(","));
        }
        if !self.mandatory_features.is_empty() {
            line.push(' ');
            line.push_str(&self.mandatory_features.join(","));
        }
        line
    }
}

fn format_speed(speed: f64) -> String {
    if speed.fract() == 0.0 {
        format!("{}", speed as u64)
    } else {
        format!("{speed}")
    }
}

/// Split a comma-joined tag list, dropping empty segments.
pub fn split_features(s: &str) -> Vec<String> {
    s.split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load the machine registry.
///
/// A missing file yields an empty registry (the hook then declines every
/// request); a malformed file aborts startup.
pub fn load_machines(path: &Path) -> Result<Vec<Machine>, MachinesError> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_machines(&content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(MachinesError::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Parse machines-file content.
pub fn parse_machines(content: &str) -> Result<Vec<Machine>, MachinesError> {
    let mut machines = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let machine = parse_machine_line(line).map_err(|reason| MachinesError::Malformed {
            line: idx + 1,
            reason,
        })?;
        // A machine with no slots can never be selected and must not make
        // requests look placeable, so it does not enter the registry at all.
        if machine.max_jobs == 0 {
            continue;
        }
        machines.push(machine);
    }
    Ok(machines)
}

fn parse_machine_line(line: &str) -> Result<Machine, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(format!(
            "expected at least 4 fields (hostName systemTypes sshKeys maxJobs), got {}",
            fields.len()
        ));
    }
    if fields.len() > 7 {
        return Err(format!("expected at most 7 fields, got {}", fields.len()));
    }

    let host_name = fields[0].to_string();
    let system_types = split_features(fields[1]);
    if system_types.is_empty() {
        return Err(format!("machine '{host_name}' has no system types"));
    }
    let ssh_keys = fields[2].to_string();
    let max_jobs: u32 = fields[3]
        .parse()
        .map_err(|_| format!("invalid maxJobs '{}'", fields[3]))?;
    let speed_factor: f64 = match fields.get(4) {
        Some(s) => s
            .parse()
            .map_err(|_| format!("invalid speedFactor '{s}'"))?,
        None => 1.0,
    };
    if speed_factor < 1.0 || speed_factor.is_nan() {
        return Err(format!("speedFactor must be >= 1.0, got {speed_factor}"));
    }

    let mut supported_features = fields.get(5).map_or_else(Vec::new, |s| split_features(s));
    let mandatory_features = fields.get(6).map_or_else(Vec::new, |s| split_features(s));

    // A machine implicitly supports everything it makes mandatory.
    for feature in &mandatory_features {
        if !supported_features.iter().any(|f| f == feature) {
            supported_features.push(feature.clone());
        }
    }

    Ok(Machine {
        host_name,
        system_types,
        ssh_keys,
        max_jobs,
        speed_factor,
        supported_features,
        mandatory_features,
    })
}
