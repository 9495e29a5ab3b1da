//! Slot placement under the global admission lock.
//!
//! Placement is the only code that acquires slot locks, and it only does so
//! while holding the main lock, so the occupancy every hook observes during
//! its probe is exactly the occupancy at the moment it selects. The main
//! lock is dropped before any network traffic; the slot lock of an accepted
//! build stays held until the process exits.

use crate::locks::{self, HeldLock};
use crate::machines::{Machine, split_features};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use tracing::debug;

// =========================================================================
// Request
// =========================================================================

/// One build request as read from the parent daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    /// The parent permits building locally instead.
    pub am_willing: bool,
    /// Platform the build needs.
    pub needed_system: String,
    /// Derivation store path (opaque).
    pub drv_path: String,
    /// Feature tags the build requires.
    pub required_features: Vec<String>,
}

impl BuildRequest {
    /// Parse a request line: `<amWilling> <neededSystem> <drvPath>
    /// <requiredFeatures>`, the last field comma-joined and possibly absent.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let am_willing = match fields.next()? {
            "0" => false,
            "1" => true,
            _ => return None,
        };
        let needed_system = fields.next()?.to_string();
        let drv_path = fields.next()?.to_string();
        let required_features = fields.next().map(split_features).unwrap_or_default();
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            am_willing,
            needed_system,
            drv_path,
            required_features,
        })
    }

    pub fn requires(&self, feature: &str) -> bool {
        self.required_features.iter().any(|f| f == feature)
    }
}

// =========================================================================
// Decision
// =========================================================================

/// Outcome of one placement round.
#[derive(Debug)]
pub enum Placement {
    /// A slot was locked; the caller owns it until process exit.
    Accept(PlacedBuild),
    /// Every capable machine is at capacity right now.
    Postpone,
    /// No enabled machine will ever serve this request in this process.
    Decline,
}

/// An accepted placement: the chosen machine and its held slot lock.
#[derive(Debug)]
pub struct PlacedBuild {
    pub machine: Machine,
    pub slot: u32,
    pub lock: HeldLock,
}

// =========================================================================
// Engine
// =========================================================================

struct Candidate<'a> {
    machine: &'a Machine,
    load: u32,
    free: u32,
}

/// Effective load used as the primary ranking key. The `0.4999` bias is
/// round-half-up without landing on an exact `.5` in binary floats; keep it
/// bit-exact so concurrent hooks rank machines identically.
pub fn scaled_load(load: u32, speed_factor: f64) -> u64 {
    (f64::from(load) / speed_factor + 0.4999).floor() as u64
}

/// Select a slot for `req`, or decide postpone/decline.
///
/// `disabled` holds hosts this process has given up on (connect failures).
/// `can_build_locally` is `amWilling && localSystem == neededSystem`; when
/// it holds, a busy fleet declines instead of postponing so the parent
/// falls back to a local build.
pub fn place(
    machines: &[Machine],
    disabled: &HashSet<String>,
    req: &BuildRequest,
    can_build_locally: bool,
    state_dir: &Path,
) -> io::Result<Placement> {
    let _main = locks::acquire_main(state_dir)?;

    let mut right_type = false;
    let mut candidates: Vec<Candidate<'_>> = Vec::new();

    for machine in machines {
        if disabled.contains(&machine.host_name) {
            continue;
        }
        if !machine.builds_for(&req.needed_system) {
            continue;
        }
        if !req
            .required_features
            .iter()
            .all(|f| machine.supports(f))
        {
            continue;
        }
        if !machine.mandatory_features.iter().all(|f| req.requires(f)) {
            continue;
        }
        // Fully eligible; from here on only slot occupancy decides, which
        // is what separates a postpone from a decline.
        right_type = true;

        let mut load = 0u32;
        let mut free = None;
        for slot in 0..machine.max_jobs {
            let path = state_dir.join(machine.slot_lock_file(slot));
            if locks::probe_busy(&path)? {
                load += 1;
            } else if free.is_none() {
                free = Some(slot);
            }
        }
        debug!(
            host = %machine.host_name,
            load,
            free = ?free,
            speed = machine.speed_factor,
            "placement candidate"
        );
        if let Some(free) = free {
            candidates.push(Candidate {
                machine,
                load,
                free,
            });
        }
    }

    if candidates.is_empty() {
        return Ok(if right_type && !can_build_locally {
            Placement::Postpone
        } else {
            Placement::Decline
        });
    }

    candidates.sort_by(|a, b| {
        scaled_load(a.load, a.machine.speed_factor)
            .cmp(&scaled_load(b.load, b.machine.speed_factor))
            .then(b.machine.speed_factor.total_cmp(&a.machine.speed_factor))
            .then(a.load.cmp(&b.load))
    });
    let best = &candidates[0];

    let path = state_dir.join(best.machine.slot_lock_file(best.free));
    let lock = locks::LockFile::open(&path)?
        .try_exclusive()?
        .ok_or_else(|| {
            io::Error::other(format!(
                "slot lock {} taken while the main lock was held; scheduler invariant violated",
                path.display()
            ))
        })?;
    lock.touch()?;

    debug!(
        host = %best.machine.host_name,
        slot = best.free,
        drv = %req.drv_path,
        "slot acquired"
    );
    Ok(Placement::Accept(PlacedBuild {
        machine: best.machine.clone(),
        slot: best.free,
        lock,
    }))
}

// =========================================================================
// Tests
// =========================================================================
