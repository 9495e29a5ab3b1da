//! CLI contract and environment plumbing.

use crate::common::{HookFixture, init_test_logging, stderr_of};
use std::process::Command;

#[test]
fn missing_arguments_are_a_usage_error() {
    init_test_logging();
    let output = Command::new(env!("CARGO_BIN_EXE_rbh"))
        .output()
        .expect("run rbh without args");

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "stderr: {stderr}");
}

#[test]
fn version_flag_reports_the_binary() {
    init_test_logging();
    let output = Command::new(env!("CARGO_BIN_EXE_rbh"))
        .arg("--version")
        .output()
        .expect("run rbh --version");

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("rbh"));
}

#[test]
fn debug_hook_logs_placement_candidates() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 1 1\n");
    let machine = fixture.machine(0);
    let _slot0 = fixture.hold_slot(&machine, 0);

    let output = fixture.run(
        "aarch64-linux",
        &["1 x86_64-linux /nix/store/abc-x.drv "],
        &[("NIX_DEBUG_HOOK", "1")],
    );

    assert!(output.status.success());
    assert!(
        stderr_of(&output).contains("placement candidate"),
        "expected per-candidate debug output: {}",
        stderr_of(&output)
    );
}

#[test]
fn malformed_machines_file_aborts_with_a_diagnostic() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k lots-of-jobs\n");
    // No request lines: the hook must die during startup, before replying.
    let output = fixture.run("x86_64-linux", &[], &[]);

    assert_eq!(output.status.code(), Some(1));
    assert!(
        stderr_of(&output).contains("invalid maxJobs"),
        "stderr: {}",
        stderr_of(&output)
    );
}
