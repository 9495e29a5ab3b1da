//! End-to-end request/reply and build scenarios.

use crate::common::{HookFixture, init_test_logging, replies, stderr_of};

const DRV: &str = "/nix/store/abc-x.drv";

#[test]
fn declines_when_no_platform_matches() {
    init_test_logging();
    crate::test_log!("TEST START: declines_when_no_platform_matches");

    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let output = fixture.run("x86_64-linux", &[&format!("1 aarch64-linux {DRV} ")], &[]);

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(replies(&output), vec!["# decline"]);
}

#[test]
fn declines_on_an_empty_machines_file() {
    init_test_logging();
    let fixture = HookFixture::new("# no machines yet\n");
    let output = fixture.run("x86_64-linux", &[&format!("0 x86_64-linux {DRV} ")], &[]);

    assert!(output.status.success());
    assert_eq!(replies(&output), vec!["# decline"]);
}

#[test]
fn declines_when_mandatory_feature_is_not_requested() {
    init_test_logging();
    let fixture = HookFixture::new("sec x86_64-linux /k 1 1 kvm kvm\n");
    let output = fixture.run("aarch64-linux", &[&format!("0 x86_64-linux {DRV} ")], &[]);

    assert!(output.status.success());
    assert_eq!(replies(&output), vec!["# decline"]);
}

#[test]
fn postpones_while_every_slot_is_held() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let machine = fixture.machine(0);
    let _slot0 = fixture.hold_slot(&machine, 0);
    let _slot1 = fixture.hold_slot(&machine, 1);

    // The local system differs, so a busy fleet postpones rather than
    // handing the build back for a local fallback.
    let output = fixture.run("aarch64-linux", &[&format!("1 x86_64-linux {DRV} ")], &[]);

    assert!(output.status.success());
    assert_eq!(replies(&output), vec!["# postpone"]);
}

#[test]
fn busy_fleet_declines_when_local_fallback_is_possible() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 1 1\n");
    let machine = fixture.machine(0);
    let _slot0 = fixture.hold_slot(&machine, 0);

    let output = fixture.run("x86_64-linux", &[&format!("1 x86_64-linux {DRV} ")], &[]);

    assert!(output.status.success());
    assert_eq!(replies(&output), vec!["# decline"]);
}

#[test]
fn keeps_answering_requests_until_stdin_closes() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let output = fixture.run(
        "x86_64-linux",
        &[
            &format!("1 aarch64-linux {DRV} "),
            &format!("1 riscv64-linux {DRV} "),
        ],
        &[],
    );

    assert!(output.status.success());
    assert_eq!(replies(&output), vec!["# decline", "# decline"]);
}

#[test]
fn exits_cleanly_on_immediate_eof() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let output = fixture.run("x86_64-linux", &[], &[]);

    assert!(output.status.success());
    assert!(replies(&output).is_empty());
}

#[test]
fn accepts_builds_and_imports_outputs() {
    init_test_logging();
    crate::test_log!("TEST START: accepts_builds_and_imports_outputs");

    let fixture = HookFixture::new("host1 x86_64-linux /k 4 2 big,kvm\n");
    let output = fixture.run(
        "aarch64-linux",
        &[
            &format!("0 x86_64-linux {DRV} big,kvm"),
            "/nix/store/in1 /nix/store/in2",
            "/nix/store/out1",
        ],
        &[],
    );

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(replies(&output), vec!["# accept"]);
    assert!(
        stderr_of(&output).contains(&format!("@ build-remote {DRV} host1")),
        "missing build trace: {}",
        stderr_of(&output)
    );

    // The hook exited, so its slot lock must be gone.
    let machine = fixture.machine(0);
    assert!(!fixture.slot_is_locked(&machine, 0));
}

#[test]
fn uploads_the_closure_when_the_worker_is_missing_it() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    // A signing key makes the upload pass --sign to the export.
    std::fs::write(fixture.conf_dir.join("signing-key.sec"), "key\n").unwrap();

    let output = fixture.run(
        "aarch64-linux",
        &[
            &format!("0 x86_64-linux {DRV} "),
            "/nix/store/in1 /nix/store/in2",
            "/nix/store/out1",
        ],
        &[("RBH_MOCK_REMOTE_VALID", "")],
    );

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(replies(&output), vec!["# accept"]);
}

#[test]
fn skips_importing_outputs_that_are_already_valid() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let output = fixture.run(
        "aarch64-linux",
        &[
            &format!("0 x86_64-linux {DRV} "),
            "/nix/store/in1",
            "/nix/store/out1 /nix/store/out2",
        ],
        &[("RBH_MOCK_LOCAL_VALID", "/nix/store/out1,/nix/store/out2")],
    );

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(replies(&output), vec!["# accept"]);
}

#[test]
fn remote_build_failure_propagates_status_and_message() {
    init_test_logging();
    let fixture = HookFixture::new("host1 x86_64-linux /k 2 1\n");
    let output = fixture.run(
        "aarch64-linux",
        &[
            &format!("0 x86_64-linux {DRV} "),
            "/nix/store/in1",
            "/nix/store/out1",
        ],
        &[
            ("RBH_MOCK_BUILD_STATUS", "100"),
            ("RBH_MOCK_BUILD_ERROR", "builder failed with exit code 2"),
        ],
    );

    assert_eq!(output.status.code(), Some(100));
    assert_eq!(replies(&output), vec!["# accept"]);
    assert!(
        stderr_of(&output).contains("error: builder failed with exit code 2 on 'host1'"),
        "stderr: {}",
        stderr_of(&output)
    );
}

#[test]
fn connect_failure_falls_over_to_the_next_machine() {
    init_test_logging();
    crate::test_log!("TEST START: connect_failure_falls_over_to_the_next_machine");

    // "first" wins the ranking (same load, higher speed) but refuses SSH.
    let fixture =
        HookFixture::new("first x86_64-linux /k 1 4\nsecond x86_64-linux /k 1 1\n");
    let output = fixture.run(
        "aarch64-linux",
        &[
            &format!("0 x86_64-linux {DRV} "),
            "/nix/store/in1",
            "/nix/store/out1",
        ],
        &[("RBH_TEST_FAIL_HOST", "first")],
    );

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    // The parent must observe exactly one reply for the request.
    assert_eq!(replies(&output), vec!["# accept"]);
    assert!(
        stderr_of(&output).contains(&format!("@ build-remote {DRV} second")),
        "build did not land on the fallback machine: {}",
        stderr_of(&output)
    );
}

#[test]
fn every_machine_failing_collapses_to_a_decline() {
    init_test_logging();
    // Once the only machine is disabled, nothing can ever serve the
    // request in this process.
    let fixture = HookFixture::new("only x86_64-linux /k 1 1\n");
    let output = fixture.run(
        "aarch64-linux",
        &[&format!("0 x86_64-linux {DRV} ")],
        &[("RBH_TEST_FAIL_HOST", "only")],
    );

    assert!(output.status.success(), "stderr: {}", stderr_of(&output));
    assert_eq!(replies(&output), vec!["# decline"]);
}
