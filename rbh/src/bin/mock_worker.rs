//! Test-only worker stand-in.
//!
//! `rbh-mock-worker serve` speaks the worker protocol on stdin/stdout;
//! `rbh-mock-worker store <op> ...` plays the local `nix-store` helper.
//! Integration tests put shell shims for `ssh` and `nix-store` on `PATH`
//! that exec into this binary.

#![forbid(unsafe_code)]

use rbh_common::mock_worker::{self, MockBehavior};
use std::io;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let behavior = MockBehavior::from_env();

    let result: io::Result<i32> = match args.first().map(String::as_str) {
        Some("serve") => {
            let stdin = io::stdin();
            let stdout = io::stdout();
            mock_worker::serve(&behavior, stdin.lock(), stdout.lock()).map(|()| 0)
        }
        Some("store") => mock_worker::store_main(&behavior, &args[1..]),
        other => {
            eprintln!("rbh-mock-worker: unknown mode {other:?}");
            Ok(2)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("rbh-mock-worker: {e}");
            std::process::exit(1);
        }
    }
}
