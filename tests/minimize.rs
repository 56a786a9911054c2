//! End-to-end minimization scenarios driving the real binary.
//!
//! Each test writes a shell predicate and an input into a temp directory,
//! runs the binary against them, and checks the minimized output.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("predicate.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write predicate");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod predicate");
    path
}

struct Run {
    output: Output,
    result_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Run {
    fn result(&self) -> Vec<u8> {
        fs::read(&self.result_path).expect("read minimized output")
    }
}

fn minimize(script_body: &str, input: &[u8], extra_args: &[&str]) -> Run {
    let dir = tempfile::tempdir().expect("create temp dir");
    let script = write_script(dir.path(), script_body);
    let input_path = dir.path().join("input.bin");
    fs::write(&input_path, input).expect("write input");
    let result_path = dir.path().join("minimized.bin");

    let output = Command::new(env!("CARGO_BIN_EXE_halfempty"))
        .arg("--quiet")
        .arg(format!("--output={}", result_path.display()))
        .args(extra_args)
        .arg(&script)
        .arg(&input_path)
        .output()
        .expect("run halfempty");

    Run {
        output,
        result_path,
        _dir: dir,
    }
}

fn assert_success(run: &Run) {
    assert!(
        run.output.status.success(),
        "halfempty failed: stderr={}",
        String::from_utf8_lossy(&run.output.stderr)
    );
}

#[test]
fn trivial_predicate_minimizes_to_nothing() {
    let run = minimize("cat >/dev/null\nexit 0", b"XYZ", &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"");
}

#[test]
fn empty_input_round_trips() {
    let run = minimize("cat >/dev/null\nexit 0", b"", &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"");
}

#[test]
fn single_byte_sentinel_converges_to_one_byte() {
    let run = minimize("grep -q A", b"AAAA", &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"A");
}

#[test]
fn fixed_prefix_converges_to_the_prefix() {
    let mut input = b"MAGIC".to_vec();
    input.extend(std::iter::repeat(b"junk").take(1000).flatten());
    let run = minimize(r#"[ "$(head -c 5)" = "MAGIC" ]"#, &input, &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"MAGIC");
}

#[test]
fn two_required_markers_stay_in_order() {
    let body = r#"t=$(cat)
case "$t" in *P*) ;; *) exit 1 ;; esac
case "$t" in *Q*) exit 0 ;; *) exit 1 ;; esac"#;
    let run = minimize(body, b"AAAPBBBQCCC", &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"PQ");
}

#[test]
fn mispredicted_success_still_converges() {
    // A rare success deep in a speculative failure tail: the needle
    // survives, a megabyte of filler does not.
    let mut input = b"halfempty".to_vec();
    input.extend(std::iter::repeat(b'A').take(1024 * 1024));
    let run = minimize("grep -q halfempty", &input, &[]);
    assert_success(&run);
    assert_eq!(run.result(), b"halfempty");
}

#[test]
fn zero_strategy_fills_under_stable() {
    // The predicate pins the exact length, so bisect can remove nothing and
    // all simplification comes from the zero strategy.
    let body = r#"t=$(cat)
[ "${#t}" -eq 25 ] || exit 1
case "$t" in MAGIC*) exit 0 ;; *) exit 1 ;; esac"#;
    let mut input = b"MAGIC".to_vec();
    input.extend(b"qwertyuiopasdfghjklz");
    let run = minimize(body, &input, &["--stable", "--zero-char=32"]);
    assert_success(&run);

    let mut expected = b"MAGIC".to_vec();
    expected.extend(std::iter::repeat(b' ').take(20));
    assert_eq!(run.result(), expected);
}

#[test]
fn compression_mid_run_preserves_convergence() {
    // 64 removable bytes produce long finalized runs with consecutive
    // successes at the same window (a success keeps its offset, so the
    // next removal there often succeeds too). A tiny height bound forces
    // the compression pass to fire repeatedly while work is in flight; the
    // run must still converge to the single essential byte.
    let run = minimize("grep -q A", &[b'A'; 64], &["--max-tree-depth=4"]);
    assert_success(&run);
    assert_eq!(run.result(), b"A");
}

#[test]
fn timeouts_classify_as_failure_and_leave_no_orphans() {
    let run = minimize(
        "cat >/dev/null\nsleep 6337",
        b"XY",
        &["--timeout=1", "--noverify"],
    );
    assert_success(&run);
    // Nothing was ever interesting, so the result is the original input.
    assert_eq!(run.result(), b"XY");

    // Every predicate child was signalled and reaped; no sleeper survives.
    assert!(!process_running_with_arg("sleep 6337"));
}

#[test]
fn verification_failure_aborts_without_output() {
    let run = minimize("exit 1", b"anything", &[]);
    assert!(!run.output.status.success());
    let stderr = String::from_utf8_lossy(&run.output.stderr);
    assert!(
        stderr.contains("return successfully"),
        "missing remediation hint: {stderr}"
    );
    assert!(!run.result_path.exists());
}

#[test]
fn noverify_skips_the_sanity_run() {
    // The predicate rejects everything, including the original input; with
    // --noverify the engine assumes the root is interesting and halts with
    // the input unchanged.
    let run = minimize("exit 1", b"abcd", &["--noverify"]);
    assert_success(&run);
    assert_eq!(run.result(), b"abcd");
}

#[test]
fn zero_max_queue_is_rejected() {
    let run = minimize("exit 0", b"x", &["--max-queue=0"]);
    assert_eq!(run.output.status.code(), Some(2));
}

/// Scans /proc for a live process whose command line contains `needle`.
fn process_running_with_arg(needle: &str) -> bool {
    let Ok(entries) = fs::read_dir("/proc") else {
        return false;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(cmdline) = fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline: Vec<u8> = cmdline
            .iter()
            .map(|&b| if b == 0 { b' ' } else { b })
            .collect();
        if String::from_utf8_lossy(&cmdline).contains(needle) {
            return true;
        }
    }
    false
}
