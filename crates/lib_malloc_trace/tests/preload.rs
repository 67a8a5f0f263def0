//! Run real programs with the tracer preloaded.

use malloc_trace::{Record, TimedRecord};
use once_cell::sync::Lazy;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{self, Command, Output, Stdio},
};

const LIBRARY: &str = "libmalloc_trace.so";

// The cdylib is not a dependency of this test, so look for it next to the
// test binary and build it into a private target directory if it is missing.
static PRELOAD: Lazy<PathBuf> = Lazy::new(|| {
    let exe = std::env::current_exe().unwrap();
    let deps = exe.parent().unwrap();
    let profile = deps.parent().unwrap();
    for candidate in [profile.join(LIBRARY), deps.join(LIBRARY)] {
        if candidate.exists() {
            return candidate;
        }
    }

    let target_dir = profile.join("preload-test");
    let status = Command::new(env!("CARGO"))
        .args(["build", "-p", "lib_malloc_trace", "--target-dir"])
        .arg(&target_dir)
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .status()
        .unwrap();
    assert!(status.success(), "failed to build {}", LIBRARY);
    target_dir.join("debug").join(LIBRARY)
});

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("lib_malloc_trace.{}.{}", process::id(), name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn traced(program: &str, dir: &Path, log: Option<&Path>) -> Command {
    let mut cmd = Command::new(program);
    cmd.env("LD_PRELOAD", &*PRELOAD).current_dir(dir);
    match log {
        Some(log) => cmd.env("MALLOC_TRACE", log),
        None => cmd.env_remove("MALLOC_TRACE"),
    };
    cmd
}

fn check_output(output: &Output) {
    assert!(output.status.success(), "{:?}", output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("malloc_trace:"), "{}", stderr);
}

fn records(log: &Path) -> Vec<TimedRecord> {
    fs::read_to_string(log)
        .unwrap_or_else(|e| panic!("{}: {}", log.display(), e))
        .lines()
        .map(|line| line.parse().unwrap())
        .collect()
}

#[test]
fn true_with_trace_var() {
    let dir = scratch_dir("true_var");
    let log = dir.join("true.log");
    let output = traced("/bin/true", &dir, Some(&log)).output().unwrap();
    check_output(&output);

    records(&log);
    assert!(!dir.join("mtrace.log").exists());
}

#[test]
fn true_default_destination() {
    let dir = scratch_dir("true_default");
    let output = traced("/bin/true", &dir, None).output().unwrap();
    check_output(&output);

    records(&dir.join("mtrace.log"));
}

fn run_sort(name: &str, trace_var: Option<&str>) {
    let dir = scratch_dir(name);
    let log = dir.join(trace_var.unwrap_or("mtrace.log"));

    let input: String = (0..2000).rev().map(|i| format!("line {:05}\n", i)).collect();
    let mut child = traced("sort", &dir, trace_var.map(|_| log.as_path()))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(input.as_bytes()).unwrap();
    let output = child.wait_with_output().unwrap();
    check_output(&output);

    let expected: String = (0..2000).map(|i| format!("line {:05}\n", i)).collect();
    assert_eq!(String::from_utf8_lossy(&output.stdout), expected);

    // Everything up to exit was flushed by the unload hook.
    let recs = records(&log);
    assert!(recs
        .iter()
        .any(|r| matches!(r.record, Record::Malloc { ret, .. } if ret != 0)));
    assert!(recs.iter().any(|r| matches!(r.record, Record::Free { .. })));
}

#[test]
fn sort_with_trace_var() {
    run_sort("sort_var", Some("sort.log"));
}

#[test]
fn sort_default_destination() {
    run_sort("sort_default", None);
}
