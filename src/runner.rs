//! Spawns the user predicate on a candidate blob and classifies the result.
//!
//! The child is handed the candidate on stdin through a pipe (zero-copy
//! where the platform allows), with stdout/stderr silenced by default. Before
//! exec it applies the configured resource limits, moves into a fresh
//! process group, asks for a parent-death signal, and disables address
//! randomization so crashes reproduce.
//!
//! # Timeouts
//! An alarm in the child would only reach the group leader, and a handler
//! that re-forwards it would be reset by exec. So the timeout lives out here:
//! a watchdog thread waits on a condition variable with a deadline and, on
//! expiry, sends SIGALRM to the whole process group `-pid`. Predicates can
//! trap the signal to clean up; if they ignore it, the default disposition
//! kills everything in the group. The normal-exit path signals the condition
//! and joins the thread.
//!
//! # Reaping
//! The wait here uses `WNOWAIT`, leaving the child reapable: the cleanup
//! pool (or end-of-run teardown) performs the final non-blocking reap while
//! it releases the task's other resources.

use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::limits;
use crate::task::Task;
use crate::util;

/// Disposition of one predicate run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The child exited normally with this code.
    Exited(i32),
    /// The child was killed by a signal or dumped core. Never interesting.
    Killed(i32),
}

impl RunOutcome {
    /// Only a clean exit 0 counts as interesting.
    pub fn is_interesting(self) -> bool {
        self == RunOutcome::Exited(0)
    }
}

/// Runs the predicate on `len` bytes of `data`.
///
/// The child pid is published through `task` as soon as the spawn returns,
/// so the watchdog and the cleanup pool can signal the process group while
/// the run is still in flight.
///
/// # Errors
/// Spawn and wait failures are returned; the predicate's own failures are
/// [`RunOutcome`] values, not errors.
pub fn run(config: &Config, data: &File, len: u64, task: &Task) -> io::Result<RunOutcome> {
    let mut cmd = Command::new(&config.command_path);
    cmd.stdin(Stdio::piped());
    if !config.inherit_stdout {
        cmd.stdout(Stdio::null());
    }
    if !config.inherit_stderr {
        cmd.stderr(Stdio::null());
    }
    // glibc writes malloc diagnostics to /dev/tty and spams the console;
    // request plain abort instead, without overriding a user's setting.
    if std::env::var_os("MALLOC_CHECK_").is_none() {
        cmd.env("MALLOC_CHECK_", "2");
    }

    let child_limits = config.child_limits.clone();
    let pdeath_signal = config.term_signal;
    let pre_exec_sleep = config.pre_exec_sleep;
    unsafe {
        cmd.pre_exec(move || child_setup(&child_limits, pdeath_signal, pre_exec_sleep));
    }

    let mut child = cmd.spawn()?;
    let pid = child.id() as i32;
    task.set_child_pid(pid);
    tracing::debug!(pid, len, "predicate spawned");

    let watchdog = config.timeout.map(|limit| Watchdog::arm(pid, limit));

    let mut stdin = child.stdin.take().expect("stdin was piped");
    util::feed_pipe(data, &mut stdin, len)?;
    drop(stdin);

    let outcome = wait_exited_nowait(pid);

    if let Some(watchdog) = watchdog {
        watchdog.disarm();
    }

    let outcome = outcome?;
    tracing::debug!(pid, ?outcome, "predicate finished");
    Ok(outcome)
}

/// Child-side setup between fork and exec. Must stay async-signal safe:
/// raw syscalls only, no allocation.
fn child_setup(child_limits: &[limits::ChildLimit], pdeath_signal: i32, sleep_secs: u64) -> io::Result<()> {
    unsafe {
        limits::apply_in_child(child_limits)?;

        // A fresh process group so one signal reaches the whole predicate
        // subtree.
        if libc::setpgid(0, 0) != 0 {
            return Err(io::Error::last_os_error());
        }

        #[cfg(target_os = "linux")]
        {
            // Cleanup if the minimizer itself dies.
            libc::prctl(libc::PR_SET_PDEATHSIG, pdeath_signal as libc::c_ulong);
            // Reproducible addresses across runs.
            let persona = libc::personality(0xffff_ffff);
            if persona != -1 {
                libc::personality((persona as libc::c_ulong) | libc::ADDR_NO_RANDOMIZE as libc::c_ulong);
            }
        }
        #[cfg(not(target_os = "linux"))]
        let _ = pdeath_signal;

        // Debug aid for shaking out synchronization problems.
        if sleep_secs > 0 {
            libc::sleep(sleep_secs as libc::c_uint);
        }
    }
    Ok(())
}

/// Waits for the child to exit without reaping it.
fn wait_exited_nowait(pid: i32) -> io::Result<RunOutcome> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let status = si_status(&info);
    match info.si_code {
        libc::CLD_EXITED => Ok(RunOutcome::Exited(status)),
        libc::CLD_KILLED | libc::CLD_DUMPED => Ok(RunOutcome::Killed(status)),
        other => panic!("unexpected si_code {other} from waitid"),
    }
}

#[cfg(target_os = "linux")]
fn si_status(info: &libc::siginfo_t) -> i32 {
    unsafe { info.si_status() }
}

#[cfg(not(target_os = "linux"))]
fn si_status(info: &libc::siginfo_t) -> i32 {
    info.si_status
}

/// Deadline thread that forwards SIGALRM to a child's process group.
struct Watchdog {
    handle: thread::JoinHandle<()>,
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Watchdog {
    /// Starts a watchdog for `pid` with the given wall-clock budget.
    fn arm(pid: i32, limit: Duration) -> Watchdog {
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let shared = Arc::clone(&state);
        let handle = thread::spawn(move || {
            let (done, cv) = &*shared;
            let guard = done.lock().unwrap_or_else(|e| e.into_inner());
            let (guard, result) = cv
                .wait_timeout_while(guard, limit, |finished| !*finished)
                .unwrap_or_else(|e| e.into_inner());
            if result.timed_out() && !*guard {
                tracing::debug!(pid, "timeout expired, signalling process group");
                unsafe {
                    if libc::kill(-pid, libc::SIGALRM) != 0 {
                        tracing::info!(pid, "watchdog failed to signal child group");
                    }
                }
            }
        });
        Watchdog { handle, state }
    }

    /// Tells the watchdog the child is done and joins it.
    fn disarm(self) {
        let (done, cv) = &*self.state;
        *done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cv.notify_one();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ChunkState;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    fn script(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("predicate.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\n{body}").unwrap();
        f.set_permissions(std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn blob(bytes: &[u8]) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(bytes).unwrap();
        f
    }

    fn run_script(body: &str, data: &[u8], timeout: Option<Duration>) -> RunOutcome {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            command_path: script(&dir, body),
            timeout,
            ..Config::default()
        };
        let task = Task::new(blob(data), data.len() as u64, ChunkState { offset: 0, chunksize: 1 });
        let file = blob(data);
        let outcome = run(&config, &file, data.len() as u64, &task).unwrap();

        // Reap what the engine's cleanup pool would.
        let pid = task.child_pid();
        assert!(pid > 0);
        unsafe {
            assert_eq!(libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG), pid);
        }
        outcome
    }

    #[test]
    fn classifies_clean_exits() {
        assert_eq!(run_script("cat >/dev/null; exit 0", b"data", None), RunOutcome::Exited(0));
        assert!(run_script("cat >/dev/null; exit 0", b"data", None).is_interesting());
        assert_eq!(run_script("cat >/dev/null; exit 7", b"data", None), RunOutcome::Exited(7));
    }

    #[test]
    fn early_exit_without_reading_stdin_is_tolerated() {
        let data = vec![0x41u8; 256 * 1024];
        assert_eq!(run_script("exit 3", &data, None), RunOutcome::Exited(3));
    }

    #[test]
    fn classifies_signal_death() {
        let outcome = run_script("kill -9 $$", b"", None);
        assert_eq!(outcome, RunOutcome::Killed(libc::SIGKILL));
        assert!(!outcome.is_interesting());
    }

    #[test]
    fn timeout_alarms_the_whole_group() {
        let outcome = run_script(
            "cat >/dev/null; sleep 60",
            b"x",
            Some(Duration::from_millis(300)),
        );
        assert_eq!(outcome, RunOutcome::Killed(libc::SIGALRM));
    }
}
