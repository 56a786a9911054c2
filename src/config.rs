//! Engine configuration.
//!
//! One immutable record, built by the CLI layer, validated once, and shared
//! behind an `Arc` before any worker thread starts. Nothing in the engine
//! mutates it afterwards, so no per-access locking is needed.

use std::path::PathBuf;
use std::time::Duration;

use crate::limits::ChildLimit;

/// Default backpressure bound on unprocessed speculative work.
///
/// Each queued candidate holds a file descriptor, so this cannot be
/// unbounded. Larger values add parallelism for slow predicates but make
/// recovery from a mispredicted path more expensive.
pub const DEFAULT_MAX_UNPROCESSED: usize = 2;

/// Default cleanup pool size. These threads mostly wait on locks.
pub const DEFAULT_CLEANUP_THREADS: usize = 4;

/// Default unit of the driver's exponential backoff when a strategy stalls.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(10_000);

/// Tree height that triggers a compression pass.
///
/// Long runs produce deep consecutive-failure tails; past this height the
/// driver folds finalized tails so traversal cost stays bounded.
pub const DEFAULT_MAX_TREE_DEPTH: u32 = 512;

/// Default name of the minimized output file.
pub const DEFAULT_OUTPUT_FILE: &str = "halfempty.out";

/// Immutable run configuration.
///
/// Field defaults mirror the documented option defaults; see
/// [`Config::default`] and the CLI help text.
#[derive(Clone, Debug)]
pub struct Config {
    /// The user predicate executed for every candidate.
    pub command_path: PathBuf,
    /// The original input blob.
    pub input_file: PathBuf,
    /// Destination for the minimized result.
    pub output_file: PathBuf,
    /// Worker pool size.
    pub num_threads: usize,
    /// Cleanup (garbage collection) pool size.
    pub cleanup_threads: usize,
    /// Maximum number of unprocessed speculative candidates.
    pub max_unprocessed: usize,
    /// Backoff unit used when no new work can be generated yet.
    pub poll_delay: Duration,
    /// Per-predicate wall clock limit, enforced by SIGALRM to the child's
    /// process group.
    pub timeout: Option<Duration>,
    /// Resource limits applied in the child before exec.
    pub child_limits: Vec<ChildLimit>,
    /// Signal mispredicted children so their compute is reclaimed early.
    pub terminate_discarded: bool,
    /// Signal used for aggressive termination.
    pub term_signal: i32,
    /// Leave child stdout connected instead of redirecting to null.
    pub inherit_stdout: bool,
    /// Leave child stderr connected instead of redirecting to null.
    pub inherit_stderr: bool,
    /// Run the predicate once on the original input before minimizing.
    pub verify_input: bool,
    /// Re-run all strategies until the output size stops shrinking.
    pub stable: bool,
    /// Print only errors.
    pub quiet: bool,
    /// Fill byte used by the zero strategy.
    pub zero_char: u8,
    /// Write a DOT file of the final tree.
    pub generate_dot: bool,
    /// Render the tree to a self-refreshing HTML page while running.
    pub monitor: bool,
    /// Tree height that triggers compression.
    pub max_tree_depth: u32,
    /// Debug aid: seconds the child sleeps before exec.
    pub pre_exec_sleep: u64,
    /// Diagnostic verbosity (0 = warnings only).
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            command_path: PathBuf::new(),
            input_file: PathBuf::new(),
            output_file: PathBuf::from(DEFAULT_OUTPUT_FILE),
            num_threads: num_cpus::get() + 1,
            cleanup_threads: DEFAULT_CLEANUP_THREADS,
            max_unprocessed: DEFAULT_MAX_UNPROCESSED,
            poll_delay: DEFAULT_POLL_DELAY,
            timeout: None,
            child_limits: ChildLimit::defaults(),
            terminate_discarded: true,
            term_signal: libc::SIGTERM,
            inherit_stdout: false,
            inherit_stderr: false,
            verify_input: true,
            stable: false,
            quiet: false,
            zero_char: 0,
            generate_dot: false,
            monitor: false,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
            pre_exec_sleep: 0,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Checks for values that would stall or wedge the engine.
    ///
    /// # Errors
    /// Returns a human-readable description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_unprocessed == 0 {
            return Err("max-queue must be at least 1, the driver would stall".into());
        }
        if self.num_threads == 0 {
            return Err("num-threads must be at least 1".into());
        }
        if self.cleanup_threads == 0 {
            return Err("cleanup-threads must be at least 1".into());
        }
        if self.max_tree_depth < 2 {
            return Err("max-tree-depth must be at least 2".into());
        }
        if !(0..64).contains(&self.term_signal) {
            return Err(format!("term-signal {} is not a signal number", self.term_signal));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_queue_is_rejected() {
        let cfg = Config {
            max_unprocessed: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_threads_are_rejected() {
        let cfg = Config {
            num_threads: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = Config {
            cleanup_threads: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
