//! The materialized candidate: one predicate invocation's worth of state.
//!
//! # Locking protocol
//! A task's blob handle is guarded by its mutex; whoever holds the lock owns
//! the bytes. Status and child pid are atomics *mirroring* state that is only
//! written while the mutex is held, so the driver (holding the tree lock) and
//! the cleanup pool can read them lock-free. A stale read is benign by
//! design of the callers: the driver treats Pending as "predict failure" and
//! corrects itself next iteration, and signalling a process group that just
//! died is a no-op.
//!
//! Legal status transitions:
//! Pending -> Success | Failure | Discarded, and Success | Failure -> Discarded.

use std::fmt;
use std::fs::File;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use crate::strategy::ChunkState;

/// Lifecycle of a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Queued or executing; outcome unknown.
    Pending = 0,
    /// The predicate exited 0.
    Success = 1,
    /// Any other disposition: non-zero exit, signal, timeout.
    Failure = 2,
    /// Speculation went the other way; resources reclaimed.
    Discarded = 3,
}

impl TaskStatus {
    fn from_u8(v: u8) -> TaskStatus {
        match v {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Success,
            2 => TaskStatus::Failure,
            3 => TaskStatus::Discarded,
            _ => unreachable!("invalid task status {v}"),
        }
    }

    /// True once the predicate's verdict is known and kept.
    pub fn is_final(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
            TaskStatus::Discarded => "discarded",
        };
        f.write_str(name)
    }
}

/// Sentinel for "no elapsed time recorded yet".
const ELAPSED_UNSET: u64 = u64::MAX;

/// A candidate blob plus everything needed to test and reclaim it.
pub struct Task {
    /// Byte length of the blob. Fixed at creation; equals the file's actual
    /// length for as long as the handle is held.
    size: u64,
    /// Strategy parameter block. Write-once, immutable after the task is
    /// published into the tree.
    state: OnceLock<ChunkState>,
    /// Mirror of the status written under `data`'s lock.
    status: AtomicU8,
    /// Pid of the most recent predicate child, 0 if none.
    child_pid: AtomicI32,
    /// Wall time of the predicate run, in microseconds.
    elapsed_micros: AtomicU64,
    /// The candidate bytes. `None` once the cleanup pool released them.
    data: Mutex<Option<File>>,
}

impl Task {
    /// Creates a pending candidate with its schedule state attached.
    pub fn new(data: File, size: u64, state: ChunkState) -> Task {
        let task = Task::with_status(data, size, TaskStatus::Pending);
        task.state.set(state).expect("fresh task");
        task
    }

    /// Creates the root task for an input blob. The schedule state is primed
    /// later by the strategy.
    pub fn new_root(data: File, size: u64) -> Task {
        Task::with_status(data, size, TaskStatus::Pending)
    }

    fn with_status(data: File, size: u64, status: TaskStatus) -> Task {
        Task {
            size,
            state: OnceLock::new(),
            status: AtomicU8::new(status as u8),
            child_pid: AtomicI32::new(0),
            elapsed_micros: AtomicU64::new(ELAPSED_UNSET),
            data: Mutex::new(Some(data)),
        }
    }

    /// Byte length of the candidate.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Schedule state, if primed.
    pub fn state(&self) -> Option<&ChunkState> {
        self.state.get()
    }

    /// Attaches the schedule state to a root task.
    ///
    /// # Panics
    /// Panics if the state was already set; it is immutable after publication.
    pub fn prime_state(&self, state: ChunkState) {
        self.state.set(state).expect("task state is write-once");
    }

    /// Current status. Lock-free; see the module docs for why that is sound.
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Records a status transition. The caller must hold the data lock.
    ///
    /// # Panics
    /// Panics on an illegal transition.
    pub fn set_status(&self, to: TaskStatus) {
        let from = self.status();
        let legal = match (from, to) {
            (TaskStatus::Pending, TaskStatus::Success)
            | (TaskStatus::Pending, TaskStatus::Failure)
            | (TaskStatus::Pending, TaskStatus::Discarded)
            | (TaskStatus::Success, TaskStatus::Discarded)
            | (TaskStatus::Failure, TaskStatus::Discarded) => true,
            _ => false,
        };
        assert!(legal, "illegal task transition {from} -> {to}");
        self.status.store(to as u8, Ordering::Release);
    }

    /// Locks the candidate bytes.
    pub fn lock_data(&self) -> MutexGuard<'_, Option<File>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Pid of the running or unreaped predicate child, 0 if none.
    pub fn child_pid(&self) -> i32 {
        self.child_pid.load(Ordering::Acquire)
    }

    /// Publishes the child pid for the watchdog and cleanup pool.
    pub fn set_child_pid(&self, pid: i32) {
        self.child_pid.store(pid, Ordering::Release);
    }

    /// Wall time of the predicate run, if it ran.
    pub fn elapsed(&self) -> Option<Duration> {
        match self.elapsed_micros.load(Ordering::Acquire) {
            ELAPSED_UNSET => None,
            micros => Some(Duration::from_micros(micros)),
        }
    }

    /// Records the predicate's wall time.
    ///
    /// # Panics
    /// Panics if an elapsed time was already recorded; a task runs once.
    pub fn record_elapsed(&self, elapsed: Duration) {
        let micros = elapsed.as_micros().min(u128::from(ELAPSED_UNSET - 1)) as u64;
        let prev = self.elapsed_micros.swap(micros, Ordering::AcqRel);
        assert_eq!(prev, ELAPSED_UNSET, "task executed twice");
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("size", &self.size)
            .field("status", &self.status())
            .field("child_pid", &self.child_pid())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> Task {
        Task::new(
            tempfile::tempfile().unwrap(),
            4,
            ChunkState {
                offset: 0,
                chunksize: 4,
            },
        )
    }

    #[test]
    fn pending_to_final_transitions() {
        let t = pending();
        assert_eq!(t.status(), TaskStatus::Pending);
        t.set_status(TaskStatus::Success);
        assert_eq!(t.status(), TaskStatus::Success);
        t.set_status(TaskStatus::Discarded);
        assert_eq!(t.status(), TaskStatus::Discarded);
    }

    #[test]
    #[should_panic(expected = "illegal task transition")]
    fn success_cannot_become_failure() {
        let t = pending();
        t.set_status(TaskStatus::Success);
        t.set_status(TaskStatus::Failure);
    }

    #[test]
    #[should_panic(expected = "illegal task transition")]
    fn discarded_is_terminal() {
        let t = pending();
        t.set_status(TaskStatus::Discarded);
        t.set_status(TaskStatus::Success);
    }

    #[test]
    fn elapsed_round_trips() {
        let t = pending();
        assert!(t.elapsed().is_none());
        t.record_elapsed(Duration::from_millis(1500));
        assert_eq!(t.elapsed(), Some(Duration::from_millis(1500)));
    }

    #[test]
    #[should_panic(expected = "write-once")]
    fn state_is_write_once() {
        let t = pending();
        t.prime_state(ChunkState {
            offset: 1,
            chunksize: 1,
        });
    }
}
