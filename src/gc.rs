//! Cleanup pool: reclaims tasks off the hot path.
//!
//! Mispredicted speculation leaves behind tasks that are queued, running, or
//! already finished. The driver and workers never pay for that cleanup
//! themselves; they enqueue the task here and a small pool of threads does
//! the waiting. These threads mostly block on task mutexes and consume
//! almost nothing.
//!
//! Cleanup is idempotent: a task can arrive more than once (eager release
//! after a failure, a later subtree sweep, end-of-run teardown) and every
//! pass after the first finds nothing left to do.

use std::sync::Arc;
use std::thread;

use crossbeam_channel as chan;

use crate::config::Config;
use crate::task::{Task, TaskStatus};

/// Work item for the cleanup pool.
pub enum GcJob {
    /// Reclaim this task's resources.
    Clean(Arc<Task>),
    /// Drain marker: the receiving thread exits.
    Shutdown,
}

/// The cleanup thread pool.
pub struct GcPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl GcPool {
    /// Spawns `config.cleanup_threads` cleanup threads draining `rx`.
    pub fn spawn(config: &Arc<Config>, rx: chan::Receiver<GcJob>) -> GcPool {
        let handles = (0..config.cleanup_threads)
            .map(|i| {
                let rx = rx.clone();
                let config = Arc::clone(config);
                thread::Builder::new()
                    .name(format!("cleanup-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            match job {
                                GcJob::Clean(task) => cleanup_task(&config, &task),
                                GcJob::Shutdown => break,
                            }
                        }
                    })
                    .expect("spawn cleanup thread")
            })
            .collect();
        GcPool { handles }
    }

    /// Waits for every cleanup thread to drain and exit. The caller must
    /// have sent one [`GcJob::Shutdown`] per thread first.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                panic!("cleanup thread panicked");
            }
        }
    }
}

/// Releases everything a task holds: signals the child group, closes the
/// blob, reaps the zombie.
///
/// The termination signal goes out before taking the task mutex: a worker
/// holds that mutex for the whole predicate run, so signalling first is
/// what cuts mispredicted runs short. The pid read may race the worker
/// publishing it, which is harmless; signalling a group that is already
/// gone is a no-op.
pub fn cleanup_task(config: &Config, task: &Task) {
    let pid = task.child_pid();
    if config.terminate_discarded && pid > 0 {
        tracing::debug!(pid, "terminating discarded child group");
        unsafe {
            libc::kill(-pid, config.term_signal);
        }
    }

    let mut data = task.lock_data();
    tracing::debug!(status = %task.status(), "cleaning up task");

    // A task the speculation abandoned before it ran (or while it was
    // running) is discarded. A finalized verdict stays; only the resources
    // go.
    if task.status() == TaskStatus::Pending {
        task.set_status(TaskStatus::Discarded);
    }

    // Closes the blob. Safe while holding the lock; nobody else may touch
    // the descriptor without it.
    *data = None;

    let pid = task.child_pid();
    if pid > 0 {
        // The worker already waited with WNOWAIT, so the zombie must be
        // immediately reapable.
        let reaped = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        if reaped != pid {
            tracing::error!(pid, reaped, "zombie was not immediately reapable");
        }
        task.set_child_pid(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::ChunkState;

    fn pending_task() -> Task {
        Task::new(
            tempfile::tempfile().unwrap(),
            1,
            ChunkState {
                offset: 0,
                chunksize: 1,
            },
        )
    }

    #[test]
    fn pending_tasks_are_discarded_and_released() {
        let config = Config::default();
        let task = pending_task();
        cleanup_task(&config, &task);
        assert_eq!(task.status(), TaskStatus::Discarded);
        assert!(task.lock_data().is_none());
        assert_eq!(task.child_pid(), 0);
    }

    #[test]
    fn finalized_verdicts_survive_cleanup() {
        let config = Config::default();
        let task = pending_task();
        task.set_status(TaskStatus::Failure);
        cleanup_task(&config, &task);
        assert_eq!(task.status(), TaskStatus::Failure);
        assert!(task.lock_data().is_none());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let config = Config::default();
        let task = pending_task();
        cleanup_task(&config, &task);
        cleanup_task(&config, &task);
        assert_eq!(task.status(), TaskStatus::Discarded);
    }

    #[test]
    fn pool_drains_and_joins() {
        let config = Arc::new(Config::default());
        let (tx, rx) = chan::unbounded();
        let pool = GcPool::spawn(&config, rx);

        let task = Arc::new(pending_task());
        tx.send(GcJob::Clean(Arc::clone(&task))).unwrap();
        for _ in 0..config.cleanup_threads {
            tx.send(GcJob::Shutdown).unwrap();
        }
        pool.join();
        assert_eq!(task.status(), TaskStatus::Discarded);
    }
}
