//! Worker pool: executes queued candidates and writes back verdicts.
//!
//! Each worker owns one task at a time. It takes the task mutex for the
//! whole predicate run; anyone who wants the blob or the verdict waits or
//! reads the lock-free mirrors. A task can be discarded while it sits in
//! the queue, in which case the worker drops it silently.
//!
//! Workers never touch the tree while holding a task mutex. A success first
//! releases the task, then sweeps the mispredicted failure subtree under
//! the tree lock, enqueueing its tasks for cleanup.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel as chan;

use crate::driver::Shared;
use crate::gc::GcJob;
use crate::runner::{self, RunOutcome};
use crate::task::{Task, TaskStatus};
use crate::tree::{Branch, NodeId};

/// A queued candidate execution.
pub struct Job {
    /// The node the task hangs off; needed to find its failure branch.
    pub node: NodeId,
    /// The task itself.
    pub task: Arc<Task>,
}

/// The predicate execution pool.
pub struct WorkerPool {
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `config.num_threads` workers draining `rx`. The pool exits
    /// when every sender is dropped and the queue is empty.
    pub fn spawn(shared: &Arc<Shared>, rx: chan::Receiver<Job>) -> WorkerPool {
        let handles = (0..shared.config.num_threads)
            .map(|i| {
                let rx = rx.clone();
                let shared = Arc::clone(shared);
                thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            execute(&shared, &job);
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        WorkerPool { handles }
    }

    /// Waits for the queue to drain and the workers to exit.
    pub fn join(self) {
        for handle in self.handles {
            if handle.join().is_err() {
                panic!("worker thread panicked");
            }
        }
    }
}

/// Runs one candidate and records the verdict.
///
/// Also used synchronously by the driver to verify the original input.
pub fn execute(shared: &Shared, job: &Job) {
    let task = &job.task;
    let data = task.lock_data();

    tracing::debug!(
        size = task.size(),
        status = %task.status(),
        "worker processing task"
    );

    // Discarded while queued: speculation went the other way, nothing to do.
    if task.status() == TaskStatus::Discarded {
        tracing::debug!("task was discarded before it ran");
        return;
    }
    assert_eq!(
        task.status(),
        TaskStatus::Pending,
        "queued task in an impossible state"
    );

    let blob = data.as_ref().expect("pending task retains its data");
    let start = Instant::now();
    let outcome = match runner::run(&shared.config, blob, task.size(), task) {
        Ok(outcome) => outcome,
        Err(err) => {
            // Without a runnable predicate the whole exercise is meaningless.
            eprintln!(
                "halfempty: failed to run `{}`: {err}",
                shared.config.command_path.display()
            );
            std::process::exit(1);
        }
    };
    task.record_elapsed(start.elapsed());

    tracing::debug!(
        ?outcome,
        elapsed_ms = start.elapsed().as_millis() as u64,
        size = task.size(),
        "predicate verdict"
    );

    if outcome.is_interesting() {
        task.set_status(TaskStatus::Success);
        drop(data);
        // Anything speculated on our failure branch was mispredicted.
        sweep_failure_branch(shared, job.node);
    } else {
        if let RunOutcome::Exited(code) = outcome {
            if code != 1 {
                tracing::debug!(code, "unexpected predicate exit code, treated as failure");
            }
        }
        task.set_status(TaskStatus::Failure);
        drop(data);
        // A failed candidate's bytes are never a source for descendants;
        // release the descriptor early.
        let _ = shared.gc_tx.send(GcJob::Clean(Arc::clone(task)));
    }

    shared.tree_cv.notify_one();
}

/// Queues every task under `node`'s failure branch for cleanup.
///
/// Task mutexes must not be taken while the tree lock is held, so the
/// tasks are handed to the cleanup pool instead of being touched here.
fn sweep_failure_branch(shared: &Shared, node: NodeId) {
    let tree = shared.tree.lock().unwrap_or_else(|e| e.into_inner());
    let Some(branch) = tree.child(node, Branch::Failure) else {
        tracing::debug!("no failure branch to sweep");
        return;
    };
    let tasks = tree.subtree_tasks(branch);
    tracing::info!(
        depth = tree.depth(node),
        swept = tasks.len(),
        "success contradicted a speculative failure branch"
    );
    for task in tasks {
        let _ = shared.gc_tx.send(GcJob::Clean(task));
    }
}
