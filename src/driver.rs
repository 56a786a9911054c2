//! The tree driver: grows the speculation tree and detects completion.
//!
//! One invocation per strategy. The driver owns the tree, walks the
//! predicted path under the tree lock, and inserts work at the frontier:
//!
//! - At an empty placeholder, ask the strategy to materialize the task the
//!   speculation bet against needing.
//! - At a leaf, insert a real child on the predicted branch and an empty
//!   placeholder on the other. The prediction is pessimistic: unless the
//!   leaf already succeeded, assume the new candidate fails too. Real
//!   minimization runs are dominated by long failure tails, so idle cores
//!   speculate far down the failure branch, and the rare success only
//!   invalidates the one mispredicted subtree.
//!
//! The placeholder is what makes recovery cheap: when speculation turns out
//! wrong, the driver inserts work at the now-live branch without
//! restructuring anything.
//!
//! Backpressure: the driver stops generating once `max_unprocessed`
//! candidates sit unclaimed in the queue, waiting on the tree condvar with
//! a bounded timeout so the status line keeps refreshing.

use std::fmt;
use std::fs::File;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use crate::config::Config;
use crate::dot;
use crate::gc::{self, GcJob, GcPool};
use crate::strategy::Strategy;
use crate::task::{Task, TaskStatus};
use crate::tree::{Branch, NodeId, Tree};
use crate::util;
use crate::workers::{Job, WorkerPool};

/// How long the backpressure wait may block before the status line refreshes.
const STATUS_TICK: Duration = Duration::from_secs(1);

/// State shared between the driver, the workers, and the cleanup pool.
pub(crate) struct Shared {
    pub config: Arc<Config>,
    pub tree: Mutex<Tree>,
    pub tree_cv: Condvar,
    pub gc_tx: chan::Sender<GcJob>,
}

/// A failed driver run.
#[derive(Debug)]
#[non_exhaustive]
pub enum DriveError {
    /// The predicate rejected the original input during verification.
    VerificationFailed,
    /// Candidate materialization or process plumbing failed.
    Io(io::Error),
}

impl fmt::Display for DriveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VerificationFailed => {
                write!(f, "the predicate does not succeed on the original input")
            }
            Self::Io(err) => write!(f, "I/O error during minimization: {err}"),
        }
    }
}

impl std::error::Error for DriveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DriveError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Outcome of one driver iteration.
enum Step {
    /// New work was inserted and queued.
    Enqueued,
    /// No work could be generated, but pending results may reopen a path.
    Delay,
    /// The active path is finalized and the strategy is exhausted.
    Finalized,
}

/// Minimizes `input` under `strategy` until the active path is finalized.
///
/// Returns a fresh handle to the smallest interesting blob. The worker and
/// cleanup pools live only for the duration of the call; after it returns,
/// every speculative child process has been signalled and reaped.
///
/// # Errors
/// Fails if the initial verification rejects the input or if candidate
/// materialization hits an I/O error.
pub fn drive(
    config: &Arc<Config>,
    input: File,
    strategy: &dyn Strategy,
) -> Result<File, DriveError> {
    let size = util::file_size(&input)?;
    let root = Arc::new(Task::new_root(input, size));

    let (work_tx, work_rx) = chan::unbounded::<Job>();
    let (gc_tx, gc_rx) = chan::unbounded::<GcJob>();

    let shared = Arc::new(Shared {
        config: Arc::clone(config),
        tree: Mutex::new(Tree::new(Arc::clone(&root))),
        tree_cv: Condvar::new(),
        gc_tx,
    });

    // Sanity-check the input before any pool exists: minimizing an input the
    // predicate already rejects is meaningless.
    if config.verify_input {
        util::say(
            config,
            "Verifying the original input executes successfully... (skip with --noverify)",
        );
        let root_node = shared.tree.lock().unwrap_or_else(|e| e.into_inner()).root();
        crate::workers::execute(
            &shared,
            &Job {
                node: root_node,
                task: Arc::clone(&root),
            },
        );
        if root.status() != TaskStatus::Success {
            return Err(DriveError::VerificationFailed);
        }
        util::say(
            config,
            &format!(
                "The original input file succeeded after {:.1} seconds.",
                root.elapsed().unwrap_or_default().as_secs_f64()
            ),
        );
    } else {
        let guard = root.lock_data();
        root.set_status(TaskStatus::Success);
        root.record_elapsed(Duration::ZERO);
        drop(guard);
    }

    strategy.prime_root(&root);

    let worker_pool = WorkerPool::spawn(&shared, work_rx);
    let gc_pool = GcPool::spawn(config, gc_rx);
    let mut monitor = if config.monitor {
        dot::Monitor::create(config).ok()
    } else {
        None
    };

    let started = Instant::now();
    let mut backoff: u32 = 0;
    let mut finaldepth: u32 = 0;

    let loop_result = loop {
        let mut tree = shared.tree.lock().unwrap_or_else(|e| e.into_inner());

        // Bounded speculation: exploring too far down a wrong path costs
        // more to recover from than the parallelism is worth.
        while work_tx.len() > config.max_unprocessed {
            let (guard, _timeout) = shared
                .tree_cv
                .wait_timeout(tree, STATUS_TICK)
                .unwrap_or_else(|e| e.into_inner());
            tree = guard;
            finaldepth = print_status(config, &tree, started, finaldepth, work_tx.len());
        }

        finaldepth = print_status(config, &tree, started, finaldepth, work_tx.len());

        if tree.height() > config.max_tree_depth {
            let removed = tree.compress();
            if !removed.is_empty() {
                tracing::info!(
                    removed = removed.len(),
                    height = tree.height(),
                    "compressed finalized tails"
                );
                for task in removed {
                    let _ = shared.gc_tx.send(GcJob::Clean(task));
                }
            }
        }

        let step = match advance_tree(&mut tree, strategy, &work_tx) {
            Ok(step) => step,
            Err(err) => break Err(DriveError::Io(err)),
        };

        if let Some(monitor) = monitor.as_mut() {
            monitor.refresh(&tree);
        }
        drop(tree);

        match step {
            Step::Enqueued => backoff = 0,
            Step::Delay => {
                backoff = backoff.saturating_add(1);
                tracing::debug!(backoff, "no work generated, backing off");
                std::thread::sleep(config.poll_delay * backoff);
            }
            Step::Finalized => {
                util::say(
                    config,
                    "Reached the end of our path through tree, all nodes were finalized",
                );
                break Ok(());
            }
        }
    };

    // Drain and stop the pools: workers first (they feed the cleanup
    // queue), then the cleanup threads.
    drop(work_tx);
    worker_pool.join();
    for _ in 0..config.cleanup_threads {
        let _ = shared.gc_tx.send(GcJob::Shutdown);
    }
    gc_pool.join();

    loop_result?;

    let tree = shared.tree.lock().unwrap_or_else(|e| e.into_inner());
    show_statistics(config, &tree);

    if config.generate_dot {
        match dot::write_final_tree(&tree) {
            Ok(path) => util::say(
                config,
                &format!(
                    "Generated DOT file of final tree to {} (view it with xdot)",
                    path.display()
                ),
            ),
            Err(err) => tracing::warn!("failed to write DOT file: {err}"),
        }
    }

    let output = duplicate_final_blob(&tree)?;

    // Every task in the arena, live or retired, gives up its descriptor and
    // its zombie before the next strategy starts.
    for task in tree.arena_tasks() {
        gc::cleanup_task(config, task);
    }

    Ok(output)
}

/// One pass of the speculative walk: find the frontier and insert work.
///
/// Called with the tree lock held.
fn advance_tree(
    tree: &mut Tree,
    strategy: &dyn Strategy,
    work_tx: &chan::Sender<Job>,
) -> io::Result<Step> {
    let mut current = tree.root();
    for depth in 0.. {
        let Some(task) = tree.task(current) else {
            // An empty placeholder: the branch we bet against is live after
            // all, so it needs a real task now.
            let parent = tree.parent(current).expect("placeholder has a parent");
            tracing::debug!(depth, "found a placeholder, generating task");
            return match strategy.next(tree, parent)? {
                Some(task) => {
                    let task = Arc::new(task);
                    tree.attach_task(current, Arc::clone(&task));
                    enqueue(work_tx, current, task);
                    Ok(Step::Enqueued)
                }
                None => {
                    tracing::debug!(depth, "no more work possible on this path");
                    // A path we bet against came live, but the strategy has
                    // nothing for it. Either everything above is settled and
                    // the run is over, or an in-flight result may reopen it.
                    if tree.root_path_finalized(parent) {
                        Ok(Step::Finalized)
                    } else {
                        Ok(Step::Delay)
                    }
                }
            };
        };

        let status = task.status();
        assert_ne!(
            status,
            TaskStatus::Discarded,
            "traversed into a discarded branch"
        );
        tracing::debug!(depth, %status, size = task.size(), "traversing");

        if tree.is_leaf(current) {
            return match strategy.next(tree, current)? {
                Some(child) => {
                    let child = Arc::new(child);
                    // Predict the branch this candidate lands on: success
                    // only when the leaf's verdict already proves it,
                    // failure otherwise.
                    let predicted = if status == TaskStatus::Success {
                        Branch::Success
                    } else {
                        Branch::Failure
                    };
                    tree.insert_child(current, predicted.other(), None);
                    let real = tree.insert_child(current, predicted, Some(Arc::clone(&child)));
                    enqueue(work_tx, real, child);
                    Ok(Step::Enqueued)
                }
                None => {
                    tracing::debug!(depth, "no more children possible");
                    if tree.root_path_finalized(current) {
                        Ok(Step::Finalized)
                    } else {
                        Ok(Step::Delay)
                    }
                }
            };
        }

        // Not a leaf: keep following the predicted path.
        let branch = if status == TaskStatus::Success {
            Branch::Success
        } else {
            Branch::Failure
        };
        current = tree
            .child(current, branch)
            .expect("expanded nodes carry both children");
    }
    unreachable!("the walk always terminates at a leaf or placeholder");
}

fn enqueue(work_tx: &chan::Sender<Job>, node: NodeId, task: Arc<Task>) {
    work_tx
        .send(Job { node, task })
        .expect("worker pool outlives the driver loop");
}

/// Prints the transient status line and the discrete new-depth events.
/// Returns the updated deepest finalized depth.
fn print_status(
    config: &Config,
    tree: &Tree,
    started: Instant,
    finaldepth: u32,
    unprocessed: usize,
) -> u32 {
    if config.quiet {
        return finaldepth;
    }
    let Some(final_id) = tree.find_finalized(true) else {
        return finaldepth;
    };
    let final_task = tree.task(final_id).expect("finalized node carries a task");
    let real = started.elapsed().as_secs_f64();
    let user = (tree.path_elapsed(final_id) + tree.collapsed_time()).as_secs_f64();

    if io::stdout().is_terminal() {
        print!(
            "treesize={}, height={}, unproc={}, real={:.1}s, user={:.1}s, speedup=~{:.1}s\r",
            tree.len(),
            tree.height(),
            unprocessed,
            real,
            user,
            user - real,
        );
        let _ = io::stdout().flush();
    }

    let depth = tree.depth(final_id);
    if depth > finaldepth {
        util::say(
            config,
            &format!(
                "New finalized size: {} (depth={}) real={:.1}s, user={:.1}s, speedup=~{:.1}s",
                final_task.size(),
                depth,
                real,
                user,
                user - real,
            ),
        );
        return depth;
    }
    finaldepth
}

/// Prints the end-of-strategy tree summary.
fn show_statistics(config: &Config, tree: &Tree) {
    tracing::info!(
        treesize = tree.len(),
        height = tree.height(),
        "analyzing final tree"
    );

    let mut success = 0u32;
    let mut failure = 0u32;
    let mut discarded = 0u32;
    let mut compute = tree.collapsed_time();
    for task in tree.arena_tasks() {
        let status = task.status();
        assert_ne!(status, TaskStatus::Pending, "pending task after drain");
        match status {
            TaskStatus::Success => success += 1,
            TaskStatus::Failure => failure += 1,
            TaskStatus::Discarded => discarded += 1,
            TaskStatus::Pending => unreachable!(),
        }
        if status != TaskStatus::Discarded {
            if let Some(elapsed) = task.elapsed() {
                compute += elapsed;
            }
        }
    }

    util::say(
        config,
        &format!("{failure} nodes failed, {success} worked, {discarded} discarded"),
    );
    util::say(
        config,
        &format!(
            "{:.3} seconds of compute was required for final path",
            compute.as_secs_f64()
        ),
    );
}

/// Clones the descriptor of the deepest finalized success.
fn duplicate_final_blob(tree: &Tree) -> io::Result<File> {
    let final_id = tree
        .find_finalized(true)
        .expect("a finalized run always has a success path");
    let task = tree.task(final_id).expect("finalized node carries a task");
    assert_eq!(task.status(), TaskStatus::Success);
    let guard = task.lock_data();
    let blob = guard.as_ref().expect("final success retains its data");
    blob.try_clone()
}
