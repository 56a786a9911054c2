//! Minimization strategies.
//!
//! A strategy is asked for the next candidate below a given tree node. It
//! inspects the node's task (its "parent"), derives the next schedule state,
//! pulls bytes from the nearest successful ancestor (the "source"), and
//! materializes a fresh unlinked temporary file. Returning `None` signals
//! that no further work is reachable from that position.
//!
//! The parent and the source are different things: the parent decides *where
//! the schedule is*, the source decides *which bytes exist*. A failed parent
//! may have had data removed that the next candidate still needs, so the
//! source must be a Success node (the root always qualifies).
//!
//! Both shipped strategies walk the same `(offset, chunksize)` schedule: try
//! every chunk-aligned window of the current chunk size, then halve the
//! chunk size and start over, until the chunk size reaches zero.

use std::io;
use std::sync::Arc;

use crate::task::{Task, TaskStatus};
use crate::tree::{NodeId, Tree};

mod bisect;
mod zero;

pub use bisect::Bisect;
pub use zero::Zero;

/// Schedule state attached to every task.
///
/// The window `[offset, offset + chunksize)` is the chunk this candidate
/// removed (bisect) or overwrote (zero), relative to its source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkState {
    /// Start of the chunk window.
    pub offset: u64,
    /// Width of the chunk window. Zero means the schedule is exhausted.
    pub chunksize: u64,
}

/// A reduction policy plugged into the tree driver.
pub trait Strategy: Sync {
    /// Short name used in progress output.
    fn name(&self) -> &'static str;

    /// One-line description for help output.
    fn description(&self) -> &'static str;

    /// Produces the next candidate below `parent`, or `None` when no further
    /// work is reachable from that position.
    ///
    /// Called with the tree lock held; may block on the source task's mutex
    /// while copying bytes.
    ///
    /// # Errors
    /// I/O failures while materializing a candidate are fatal to the run.
    fn next(&self, tree: &Tree, parent: NodeId) -> io::Result<Option<Task>>;

    /// Primes the root task's schedule state at the start of a run.
    fn prime_root(&self, root: &Task) {
        if root.state().is_none() {
            root.prime_state(ChunkState {
                offset: 0,
                chunksize: root.size(),
            });
        }
    }
}

/// Advances the schedule from a parent's state to its child's.
///
/// When the parent's window ran past the end of the file, the cycle is over:
/// restart at offset zero with half the chunk size. Otherwise move to the
/// next window if `advance` is set; a parent that successfully removed its
/// chunk keeps its offset, because the bytes that used to be there are gone.
pub fn successor_state(parent: ChunkState, parent_size: u64, advance: bool) -> ChunkState {
    let mut state = parent;
    if parent.offset + parent.chunksize > parent_size {
        tracing::debug!(
            offset = parent.offset,
            chunksize = parent.chunksize,
            size = parent_size,
            "cycle complete, halving chunk size"
        );
        state.offset = 0;
        state.chunksize >>= 1;
    } else if advance {
        state.offset += state.chunksize;
    }
    state
}

/// Finds the node whose data a new candidate is derived from: the nearest
/// ancestor (starting at `parent` itself) whose task succeeded.
///
/// # Panics
/// Panics if no Success ancestor exists; the root is always Success once the
/// run starts, so that indicates a corrupt tree.
pub fn find_source(tree: &Tree, parent: NodeId) -> Arc<Task> {
    for id in tree.ancestors(parent) {
        let task = tree.task(id).expect("ancestor chain carries tasks");
        if task.status() == TaskStatus::Success {
            return Arc::clone(task);
        }
    }
    panic!("no successful ancestor; the root must be a success");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_offset_without_advance() {
        let s = successor_state(
            ChunkState {
                offset: 8,
                chunksize: 4,
            },
            16,
            false,
        );
        assert_eq!(
            s,
            ChunkState {
                offset: 8,
                chunksize: 4
            }
        );
    }

    #[test]
    fn advances_by_one_chunk() {
        let s = successor_state(
            ChunkState {
                offset: 8,
                chunksize: 4,
            },
            16,
            true,
        );
        assert_eq!(
            s,
            ChunkState {
                offset: 12,
                chunksize: 4
            }
        );
    }

    #[test]
    fn rolls_over_into_a_smaller_cycle() {
        // 12 + 8 runs past a 16 byte file, so the next cycle starts.
        let s = successor_state(
            ChunkState {
                offset: 12,
                chunksize: 8,
            },
            16,
            true,
        );
        assert_eq!(
            s,
            ChunkState {
                offset: 0,
                chunksize: 4
            }
        );
    }

    #[test]
    fn window_flush_with_the_end_does_not_roll_over() {
        let s = successor_state(
            ChunkState {
                offset: 12,
                chunksize: 4,
            },
            16,
            true,
        );
        assert_eq!(
            s,
            ChunkState {
                offset: 16,
                chunksize: 4
            }
        );
    }

    #[test]
    fn chunksize_one_halves_to_exhaustion() {
        let s = successor_state(
            ChunkState {
                offset: 4,
                chunksize: 1,
            },
            4,
            true,
        );
        assert_eq!(s.chunksize, 0);
    }
}
