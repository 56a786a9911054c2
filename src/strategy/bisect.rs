//! Chunk-removal bisection.
//!
//! Every candidate deletes the window `[offset, offset + chunksize)` from
//! its source. If the parent candidate succeeded the window stays put (the
//! bytes behind it are new, untested data); if it failed the window slides
//! forward. When a cycle runs off the end of the file the chunk size halves
//! and the sweep restarts at offset zero, down to a chunk size of one.

use std::io;

use crate::task::{Task, TaskStatus};
use crate::tree::{NodeId, Tree};
use crate::util;

use super::{find_source, successor_state, Strategy};

/// The default strategy: remove consecutively smaller chunks.
pub struct Bisect;

impl Strategy for Bisect {
    fn name(&self) -> &'static str {
        "bisect"
    }

    fn description(&self) -> &'static str {
        "Remove consecutively larger chunks of data from the file"
    }

    fn next(&self, tree: &Tree, parent: NodeId) -> io::Result<Option<Task>> {
        let parent_task = tree.task(parent).expect("strategy needs a task-bearing node");
        let parent_state = *parent_task
            .state()
            .expect("schedule state is primed before the tree grows");

        // Only a successful parent proves its chunk was removable; any other
        // outcome means the chunk has to go back and the window moves on.
        let advance = parent_task.status() != TaskStatus::Success;
        let state = successor_state(parent_state, parent_task.size(), advance);
        if state.chunksize == 0 {
            tracing::info!("final cycle complete");
            return Ok(None);
        }

        let source = find_source(tree, parent);
        if source.size() == 0 {
            tracing::info!("empty file succeeded, no further reduction possible");
            return Ok(None);
        }

        let guard = source.lock_data();
        let src = guard.as_ref().expect("a success task retains its data");
        assert_eq!(
            source.size(),
            util::file_size(src)?,
            "source task size does not match its file"
        );

        if state.offset > source.size() {
            return Ok(None);
        }

        let out = tempfile::tempfile()?;
        util::copy_range(src, &out, 0, state.offset)?;
        let mut size = state.offset;

        if state.offset + state.chunksize <= source.size() {
            let tail = source.size() - state.chunksize - state.offset;
            util::copy_range(src, &out, state.offset + state.chunksize, tail)?;
            size += tail;
        }

        tracing::debug!(
            offset = state.offset,
            chunksize = state.chunksize,
            size,
            "bisect candidate materialized"
        );
        Ok(Some(Task::new(out, size, state)))
    }
}
