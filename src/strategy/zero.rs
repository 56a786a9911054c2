//! Chunk-overwrite simplification.
//!
//! Same schedule as bisection, but instead of deleting the window it is
//! overwritten with a fill byte, so the file size never changes. Useful when
//! the predicate is sensitive to offsets or lengths.
//!
//! Re-testing a window that is already filled is pure waste, so before
//! materializing, the proposal is checked two ways: against every
//! successful ancestor's window (a success means its window really was
//! filled in the data this candidate would inherit), and against the actual
//! source bytes. Either hit advances the window and the scan starts over.
//! The scan is O(depth * cycles); that is the price of never re-testing
//! known-redundant candidates.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::FileExt;

use crate::task::{Task, TaskStatus};
use crate::tree::{NodeId, Tree};
use crate::util;

use super::{find_source, successor_state, ChunkState, Strategy};

/// Overwrite consecutively smaller chunks with a fixed byte.
pub struct Zero {
    fill: u8,
}

impl Zero {
    /// Creates the strategy with the configured fill byte.
    pub fn new(fill: u8) -> Zero {
        Zero { fill }
    }
}

impl Strategy for Zero {
    fn name(&self) -> &'static str {
        "zero"
    }

    fn description(&self) -> &'static str {
        "Zero consecutively larger chunks of data from the file"
    }

    fn next(&self, tree: &Tree, parent: NodeId) -> io::Result<Option<Task>> {
        let parent_task = tree.task(parent).expect("strategy needs a task-bearing node");
        let parent_state = *parent_task
            .state()
            .expect("schedule state is primed before the tree grows");
        // This strategy never changes the file size, so every task shares it.
        let size = parent_task.size();

        let mut state = successor_state(parent_state, size, true);
        if state.chunksize == 0 {
            tracing::info!("final cycle complete");
            return Ok(None);
        }

        let source = find_source(tree, parent);
        let guard = source.lock_data();
        let src = guard.as_ref().expect("a success task retains its data");
        assert_eq!(
            source.size(),
            util::file_size(src)?,
            "source task size does not match its file"
        );

        let mut adjust = 0u32;
        'restart: loop {
            // A successful ancestor whose window wholly contains the proposal
            // already filled those bytes in the data we would inherit. The
            // root does not count: its window is the initial schedule, not an
            // applied fill.
            for anc in tree.ancestors(parent) {
                if anc == tree.root() {
                    continue;
                }
                let task = tree.task(anc).expect("ancestor chain carries tasks");
                if task.status() != TaskStatus::Success {
                    continue;
                }
                let window = task.state().expect("published tasks carry state");
                // An ancestor cannot have a smaller chunk than a descendant.
                assert!(state.chunksize <= window.chunksize);

                let mut adjusted = false;
                while state.offset >= window.offset
                    && state.offset + state.chunksize <= window.offset + window.chunksize
                {
                    adjusted = true;
                    adjust += 1;
                    if !advance_window(&mut state, size) {
                        tracing::info!("final cycle complete, cannot start a new cycle");
                        return Ok(None);
                    }
                }
                if adjusted {
                    continue 'restart;
                }
            }

            // The source may already hold the fill byte here even without a
            // recorded success, for example from the original input.
            if range_already_filled(src, state.offset, state.chunksize, self.fill)? {
                tracing::debug!(
                    offset = state.offset,
                    chunksize = state.chunksize,
                    "window already filled, skipping"
                );
                if !advance_window(&mut state, size) {
                    tracing::info!("final cycle complete, cannot start a new cycle");
                    return Ok(None);
                }
                continue 'restart;
            }
            break;
        }

        tracing::debug!(
            adjust,
            offset = state.offset,
            chunksize = state.chunksize,
            "zero candidate window settled"
        );

        if state.offset > source.size() {
            return Ok(None);
        }

        let out = tempfile::tempfile()?;
        util::copy_range(src, &out, 0, state.offset)?;
        write_fill(
            &out,
            self.fill,
            state.chunksize.min(source.size() - state.offset),
        )?;
        if state.offset + state.chunksize <= source.size() {
            let tail = source.size() - state.chunksize - state.offset;
            util::copy_range(src, &out, state.offset + state.chunksize, tail)?;
        }

        let size = source.size();
        assert_eq!(
            size,
            util::file_size(&out)?,
            "zero candidate must keep the source size"
        );
        Ok(Some(Task::new(out, size, state)))
    }
}

/// Moves the window forward one chunk, rolling into the next cycle when it
/// runs off the end. Returns false when the schedule is exhausted.
fn advance_window(state: &mut ChunkState, limit: u64) -> bool {
    state.offset += state.chunksize;
    if state.offset > limit {
        state.offset = 0;
        state.chunksize >>= 1;
        if state.chunksize == 0 {
            return false;
        }
    }
    true
}

/// True if `len` bytes at `offset` already hold `fill`. Bytes past the end
/// of the file read as zero, matching what an overwrite there would leave.
fn range_already_filled(src: &File, offset: u64, len: u64, fill: u8) -> io::Result<bool> {
    let mut buf = [0u8; 64 * 1024];
    let mut pos = offset;
    let mut left = len;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let got = src.read_at(&mut buf[..want], pos)?;
        if got == 0 {
            return Ok(fill == 0);
        }
        if buf[..got].iter().any(|&b| b != fill) {
            return Ok(false);
        }
        pos += got as u64;
        left -= got as u64;
    }
    Ok(true)
}

/// Appends `len` copies of `fill` at the file's write position.
fn write_fill(out: &File, fill: u8, len: u64) -> io::Result<()> {
    let buf = [fill; 64 * 1024];
    let mut left = len;
    let mut out = out;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    Ok(())
}
