//! Small file and pipe helpers shared across the engine.
//!
//! Candidate blobs live in unlinked temporary files and move between file
//! descriptors a lot: strategies splice ranges of a source blob into a fresh
//! candidate, and the runner streams a candidate into the predicate's stdin.
//! On Linux both paths use zero-copy syscalls (`sendfile`, `splice`) with a
//! portable read/write fallback.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;

use crate::config::Config;

/// Buffer size for the portable copy fallbacks.
const COPY_BUF_LEN: usize = 64 * 1024;

/// Prints a user-facing event line, respecting quiet mode.
///
/// On a terminal the transient status line is cleared first so discrete
/// events never interleave with its leftovers.
pub fn say(config: &Config, msg: &str) {
    if config.quiet {
        return;
    }
    if io::stdout().is_terminal() {
        print!("\x1b[0K");
    }
    println!("{msg}");
}

/// Returns the current byte length of an open file.
pub fn file_size(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Copies `count` bytes from `src` starting at `offset` to `dst`'s current
/// write position.
///
/// The source read position is not disturbed on Linux; the fallback seeks.
/// Short transfers are retried until `count` bytes have moved.
///
/// # Errors
/// Returns the underlying I/O error, or `UnexpectedEof` if the source ends
/// before `count` bytes were copied.
pub fn copy_range(src: &File, dst: &File, offset: u64, count: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let mut off = offset as libc::off_t;
        let mut left = count;
        while left > 0 {
            let n = unsafe {
                libc::sendfile(
                    dst.as_raw_fd(),
                    src.as_raw_fd(),
                    &mut off,
                    left.min(usize::MAX as u64) as usize,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                // Some filesystems reject sendfile; fall back below.
                if err.raw_os_error() == Some(libc::EINVAL) && left == count {
                    break;
                }
                return Err(err);
            }
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            left -= n as u64;
        }
        if left == 0 {
            return Ok(());
        }
    }

    copy_range_generic(src, dst, offset, count)
}

/// Portable `copy_range` using positioned reads and plain writes.
fn copy_range_generic(src: &File, dst: &File, offset: u64, count: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    let mut buf = [0u8; COPY_BUF_LEN];
    let mut pos = offset;
    let mut left = count;
    let mut out = dst;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let got = src.read_at(&mut buf[..want], pos)?;
        if got == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        out.write_all(&buf[..got])?;
        pos += got as u64;
        left -= got as u64;
    }
    Ok(())
}

/// Streams `len` bytes of `data` (from offset 0) into a pipe.
///
/// Uses `splice` where available. A predicate is free to exit without
/// consuming its stdin, so a broken pipe terminates the feed silently
/// rather than failing the run.
pub fn feed_pipe<W: Write + AsRawFd>(data: &File, pipe: &mut W, len: u64) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let mut off: libc::loff_t = 0;
        let mut left = len;
        let mut spliced_any = false;
        while left > 0 {
            let n = unsafe {
                libc::splice(
                    data.as_raw_fd(),
                    &mut off,
                    pipe.as_raw_fd(),
                    std::ptr::null_mut(),
                    left.min(usize::MAX as u64) as usize,
                    0,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EPIPE) => return Ok(()),
                    // splice can refuse unusual descriptor pairs; fall back
                    // only if nothing moved yet.
                    Some(libc::EINVAL) if !spliced_any => break,
                    _ => return Err(err),
                }
            }
            if n == 0 {
                return Ok(());
            }
            spliced_any = true;
            left -= n as u64;
        }
        if left == 0 || spliced_any {
            return Ok(());
        }
    }

    feed_pipe_generic(data, pipe, len)
}

/// Portable pipe feed for platforms or descriptor pairs without `splice`.
fn feed_pipe_generic<W: Write>(data: &File, pipe: &mut W, len: u64) -> io::Result<()> {
    let mut src = data;
    src.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; COPY_BUF_LEN];
    let mut left = len;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        let got = src.read(&mut buf[..want])?;
        if got == 0 {
            break;
        }
        match pipe.write_all(&buf[..got]) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(err) => return Err(err),
        }
        left -= got as u64;
    }
    Ok(())
}
