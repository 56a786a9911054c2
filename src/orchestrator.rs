//! Strategy sequencing and final output.
//!
//! Runs every strategy over the shrinking blob, optionally looping until
//! the size reaches a fixed point, then writes the result.

use std::fmt;
use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::config::Config;
use crate::driver::{self, DriveError};
use crate::strategy::{Bisect, Strategy, Zero};
use crate::util;

/// A failed minimization run.
#[derive(Debug)]
#[non_exhaustive]
pub enum MinimizeError {
    /// The predicate rejected the original input.
    Verification,
    /// Everything else: unreadable input, candidate I/O, output write.
    Io(io::Error),
}

impl fmt::Display for MinimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verification => write!(f, "the predicate rejected the original input"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MinimizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for MinimizeError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<DriveError> for MinimizeError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::VerificationFailed => Self::Verification,
            DriveError::Io(err) => Self::Io(err),
        }
    }
}

/// Minimizes the configured input and writes the result.
///
/// # Errors
/// Fails on verification rejection or any I/O error; predicate failures are
/// the algorithm's bread and butter, never errors.
pub fn minimize(config: &Arc<Config>) -> Result<(), MinimizeError> {
    // Every live Success node retains a descriptor, so the default soft
    // limit is too small for real runs on some distributions.
    raise_fd_limit();

    let mut current = File::open(&config.input_file)?;
    let strategies: Vec<Box<dyn Strategy>> =
        vec![Box::new(Bisect), Box::new(Zero::new(config.zero_char))];

    loop {
        let before = util::file_size(&current)?;

        for strategy in &strategies {
            util::say(
                config,
                &format!(
                    "Input file \"{}\" is now {} bytes, starting strategy \"{}\"...",
                    config.input_file.display(),
                    util::file_size(&current)?,
                    strategy.name()
                ),
            );

            current = driver::drive(config, current, strategy.as_ref())?;

            util::say(
                config,
                &format!(
                    "Strategy \"{}\" complete, output {} bytes",
                    strategy.name(),
                    util::file_size(&current)?
                ),
            );
        }

        // Simplifying can shake out new minimization paths; under --stable
        // the whole cycle repeats until the size stops moving.
        if config.stable && util::file_size(&current)? < before {
            util::say(
                config,
                "Minimization succeeded, testing if minimization is stable...",
            );
            continue;
        }
        if config.stable {
            util::say(config, "Minimization stable, all work done.");
        }
        break;
    }

    let size = util::file_size(&current)?;
    util::say(
        config,
        &format!(
            "All work complete, generating output {} (size: {})",
            config.output_file.display(),
            size
        ),
    );

    let output = File::create(&config.output_file)?;
    util::copy_range(&current, &output, 0, size)?;
    Ok(())
}

/// Raises the descriptor limit to its hard maximum. Best effort; a refusal
/// just means big runs may hit EMFILE sooner.
fn raise_fd_limit() {
    unsafe {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) != 0 {
            tracing::warn!("failed to query RLIMIT_NOFILE, use \"ulimit -n\" instead");
            return;
        }
        lim.rlim_cur = lim.rlim_max;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) != 0 {
            tracing::warn!("failed to raise RLIMIT_NOFILE, use \"ulimit -n\" if necessary");
        }
    }
}
