//! Resource limits applied to predicate children.
//!
//! Users pass `--limit=RLIMIT_CPU=60` style specifications on the command
//! line; each one becomes a `setrlimit` call in the child between fork and
//! exec. Core dumps are disabled by default so crashing predicates do not
//! litter the filesystem (override with `--limit=RLIMIT_CORE=N`).

use std::fmt;

/// One resource limit to install in the child before exec.
///
/// Both the soft and hard limit are set to `value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildLimit {
    /// `RLIMIT_*` resource number.
    pub resource: libc::c_int,
    /// Limit value in the resource's native unit.
    pub value: u64,
}

/// Names accepted by `--limit`, paired with their resource numbers.
const LIMIT_NAMES: &[(&str, libc::c_int)] = &[
    ("RLIMIT_CPU", libc::RLIMIT_CPU as libc::c_int),
    ("RLIMIT_FSIZE", libc::RLIMIT_FSIZE as libc::c_int),
    ("RLIMIT_DATA", libc::RLIMIT_DATA as libc::c_int),
    ("RLIMIT_STACK", libc::RLIMIT_STACK as libc::c_int),
    ("RLIMIT_CORE", libc::RLIMIT_CORE as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_RSS", libc::RLIMIT_RSS as libc::c_int),
    ("RLIMIT_NOFILE", libc::RLIMIT_NOFILE as libc::c_int),
    ("RLIMIT_AS", libc::RLIMIT_AS as libc::c_int),
    ("RLIMIT_NPROC", libc::RLIMIT_NPROC as libc::c_int),
    ("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_LOCKS", libc::RLIMIT_LOCKS as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_SIGPENDING", libc::RLIMIT_SIGPENDING as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_MSGQUEUE", libc::RLIMIT_MSGQUEUE as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_NICE", libc::RLIMIT_NICE as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_RTPRIO", libc::RLIMIT_RTPRIO as libc::c_int),
    #[cfg(target_os = "linux")]
    ("RLIMIT_RTTIME", libc::RLIMIT_RTTIME as libc::c_int),
];

/// A `--limit` value that could not be parsed.
#[derive(Debug)]
#[non_exhaustive]
pub enum LimitParseError {
    /// The specification was not of the form `NAME=VALUE`.
    MissingSeparator,
    /// The resource name is not a recognized `RLIMIT_*` constant.
    UnknownResource(String),
    /// The value is not a non-negative integer.
    BadValue(String),
}

impl fmt::Display for LimitParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSeparator => {
                write!(f, "expected RLIMIT_RESOURCE=N, for example RLIMIT_CPU=120")
            }
            Self::UnknownResource(name) => {
                write!(
                    f,
                    "`{name}` is not a recognized limit name, see the setrlimit(3) manual"
                )
            }
            Self::BadValue(value) => write!(f, "`{value}` is not a valid limit value"),
        }
    }
}

impl std::error::Error for LimitParseError {}

impl ChildLimit {
    /// The limits installed when the user configures nothing.
    pub fn defaults() -> Vec<ChildLimit> {
        vec![ChildLimit {
            resource: libc::RLIMIT_CORE as libc::c_int,
            value: 0,
        }]
    }

    /// Parses a `RLIMIT_RESOURCE=N` specification.
    ///
    /// # Errors
    /// Returns a [`LimitParseError`] describing the malformed part.
    pub fn parse(spec: &str) -> Result<ChildLimit, LimitParseError> {
        let (name, value) = spec.split_once('=').ok_or(LimitParseError::MissingSeparator)?;
        let resource = LIMIT_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, r)| *r)
            .ok_or_else(|| LimitParseError::UnknownResource(name.to_string()))?;
        let value = parse_value(value).ok_or_else(|| LimitParseError::BadValue(value.to_string()))?;
        Ok(ChildLimit { resource, value })
    }

    /// The `RLIMIT_*` name for this limit, for diagnostics.
    pub fn name(&self) -> &'static str {
        LIMIT_NAMES
            .iter()
            .find(|(_, r)| *r == self.resource)
            .map(|(n, _)| *n)
            .unwrap_or("RLIMIT_?")
    }
}

fn parse_value(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Adds `limit` to `limits`, replacing any earlier entry for the same
/// resource so the last `--limit` wins.
pub fn upsert(limits: &mut Vec<ChildLimit>, limit: ChildLimit) {
    match limits.iter_mut().find(|l| l.resource == limit.resource) {
        Some(slot) => *slot = limit,
        None => limits.push(limit),
    }
}

/// Installs `limits` in the current process.
///
/// Called in the child between fork and exec, so it must stay async-signal
/// safe: raw syscalls only, no allocation.
///
/// # Safety
/// Must only be called from a `pre_exec` context.
pub(crate) unsafe fn apply_in_child(limits: &[ChildLimit]) -> std::io::Result<()> {
    for limit in limits {
        let rl = libc::rlimit {
            rlim_cur: limit.value as libc::rlim_t,
            rlim_max: limit.value as libc::rlim_t,
        };
        if libc::setrlimit(limit.resource as _, &rl) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
