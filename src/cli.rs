//! Command line parsing.
//!
//! Hand-rolled `--flag=value` parser; no option crate needed for a fixed
//! flag set and it keeps startup instant.
//!
//! # Grammar
//!
//! ```text
//! halfempty [FLAGS] SCRIPT INPUTFILE
//! ```
//!
//! `SCRIPT` is executed with each candidate on stdin; exit 0 means the
//! candidate is still interesting.

use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::limits::{self, ChildLimit};

/// Parses the process arguments, exiting with code 2 on invalid usage.
pub fn parse_args() -> Config {
    let mut args = env::args_os();
    let exe = args.next().unwrap_or_else(|| "halfempty".into());

    match parse_from(args) {
        Ok(config) => config,
        Err(Usage::Help) => {
            print_usage(&exe.to_string_lossy());
            std::process::exit(0);
        }
        Err(Usage::Invalid(msg)) => {
            eprintln!("error: {msg}");
            eprintln!();
            print_usage(&exe.to_string_lossy());
            std::process::exit(2);
        }
    }
}

/// Why parsing stopped without a configuration.
#[derive(Debug)]
pub enum Usage {
    /// `--help` was requested.
    Help,
    /// Bad flag, bad value, or unusable positional arguments.
    Invalid(String),
}

/// Parses an argument list into a validated [`Config`].
///
/// # Errors
/// Returns [`Usage::Invalid`] with a human-readable reason; the predicate
/// must exist and be executable, the input must be readable.
pub fn parse_from(args: impl Iterator<Item = OsString>) -> Result<Config, Usage> {
    let mut config = Config::default();
    let mut positional: Vec<PathBuf> = Vec::new();

    for arg in args {
        let Some(flag) = arg.to_str() else {
            // Paths may be arbitrary bytes; flags must be UTF-8.
            positional.push(PathBuf::from(arg));
            continue;
        };

        if let Some(rest) = flag.strip_prefix("--num-threads=") {
            config.num_threads = parse_num(rest, "--num-threads")?;
        } else if let Some(rest) = flag.strip_prefix("--cleanup-threads=") {
            config.cleanup_threads = parse_num(rest, "--cleanup-threads")?;
        } else if let Some(rest) = flag.strip_prefix("--max-queue=") {
            config.max_unprocessed = parse_num(rest, "--max-queue")?;
        } else if let Some(rest) = flag.strip_prefix("--poll-delay=") {
            config.poll_delay = Duration::from_micros(parse_num(rest, "--poll-delay")?);
        } else if let Some(rest) = flag.strip_prefix("--timeout=") {
            let secs: u64 = parse_num(rest, "--timeout")?;
            config.timeout = (secs > 0).then(|| Duration::from_secs(secs));
        } else if let Some(rest) = flag.strip_prefix("--limit=") {
            let limit = ChildLimit::parse(rest)
                .map_err(|e| Usage::Invalid(format!("--limit: {e}")))?;
            limits::upsert(&mut config.child_limits, limit);
        } else if let Some(rest) = flag.strip_prefix("--term-signal=") {
            config.term_signal = parse_num(rest, "--term-signal")?;
        } else if let Some(rest) = flag.strip_prefix("--zero-char=") {
            config.zero_char = parse_num(rest, "--zero-char")?;
        } else if let Some(rest) = flag.strip_prefix("--output=") {
            config.output_file = PathBuf::from(rest);
        } else if let Some(rest) = flag.strip_prefix("--max-tree-depth=") {
            config.max_tree_depth = parse_num(rest, "--max-tree-depth")?;
        } else if let Some(rest) = flag.strip_prefix("--sleep=") {
            config.pre_exec_sleep = parse_num(rest, "--sleep")?;
        } else if let Some(rest) = flag.strip_prefix("--verbosity=") {
            config.verbosity = parse_num(rest, "--verbosity")?;
        } else {
            match flag {
                "--no-terminate" => config.terminate_discarded = false,
                "--inherit-stdout" => config.inherit_stdout = true,
                "--inherit-stderr" => config.inherit_stderr = true,
                "--noverify" => config.verify_input = false,
                "--stable" => config.stable = true,
                "--quiet" | "-q" => config.quiet = true,
                "--generate-dot" => config.generate_dot = true,
                "--monitor" => config.monitor = true,
                "--help" | "-h" => return Err(Usage::Help),
                _ if flag.starts_with("--") => {
                    return Err(Usage::Invalid(format!("unknown flag: {flag}")));
                }
                _ => positional.push(PathBuf::from(flag)),
            }
        }
    }

    let [script, input] = <[PathBuf; 2]>::try_from(positional).map_err(|got| {
        Usage::Invalid(format!(
            "expected two parameters, a test program and an inputfile (got {})",
            got.len()
        ))
    })?;

    if !is_executable(&script) {
        return Err(Usage::Invalid(format!(
            "the test program `{}` does not seem to be executable",
            script.display()
        )));
    }
    if !is_readable(&input) {
        return Err(Usage::Invalid(format!(
            "the inputfile specified `{}` does not seem valid",
            input.display()
        )));
    }

    config.command_path = script;
    config.input_file = input;
    config.validate().map_err(Usage::Invalid)?;
    Ok(config)
}

fn parse_num<T: std::str::FromStr>(value: &str, flag: &str) -> Result<T, Usage> {
    value
        .parse()
        .map_err(|_| Usage::Invalid(format!("{flag} got invalid value `{value}`")))
}

fn is_executable(path: &std::path::Path) -> bool {
    access(path, libc::X_OK)
}

fn is_readable(path: &std::path::Path) -> bool {
    access(path, libc::R_OK)
}

fn access(path: &std::path::Path, mode: libc::c_int) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(cpath.as_ptr(), mode) == 0 }
}

fn print_usage(exe: &str) {
    eprintln!("usage: {exe} [FLAGS] SCRIPT INPUTFILE");
    eprintln!();
    eprintln!("Execute SCRIPT with candidate simplifications of INPUTFILE on stdin,");
    eprintln!("keeping the smallest candidate SCRIPT still exits zero for.");
    eprintln!();
    eprintln!("performance:");
    eprintln!("  --num-threads=N       worker threads (default: cores + 1)");
    eprintln!("  --cleanup-threads=N   garbage collection threads (default: 4)");
    eprintln!("  --max-queue=N         maximum unprocessed workunits (default: 2)");
    eprintln!("  --poll-delay=USECS    backoff unit between queue checks (default: 10000)");
    eprintln!("  --max-tree-depth=N    compress the tree above this height (default: 512)");
    eprintln!();
    eprintln!("test program:");
    eprintln!("  --timeout=SECONDS     SIGALRM the test program group after this long");
    eprintln!("  --limit=RLIMIT_X=N    set a child resource limit (repeatable)");
    eprintln!("  --no-terminate        don't signal mispredicted tests early");
    eprintln!("  --term-signal=N       signal for discarded workers (default: 15)");
    eprintln!("  --inherit-stdout      don't redirect child stdout to /dev/null");
    eprintln!("  --inherit-stderr      don't redirect child stderr to /dev/null");
    eprintln!();
    eprintln!("behavior:");
    eprintln!("  --output=PATH         result location (default: halfempty.out)");
    eprintln!("  --stable              re-run all strategies until the size is stable");
    eprintln!("  --noverify            skip verifying the original input");
    eprintln!("  --zero-char=BYTE      fill byte for the zero strategy (default: 0)");
    eprintln!("  --quiet, -q           only print errors");
    eprintln!();
    eprintln!("debugging:");
    eprintln!("  --generate-dot        write a DOT file of the final tree");
    eprintln!("  --monitor             render live progress for your browser");
    eprintln!("  --verbosity=N         diagnostic log level (default: 0)");
    eprintln!("  --sleep=SECONDS       delay children before exec");
}
