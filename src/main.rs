use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use halfempty::orchestrator::{self, MinimizeError};
use halfempty::{cli, Config};

fn main() -> ExitCode {
    let config = cli::parse_args();
    init_tracing(&config);

    if !config.quiet {
        banner();
    }

    let config = Arc::new(config);
    match orchestrator::minimize(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(MinimizeError::Verification) => {
            eprintln!(
                "This program expected `{}` to return successfully (exitcode zero) for the original input",
                config.command_path.display()
            );
            eprintln!("Try it yourself to verify it's working");
            ExitCode::FAILURE
        }
        Err(err) => {
            eprintln!("halfempty: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::EnvFilter;

    let default = match config.verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// It's hard to make something look like a glass in ascii.
fn banner() {
    const RESET: &str = "\x1b[0m";
    const GLASS: &str = "\x1b[36m";
    const MILK: &str = "\x1b[47m\x1b[30m";
    let version = env!("CARGO_PKG_VERSION");
    let cores = num_cpus::get();

    if !std::io::stdout().is_terminal() {
        println!("halfempty v{version} - a fast, parallel testcase minimization tool");
        return;
    }
    println!(
        "{GLASS}\u{256d}\u{2502}   \u{2502}{RESET} \u{2500}\u{2500} halfempty \u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500} v{version} \u{2500}\u{2500}"
    );
    println!(
        "{GLASS}\u{2570}\u{2502}{MILK}{cores:3}{RESET}{GLASS}\u{2502}{RESET} A fast, parallel testcase minimization tool"
    );
    println!(
        "{GLASS} \u{2570}\u{2500}\u{2500}\u{2500}\u{256f}{RESET} \u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}\u{2500}"
    );
}
