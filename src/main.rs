mod cli;

use cli::Cli;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the `-v` derived log filter.
const LOG_ENV: &str = "PROCTRL_LOG";

fn main() {
    // A helper copy of this binary never gets past this line.
    proctrl::intercept_helper_args();

    std::process::exit(run());
}

fn run() -> i32 {
    let args = Cli::parse_args();
    init_tracing(args.log_level());

    match run_program(&args) {
        Ok(code) => {
            tracing::info!("child exited with code {}", code);
            code
        }
        Err(e) => {
            eprintln!("drop: {:#}", e);
            e.downcast_ref::<proctrl::ProcessError>()
                .map(|e| e.exit_code())
                .unwrap_or(1)
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Runs the command under a lowered token and returns its exit code.
#[cfg(windows)]
fn run_program(args: &Cli) -> anyhow::Result<i32> {
    use anyhow::Context;
    use proctrl::{InputSource, OutputSink, Process};

    let (exec, rest) = args.split();
    let token = proctrl::lower_privilege_token()
        .context("failed to generate lower privilege token")?;

    let mut process = Process::new("", exec, rest.iter().cloned())?;
    process.spawn_attributes_mut().token = Some(token);
    process.inherit_console(true);
    process.show_window(true);

    process
        .start(InputSource::Inherit, OutputSink::Inherit, OutputSink::Inherit)
        .with_context(|| format!("an error has occurred during program \"{}\" execution", exec))?;
    Ok(process.wait().code)
}

#[cfg(not(windows))]
fn run_program(args: &Cli) -> anyhow::Result<i32> {
    let (exec, _) = args.split();
    anyhow::bail!(
        "cannot run \"{}\": lowering the integrity level is only supported on windows",
        exec
    )
}
