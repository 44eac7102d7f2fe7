use clap::Parser;

/// drop - run a command with lowered privileges
///
/// Starts the given command under a Medium integrity "normal user" token
/// derived from the current one, so an elevated shell can launch programs
/// without handing them administrative rights.
#[derive(Parser, Debug)]
#[command(
    name = "drop",
    version,
    about = "Run a command with lowered privileges",
    long_about = "Runs <exec_path> [args...] under a Medium integrity token derived from\n\
                  the current one and exits with the command's exit code."
)]
pub struct Cli {
    /// Be verbose about what you're doing (repeat for more)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Command and its arguments to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Executable to run and its arguments
    pub fn split(&self) -> (&str, &[String]) {
        match self.command.split_first() {
            Some((exec, args)) => (exec.as_str(), args),
            None => ("", &[]),
        }
    }

    /// Default log filter for the verbosity level
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
