//! Command-line surface of a server binary.

use clap::{Parser, Subcommand};

/// Exit code for internal fatals: a dead event loop or an unhandled
/// exception escaping a worker.
pub const FATAL_EXIT_CODE: i32 = 250;

#[derive(Debug, Parser)]
#[command(about = "Multi-process socket server", disable_version_flag = true)]
pub struct Cli {
    #[command(subcommand)]
    pub verb: Verb,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Verb {
    /// Run the master and its worker pool.
    Start {
        /// Detach and run as a daemon.
        #[arg(short = 'd', long)]
        daemon: bool,
        /// Skip the startup banner.
        #[arg(short = 'q', long)]
        quiet: bool,
    },
    /// Stop the running master (with `-g`, drain connections first).
    Stop {
        #[arg(short = 'g', long)]
        graceful: bool,
    },
    /// Stop, then start again.
    Restart {
        #[arg(short = 'g', long)]
        graceful: bool,
        #[arg(short = 'd', long)]
        daemon: bool,
        #[arg(short = 'q', long)]
        quiet: bool,
    },
    /// Restart workers one at a time (with `-g`, after they drain).
    Reload {
        #[arg(short = 'g', long)]
        graceful: bool,
    },
    /// Print the master/worker status dump (with `-d`, refresh live).
    Status {
        #[arg(short = 'd', long)]
        live: bool,
    },
    /// Print one row per live connection across all workers.
    Connections,
}

impl Cli {
    pub fn parse_args() -> Self {
        // clap prints usage to stderr and exits non-zero on unknown verbs.
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbs_and_flags_parse() {
        let cli = Cli::try_parse_from(["app", "start", "-d", "-q"]).unwrap();
        assert!(matches!(
            cli.verb,
            Verb::Start {
                daemon: true,
                quiet: true
            }
        ));

        let cli = Cli::try_parse_from(["app", "stop", "-g"]).unwrap();
        assert!(matches!(cli.verb, Verb::Stop { graceful: true }));

        let cli = Cli::try_parse_from(["app", "connections"]).unwrap();
        assert!(matches!(cli.verb, Verb::Connections));
    }

    #[test]
    fn unknown_verb_is_an_error() {
        assert!(Cli::try_parse_from(["app", "flush"]).is_err());
    }
}
