use clap::{Parser, Subcommand};

/// Fixed verb surface: `<program> <command> [mode]`.
#[derive(Parser, Debug)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Boot the master and fork the configured workers.
    Start {
        /// Detach from the terminal and run as a daemon.
        #[arg(short = 'd')]
        daemon: bool,
        /// Suppress the startup banner.
        #[arg(short = 'q')]
        quiet: bool,
    },
    /// Stop a running master (and its workers).
    Stop {
        /// Let connections drain instead of forcing them closed.
        #[arg(short = 'g')]
        graceful: bool,
    },
    /// Stop, then start again.
    Restart {
        #[arg(short = 'd')]
        daemon: bool,
        #[arg(short = 'g')]
        graceful: bool,
        #[arg(short = 'q')]
        quiet: bool,
    },
    /// Recycle reloadable workers one at a time.
    Reload {
        #[arg(short = 'g')]
        graceful: bool,
    },
    /// Print the status dump of a running master.
    Status {
        /// Refresh continuously, clearing the terminal each round.
        #[arg(short = 'd')]
        live: bool,
    },
    /// Print one row per live TCP connection.
    Connections,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verbs_and_modes_parse() {
        let cli = Cli::try_parse_from(["app", "start", "-d", "-q"]).expect("start");
        assert!(matches!(cli.command, Command::Start { daemon: true, quiet: true }));

        let cli = Cli::try_parse_from(["app", "stop", "-g"]).expect("stop");
        assert!(matches!(cli.command, Command::Stop { graceful: true }));

        let cli = Cli::try_parse_from(["app", "status"]).expect("status");
        assert!(matches!(cli.command, Command::Status { live: false }));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        assert!(Cli::try_parse_from(["app", "frobnicate"]).is_err());
        assert!(Cli::try_parse_from(["app"]).is_err());
        Cli::command().debug_assert();
    }
}
