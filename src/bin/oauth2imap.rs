//! CLI entry point: the three front-ends from 4.G sharing the session
//! engine in `oauth2imap::session`. Argument parsing, help text and
//! packaging are non-goals per spec.md §1; this is the thinnest clap
//! wiring that gets a subcommand dispatched.

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, error};

use oauth2imap::authflow::{self, LoopbackHttpSource, StdinPasteSource};
use oauth2imap::{config, provider, server, tunnel};

#[derive(Parser)]
#[command(
    name = "oauth2imap",
    version,
    about = "Local IMAP4rev1 gateway proxying plain-auth clients to an OAuth2 upstream provider"
)]
struct Cli {
    /// Increase verbosity; repeat for more (info, then debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output critical information only.
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Bind a listening downstream IMAP server; one session per connection.
    Server,
    /// Run a single session tunnelled over stdin/stdout.
    Tunnel,
    /// Bootstrap or refresh the token cache via an authorization-code grant.
    Auth {
        #[arg(long, value_enum, default_value_t = AuthFlow::Loopback)]
        flow: AuthFlow,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AuthFlow {
    /// Capture the redirect with a one-shot loopback HTTP server.
    Loopback,
    /// Paste the authorization code back in on stdin.
    Stdin,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logger(cli.verbose, cli.quiet);

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_logger(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .init();
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Server => server::run(config::load()?),
        Command::Tunnel => tunnel::run(config::load()?),
        Command::Auth { flow } => {
            let config = config::load()?;
            let provider = provider::resolve(config.provider_name()?, &config.upstream)?;

            match flow {
                AuthFlow::Loopback => {
                    let source = LoopbackHttpSource::bind()?;
                    authflow::run(&provider, &config.tokens_file(), &source)
                }
                AuthFlow::Stdin => authflow::run(&provider, &config.tokens_file(), &StdinPasteSource),
            }
        }
    }
}
