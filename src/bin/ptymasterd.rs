use std::path::PathBuf;

use clap::Parser;
use ptymaster::daemon::{Daemon, DEFAULT_SOCKET_PATH};
use tracing_subscriber::EnvFilter;

/// A local PTY multiplexer daemon: one shell per session, many attached
/// clients, over a Unix socket.
#[derive(Parser, Debug)]
#[command(name = "ptymasterd", version, about)]
struct Cli {
    /// Path to the listening Unix socket.
    #[arg(long, default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Shell to exec for new sessions. Defaults to $SHELL, then /bin/bash.
    #[arg(long)]
    shell: Option<String>,

    /// Raise log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let shell = cli
        .shell
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/bash".to_string());

    let daemon = Daemon::new(cli.socket, shell);
    let handle = daemon.handle();

    if let Err(err) = ctrlc::set_handler(move || {
        handle.stop();
    }) {
        tracing::warn!(error = %err, "failed to install signal handler");
    }

    if let Err(err) = daemon.start() {
        tracing::error!(error = %err, "daemon exited with error");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
