use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "beach-pier",
    author,
    version,
    about = "Local WebSocket-to-PTY terminal bridge",
    args_conflicts_with_subcommands = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Relay server options (used when no subcommand is given)
    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Poll a running bridge until it answers or the polling window closes
    Probe(ProbeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the terminal relay to.
    #[arg(long, env = "BEACH_PIER_LISTEN_ADDR", default_value = "127.0.0.1:7681")]
    pub listen_addr: String,

    /// Shell launched for each connection (defaults to $SHELL, then /bin/sh).
    #[arg(long, env = "BEACH_PIER_SHELL")]
    pub shell: Option<String>,

    /// Extra argument passed to the shell; repeat for several.
    #[arg(long = "shell-arg", allow_hyphen_values = true)]
    pub shell_args: Vec<String>,

    /// Working directory for spawned shells (defaults to the home directory).
    #[arg(long, env = "BEACH_PIER_CWD")]
    pub cwd: Option<PathBuf>,

    /// Initial terminal width.
    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Initial terminal height.
    #[arg(long, default_value_t = 30)]
    pub rows: u16,

    /// Environment override for spawned shells, as KEY=VALUE; repeat for several.
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Start shells with only the --env entries instead of this process's environment.
    #[arg(long, default_value_t = false)]
    pub clear_env: bool,

    /// Directory of lab pages to serve on --static-addr.
    #[arg(long, env = "BEACH_PIER_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Address for the lab page server.
    #[arg(long, env = "BEACH_PIER_STATIC_ADDR", default_value = "127.0.0.1:8000")]
    pub static_addr: String,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_PIER_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Health URL of the bridge.
    #[arg(long, default_value = "http://127.0.0.1:7681/health")]
    pub url: String,

    /// Seconds between automatic probes.
    #[arg(long, default_value_t = 5)]
    pub interval_secs: u64,

    /// Seconds after which automatic probing stops.
    #[arg(long, default_value_t = 60)]
    pub window_secs: u64,

    /// Per-probe timeout in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub timeout_ms: u64,
}
