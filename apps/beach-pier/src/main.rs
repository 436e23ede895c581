use anyhow::Result;
use beach_pier::cli::{Cli, Commands};
use beach_pier::config::{ProbeConfig, ServerConfig};
use beach_pier::{probe, server, telemetry::Telemetry};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        let code = probe::run_cli(ProbeConfig::try_from(args)?).await?;
        std::process::exit(code);
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        shell = %config.template.program,
        cwd = ?config.template.cwd,
        cols = config.template.cols,
        rows = config.template.rows,
        static_site = ?config.static_site,
        "starting beach-pier"
    );

    server::run(config, Some(telemetry.metrics_handle())).await
}
