mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use labpool::{DockerRuntime, Error as LabError, LabManager, LabStore, Parser as ConfigParser};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        if let Some(lab_error) = e.downcast_ref::<LabError>() {
            eprintln!("Error: {}", lab_error);
            if let Some(suggestion) = lab_error.suggestion() {
                eprintln!("\nHint: {}", suggestion);
            }
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let parser = ConfigParser::new();
    let source = cli.config.clone().or_else(|| parser.find_config_file().ok());
    let config = parser.load(source.as_deref())?;

    if let Commands::CheckConfig { json } = cli.command {
        let out = output::for_mode(json);
        return commands::run_check_config(&config, source.as_deref(), out.as_ref());
    }

    let store = LabStore::open(config.database.resolved_path()).await?;
    // The manager bounds each call itself; the adapter limit is a backstop.
    let timeouts = &config.timeouts;
    let backstop = timeouts.create.max(timeouts.start).max(timeouts.stop);
    let runtime = Arc::new(
        DockerRuntime::new()
            .with_binary(cli.docker.clone())
            .with_command_timeout(backstop),
    );
    let manager = LabManager::new(config, store, runtime);

    if let Commands::Serve { no_pool } = cli.command {
        let out = output::for_mode(false);
        return commands::run_serve(&manager, no_pool, out.as_ref()).await;
    }

    // One-shot commands act on the state a server may own; they never
    // reconcile implicitly.
    manager.attach().await?;

    match cli.command {
        Commands::Assign {
            owner,
            scenario,
            json,
        } => commands::run_assign(&manager, &owner, &scenario, output::for_mode(json).as_ref()).await,
        Commands::Stop { owner, json } => {
            commands::run_stop(&manager, &owner, output::for_mode(json).as_ref()).await
        }
        Commands::Heartbeat { owner, json } => {
            commands::run_heartbeat(&manager, &owner, output::for_mode(json).as_ref()).await
        }
        Commands::Lookup { owner, json } => {
            commands::run_lookup(&manager, &owner, output::for_mode(json).as_ref()).await
        }
        Commands::Stats { json } => {
            commands::run_stats(&manager, output::for_mode(json).as_ref()).await
        }
        Commands::Ports { allocated, json } => {
            commands::run_ports(&manager, allocated, output::for_mode(json).as_ref()).await
        }
        Commands::Reap { json } => commands::run_reap(&manager, output::for_mode(json).as_ref()).await,
        Commands::Reconcile { json } => {
            commands::run_reconcile(&manager, output::for_mode(json).as_ref()).await
        }
        Commands::PurgePool { json } => {
            commands::run_purge_pool(&manager, output::for_mode(json).as_ref()).await
        }
        Commands::Serve { .. } | Commands::CheckConfig { .. } => Ok(()),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}
