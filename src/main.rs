mod args;
mod commands;
mod output;

use args::{Cli, Commands, GenerateCommands};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zli::clienv;
use zli::DaemonError;

use commands::connect::ConnectArgs;
use output::icons;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{} {}",
                output::error(icons::ERROR),
                output::error(format!("Error: {}", e))
            );
            let remediation = e
                .chain()
                .find_map(|cause| cause.downcast_ref::<DaemonError>())
                .and_then(DaemonError::remediation);
            if let Some(hint) = remediation {
                eprintln!("  {}", output::muted(hint));
            }
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Connect {
            target,
            kind,
            target_user,
            target_group,
            port,
            host,
            control_port,
            debug,
        } => {
            commands::connect::cmd_connect(ConnectArgs {
                target,
                kind,
                target_user,
                target_groups: target_group,
                port,
                host,
                control_port,
                debug,
            })
            .await?
        }
        Commands::ListDaemons { target_type, json } => {
            commands::list::cmd_list_daemons(&target_type.kinds(), json).await?
        }
        Commands::Disconnect {
            connection_id,
            all: _,
            kind,
            yes,
        } => commands::disconnect::cmd_disconnect(connection_id, kind, yes).await?,
        Commands::Generate { command } => match command {
            GenerateCommands::KubeConfig {
                update,
                force,
                output_file,
            } => {
                commands::kubeconfig::cmd_generate_kubeconfig(update, force, output_file).await?
            }
        },
        Commands::Logout => commands::logout::cmd_logout().await?,
        Commands::Completions { shell, install } => {
            commands::completions::cmd_completions(shell, install)?
        }
    }
    Ok(())
}

/// Diagnostics go to stderr so listings and generated YAML stay pipeable.
fn init_tracing() {
    let env_filter = clienv::log_filter()
        .and_then(|directive| EnvFilter::try_new(directive).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}
