//! Gantry CLI entrypoint.

use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod changes;
mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::{CliConfig, LogFormat};
use handlers::RunOptions;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry build pipeline orchestrator", long_about = None)]
struct Cli {
    /// Log format, overriding the configuration file
    #[arg(long, global = true, value_parser = ["text", "json"])]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let mut config = CliConfig::load().unwrap_or_default();
    if let Some(format) = &cli.log_format {
        config.set("log_format", format)?;
    }
    init_tracing(config.log_format);

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path } => handlers::plan(&path)?,
        Commands::Detect {
            pipeline,
            exclude,
            include,
            changes,
        } => handlers::detect(pipeline.as_deref(), &exclude, &include, &changes).await?,
        Commands::Run {
            path,
            params,
            workdir,
            report,
            max_parallel,
            verbose,
            changes,
        } => {
            let succeeded = handlers::run_pipeline(
                &config,
                RunOptions {
                    path,
                    params,
                    workdir,
                    report,
                    max_parallel,
                    verbose,
                    changes,
                },
            )
            .await?;
            if !succeeded {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(ExitCode::SUCCESS)
}
