//! fleetgate binary entry point.
//!
//! Parses the CLI, initializes tracing, and either runs the combined
//! serve runtime or executes a one-shot subcommand through the same
//! library dispatch the tool server re-enters.

use std::collections::HashMap;
use std::process::ExitCode;

use clap::Parser;

use fleetgate::cli::{commands, Cli, Command};
use fleetgate::config::Settings;
use fleetgate::error::UsageError;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let env: HashMap<String, String> = std::env::vars().collect();
    let settings = Settings::from_map(&env);

    match cli.command {
        Command::Serve(ref args) => {
            let args = (**args).clone();
            match fleetgate::serve::run(args, settings).await {
                Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
                Err(e) => {
                    if let Some(usage) = e.downcast_ref::<UsageError>() {
                        eprintln!("error: {usage}");
                        ExitCode::from(2)
                    } else {
                        tracing::error!(error = %e, "serve failed");
                        ExitCode::from(1)
                    }
                }
            }
        }
        _ => {
            let envelope = commands::run(&cli, &settings).await;
            match serde_json::to_string_pretty(&envelope) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{envelope}"),
            }
            if envelope["ok"].as_bool().unwrap_or(false) {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            }
        }
    }
}
