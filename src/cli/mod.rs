//! Command-line surface.
//!
//! The parser is a library over an argv slice plus an environment map —
//! never process-global state — so the tool server can re-enter the same
//! dispatch from a worker thread with `--format json --wake` injected and
//! get exactly the behavior a shell user gets.

pub mod commands;

use std::collections::HashMap;

use clap::{Args, Parser, Subcommand};

use crate::config::Settings;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "fleetgate")]
#[command(about = "Personal command, telemetry, and automation gateway for a vehicle fleet API")]
#[command(version)]
pub struct Cli {
    /// Vehicle identifier (falls back to FLEETGATE_VIN)
    #[arg(long, global = true)]
    pub vin: Option<String>,

    /// Output format
    #[arg(long, global = true, default_value = "json")]
    pub format: String,

    /// Wake the vehicle when it is asleep
    #[arg(long, global = true)]
    pub wake: bool,

    /// Bypass the response cache for this invocation
    #[arg(long, global = true)]
    pub no_cache: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Vehicle reads and lifecycle
    Vehicle {
        #[command(subcommand)]
        cmd: VehicleCmd,
    },
    /// Charging reads and controls
    Charge {
        #[command(subcommand)]
        cmd: ChargeCmd,
    },
    /// Climate reads and controls
    Climate {
        #[command(subcommand)]
        cmd: ClimateCmd,
    },
    /// Locks, sentry, and alerts
    Security {
        #[command(subcommand)]
        cmd: SecurityCmd,
    },
    /// Trunk and frunk actuation
    Trunk {
        #[command(subcommand)]
        cmd: TrunkCmd,
    },
    /// Response cache inspection
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
    /// Authentication status
    Auth {
        #[command(subcommand)]
        cmd: AuthCmd,
    },
    /// Run the combined tool + telemetry server
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Subcommand)]
pub enum VehicleCmd {
    /// List all vehicles on the account
    List,
    /// Vehicle info summary
    Info,
    /// Full vehicle data
    Data,
    /// Vehicle location
    Location,
    /// Wake the vehicle
    Wake,
}

#[derive(Debug, Subcommand)]
pub enum ChargeCmd {
    /// Charge status
    Status,
    /// Start charging
    Start,
    /// Stop charging
    Stop,
    /// Set the charge limit (percent)
    Limit { percent: i64 },
    /// Set the charge amperage
    Amps { amps: i64 },
    /// Open the charge port
    PortOpen,
    /// Close the charge port
    PortClose,
}

#[derive(Debug, Subcommand)]
pub enum ClimateCmd {
    /// Climate status
    Status,
    /// Turn on climate control
    On,
    /// Turn off climate control
    Off,
    /// Set the cabin temperature (Celsius)
    Set { temp: f64 },
    /// Set a seat heater level
    Seat { position: String, level: i64 },
}

#[derive(Debug, Subcommand)]
pub enum SecurityCmd {
    /// Lock/sentry status
    Status,
    /// Lock the vehicle
    Lock,
    /// Unlock the vehicle
    Unlock,
    /// Toggle sentry mode
    Sentry { state: String },
    /// Flash the lights
    Flash,
    /// Honk the horn
    Honk,
}

#[derive(Debug, Subcommand)]
pub enum TrunkCmd {
    /// Open the trunk
    Open,
    /// Open the frunk
    Frunk,
}

#[derive(Debug, Subcommand)]
pub enum CacheCmd {
    /// Cache statistics
    Status,
    /// Clear cached entries
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum AuthCmd {
    /// Token status
    Status,
}

/// Arguments for the serve command.
#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Vehicle identifier
    pub vin_positional: Option<String>,

    /// Tool transport
    #[arg(long, default_value = "streamable-http")]
    pub transport: String,

    /// HTTP port for the tool surface
    #[arg(long, env = "FLEETGATE_MCP_PORT")]
    pub port: Option<u16>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1", env = "FLEETGATE_HOST")]
    pub host: String,

    /// WebSocket port for telemetry (random in the ephemeral range if absent)
    #[arg(long)]
    pub telemetry_port: Option<u16>,

    /// Telemetry field preset or comma-separated names
    #[arg(long, default_value = "default")]
    pub fields: String,

    /// Override the telemetry interval for all fields
    #[arg(long)]
    pub interval: Option<u32>,

    /// Tool-only mode: skip telemetry and cache warming
    #[arg(long)]
    pub no_telemetry: bool,

    /// Telemetry-only mode: skip the tool server
    #[arg(long)]
    pub no_mcp: bool,

    /// Disable the CSV telemetry log
    #[arg(long)]
    pub no_log: bool,

    /// Bridge telemetry to an operator gateway (ws://…)
    #[arg(long = "openclaw", value_name = "URL")]
    pub openclaw_url: Option<String>,

    /// Gateway auth token
    #[arg(long = "openclaw-token", env = "OPENCLAW_GATEWAY_TOKEN")]
    pub openclaw_token: Option<String>,

    /// Bridge config file (TOML)
    #[arg(long = "openclaw-config")]
    pub openclaw_config: Option<std::path::PathBuf>,

    /// Bridge dry-run: print events as JSONL instead of sending
    #[arg(long)]
    pub dry_run: bool,

    /// Expose the server via a public tunnel
    #[arg(long)]
    pub tunnel: bool,

    /// Tool-server OAuth client id
    #[arg(long, env = "FLEETGATE_MCP_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Tool-server OAuth client secret
    #[arg(long, env = "FLEETGATE_MCP_CLIENT_SECRET")]
    pub client_secret: Option<String>,
}

/// Result of a re-entrant CLI invocation.
#[derive(Debug, Clone)]
pub struct InvokeOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Parse and run a command from an argv slice and environment map.
///
/// This is the entry point for tool invocations: it builds its own
/// runtime (callers run it on a worker thread to avoid re-entering the
/// running loop) and returns the JSON envelope the command printed.
pub fn invoke(argv: &[String], env: &HashMap<String, String>) -> InvokeOutcome {
    let mut full_argv = vec!["fleetgate".to_string()];
    full_argv.extend_from_slice(argv);

    let cli = match Cli::try_parse_from(&full_argv) {
        Ok(cli) => cli,
        Err(e) => {
            return InvokeOutcome {
                exit_code: 2,
                output: e.to_string(),
            };
        }
    };

    if matches!(cli.command, Command::Serve(_)) {
        return InvokeOutcome {
            exit_code: 2,
            output: "serve cannot be invoked as a tool".to_string(),
        };
    }

    let settings = Settings::from_map(env);
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            return InvokeOutcome {
                exit_code: 1,
                output: format!("failed to build runtime: {e}"),
            };
        }
    };

    let envelope = runtime.block_on(commands::run(&cli, &settings));
    let exit_code = if envelope["ok"].as_bool().unwrap_or(false) {
        0
    } else {
        1
    };
    InvokeOutcome {
        exit_code,
        output: envelope.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_read_command() {
        let cli = Cli::try_parse_from(["fleetgate", "--vin", "V1", "vehicle", "info"]).unwrap();
        assert_eq!(cli.vin.as_deref(), Some("V1"));
        assert!(matches!(
            cli.command,
            Command::Vehicle {
                cmd: VehicleCmd::Info
            }
        ));
    }

    #[test]
    fn test_parse_serve_flags() {
        let cli = Cli::try_parse_from([
            "fleetgate", "serve", "V1", "--port", "9000", "--fields", "charging", "--no-log",
            "--openclaw", "ws://gw:1", "--dry-run",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.vin_positional.as_deref(), Some("V1"));
        assert_eq!(args.port, Some(9000));
        assert_eq!(args.fields, "charging");
        assert!(args.no_log);
        assert!(args.dry_run);
        assert_eq!(args.openclaw_url.as_deref(), Some("ws://gw:1"));
    }

    #[test]
    fn test_invoke_rejects_serve() {
        let outcome = invoke(&argv(&["serve"]), &HashMap::new());
        assert_eq!(outcome.exit_code, 2);
    }

    #[test]
    fn test_invoke_parse_error() {
        let outcome = invoke(&argv(&["nonsense"]), &HashMap::new());
        assert_eq!(outcome.exit_code, 2);
    }
}
