//! The combined serve runtime.
//!
//! One long-running process operating the authenticated tool server, the
//! telemetry WebSocket receiver, the fan-out sinks, the telemetry
//! session lifecycle, the trigger engine, and the outbound gateway
//! bridge — all on a single event loop behind one public tunnel, with a
//! carefully sequenced startup and shutdown.

pub mod app;
pub mod sinks;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::bridge::{
    BridgeConfig, DualGateFilter, EventEmitter, GatewayClient, TelemetryBridge,
};
use crate::cache::ResponseCache;
use crate::cli::ServeArgs;
use crate::config::{resolve_vin, Settings};
use crate::error::UsageError;
use crate::mcp::server::{register_trigger_tools, ToolServer, ToolState, TransportSecurity};
use crate::mcp::OAuthAuthServer;
use crate::telemetry::cache_sink::CacheSink;
use crate::telemetry::csv_sink::{create_log_path, CsvLogSink};
use crate::telemetry::fanout::FrameFanout;
use crate::telemetry::fields::resolve_fields;
use crate::telemetry::mapper::TelemetryMapper;
use crate::telemetry::session::TelemetrySession;
use crate::telemetry::store::TelemetryStore;
use crate::triggers::TriggerManager;
use crate::tunnel::TunnelManager;

use self::app::{combined_app, ReceiverState};
use self::sinks::{DisplaySink, JsonlSink, TriggerEvalSink};

/// Default tool-surface port.
const DEFAULT_PORT: u16 = 8080;

/// Ephemeral range used when `--telemetry-port` is absent.
const EPHEMERAL_PORT_RANGE: std::ops::RangeInclusive<u16> = 49152..=65534;

/// Validate runtime mode combinations before anything is started.
pub fn validate_args(args: &ServeArgs) -> Result<(), UsageError> {
    if args.no_mcp && args.no_telemetry {
        return Err(UsageError::new(
            "--no-mcp and --no-telemetry cannot both be set (nothing to run)",
        ));
    }
    if args.no_mcp && args.transport == "stdio" {
        return Err(UsageError::new(
            "--no-mcp cannot be used with --transport stdio (stdio is tool-only)",
        ));
    }
    if !matches!(args.transport.as_str(), "stdio" | "streamable-http") {
        return Err(UsageError::new(format!(
            "unknown transport '{}'; expected stdio or streamable-http",
            args.transport
        )));
    }
    if args.tunnel && args.transport == "stdio" {
        return Err(UsageError::new("--tunnel cannot be used with --transport stdio"));
    }
    if args.openclaw_url.is_some() && args.no_telemetry {
        return Err(UsageError::new(
            "--openclaw requires telemetry; remove --no-telemetry",
        ));
    }
    if args.dry_run && args.openclaw_url.is_none() {
        return Err(UsageError::new("--dry-run requires --openclaw"));
    }
    if args.openclaw_config.is_some() && args.openclaw_url.is_none() {
        return Err(UsageError::new("--openclaw-config requires --openclaw"));
    }
    Ok(())
}

/// Return `preferred` when it is free; otherwise let the OS pick one,
/// unless the user explicitly requested the port — then fail with a
/// suggestion.
pub fn resolve_port(host: &str, preferred: u16, explicit: bool) -> Result<u16, UsageError> {
    if probe_bind(host, preferred) {
        return Ok(preferred);
    }
    if explicit {
        return Err(UsageError::new(format!(
            "port {preferred} is already in use; pick a different one, e.g. --port {}",
            preferred.wrapping_add(1)
        )));
    }

    let addr: SocketAddr = format!("{host}:0")
        .parse()
        .map_err(|e| UsageError::new(format!("invalid bind address {host}: {e}")))?;
    let listener = std::net::TcpListener::bind(addr)
        .map_err(|e| UsageError::new(format!("cannot bind {host}: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| UsageError::new(format!("cannot read bound address: {e}")))?
        .port();
    tracing::info!(preferred, port, "preferred port in use; using a free one");
    Ok(port)
}

fn probe_bind(host: &str, port: u16) -> bool {
    use socket2::{Domain, Socket, Type};

    let Ok(addr) = format!("{host}:{port}").parse::<SocketAddr>() else {
        return false;
    };
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let Ok(socket) = Socket::new(domain, Type::STREAM, None) else {
        return false;
    };
    let _ = socket.set_reuse_address(true);
    socket.bind(&addr.into()).is_ok()
}

/// Run the serve command. Returns the process exit code.
pub async fn run(args: ServeArgs, settings: Settings) -> anyhow::Result<i32> {
    validate_args(&args)?;

    // Credentials are required whenever the tool surface runs.
    let client_id = args.client_id.clone().or_else(|| settings.client_id.clone());
    let client_secret = args
        .client_secret
        .clone()
        .or_else(|| settings.client_secret.clone());
    if !args.no_mcp && (client_id.is_none() || client_secret.is_none()) {
        return Err(UsageError::new(
            "tool-server credentials required: set FLEETGATE_MCP_CLIENT_ID and \
             FLEETGATE_MCP_CLIENT_SECRET, or pass --client-id/--client-secret \
             (or use --no-mcp)",
        )
        .into());
    }

    let shutdown = CancellationToken::new();
    install_signal_handlers(&shutdown);

    // Tool registry with the inherited environment for re-entrant calls.
    let tool_server = (!args.no_mcp).then(|| {
        Arc::new(ToolServer::new(
            std::env::vars().collect::<HashMap<_, _>>(),
        ))
    });

    // stdio transport: tool surface only, no HTTP listener.
    if args.transport == "stdio" {
        let Some(tool_server) = tool_server else {
            unreachable!("validated: stdio requires the tool surface");
        };
        eprintln!(
            "fleetgate serve starting (stdio, {} tools)",
            tool_server.tool_count()
        );
        return run_stdio(tool_server, shutdown).await;
    }

    // -- Port resolution ----------------------------------------------------
    let port_explicit = args.port.is_some();
    let preferred = args.port.unwrap_or(DEFAULT_PORT);
    let serve_port = resolve_port(&args.host, preferred, port_explicit)?;

    // -- Telemetry wiring ---------------------------------------------------
    let mut fanout = FrameFanout::new();
    let mut cache_sink: Option<Arc<CacheSink>> = None;
    let mut csv_sink: Option<Arc<CsvLogSink>> = None;
    let mut bridge: Option<Arc<TelemetryBridge>> = None;
    let store = Arc::new(TelemetryStore::new());
    let mut trigger_manager: Option<Arc<TriggerManager>> = None;
    let mut vin: Option<String> = None;
    let mut field_config = None;
    let mut telemetry_port = args.telemetry_port;

    if !args.no_telemetry {
        let resolved_vin = resolve_vin(args.vin_positional.as_deref(), None, &settings)
            .ok_or_else(|| {
                UsageError::new("no VIN specified; pass it as an argument or set FLEETGATE_VIN")
            })?;
        let triggers = Arc::new(TriggerManager::new(resolved_vin.clone()));
        trigger_manager = Some(triggers.clone());

        if telemetry_port.is_none() {
            telemetry_port = Some(rand::thread_rng().gen_range(EPHEMERAL_PORT_RANGE));
        }
        field_config = Some(resolve_fields(&args.fields, args.interval)?);

        // Cache sink: telemetry warms the response cache so tool reads
        // are free while the stream is active.
        let cache = ResponseCache::open(settings.cache_dir(), settings.cache_ttl, true)?;
        let warm = Arc::new(CacheSink::new(
            cache,
            TelemetryMapper::new(),
            resolved_vin.clone(),
        ));
        fanout.add_sink(warm.clone());
        cache_sink = Some(warm);

        // CSV log sink (default on).
        if !args.no_log {
            let path = create_log_path(&resolved_vin, &settings.log_dir())?;
            tracing::info!(path = %path.display(), "CSV telemetry log");
            let sink = Arc::new(CsvLogSink::new(path, Some(resolved_vin.clone())));
            fanout.add_sink(sink.clone());
            csv_sink = Some(sink);
        }

        // Display: JSONL when piped telemetry-only, log summary otherwise.
        if args.no_mcp {
            fanout.add_sink(Arc::new(JsonlSink));
        } else {
            fanout.add_sink(Arc::new(DisplaySink));
        }

        // Outbound bridge.
        if let Some(gateway_url) = &args.openclaw_url {
            let config_path = args
                .openclaw_config
                .clone()
                .unwrap_or_else(|| settings.config_dir.join("bridge.toml"));
            let config = BridgeConfig::load(&config_path)?.merge_overrides(
                Some(gateway_url),
                args.openclaw_token.as_deref(),
            );

            let gateway = Arc::new(tokio::sync::Mutex::new(GatewayClient::new(
                config.gateway_url.clone(),
                config.gateway_token.clone(),
                config.client_id.clone(),
            )));
            let oc_bridge = Arc::new(TelemetryBridge::new(
                gateway.clone(),
                DualGateFilter::new(config.telemetry.clone()),
                EventEmitter::new(config.client_id.clone()),
                store.clone(),
                triggers.clone(),
                config.client_id.clone(),
                args.dry_run,
            ));

            triggers.add_on_fire(oc_bridge.make_trigger_push_callback());

            if args.dry_run {
                tracing::info!("bridge dry-run: events will be printed as JSONL");
            } else {
                tracing::info!(url = %config.gateway_url, "connecting to gateway");
                gateway.lock().await.connect_with_backoff(5).await?;
                if !oc_bridge.send_connected().await {
                    tracing::warn!("node.connected event failed");
                }
            }

            // Register the sink only after the gateway is up (or dry-run
            // confirmed) so early frames aren't silently dropped.
            fanout.add_sink(oc_bridge.clone());
            bridge = Some(oc_bridge);
        } else {
            // No bridge: a lightweight sink owns trigger evaluation.
            fanout.add_sink(Arc::new(TriggerEvalSink::new(store.clone(), triggers.clone())));
        }

        vin = Some(resolved_vin);
    }

    // -- Tunnel pre-detection ------------------------------------------------
    // The tool app's issuer must carry the public hostname before the
    // router is built, so detect it ahead of the session.
    let mut public_hostname: Option<String> = None;
    if args.tunnel {
        let probe = TunnelManager::new();
        probe.check_available().await?;
        probe.check_running().await?;
        public_hostname = Some(probe.get_hostname().await?);
    }

    // -- Tool surface ----------------------------------------------------
    let tool_state = tool_server.as_ref().map(|server| {
        if let Some(triggers) = &trigger_manager {
            register_trigger_tools(server, triggers.clone(), Some(store.clone()));
        }
        let issuer = match &public_hostname {
            Some(host) => format!("https://{host}"),
            None => format!("http://{}:{serve_port}", args.host),
        };
        ToolState {
            server: server.clone(),
            oauth: Arc::new(OAuthAuthServer::new(client_id.clone(), client_secret.clone())),
            security: Arc::new(TransportSecurity::new(public_hostname.as_deref())),
            issuer,
        }
    });

    // -- Bind and serve the combined app -------------------------------------
    // Combined mode serves everything on the tool port; telemetry-only
    // mode hands the listener to the receiver port.
    let bind_port = if args.no_mcp {
        telemetry_port.unwrap_or(serve_port)
    } else {
        serve_port
    };

    let public_key_pem = load_public_key_pem(&settings);
    let fanout = Arc::new(fanout);
    let receiver = ReceiverState::new(fanout.clone(), public_key_pem);
    let router = combined_app(receiver, tool_state);

    let bind_addr: SocketAddr = format!("{}:{bind_port}", args.host)
        .parse()
        .map_err(|e| UsageError::new(format!("invalid bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "combined server listening");
    if tool_server.is_some() {
        tracing::info!(
            tools = tool_server.as_ref().map(|s| s.tool_count()).unwrap_or(0),
            sinks = fanout.sink_count(),
            "tool surface ready at /mcp"
        );
    }

    let server_cancel = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    // -- Telemetry session (tunnel + registration + remote config) ----------
    let mut session: Option<TelemetrySession> = None;
    if args.tunnel {
        if let (Some(vin), Some(fields)) = (&vin, &field_config) {
            let interactive = args.transport != "stdio";
            match TelemetrySession::start(&settings, vin, bind_port, fields, interactive).await {
                Ok(active) => {
                    tracing::info!(url = %active.tunnel_url, "telemetry session active");
                    session = Some(active);
                }
                Err(e) => {
                    shutdown.cancel();
                    let _ = server_task.await;
                    return Err(e);
                }
            }
        }
    }

    // -- Run until shutdown --------------------------------------------------
    shutdown.cancelled().await;
    tracing::info!("shutdown requested");

    // Ordered teardown: drain the server first, then the session (config
    // delete, domain restore, tunnel stop), then bridge, then sinks.
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::warn!(%error, "server exited with error"),
        Err(error) => tracing::warn!(%error, "server task panicked"),
    }

    if let Some(session) = session {
        session.shutdown().await;
    }

    if let Some(bridge) = &bridge {
        bridge.send_disconnecting().await;
        bridge.gateway().lock().await.close().await;
    }

    if let Some(sink) = &csv_sink {
        sink.close();
        tracing::info!(
            path = %sink.log_path().display(),
            frames = sink.frame_count(),
            "CSV log closed"
        );
    }
    if let Some(sink) = &cache_sink {
        if let Err(error) = sink.flush() {
            tracing::warn!(%error, "final cache flush failed");
        }
        tracing::info!(
            frames = sink.frame_count(),
            fields = sink.field_count(),
            "cache sink drained"
        );
    }

    Ok(130)
}

/// Tool surface over stdio: one JSON-RPC message per line.
async fn run_stdio(server: Arc<ToolServer>, shutdown: CancellationToken) -> anyhow::Result<i32> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut stdout = tokio::io::stdout();
    let mut line = String::new();

    loop {
        line.clear();
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(130),
            read = reader.read_line(&mut line) => {
                match read {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let request: serde_json::Value = match serde_json::from_str(trimmed) {
                            Ok(v) => v,
                            Err(error) => {
                                tracing::warn!(%error, "unparseable stdio request");
                                continue;
                            }
                        };
                        if let Some(response) = crate::mcp::server::handle_rpc(&server, &request).await {
                            let mut bytes = response.to_string().into_bytes();
                            bytes.push(b'\n');
                            stdout.write_all(&bytes).await?;
                            stdout.flush().await?;
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

fn install_signal_handlers(shutdown: &CancellationToken) {
    let token = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(error) => {
                    tracing::warn!(%error, "cannot install SIGTERM handler");
                    let _ = ctrl_c.await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => tracing::info!("interrupt received"),
                _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        token.cancel();
    });
}

fn load_public_key_pem(settings: &Settings) -> Option<String> {
    let path = settings.key_dir().join("public-key.pem");
    match std::fs::read_to_string(&path) {
        Ok(pem) => Some(pem),
        Err(_) => {
            tracing::debug!(path = %path.display(), "no public key on disk");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> ServeArgs {
        let mut argv = vec!["fleetgate", "serve"];
        argv.extend_from_slice(args);
        let cli = crate::cli::Cli::try_parse_from(argv).unwrap();
        match cli.command {
            crate::cli::Command::Serve(args) => *args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_rejected_mode_combinations() {
        assert!(validate_args(&parse(&["--no-mcp", "--no-telemetry"])).is_err());
        assert!(validate_args(&parse(&["--no-mcp", "--transport", "stdio"])).is_err());
        assert!(validate_args(&parse(&["--dry-run"])).is_err());
        assert!(validate_args(&parse(&["--openclaw", "ws://x", "--no-telemetry"])).is_err());
        assert!(validate_args(&parse(&["--tunnel", "--transport", "stdio"])).is_err());
        assert!(validate_args(&parse(&["--openclaw-config", "/tmp/x.toml"])).is_err());
    }

    #[test]
    fn test_accepted_mode_combinations() {
        assert!(validate_args(&parse(&[])).is_ok());
        assert!(validate_args(&parse(&["--no-telemetry"])).is_ok());
        assert!(validate_args(&parse(&["--no-mcp"])).is_ok());
        assert!(validate_args(&parse(&["--openclaw", "ws://x", "--dry-run"])).is_ok());
    }

    #[test]
    fn test_resolve_port_returns_free_preferred() {
        // Grab a free port, release it, then ask for it.
        let free = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let port = resolve_port("127.0.0.1", free, true).unwrap();
        assert_eq!(port, free);
    }

    #[test]
    fn test_resolve_port_conflict_explicit_fails_with_suggestion() {
        // Hold a port open, then ask for it explicitly.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let held = listener.local_addr().unwrap().port();

        let err = resolve_port("127.0.0.1", held, true).unwrap_err();
        assert!(err.to_string().contains(&format!("--port {}", held + 1)));
    }

    #[test]
    fn test_resolve_port_conflict_auto_selects() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let held = listener.local_addr().unwrap().port();

        let port = resolve_port("127.0.0.1", held, false).unwrap();
        assert_ne!(port, held);
    }
}
