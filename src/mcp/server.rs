//! HTTP tool server.
//!
//! Exposes two surfaces on one router:
//!
//! 1. The protected tool surface at `/mcp`: a JSON-RPC-over-HTTP endpoint
//!    (`initialize`, `tools/list`, `tools/call`) behind bearer auth. Tool
//!    calls re-enter the CLI dispatcher with `--format json --wake`
//!    injected, on a worker thread, which guarantees behavioral parity
//!    with direct command use.
//! 2. The OAuth surface: `/authorize`, `/token`, `/revoke`, and the
//!    discovery documents.
//!
//! DNS-rebinding protection: the Host (and Origin, when present) headers
//! must match loopback or the active tunnel hostname.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};

use crate::cli;
use crate::telemetry::store::TelemetryStore;
use crate::triggers::{
    TriggerCondition, TriggerDefinition, TriggerManager, TriggerOperator,
};

use super::oauth::{AuthorizeParams, OAuthAuthServer};

type CustomHandler = Arc<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

enum ToolKind {
    /// Forwarded to the CLI dispatcher with this argv template.
    Cli(Vec<String>),
    /// Handled in-process.
    Custom(CustomHandler),
}

struct ToolEntry {
    description: String,
    input_schema: Value,
    read_only: bool,
    kind: ToolKind,
}

/// Host/Origin allowlists for DNS-rebinding protection.
#[derive(Debug, Clone)]
pub struct TransportSecurity {
    allowed_hosts: Vec<String>,
}

impl TransportSecurity {
    /// Loopback is always allowed; a tunnel hostname extends the set.
    pub fn new(public_hostname: Option<&str>) -> Self {
        let mut allowed_hosts = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            "[::1]".to_string(),
            "::1".to_string(),
        ];
        if let Some(host) = public_hostname {
            allowed_hosts.push(host.to_lowercase());
        }
        Self { allowed_hosts }
    }

    fn host_allowed(&self, host_header: &str) -> bool {
        let host = host_header
            .rsplit_once(':')
            .filter(|(name, port)| !name.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
            .map(|(name, _)| name)
            .unwrap_or(host_header)
            .to_lowercase();
        self.allowed_hosts.contains(&host)
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        match url::Url::parse(origin) {
            Ok(url) => url
                .host_str()
                .map(|h| self.allowed_hosts.contains(&h.to_lowercase()))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// The default CLI-forwarded tool tables: `(tool name, argv, description)`.
#[rustfmt::skip]
fn read_tools() -> Vec<(&'static str, Vec<&'static str>, &'static str)> {
    vec![
        ("vehicle_list",     vec!["vehicle", "list"],     "List all vehicles on the account"),
        ("vehicle_info",     vec!["vehicle", "info"],     "Get vehicle info summary"),
        ("vehicle_data",     vec!["vehicle", "data"],     "Get full vehicle data"),
        ("vehicle_location", vec!["vehicle", "location"], "Get vehicle location"),
        ("charge_status",    vec!["charge", "status"],    "Get charge status"),
        ("climate_status",   vec!["climate", "status"],   "Get climate status"),
        ("security_status",  vec!["security", "status"],  "Get security/lock status"),
        ("cache_status",     vec!["cache", "status"],     "Get cache status"),
        ("auth_status",      vec!["auth", "status"],      "Get auth/token status"),
    ]
}

#[rustfmt::skip]
fn write_tools() -> Vec<(&'static str, Vec<&'static str>, &'static str)> {
    vec![
        ("charge_start",      vec!["charge", "start"],      "Start charging"),
        ("charge_stop",       vec!["charge", "stop"],       "Stop charging"),
        ("charge_limit",      vec!["charge", "limit"],      "Set charge limit (percentage)"),
        ("charge_amps",       vec!["charge", "amps"],       "Set charge amperage"),
        ("charge_port_open",  vec!["charge", "port-open"],  "Open charge port"),
        ("charge_port_close", vec!["charge", "port-close"], "Close charge port"),
        ("climate_on",        vec!["climate", "on"],        "Turn on climate control"),
        ("climate_off",       vec!["climate", "off"],       "Turn off climate control"),
        ("climate_set",       vec!["climate", "set"],       "Set climate temperature"),
        ("climate_seat",      vec!["climate", "seat"],      "Set seat heater level"),
        ("security_lock",     vec!["security", "lock"],     "Lock the vehicle"),
        ("security_unlock",   vec!["security", "unlock"],   "Unlock the vehicle"),
        ("security_sentry",   vec!["security", "sentry"],   "Toggle sentry mode"),
        ("security_flash",    vec!["security", "flash"],    "Flash the lights"),
        ("security_honk",     vec!["security", "honk"],     "Honk the horn"),
        ("trunk_open",        vec!["trunk", "open"],        "Open the trunk"),
        ("trunk_frunk",       vec!["trunk", "frunk"],       "Open the frunk"),
        ("vehicle_wake",      vec!["vehicle", "wake"],      "Wake the vehicle"),
        ("cache_clear",       vec!["cache", "clear"],       "Clear response cache"),
    ]
}

fn cli_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "vin": {
                "type": "string",
                "description": "Vehicle VIN (optional if FLEETGATE_VIN set)",
            },
            "args": {
                "type": "array",
                "items": {"type": "string"},
                "description": "Additional CLI arguments",
            },
        },
    })
}

/// Tool registry plus invocation machinery.
pub struct ToolServer {
    tools: Mutex<BTreeMap<String, ToolEntry>>,
    /// Environment inherited by re-entrant CLI invocations.
    env: HashMap<String, String>,
}

impl ToolServer {
    pub fn new(env: HashMap<String, String>) -> Self {
        let mut tools = BTreeMap::new();
        for (name, argv, desc) in read_tools() {
            tools.insert(
                name.to_string(),
                ToolEntry {
                    description: desc.to_string(),
                    input_schema: cli_tool_schema(),
                    read_only: true,
                    kind: ToolKind::Cli(argv.iter().map(|s| s.to_string()).collect()),
                },
            );
        }
        for (name, argv, desc) in write_tools() {
            tools.insert(
                name.to_string(),
                ToolEntry {
                    description: desc.to_string(),
                    input_schema: cli_tool_schema(),
                    read_only: false,
                    kind: ToolKind::Cli(argv.iter().map(|s| s.to_string()).collect()),
                },
            );
        }
        Self {
            tools: Mutex::new(tools),
            env,
        }
    }

    fn lock_tools(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, ToolEntry>> {
        match self.tools.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register an in-process tool.
    pub fn register_custom_tool(
        &self,
        name: &str,
        description: &str,
        input_schema: Value,
        read_only: bool,
        handler: CustomHandler,
    ) {
        self.lock_tools().insert(
            name.to_string(),
            ToolEntry {
                description: description.to_string(),
                input_schema,
                read_only,
                kind: ToolKind::Custom(handler),
            },
        );
    }

    pub fn tool_count(&self) -> usize {
        self.lock_tools().len()
    }

    /// Tool descriptors, sorted by name.
    pub fn list_tools(&self) -> Vec<Value> {
        self.lock_tools()
            .iter()
            .map(|(name, entry)| {
                json!({
                    "name": name,
                    "description": entry.description,
                    "inputSchema": entry.input_schema,
                    "annotations": {"readOnlyHint": entry.read_only},
                })
            })
            .collect()
    }

    /// Invoke a tool. CLI-forwarded tools run the subcommand dispatcher
    /// on a worker thread; the JSON envelope (or an error object) comes
    /// back as the result.
    pub async fn invoke_tool(&self, name: &str, arguments: &Value) -> Value {
        enum Plan {
            Cli(Vec<String>),
            Custom(CustomHandler),
        }

        let plan = {
            let tools = self.lock_tools();
            match tools.get(name) {
                None => return json!({"error": format!("Unknown tool: {name}")}),
                Some(entry) => match &entry.kind {
                    ToolKind::Cli(argv) => Plan::Cli(argv.clone()),
                    ToolKind::Custom(handler) => Plan::Custom(handler.clone()),
                },
            }
        };

        match plan {
            Plan::Custom(handler) => match handler(arguments) {
                Ok(value) => value,
                Err(e) => json!({"error": e.to_string()}),
            },
            Plan::Cli(argv_template) => {
                let mut argv = vec!["--format".to_string(), "json".to_string(), "--wake".to_string()];
                if let Some(vin) = arguments.get("vin").and_then(Value::as_str) {
                    if !vin.is_empty() {
                        argv.push("--vin".to_string());
                        argv.push(vin.to_string());
                    }
                }
                argv.extend(argv_template);
                if let Some(extra) = arguments.get("args").and_then(Value::as_array) {
                    argv.extend(
                        extra
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string),
                    );
                }

                let env = self.env.clone();
                let outcome = tokio::task::spawn_blocking(move || cli::invoke(&argv, &env)).await;
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => return json!({"error": format!("tool task failed: {e}")}),
                };

                if outcome.exit_code != 0 {
                    return json!({
                        "error": if outcome.output.is_empty() {
                            format!("Command failed with exit code {}", outcome.exit_code)
                        } else {
                            outcome.output
                        },
                        "exit_code": outcome.exit_code,
                    });
                }
                serde_json::from_str(&outcome.output)
                    .unwrap_or_else(|_| json!({"output": outcome.output}))
            }
        }
    }
}

// -- trigger tools ----------------------------------------------------------

fn fahrenheit_to_celsius(f: f64) -> f64 {
    ((f - 32.0) * 5.0 / 9.0 * 10.0).round() / 10.0
}

fn celsius_to_fahrenheit(c: f64) -> f64 {
    (c * 9.0 / 5.0 * 10.0).round() / 10.0 + 32.0
}

fn trigger_schema(value_desc: &str, value_type: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "operator": {
                "type": "string",
                "description": "Comparison: lt, gt, lte, gte, eq, neq, changed",
            },
            "value": {"type": value_type, "description": value_desc},
            "once": {
                "type": "boolean",
                "description": "Fire once then auto-delete (default: false)",
            },
            "cooldown_seconds": {
                "type": "number",
                "description": "Cooldown between firings in seconds (default: 60)",
            },
        },
        "required": ["operator"],
    })
}

fn create_trigger(
    manager: &Arc<TriggerManager>,
    store: &Option<Arc<TelemetryStore>>,
    field: &str,
    params: &Value,
    convert_temp: bool,
) -> anyhow::Result<Value> {
    let op_str = params
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("trigger requires 'operator' parameter"))?;
    let operator = TriggerOperator::parse(op_str)
        .ok_or_else(|| anyhow::anyhow!("unknown operator: {op_str}"))?;

    let mut value = params.get("value").cloned().filter(|v| !v.is_null());
    if convert_temp {
        if let Some(f) = value.as_ref().and_then(Value::as_f64) {
            value = Some(json!(fahrenheit_to_celsius(f)));
        }
    }

    let condition = TriggerCondition::new(field, operator, value)?;
    let trigger = TriggerDefinition::new(
        condition.clone(),
        params.get("once").and_then(Value::as_bool).unwrap_or(false),
        params
            .get("cooldown_seconds")
            .and_then(Value::as_f64)
            .unwrap_or(60.0),
    );
    let created = manager.create(trigger)?;
    let mut result = serde_json::to_value(&created)?;

    // Immediate evaluation: if the store already satisfies the condition,
    // say so. One-shot triggers are held open until the push callback
    // confirms delivery.
    if let Some(store) = store {
        if let Some(snapshot) = store.get(field) {
            if TriggerManager::matches(&condition, &snapshot.value, None) {
                result["immediate"] = json!(true);
                if created.once {
                    manager.mark_fired_once(&created.id);
                }
            }
        }
    }
    Ok(result)
}

fn list_triggers(manager: &Arc<TriggerManager>, field: Option<&str>, show_fahrenheit: bool) -> Value {
    let triggers: Vec<Value> = manager
        .list_all()
        .into_iter()
        .filter(|t| field.map_or(true, |f| t.condition.field == f))
        .map(|t| {
            let mut entry = json!({
                "id": t.id,
                "field": t.condition.field,
                "operator": t.condition.operator.as_str(),
                "value": t.condition.value,
                "once": t.once,
                "cooldown_seconds": t.cooldown_seconds,
            });
            if show_fahrenheit {
                if let Some(c) = t.condition.value.as_ref().and_then(Value::as_f64) {
                    entry["value_f"] = json!(celsius_to_fahrenheit(c));
                }
            }
            entry
        })
        .collect();
    json!({"triggers": triggers})
}

/// Register the trigger CRUD tools and `telemetry_get` on the server.
pub fn register_trigger_tools(
    server: &ToolServer,
    manager: Arc<TriggerManager>,
    store: Option<Arc<TelemetryStore>>,
) {
    let delete_schema = json!({
        "type": "object",
        "properties": {"id": {"type": "string", "description": "Trigger ID"}},
        "required": ["id"],
    });
    let list_schema = json!({"type": "object", "properties": {}});

    // Domain-specific creators: (tool prefix, field, temperature conversion)
    let domains: &[(&str, &str, bool, &str)] = &[
        ("cabin_temp_trigger", "InsideTemp", true, "Temperature threshold in °F"),
        ("outside_temp_trigger", "OutsideTemp", true, "Temperature threshold in °F"),
        ("battery_trigger", "BatteryLevel", false, "Battery level threshold (0-100 percent)"),
    ];

    for (prefix, field, convert, value_desc) in domains {
        let field = field.to_string();
        let convert = *convert;

        let m = manager.clone();
        let s = store.clone();
        let create_field = field.clone();
        server.register_custom_tool(
            prefix,
            &format!("Create a trigger on {field}"),
            trigger_schema(value_desc, "number"),
            false,
            Arc::new(move |params| create_trigger(&m, &s, &create_field, params, convert)),
        );

        let m = manager.clone();
        let list_field = field.clone();
        server.register_custom_tool(
            &format!("{prefix}_list"),
            &format!("List {field} triggers with IDs and thresholds"),
            list_schema.clone(),
            true,
            Arc::new(move |_| Ok(list_triggers(&m, Some(&list_field), convert))),
        );

        let m = manager.clone();
        server.register_custom_tool(
            &format!("{prefix}_delete"),
            &format!("Delete a {field} trigger by ID"),
            delete_schema.clone(),
            false,
            Arc::new(move |params| {
                let id = params
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow::anyhow!("trigger delete requires 'id' parameter"))?;
                Ok(json!({"deleted": m.delete(id), "id": id}))
            }),
        );
    }

    // Location geofence triggers.
    let m = manager.clone();
    let s = store.clone();
    server.register_custom_tool(
        "location_trigger",
        "Create a location geofence trigger (enter/leave)",
        json!({
            "type": "object",
            "properties": {
                "operator": {"type": "string", "description": "Geofence operator: enter or leave"},
                "value": {
                    "type": "object",
                    "description": "Geofence: {latitude, longitude, radius_m}",
                    "properties": {
                        "latitude": {"type": "number"},
                        "longitude": {"type": "number"},
                        "radius_m": {"type": "number"},
                    },
                    "required": ["latitude", "longitude", "radius_m"],
                },
                "once": {"type": "boolean"},
                "cooldown_seconds": {"type": "number"},
            },
            "required": ["operator", "value"],
        }),
        false,
        Arc::new(move |params| create_trigger(&m, &s, "Location", params, false)),
    );

    // Generic create across any telemetry field.
    let m = manager.clone();
    let s = store.clone();
    server.register_custom_tool(
        "trigger_create",
        "Create a trigger on any telemetry field",
        json!({
            "type": "object",
            "properties": {
                "field": {
                    "type": "string",
                    "description": "Telemetry field name (e.g. BatteryLevel, InsideTemp, Location, Soc)",
                },
                "operator": {
                    "type": "string",
                    "description": "Comparison: lt, gt, lte, gte, eq, neq, changed, enter, leave",
                },
                "value": {"description": "Threshold (number, or geofence object for enter/leave)"},
                "once": {"type": "boolean"},
                "cooldown_seconds": {"type": "number"},
            },
            "required": ["field", "operator"],
        }),
        false,
        Arc::new(move |params| {
            let field = params
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("trigger_create requires 'field' parameter"))?
                .to_string();
            create_trigger(&m, &s, &field, params, false)
        }),
    );

    let m = manager.clone();
    server.register_custom_tool(
        "trigger_list",
        "List all triggers across all domains",
        list_schema.clone(),
        true,
        Arc::new(move |_| Ok(list_triggers(&m, None, false))),
    );

    let m = manager.clone();
    server.register_custom_tool(
        "trigger_delete",
        "Delete a trigger by ID",
        delete_schema,
        false,
        Arc::new(move |params| {
            let id = params
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("trigger delete requires 'id' parameter"))?;
            Ok(json!({"deleted": m.delete(id), "id": id}))
        }),
    );

    let m = manager.clone();
    server.register_custom_tool(
        "trigger_poll",
        "Drain pending trigger notifications",
        list_schema,
        false,
        Arc::new(move |_| Ok(json!({"notifications": m.drain_pending()}))),
    );

    let s = store;
    server.register_custom_tool(
        "telemetry_get",
        "Read the latest value of any telemetry field",
        json!({
            "type": "object",
            "properties": {
                "field": {"type": "string", "description": "Telemetry field name (e.g. PackVoltage)"},
            },
            "required": ["field"],
        }),
        true,
        Arc::new(move |params| {
            let field = params
                .get("field")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("telemetry_get requires 'field' parameter"))?;
            let Some(store) = &s else {
                return Ok(json!({"field": field, "error": "telemetry_store_unavailable"}));
            };
            Ok(match store.get(field) {
                Some(snap) => json!({"field": field, "value": snap.value.to_json()}),
                None => json!({"field": field, "pending": true}),
            })
        }),
    );
}

// -- axum surface -----------------------------------------------------------

/// Shared router state.
#[derive(Clone)]
pub struct ToolState {
    pub server: Arc<ToolServer>,
    pub oauth: Arc<OAuthAuthServer>,
    pub security: Arc<TransportSecurity>,
    pub issuer: String,
}

/// Build the tool + OAuth router.
pub fn tool_router(state: ToolState) -> Router {
    // CORS is permissive by design: the host/origin guard and bearer
    // auth are the actual gates.
    Router::new()
        .route("/mcp", post(handle_mcp))
        .route("/authorize", get(handle_authorize))
        .route("/token", post(handle_token))
        .route("/revoke", post(handle_revoke))
        .route(
            "/.well-known/oauth-authorization-server",
            get(handle_as_discovery),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(handle_resource_discovery),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            host_guard,
        ))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// DNS-rebinding guard: reject requests whose Host or Origin falls
/// outside the allowlist.
async fn host_guard(
    State(state): State<ToolState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let headers = request.headers();
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
        if !state.security.host_allowed(host) {
            tracing::warn!(host, "rejected request for unlisted host");
            return (StatusCode::MISDIRECTED_REQUEST, "unknown host").into_response();
        }
    }
    if let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) {
        if !state.security.origin_allowed(origin) {
            tracing::warn!(origin, "rejected request for unlisted origin");
            return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
        }
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn unauthorized(issuer: &str) -> Response {
    let www = format!(
        "Bearer resource_metadata=\"{issuer}/.well-known/oauth-protected-resource\""
    );
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, www)],
        Json(json!({"error": "invalid_token"})),
    )
        .into_response()
}

fn rpc_result(id: Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

/// Handle one JSON-RPC request. `None` means a notification that needs
/// no response body. Shared by the HTTP endpoint and the stdio
/// transport.
pub async fn handle_rpc(server: &ToolServer, request: &Value) -> Option<Value> {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    if id.is_null() && method.starts_with("notifications/") {
        return None;
    }

    Some(match method {
        "initialize" => rpc_result(
            id,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "fleetgate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "ping" => rpc_result(id, json!({})),
        "tools/list" => rpc_result(id, json!({"tools": server.list_tools()})),
        "tools/call" => {
            let params = request.get("params").cloned().unwrap_or(json!({}));
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(rpc_error(id, -32602, "missing tool name"));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            let result = server.invoke_tool(name, &arguments).await;

            let is_error = result.get("error").is_some();
            let text = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
            rpc_result(
                id,
                json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": is_error,
                }),
            )
        }
        other => rpc_error(id, -32601, &format!("method not found: {other}")),
    })
}

async fn handle_mcp(
    State(state): State<ToolState>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized(&state.issuer);
    };
    if state.oauth.load_access_token(token).is_none() {
        return unauthorized(&state.issuer);
    }

    match handle_rpc(&state.server, &request).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[derive(serde::Deserialize)]
struct AuthorizeQuery {
    client_id: String,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
    #[serde(default)]
    resource: Option<String>,
}

async fn handle_authorize(
    State(state): State<ToolState>,
    axum::extract::Query(query): axum::extract::Query<AuthorizeQuery>,
) -> Response {
    if let Some(method) = &query.code_challenge_method {
        if method != "S256" {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_request", "error_description": "only S256 is supported"})),
            )
                .into_response();
        }
    }

    let params = AuthorizeParams {
        client_id: query.client_id,
        redirect_uri: query.redirect_uri.clone().unwrap_or_default(),
        redirect_uri_provided_explicitly: query.redirect_uri.is_some(),
        scopes: query
            .scope
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        state: query.state,
        code_challenge: query.code_challenge.unwrap_or_default(),
        resource: query.resource,
    };

    match state.oauth.authorize(params) {
        Ok(redirect) => Redirect::to(&redirect).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.body())).into_response(),
    }
}

async fn handle_token(
    State(state): State<ToolState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let grant_type = form.get("grant_type").map(String::as_str).unwrap_or("");
    let client_id = form.get("client_id").map(String::as_str).unwrap_or("");

    // Client authentication: when the client has a secret, it must match.
    let client = state.oauth.get_client(client_id);
    if let Some(secret) = &client.client_secret {
        if form.get("client_secret").map(String::as_str) != Some(secret.as_str()) {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid_client"})),
            )
                .into_response();
        }
    }

    let result = match grant_type {
        "authorization_code" => {
            let code = form.get("code").map(String::as_str).unwrap_or("");
            let verifier = form.get("code_verifier").map(String::as_str).unwrap_or("");
            state
                .oauth
                .exchange_authorization_code(code, client_id, verifier)
        }
        "refresh_token" => {
            let refresh = form.get("refresh_token").map(String::as_str).unwrap_or("");
            let scopes = form.get("scope").map(|s| {
                s.split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            });
            state.oauth.exchange_refresh_token(refresh, client_id, scopes)
        }
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "unsupported_grant_type",
                    "error_description": format!("unsupported grant_type: {other}"),
                })),
            )
                .into_response();
        }
    };

    match result {
        Ok(tokens) => Json(tokens).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.body())).into_response(),
    }
}

async fn handle_revoke(
    State(state): State<ToolState>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    if let Some(token) = form.get("token") {
        state.oauth.revoke_token(token);
    }
    Json(json!({})).into_response()
}

async fn handle_as_discovery(State(state): State<ToolState>) -> Response {
    Json(state.oauth.discovery_document(&state.issuer)).into_response()
}

async fn handle_resource_discovery(State(state): State<ToolState>) -> Response {
    Json(state.oauth.resource_document(&state.issuer)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_security_host_matching() {
        let sec = TransportSecurity::new(Some("machine.tail.example"));
        assert!(sec.host_allowed("127.0.0.1"));
        assert!(sec.host_allowed("127.0.0.1:8080"));
        assert!(sec.host_allowed("localhost:9000"));
        assert!(sec.host_allowed("machine.tail.example"));
        assert!(sec.host_allowed("Machine.Tail.Example:443"));
        assert!(!sec.host_allowed("evil.example"));
        assert!(!sec.host_allowed("evil.example:8080"));
    }

    #[test]
    fn test_transport_security_origin_matching() {
        let sec = TransportSecurity::new(Some("machine.tail.example"));
        assert!(sec.origin_allowed("http://localhost:3000"));
        assert!(sec.origin_allowed("https://machine.tail.example"));
        assert!(!sec.origin_allowed("https://evil.example"));
        assert!(!sec.origin_allowed("not a url"));
    }

    #[test]
    fn test_default_tool_registry() {
        let server = ToolServer::new(HashMap::new());
        let tools = server.list_tools();
        assert!(tools.len() >= 25);

        let info = tools
            .iter()
            .find(|t| t["name"] == "vehicle_info")
            .unwrap();
        assert_eq!(info["annotations"]["readOnlyHint"], true);
        assert!(info["inputSchema"]["properties"]["vin"].is_object());
        assert!(info["inputSchema"]["properties"]["args"].is_object());

        let lock = tools
            .iter()
            .find(|t| t["name"] == "security_lock")
            .unwrap();
        assert_eq!(lock["annotations"]["readOnlyHint"], false);
    }

    #[tokio::test]
    async fn test_unknown_tool_invocation() {
        let server = ToolServer::new(HashMap::new());
        let result = server.invoke_tool("no_such_tool", &json!({})).await;
        assert!(result["error"].as_str().unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_trigger_tools_roundtrip() {
        let server = ToolServer::new(HashMap::new());
        let manager = Arc::new(TriggerManager::new("V1"));
        let store = Arc::new(TelemetryStore::new());
        register_trigger_tools(&server, manager.clone(), Some(store.clone()));

        // Create a battery trigger through the tool surface.
        let created = server
            .invoke_tool(
                "battery_trigger",
                &json!({"operator": "lt", "value": 20, "once": false}),
            )
            .await;
        let id = created["id"].as_str().unwrap().to_string();
        assert_eq!(manager.count(), 1);

        let listed = server.invoke_tool("trigger_list", &json!({})).await;
        assert_eq!(listed["triggers"][0]["id"], id.as_str());

        let deleted = server
            .invoke_tool("trigger_delete", &json!({"id": id}))
            .await;
        assert_eq!(deleted["deleted"], true);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_temperature_trigger_converts_to_celsius() {
        let server = ToolServer::new(HashMap::new());
        let manager = Arc::new(TriggerManager::new("V1"));
        register_trigger_tools(&server, manager.clone(), None);

        let created = server
            .invoke_tool(
                "cabin_temp_trigger",
                &json!({"operator": "gt", "value": 86.0}),
            )
            .await;
        // 86°F = 30°C stored internally.
        assert_eq!(created["condition"]["value"], 30.0);

        let listed = server.invoke_tool("cabin_temp_trigger_list", &json!({})).await;
        assert_eq!(listed["triggers"][0]["value_f"], 86.0);
    }

    #[tokio::test]
    async fn test_immediate_evaluation_marks_one_shot() {
        let server = ToolServer::new(HashMap::new());
        let manager = Arc::new(TriggerManager::new("V1"));
        let store = Arc::new(TelemetryStore::new());
        store.update(
            "BatteryLevel",
            crate::telemetry::decoder::TelemetryValue::Int(15),
            chrono::Utc::now(),
        );
        register_trigger_tools(&server, manager.clone(), Some(store));

        let created = server
            .invoke_tool(
                "battery_trigger",
                &json!({"operator": "lt", "value": 20, "once": true}),
            )
            .await;
        assert_eq!(created["immediate"], true);
        // Held open for delivery; finalize_once removes it.
        assert_eq!(manager.count(), 1);
        manager.finalize_once(created["id"].as_str().unwrap());
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_telemetry_get_tool() {
        let server = ToolServer::new(HashMap::new());
        let manager = Arc::new(TriggerManager::new("V1"));
        let store = Arc::new(TelemetryStore::new());
        store.update(
            "PackVoltage",
            crate::telemetry::decoder::TelemetryValue::Float(398.5),
            chrono::Utc::now(),
        );
        register_trigger_tools(&server, manager, Some(store));

        let result = server
            .invoke_tool("telemetry_get", &json!({"field": "PackVoltage"}))
            .await;
        assert_eq!(result["value"], 398.5);

        let pending = server
            .invoke_tool("telemetry_get", &json!({"field": "Soc"}))
            .await;
        assert_eq!(pending["pending"], true);
    }
}
