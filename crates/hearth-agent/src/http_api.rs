//! REST and websocket surface.
//!
//! Requests name their instance with `X-Access-Server` and authenticate
//! with `X-Access-Token`. `s:` permissions are checked against the
//! instance's own keys (global keys hold all of them); `g:` permissions
//! need a global key.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::error_payload::ApiError;
use crate::events::ServerEvent;
use crate::files::FileError;
use crate::model::{ConfigError, ConfigPatch, InstanceConfig, PluginKind};
use crate::registry::{InstanceRegistry, RegistryError};
use crate::supervisor::{Instance, SupervisorError};

const SERVER_HEADER: &str = "x-access-server";
const TOKEN_HEADER: &str = "x-access-token";

#[derive(Clone)]
pub struct AppState {
    pub registry: InstanceRegistry,
    pub keys: Arc<[String]>,
}

impl AppState {
    fn is_global(&self, token: &str) -> bool {
        self.keys.iter().any(|k| k == token)
    }
}

fn invalid_config(e: &ConfigError) -> ApiError {
    let err = ApiError::bad_request("invalid_config", e.to_string());
    match e.field() {
        Some(field) => err.with_field(field, e.to_string()),
        None => err,
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match &e {
            SupervisorError::NotRunning => ApiError::conflict("not_running", e.to_string()),
            SupervisorError::InputRejected(_) => ApiError::conflict("input_rejected", e.to_string()),
            SupervisorError::Config(c) => invalid_config(c),
            SupervisorError::RestartLoop => ApiError::internal(e.to_string())
                .with_hint("check that the server generates its config files on first start"),
            _ => ApiError::internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::AlreadyExists(_) => ApiError::conflict("already_exists", e.to_string()),
            RegistryError::NotFound(_) => ApiError::bad_request("unknown_server", e.to_string()),
            RegistryError::Config(c) => invalid_config(&c),
            RegistryError::Supervisor(e) => e.into(),
        }
    }
}

impl From<FileError> for ApiError {
    fn from(e: FileError) -> Self {
        match &e {
            FileError::EscapesRoot | FileError::Symlink => ApiError::forbidden(e.to_string()),
            FileError::NotFound => ApiError::not_found(e.to_string()),
            FileError::NotADirectory | FileError::NotAFile | FileError::MissingName => {
                ApiError::bad_request("invalid_path", e.to_string())
            }
            FileError::TooLarge => ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "too_large", e.to_string()),
            FileError::Io(_) => ApiError::internal(e.to_string()),
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn denied() -> ApiError {
    ApiError::forbidden("You do not have permission to perform that action.")
}

async fn lookup(state: &AppState, name: &str) -> Result<Arc<Instance>, ApiError> {
    state
        .registry
        .get(name)
        .await
        .ok_or_else(|| ApiError::bad_request("unknown_server", format!("server {name} does not exist")))
}

async fn check_token(state: &AppState, server: &str, token: &str, permission: &str) -> Result<Arc<Instance>, ApiError> {
    if permission.starts_with("g:") {
        if !state.is_global(token) {
            tracing::warn!(server, permission, "rejected request without a global key");
            return Err(denied());
        }
        return lookup(state, server).await;
    }

    let inst = lookup(state, server).await?;
    let allowed = inst
        .config()
        .await
        .has_permission(&state.keys, token, permission);
    if !allowed {
        tracing::warn!(server, permission, "rejected request lacking permission");
        return Err(denied());
    }
    Ok(inst)
}

/// Resolves the addressed instance and checks `permission` for the token.
async fn authorize(state: &AppState, headers: &HeaderMap, permission: &str) -> Result<Arc<Instance>, ApiError> {
    let server = header(headers, SERVER_HEADER)
        .ok_or_else(|| ApiError::bad_request("missing_header", "Missing required X-Access-Server header."))?;
    let token = header(headers, TOKEN_HEADER)
        .ok_or_else(|| ApiError::bad_request("missing_header", "Missing required X-Access-Token header."))?;
    check_token(state, server, token, permission).await
}

fn require_global(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = header(headers, TOKEN_HEADER)
        .ok_or_else(|| ApiError::bad_request("missing_header", "Missing required X-Access-Token header."))?;
    if !state.is_global(token) {
        tracing::warn!("rejected create request without a global key");
        return Err(denied());
    }
    Ok(())
}

async fn index() -> &'static str {
    "Hearth Management Daemon"
}

async fn server_info(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let inst = authorize(&state, &headers, "s:get").await?;
    Ok(Json(inst.info().await).into_response())
}

#[derive(Debug, serde::Deserialize)]
struct CreateRequest {
    settings: InstanceConfig,
    password: String,
    #[serde(default)]
    build_params: Option<String>,
}

async fn create_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRequest>,
) -> Result<StatusCode, ApiError> {
    require_global(&state, &headers)?;
    let inst = state.registry.create(req.settings, &req.password).await?;

    tokio::spawn(async move {
        if let Err(e) = inst.major_install(req.build_params.as_deref()).await {
            tracing::error!(instance = %inst.name(), error = %e, "install of new server failed");
        }
    });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Deserialize)]
struct UpdateRequest {
    json: serde_json::Value,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    overwrite: bool,
}

async fn update_server(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateRequest>,
) -> Result<Response, ApiError> {
    let inst = authorize(&state, &headers, "g:update").await?;
    let patch = ConfigPatch::from_legacy(req.object.as_deref(), req.json, req.overwrite);
    let next = inst.update_config(&patch).await?;
    Ok(Json(next).into_response())
}

async fn delete_server(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "g:delete").await?;
    state.registry.remove(inst.name()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn power(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(action): Path<String>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "s:power").await?;
    tracing::info!(instance = %inst.name(), action = %action, "power action requested");
    match action.as_str() {
        "on" => inst.preflight().await?,
        "kill" => inst.kill().await,
        "off" | "restart" => {
            // Both wait for the process to exit, which can take the whole
            // stop timeout.
            tokio::spawn(async move {
                let result = if action == "off" {
                    inst.power_off().await
                } else {
                    inst.power_cycle().await
                };
                if let Err(e) = result {
                    tracing::warn!(instance = %inst.name(), action = %action, error = %e, "power action failed");
                }
            });
        }
        other => {
            return Err(ApiError::bad_request("invalid_action", format!("unknown power action {other:?}")));
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn rebuild(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "g:rebuild").await?;
    inst.rebuild().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, serde::Deserialize)]
struct ReinstallRequest {
    #[serde(default)]
    build_params: Option<String>,
    #[serde(default)]
    plugin: Option<PluginKind>,
}

async fn reinstall(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReinstallRequest>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "g:reinstall").await?;
    if req.build_params.is_none() {
        tracing::warn!(instance = %inst.name(), "reinstall requested without build parameters");
    }
    tokio::spawn(async move {
        if let Err(e) = inst.reinstall(req.plugin, req.build_params.as_deref()).await {
            tracing::error!(instance = %inst.name(), error = %e, "reinstall failed");
        }
    });
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Deserialize)]
struct ConsoleRequest {
    command: String,
}

async fn console(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ConsoleRequest>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "s:console:send").await?;
    inst.send_command(&req.command).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn log_tail(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(lines): Path<usize>,
) -> Result<String, ApiError> {
    let inst = authorize(&state, &headers, "s:console").await?;
    Ok(inst.log_tail(lines).await?)
}

#[derive(Debug, serde::Deserialize)]
struct PasswordRequest {
    password: String,
}

async fn reset_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PasswordRequest>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "s:ftp").await?;
    inst.reset_password(&req.password).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_root(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    list_directory(State(state), headers, Path(String::new())).await
}

async fn list_directory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let inst = authorize(&state, &headers, "s:files").await?;
    let entries = inst.files().await.list(&path).await?;
    Ok(Json(entries).into_response())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum FileEncoding {
    #[default]
    Utf8,
    Base64,
}

/// File body on the wire. Text stays readable; anything that is not valid
/// UTF-8 travels as standard base64.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct FileContents {
    contents: String,
    #[serde(default)]
    encoding: FileEncoding,
}

impl FileContents {
    fn encode(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(contents) => Self {
                contents,
                encoding: FileEncoding::Utf8,
            },
            Err(e) => Self {
                contents: base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
                encoding: FileEncoding::Base64,
            },
        }
    }

    fn decode(self) -> Result<Vec<u8>, ApiError> {
        match self.encoding {
            FileEncoding::Utf8 => Ok(self.contents.into_bytes()),
            FileEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(self.contents.as_bytes())
                .map_err(|e| ApiError::bad_request("invalid_body", format!("contents are not valid base64: {e}"))),
        }
    }
}

async fn read_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let inst = authorize(&state, &headers, "s:files:get").await?;
    let bytes = inst.files().await.read(&path).await?;
    Ok(Json(FileContents::encode(bytes)).into_response())
}

async fn write_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
    Json(body): Json<FileContents>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "s:files:put").await?;
    let bytes = body.decode()?;
    inst.files().await.write(&path, &bytes).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> Result<StatusCode, ApiError> {
    let inst = authorize(&state, &headers, "s:files:delete").await?;
    inst.files().await.delete(&path).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Deserialize)]
struct WsQuery {
    token: String,
}

async fn events_ws(
    State(state): State<AppState>,
    Path(server): Path<String>,
    Query(q): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let inst = check_token(&state, &server, &q.token, "s:console").await?;
    Ok(ws.on_upgrade(move |socket| forward_events(inst, socket)))
}

/// Streams every instance event to the socket until either side goes away.
async fn forward_events(inst: Arc<Instance>, socket: WebSocket) {
    let span = tracing::info_span!("events_ws", instance = %inst.name());
    async move {
        let mut events = inst.events().subscribe_all();
        let (mut sender, mut receiver) = socket.split();

        let hello = ServerEvent::Status(inst.status().await);
        if send_event(&mut sender, &hello).await.is_err() {
            return;
        }
        tracing::debug!("subscriber attached");

        loop {
            tokio::select! {
                ev = events.recv() => match ev {
                    Ok(ev) => {
                        if send_event(&mut sender, &ev).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!(skipped = n, "subscriber lagging, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
        tracing::debug!("subscriber detached");
    }
    .instrument(span)
    .await
}

async fn send_event<S>(sender: &mut S, ev: &ServerEvent) -> Result<(), ()>
where
    S: futures_util::Sink<Message> + Unpin,
{
    let text = serde_json::to_string(ev).map_err(|_| ())?;
    sender.send(Message::Text(text)).await.map_err(|_| ())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route(
            "/server",
            get(server_info)
                .post(create_server)
                .put(update_server)
                .delete(delete_server),
        )
        .route("/server/power/:action", get(power))
        .route("/server/rebuild-container", put(rebuild))
        .route("/server/reinstall", put(reinstall))
        .route("/server/console", post(console))
        .route("/server/log/:lines", get(log_tail))
        .route("/server/reset-password", post(reset_password))
        .route("/server/directory", get(list_root))
        .route("/server/directory/*path", get(list_directory))
        .route("/server/file/*path", get(read_file).put(write_file).delete(delete_file))
        .route("/ws/:server", get(events_ws))
        .with_state(state)
}
