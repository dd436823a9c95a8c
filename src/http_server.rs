//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::paths;
use crate::projects::{self, ProjectInfo, Template};
use crate::runner::RunResult;
use crate::state::AppState;
use crate::terminal::{SessionIo, TerminalSession, DEFAULT_COLS, DEFAULT_ROWS};
use crate::workspace::{self, TreeEntry};

// Request/Response types
#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    #[serde(default)]
    template: Option<String>,
}

#[derive(Serialize)]
struct CreateProjectResponse {
    success: bool,
    name: String,
    template: Template,
}

#[derive(Deserialize)]
struct ProjectQuery {
    project: String,
}

#[derive(Deserialize)]
struct FileQuery {
    project: String,
    path: String,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    project: String,
    path: String,
    content: String,
}

#[derive(Serialize)]
struct FileContentResponse {
    content: String,
}

#[derive(Serialize)]
struct SuccessResponse {
    success: bool,
}

#[derive(Deserialize)]
struct RunRequest {
    project: String,
    file: String,
    language: String,
}

#[derive(Serialize)]
struct TerminalInfo {
    id: String,
    state: crate::terminal::SessionState,
    cols: u16,
    rows: u16,
}

#[derive(Deserialize)]
struct TerminalQuery {
    project: Option<String>,
}

/// Structured messages a terminal client may send over the channel.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Run the HTTP server on the given port with the provided state.
///
/// Shutdown is explicit: the ctrl-c future drains the terminal registry
/// (signalling every child and refusing new sessions) before the listener
/// stops accepting.
pub async fn run_server(port: u16, state: AppState) {
    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
            state.shutdown().await;
        })
        .await
        .unwrap();
}

fn router(state: AppState) -> Router {
    Router::new()
        // Projects
        .route("/api/projects", get(list_projects))
        .route("/api/projects", post(create_project))
        .route("/api/tree", get(get_tree))
        // Files
        .route("/api/files", get(read_file))
        .route("/api/files", post(write_file))
        .route("/api/files", delete(delete_file))
        // One-shot execution
        .route("/api/run", post(run_file))
        // Terminals
        .route("/terminal", get(terminal_ws))
        .route("/api/terminals", get(list_terminals))
        .route("/api/terminals/:id", delete(close_terminal))
        // Health check
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "terminals": state.terminals.len().await,
    }))
}

async fn list_projects(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectInfo>>, GatewayError> {
    let dir = state.config.projects_dir.clone();
    let list = tokio::task::spawn_blocking(move || projects::list_projects(&dir))
        .await
        .map_err(join_error)??;
    Ok(Json(list))
}

async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<CreateProjectResponse>, GatewayError> {
    let template = Template::from_name(req.template.as_deref().unwrap_or("empty"));
    let dir = state.config.projects_dir.clone();
    let name = req.name.clone();
    tokio::task::spawn_blocking(move || projects::create_project(&dir, &name, template))
        .await
        .map_err(join_error)??;
    Ok(Json(CreateProjectResponse {
        success: true,
        name: req.name,
        template,
    }))
}

async fn get_tree(
    State(state): State<AppState>,
    Query(query): Query<ProjectQuery>,
) -> Result<Json<Vec<TreeEntry>>, GatewayError> {
    let root = paths::project_root(&state.config.projects_dir, &query.project)?;
    if !root.is_dir() {
        return Err(GatewayError::ProjectNotFound);
    }
    let tree = tokio::task::spawn_blocking(move || workspace::tree(&root))
        .await
        .map_err(join_error)??;
    Ok(Json(tree))
}

async fn read_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<FileContentResponse>, GatewayError> {
    let path = paths::resolve(&state.config.projects_dir, &query.project, &query.path)?;
    let bytes = tokio::task::spawn_blocking(move || workspace::read(&path))
        .await
        .map_err(join_error)??;
    Ok(Json(FileContentResponse {
        content: String::from_utf8_lossy(&bytes).into_owned(),
    }))
}

async fn write_file(
    State(state): State<AppState>,
    Json(req): Json<WriteFileRequest>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    let WriteFileRequest {
        project,
        path: rel_path,
        content,
    } = req;
    let path = paths::resolve(&state.config.projects_dir, &project, &rel_path)?;
    tokio::task::spawn_blocking(move || workspace::write(&path, content.as_bytes()))
        .await
        .map_err(join_error)??;
    info!(project = %project, path = %rel_path, "file saved");
    Ok(Json(SuccessResponse { success: true }))
}

async fn delete_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<Json<SuccessResponse>, GatewayError> {
    let path = paths::resolve(&state.config.projects_dir, &query.project, &query.path)?;
    if !workspace::exists(&path) {
        return Err(GatewayError::NotFound);
    }
    tokio::task::spawn_blocking(move || workspace::delete(&path))
        .await
        .map_err(join_error)??;
    info!(project = %query.project, path = %query.path, "deleted");
    Ok(Json(SuccessResponse { success: true }))
}

async fn run_file(
    State(state): State<AppState>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResult>, GatewayError> {
    let target = paths::resolve(&state.config.projects_dir, &req.project, &req.file)?;
    let root = paths::project_root(&state.config.projects_dir, &req.project)?;
    info!(project = %req.project, file = %req.file, language = %req.language, "POST /api/run");

    let result = state.runner.run(&target, &root, &req.language).await?;
    info!(exit_code = result.exit_code, "run finished");
    Ok(Json(result))
}

async fn list_terminals(State(state): State<AppState>) -> Json<Vec<TerminalInfo>> {
    let sessions = state.terminals.list().await;
    let list = sessions
        .iter()
        .map(|s| {
            let (cols, rows) = s.size();
            TerminalInfo {
                id: s.id.clone(),
                state: s.state(),
                cols,
                rows,
            }
        })
        .collect();
    Json(list)
}

async fn close_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, GatewayError> {
    if state.terminals.close(&id).await {
        info!(session = %id, "terminal close requested");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(GatewayError::NotFound)
    }
}

async fn terminal_ws(
    ws: WebSocketUpgrade,
    Query(query): Query<TerminalQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, query.project))
}

async fn handle_terminal(socket: WebSocket, state: AppState, project: Option<String>) {
    let Some(project) = project else {
        close_with(socket, close_code::POLICY, "project name is required").await;
        return;
    };
    let root = match paths::project_root(&state.config.projects_dir, &project) {
        Ok(root) => root,
        Err(e) => {
            close_with(socket, close_code::POLICY, &e.to_string()).await;
            return;
        }
    };
    if !root.is_dir() {
        close_with(socket, close_code::POLICY, "project not found").await;
        return;
    }

    let (session, io) = match TerminalSession::spawn(
        &project,
        &root,
        &state.config.shell,
        DEFAULT_COLS,
        DEFAULT_ROWS,
    ) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(project = %project, error = %e, "terminal spawn failed");
            close_with(socket, close_code::ERROR, &e.to_string()).await;
            return;
        }
    };
    if let Err(e) = state.terminals.insert(session.clone()).await {
        session.begin_close();
        session.terminate();
        close_with(socket, close_code::AGAIN, &e.to_string()).await;
        return;
    }
    session.mark_active();
    info!(session = %session.id, project = %project, "terminal connected");

    relay(socket, &state, &session, io).await;

    info!(session = %session.id, "terminal disconnected");
}

/// Bridge one session to its channel until either end terminates, then run
/// teardown at most once regardless of which side went first.
async fn relay(socket: WebSocket, state: &AppState, session: &Arc<TerminalSession>, io: SessionIo) {
    let SessionIo {
        mut output_rx,
        mut exit_rx,
    } = io;
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut process_exited = false;

    loop {
        tokio::select! {
            // PTY output -> client, verbatim and in arrival order.
            chunk = output_rx.recv() => match chunk {
                Some(data) => {
                    if ws_tx.send(Message::Binary(data.to_vec())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },

            // Client -> PTY input or resize.
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Input { data }) => {
                        if !session.write(Bytes::from(data.into_bytes())).await {
                            break;
                        }
                    }
                    Ok(ClientMessage::Resize { cols, rows }) => session.resize(cols, rows),
                    Err(e) => {
                        warn!(session = %session.id, error = %e, "ignoring malformed terminal message");
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    warn!(session = %session.id, "ignoring non-text terminal message");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong
                Some(Err(_)) => break,
            },

            // Shell exited on its own.
            _ = &mut exit_rx => {
                process_exited = true;
                break;
            }
        }
    }

    if session.begin_close() {
        session.terminate();
        if !process_exited {
            // Channel closed first: wait for the signalled child to go away
            // before dropping the registry entry.
            let _ = (&mut exit_rx).await;
        }
        state.terminals.remove(&session.id).await;
        session.mark_closed();
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

fn join_error(e: tokio::task::JoinError) -> GatewayError {
    GatewayError::Io(std::io::Error::other(e))
}
