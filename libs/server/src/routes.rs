use crate::{
    error::{api_error, session_error},
    log_stream::command_logs_handler,
    state::AppState,
    types::{
        CommandDto, CommandsResponse, CreateSessionBody, ExecuteBody, ExecuteResponse,
        HealthResponse, SendInputBody, SessionDetailResponse, SessionDto, SessionsResponse,
    },
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use sandboxd_shared::shell_session::{CreateSessionOptions, ExecuteRequest};
use std::time::Duration;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health_handler))
        .route(
            "/v1/sessions",
            get(list_sessions_handler).post(create_session_handler),
        )
        .route(
            "/v1/sessions/{id}",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/v1/sessions/{id}/exec", post(execute_handler))
        .route("/v1/sessions/{id}/commands", get(list_commands_handler))
        .route(
            "/v1/sessions/{id}/commands/{command_id}",
            get(get_command_handler),
        )
        .route(
            "/v1/sessions/{id}/commands/{command_id}/input",
            post(send_input_handler),
        )
        .route(
            "/v1/sessions/{id}/commands/{command_id}/logs",
            get(command_logs_handler),
        )
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        sessions: state.registry.session_count().await,
    })
}

async fn list_sessions_handler(State(state): State<AppState>) -> Json<SessionsResponse> {
    let sessions: Vec<SessionDto> = state
        .registry
        .list()
        .await
        .iter()
        .map(|session| SessionDto::from_session(session))
        .collect();

    Json(SessionsResponse {
        total: sessions.len(),
        sessions,
    })
}

async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Response, Response> {
    let session = state
        .registry
        .create(
            &body.session_id,
            CreateSessionOptions {
                legacy_working_dir: body.legacy_working_dir,
            },
        )
        .await
        .map_err(session_error)?;

    Ok((StatusCode::CREATED, Json(SessionDto::from_session(&session))).into_response())
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetailResponse>, Response> {
    let session = state.registry.get(&session_id).await.ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "session_not_found",
            &format!("Session {} not found", session_id),
        )
    })?;
    let commands = state
        .registry
        .list_commands(&session_id)
        .await
        .map_err(session_error)?;

    Ok(Json(SessionDetailResponse {
        session: SessionDto::from_session(&session),
        commands: commands.iter().map(|c| CommandDto::from(c.as_ref())).collect(),
    }))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, Response> {
    state
        .registry
        .delete(&session_id)
        .await
        .map_err(session_error)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn execute_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> Result<Json<ExecuteResponse>, Response> {
    if body.command.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "command must not be empty",
        ));
    }

    let outcome = state
        .registry
        .execute(
            &session_id,
            ExecuteRequest {
                command: body.command,
                run_async: body.run_async,
                combined_output: body.combined_output,
                suppress_input_echo: body.suppress_input_echo,
                timeout: body.timeout_ms.map(Duration::from_millis),
            },
        )
        .await
        .map_err(session_error)?;

    Ok(Json(ExecuteResponse::new(outcome.command_id, outcome.result)))
}

async fn list_commands_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<CommandsResponse>, Response> {
    let commands: Vec<CommandDto> = state
        .registry
        .list_commands(&session_id)
        .await
        .map_err(session_error)?
        .iter()
        .map(|c| CommandDto::from(c.as_ref()))
        .collect();

    Ok(Json(CommandsResponse {
        total: commands.len(),
        commands,
    }))
}

async fn get_command_handler(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
) -> Result<Json<CommandDto>, Response> {
    let command = state
        .registry
        .get_command(&session_id, &command_id)
        .await
        .map_err(session_error)?;

    Ok(Json(CommandDto::from(command.as_ref())))
}

async fn send_input_handler(
    State(state): State<AppState>,
    Path((session_id, command_id)): Path<(String, String)>,
    Json(body): Json<SendInputBody>,
) -> Result<StatusCode, Response> {
    state
        .registry
        .send_input(&session_id, &command_id, body.data.as_bytes())
        .await
        .map_err(session_error)?;

    Ok(StatusCode::NO_CONTENT)
}
