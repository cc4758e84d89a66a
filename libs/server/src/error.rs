use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use sandboxd_shared::shell_session::{ErrorKind, SessionError};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    error: String,
    code: String,
    request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_id: Option<String>,
}

impl ApiErrorBody {
    fn new(code: &str, message: &str) -> Self {
        Self {
            error: message.to_string(),
            code: code.to_string(),
            request_id: format!("req_{}", Uuid::new_v4().simple()),
            exit_code: None,
            command_id: None,
        }
    }
}

pub fn api_error(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(ApiErrorBody::new(code, message))).into_response()
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Gone => StatusCode::GONE,
        ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn session_error(error: SessionError) -> Response {
    let status = status_for(error.kind());
    let code = match &error {
        SessionError::NotFound(_) => "session_not_found",
        SessionError::CommandNotFound { .. } => "command_not_found",
        SessionError::AlreadyExists(_) => "session_already_exists",
        SessionError::LimitReached(_) => "session_limit_reached",
        SessionError::InvalidId(_) => "invalid_session_id",
        SessionError::BadRequest(_) => "invalid_request",
        SessionError::SessionGone(_) => "session_gone",
        SessionError::InputClosed(_) => "input_closed",
        SessionError::CommandCompleted { .. } => "command_completed",
        SessionError::SessionCancelled { .. } => "session_cancelled",
        SessionError::Timeout { .. } => "command_timeout",
        SessionError::Forbidden(_) => "forbidden",
        SessionError::SpawnFailed(_) => "spawn_failed",
        SessionError::IoError(_) => "internal_error",
    };

    let mut body = ApiErrorBody::new(code, &error.to_string());
    match error {
        SessionError::CommandCompleted { exit_code, .. }
        | SessionError::SessionCancelled { exit_code, .. } => body.exit_code = Some(exit_code),
        SessionError::Timeout { command_id, .. } => body.command_id = Some(command_id),
        _ => {}
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::time::Duration;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(body) => body,
            Err(error) => panic!("failed to read body: {error}"),
        };
        match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(error) => panic!("invalid error json: {error}"),
        }
    }

    #[test]
    fn status_follows_error_kind() {
        let cases = [
            (SessionError::NotFound("s".into()), StatusCode::NOT_FOUND),
            (SessionError::AlreadyExists("s".into()), StatusCode::CONFLICT),
            (SessionError::LimitReached(2), StatusCode::CONFLICT),
            (SessionError::SessionGone("s".into()), StatusCode::GONE),
            (SessionError::InvalidId("..".into()), StatusCode::BAD_REQUEST),
            (SessionError::Forbidden("log".into()), StatusCode::FORBIDDEN),
            (SessionError::SpawnFailed("sh".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                SessionError::CommandCompleted {
                    command_id: "c".into(),
                    exit_code: 0,
                },
                StatusCode::GONE,
            ),
        ];

        for (error, status) in cases {
            assert_eq!(status_for(error.kind()), status);
            assert_eq!(session_error(error).status(), status);
        }
    }

    #[tokio::test]
    async fn session_cancelled_carries_exit_code() {
        let response = session_error(SessionError::SessionCancelled {
            session_id: "s".into(),
            exit_code: -1,
        });
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = body_json(response).await;
        assert_eq!(body.get("code"), Some(&serde_json::json!("session_cancelled")));
        assert_eq!(body.get("exit_code"), Some(&serde_json::json!(-1)));
        assert!(
            body.get("request_id")
                .and_then(|value| value.as_str())
                .is_some_and(|id| id.starts_with("req_"))
        );
    }

    #[tokio::test]
    async fn timeout_carries_command_id() {
        let response = session_error(SessionError::Timeout {
            command_id: "c1".into(),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);

        let body = body_json(response).await;
        assert_eq!(body.get("command_id"), Some(&serde_json::json!("c1")));
        assert!(body.get("exit_code").is_none());
    }
}
