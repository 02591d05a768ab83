use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::database::AppState;

/// Guards operator routes with the shared `AUTHORIZATION` secret
///
/// When a secret is configured the request must carry it verbatim in the
/// `Authorization` header. Without a configured secret the check is skipped.
pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let Some(secret) = state.config.auth_token.as_deref() else {
        return Ok(next.run(request).await);
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if provided != Some(secret) {
        debug!(path = %request.uri().path(), "rejected unauthorized operator request");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Unauthorized",
                "message": "Invalid or missing authorization header"
            })),
        )
            .into_response());
    }

    Ok(next.run(request).await)
}
