//! Bearer authentication for the admin API.
//!
//! `/api/tunnels` and `/api/resolve` require an `Authorization: Bearer <key>`
//! header. Console WebSockets are not authenticated here: the token itself is
//! issued by the upstream console-ticket service, and the hypervisor validates
//! its own VNC ticket.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

fn reject(status: StatusCode, error: &str, code: &str) -> Response {
    (status, Json(json!({"error": error, "code": code}))).into_response()
}

/// Admin-route guard. The expected key comes from the [`ApiKey`] extension.
///
/// | Status | When |
/// |---|---|
/// | 401 | no `Authorization: Bearer` header |
/// | 403 | wrong key |
/// | 500 | no [`ApiKey`] extension, or an empty one |
///
/// An empty configured key never authenticates anything, even an empty
/// bearer value.
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let expected = request
        .extensions()
        .get::<ApiKey>()
        .map(|k| k.0.clone())
        .filter(|k| !k.is_empty());
    let Some(expected) = expected else {
        return reject(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Admin API key is not configured",
            "CONFIG",
        );
    };

    let Some(provided) = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    else {
        return reject(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
            "UNAUTHORIZED",
        );
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return reject(StatusCode::FORBIDDEN, "Invalid API key", "FORBIDDEN");
    }

    next.run(request).await
}

/// Byte comparison whose running time depends only on `expected`.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// The admin key, handed to [`require_api_key`] as a request extension.
#[derive(Clone)]
pub struct ApiKey(pub String);

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::routing::get;
    use axum::{middleware, Extension, Router};
    use tower::ServiceExt;

    use super::*;

    fn guarded(key: &str) -> Router {
        Router::new()
            .route("/admin", get(|| async { "ok" }))
            .layer(middleware::from_fn(require_api_key))
            .layer(Extension(ApiKey(key.to_string())))
    }

    async fn status(app: Router, bearer: Option<&str>) -> StatusCode {
        let mut req = axum::http::Request::get("/admin");
        if let Some(b) = bearer {
            req = req.header("authorization", format!("Bearer {b}"));
        }
        app.oneshot(req.body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[tokio::test]
    async fn test_bearer_check() {
        assert_eq!(status(guarded("s3cret"), None).await, StatusCode::UNAUTHORIZED);
        assert_eq!(status(guarded("s3cret"), Some("nope")).await, StatusCode::FORBIDDEN);
        assert_eq!(status(guarded("s3cret"), Some("s3cret")).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_empty_key_never_authenticates() {
        assert_eq!(
            status(guarded(""), Some("")).await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status(guarded(""), None).await,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
