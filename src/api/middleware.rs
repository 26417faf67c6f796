use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};

use super::types::ErrorResponse;

/// Enforces bearer auth on every route except health when a token is
/// configured; a missing token disables the check entirely.
pub async fn auth(token: Option<String>, request: Request, next: Next) -> Response {
    let Some(token) = token else {
        return next.run(request).await;
    };

    if request.uri().path() == "/api/v1/health" {
        return next.run(request).await;
    }

    let expected = format!("Bearer {token}");
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == expected);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse {
                error: "Unauthorized".to_string(),
            }),
        )
            .into_response();
    }

    next.run(request).await
}

/// CORS for browser and mobile clients. With no configured origin every
/// origin is allowed; with one configured, any other origin is refused.
pub async fn cors(allowed_origin: Option<String>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut cors_headers = HeaderMap::new();
    match (&allowed_origin, &origin) {
        (None, _) => {
            cors_headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
        (Some(allowed), Some(origin)) if origin == allowed => {
            if let Ok(value) = HeaderValue::from_str(allowed) {
                cors_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
            cors_headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        (Some(_), Some(_)) => {
            return StatusCode::FORBIDDEN.into_response();
        }
        (Some(_), None) => {}
    }

    cors_headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    cors_headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(
            "Accept, Content-Type, Content-Length, Accept-Encoding, Authorization",
        ),
    );
    cors_headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("86400"),
    );

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response.headers_mut().extend(cors_headers);
        return response;
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(cors_headers);
    response
}
