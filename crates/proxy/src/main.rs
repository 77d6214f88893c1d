//! Forwarding proxy for browser-hosted builds of the console, which cannot
//! call school APIs cross-origin. Requests arrive as `/proxy/{path}?host=...`
//! and are replayed verbatim against `{host}/{path}`, echoing the upstream
//! status, headers, and body back unchanged.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Json, Router,
};
use serde::Deserialize;
use tracing::{debug, error, info};

mod config;

use config::load_settings;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Hop-by-hop headers that must not be echoed back to the client.
const SKIPPED_RESPONSE_HEADERS: [header::HeaderName; 3] = [
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    header::CONTENT_LENGTH,
];

struct AppState {
    upstream: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ProxyQuery {
    host: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let app = build_router(Arc::new(AppState {
        upstream: reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?,
    }));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "proxy listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", any(healthz))
        .route("/proxy/*path", any(forward))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn forward(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    Query(query): Query<ProxyQuery>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(host) = query.host.filter(|host| !host.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "message": "missing host query param" })),
        )
            .into_response();
    };

    let target = format!("{}/{path}", host.trim_end_matches('/'));
    debug!(%method, %target, "forwarding request");

    let mut request = state.upstream.request(method, &target).body(body);
    // Only content negotiation survives the hop; everything else is the
    // proxy's own business.
    if let Some(accept) = headers.get(header::ACCEPT) {
        request = request.header(header::ACCEPT, accept);
    }
    if let Some(content_type) = headers.get(header::CONTENT_TYPE) {
        request = request.header(header::CONTENT_TYPE, content_type);
    }

    let upstream_response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            error!(%target, %err, "upstream request failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": err.to_string() })),
            )
                .into_response();
        }
    };

    let status = upstream_response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers() {
        if SKIPPED_RESPONSE_HEADERS.contains(name) {
            continue;
        }
        response_headers.append(name.clone(), value.clone());
    }

    match upstream_response.bytes().await {
        Ok(body) => (status, response_headers, body).into_response(),
        Err(err) => {
            error!(%target, %err, "failed to read upstream body");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    fn test_app() -> Router {
        build_router(Arc::new(AppState {
            upstream: reqwest::Client::new(),
        }))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn missing_host_is_a_bad_request() {
        let request = Request::get("/proxy/mobile-versions/ios/employee")
            .body(Body::empty())
            .expect("request");
        let response = test_app().oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["message"], "missing host query param");
    }

    #[tokio::test]
    async fn forwards_path_method_and_negotiation_headers() {
        async fn upstream(headers: HeaderMap) -> Json<serde_json::Value> {
            let accept = headers
                .get(header::ACCEPT)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(serde_json::json!({ "echoed_accept": accept }))
        }

        let upstream_router =
            Router::new().route("/mobile-versions/:platform/:app_type", get(upstream));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("upstream addr");
        tokio::spawn(async move {
            axum::serve(listener, upstream_router)
                .await
                .expect("upstream server");
        });

        let request = Request::get(format!(
            "/proxy/mobile-versions/ios/employee?host=http://{addr}"
        ))
        .header(header::ACCEPT, "application/vnd.api+json")
        .body(Body::empty())
        .expect("request");
        let response = test_app().oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["echoed_accept"], "application/vnd.api+json");
    }
}
