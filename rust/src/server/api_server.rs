use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Bytes, StreamBody};
use axum::extract::State;
use axum::http::{header, HeaderName, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};
use tower_http::compression::CompressionLayer;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};
use tower_http::ServiceBuilderExt;

use super::api;
use super::error::ApiError;
use crate::bridge::Bridge;

pub const API_VERSION: &str = env!("CARGO_PKG_VERSION");
const JSON_CONTENT_TYPE: &str = "application/json";
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

struct HttpServerContext {
    bridge: Arc<Bridge>,
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub allow_origin: String,
    pub max_age: String,
}

pub fn router(bridge: Arc<Bridge>, opts: &HttpOptions) -> anyhow::Result<Router> {
    let compress_when = SizeAbove::new(1000)
        .and(NotForContentType::GRPC)
        .and(NotForContentType::IMAGES)
        .and(NotForContentType::const_new(EVENT_STREAM_CONTENT_TYPE));
    let service = ServiceBuilder::new()
        .catch_panic()
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .override_response_header(
            HeaderName::from_static("x-api-version"),
            HeaderValue::from_static(API_VERSION),
        )
        .override_response_header(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_str(&opts.allow_origin)?,
        )
        .override_response_header(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_str(&opts.max_age)?,
        )
        .override_response_header(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization"),
        )
        .layer(
            CompressionLayer::new()
                .gzip(true)
                .no_br()
                .no_deflate()
                .no_zstd()
                .compress_when(compress_when),
        )
        .insert_response_header_if_not_present(
            header::CONTENT_TYPE,
            HeaderValue::from_static(JSON_CONTENT_TYPE),
        );

    let base = format!("/v{}", API_VERSION);
    let ctx = Arc::new(HttpServerContext { bridge });
    let app = Router::new()
        .route(
            &format!("{}/healthcheck", base),
            get(healthcheck_handler)
                .options(options_get_handler)
                .fallback(method_not_allowed),
        )
        .route(
            &format!("{}/inference", base),
            post(inference_handler)
                .options(options_post_handler)
                .fallback(method_not_allowed),
        )
        .route(
            &format!("{}/stream", base),
            post(stream_handler)
                .options(options_post_handler)
                .fallback(method_not_allowed),
        )
        .fallback(not_found)
        .layer(middleware::from_fn(validate_content_type))
        .layer(service)
        .with_state(ctx);
    Ok(app)
}

pub async fn run_http(
    bind: SocketAddr,
    http_handle: axum_server::Handle,
    _shutdown_complete: mpsc::Sender<()>,
    app: Router,
) {
    let server = axum_server::bind(bind);
    info!("Started HTTP server on {}", bind);
    let ret = server
        .handle(http_handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await;
    if let Err(e) = ret {
        error!("HTTP server error: {}", e);
    }
    info!("HTTP server stopped");
}

async fn validate_content_type<B>(
    req: Request<B>,
    next: Next<B>,
) -> Response {
    let method = req.method();
    if method == Method::POST || method == Method::PUT || method == Method::PATCH
    {
        let media_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase());
        if media_type.as_deref() != Some(JSON_CONTENT_TYPE) {
            return ApiError::UnsupportedMediaType.into_response();
        }
    }
    next.run(req).await
}

async fn healthcheck_handler(
    State(ctx): State<Arc<HttpServerContext>>,
) -> Json<api::HealthCheck> {
    Json(api::HealthCheck {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: API_VERSION,
        workers: ctx.bridge.stats(),
    })
}

async fn inference_handler(
    State(ctx): State<Arc<HttpServerContext>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req = api::parse_request(&body)?;
    if req.stream {
        return stream_response(&ctx, req).await;
    }
    let data = ctx.bridge.infer(req.messages, &req.payload).await?;
    Ok(Json(api::InferenceResponse { data }).into_response())
}

async fn stream_handler(
    State(ctx): State<Arc<HttpServerContext>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let req = api::parse_request(&body)?;
    stream_response(&ctx, req).await
}

async fn stream_response(
    ctx: &HttpServerContext,
    req: api::TextGenRequest,
) -> Result<Response, ApiError> {
    let mut fragments = ctx.bridge.stream(req.messages, &req.payload).await?;

    let stream = async_stream::stream! {
        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(text) => yield Ok(Bytes::from(api::sse_frame(&text))),
                Err(e) => {
                    error!(cause = %e, "Stream aborted.");
                    yield Err(axum::Error::new(e));
                    break;
                }
            }
        }
    };

    Ok((
        [
            (header::CONTENT_TYPE, EVENT_STREAM_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        StreamBody::new(stream),
    )
        .into_response())
}

async fn options_get_handler() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [(header::ACCESS_CONTROL_ALLOW_METHODS, "GET, OPTIONS")],
    )
}

async fn options_post_handler() -> impl IntoResponse {
    (
        StatusCode::NO_CONTENT,
        [(header::ACCESS_CONTROL_ALLOW_METHODS, "POST, OPTIONS")],
    )
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}
