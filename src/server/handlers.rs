//! Route handlers
//!
//! Translates HTTP requests into store and hub operations, and library
//! errors into the JSON error envelope `{error, code, message}`.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::error::{GalenaError, Result};
use crate::server::AppState;

/// Unified response body: fixed JSON responses and SSE streams boxed alike.
pub type ResponseBody = BoxBody<Bytes, Infallible>;

/// Capacity of the channel bridging a subscriber's delivery task to the
/// response body. Small on purpose: the real buffering happens in the
/// subscriber's own frame buffer.
const SSE_BODY_CHANNEL_CAPACITY: usize = 16;

/// Route an incoming HTTP request to the appropriate handler.
pub async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> Response<ResponseBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        let mut response = status_response(StatusCode::NO_CONTENT);
        cors_headers(&mut response);
        return response;
    }

    let mut response = match (method, path.as_str()) {
        (Method::GET, "/events") => handle_events(&query, &state)
            .await
            .unwrap_or_else(|e| error_response(&e)),

        (Method::POST, "/store") => handle_store_initialize(req, &state)
            .await
            .unwrap_or_else(|e| error_response(&e)),

        (Method::PATCH, "/store") => handle_store_update(req, &query, &state)
            .await
            .unwrap_or_else(|e| error_response(&e)),

        (Method::DELETE, "/store") => handle_store_delete(&query, &state)
            .await
            .unwrap_or_else(|e| error_response(&e)),

        (Method::GET, "/store") => handle_store_query(&query, &state)
            .await
            .unwrap_or_else(|e| error_response(&e)),

        (Method::GET, "/health") => handle_health(),

        (Method::GET, "/metrics") => handle_metrics(&state).await,

        (_, "/events" | "/store" | "/health" | "/metrics") => json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed",
        ),

        _ => json_error(StatusCode::NOT_FOUND, "not_found", "Resource not found"),
    };

    cors_headers(&mut response);
    response
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// `GET /events?filter=<expr>[&filter=<expr>…]` — open an SSE subscription.
async fn handle_events(query: &str, state: &Arc<AppState>) -> Result<Response<ResponseBody>> {
    let filters = filters_from_query(query);

    let (sink, body_rx) = mpsc::channel::<Bytes>(SSE_BODY_CHANNEL_CAPACITY);
    let subscriber = state.hub.add_subscriber(sink, &filters, true).await?;
    info!(id = %subscriber.id(), ?filters, "SSE subscriber connected");

    let stream = ReceiverStream::new(body_rx).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes)));
    let body = StreamBody::new(stream).boxed();

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("Access-Control-Allow-Origin", "*")
        .body(body)
        .map_err(|e| GalenaError::Internal(format!("failed to build SSE response: {e}")))
}

/// `POST /store` — replace the whole tree.
async fn handle_store_initialize(
    req: Request<Incoming>,
    state: &Arc<AppState>,
) -> Result<Response<ResponseBody>> {
    require_json_content_type(&req)?;
    let body = read_body(req, state.max_body_size).await?;

    state.store.initialize_from_bytes(&body).await?;
    info!(size_bytes = body.len(), "store initialized");

    state.hub.broadcast_event(".", &Value::Null, "init");

    Ok(success_response(
        json!({"size_bytes": body.len(), "timestamp": Utc::now().timestamp()}),
        "Store initialized successfully",
    ))
}

/// `PATCH /store?path=<expr>` — set the value at a path.
async fn handle_store_update(
    req: Request<Incoming>,
    query: &str,
    state: &Arc<AppState>,
) -> Result<Response<ResponseBody>> {
    require_json_content_type(&req)?;
    let path = require_param(query, "path")?;
    let body = read_body(req, state.max_body_size).await?;

    state.store.set_from_bytes(&path, &body).await?;
    debug!(path = %path, size_bytes = body.len(), "store updated");

    // Re-read the written value so the broadcast carries what the store now
    // holds rather than what the producer sent.
    match state.store.get(&path).await {
        Ok(value) => {
            state.hub.broadcast_event(&path, &value, "update");
            Ok(success_response(
                json!({
                    "path": path,
                    "size_bytes": body.len(),
                    "timestamp": Utc::now().timestamp(),
                }),
                "Store updated successfully",
            ))
        }
        Err(e) => {
            debug!(path = %path, error = %e, "could not re-read updated value");
            Ok(success_response(
                Value::Null,
                &format!("Path '{path}' updated successfully, but could not retrieve the new value"),
            ))
        }
    }
}

/// `DELETE /store?path=<expr>` — delete the value at a path.
async fn handle_store_delete(query: &str, state: &Arc<AppState>) -> Result<Response<ResponseBody>> {
    let path = require_param(query, "path")?;

    state.store.delete(&path).await?;
    debug!(path = %path, "store path deleted");

    state.hub.broadcast_event(&path, &Value::Null, "delete");

    Ok(success_response(
        json!({"path": path, "timestamp": Utc::now().timestamp()}),
        "Store path deleted successfully",
    ))
}

/// `GET /store?path=<expr>[&pattern=true]` — query the tree.
async fn handle_store_query(query: &str, state: &Arc<AppState>) -> Result<Response<ResponseBody>> {
    let params = parse_query_params(query);
    let path = query_value(&params, "path")
        .filter(|p| !p.is_empty())
        .unwrap_or(".")
        .to_string();
    let pattern = query_value(&params, "pattern") == Some("true") || path.contains('*');

    let result = if pattern {
        let matches = state.store.find_matches(&path).await?;
        serde_json::to_value(matches)?
    } else {
        state.store.get(&path).await?
    };

    Ok(json_response(StatusCode::OK, &result))
}

/// `GET /health` — liveness probe.
fn handle_health() -> Response<ResponseBody> {
    success_response(
        json!({"status": "ok", "time": Utc::now().timestamp()}),
        "Service is healthy",
    )
}

/// `GET /metrics` — subscriber count, store kind, uptime.
async fn handle_metrics(state: &Arc<AppState>) -> Response<ResponseBody> {
    success_response(
        json!({
            "subscribers": state.hub.subscriber_count(),
            "store_type": state.store.kind().to_string(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "time": Utc::now().timestamp(),
        }),
        "Server metrics",
    )
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

fn full_body(bytes: Vec<u8>) -> ResponseBody {
    Full::new(Bytes::from(bytes)).boxed()
}

/// Build a JSON response with the given status code and body.
pub(crate) fn json_response(status: StatusCode, body: &Value) -> Response<ResponseBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full_body(bytes))
        .unwrap_or_else(|e| {
            error!(error = %e, "failed to build response");
            Response::new(full_body(
                br#"{"error":"internal_error","code":500,"message":"failed to build response"}"#
                    .to_vec(),
            ))
        })
}

/// The success envelope shared by mutation and probe routes.
fn success_response(data: Value, message: &str) -> Response<ResponseBody> {
    json_response(
        StatusCode::OK,
        &json!({"status": "success", "data": data, "message": message}),
    )
}

/// Build an error response from a library error.
pub(crate) fn error_response(e: &GalenaError) -> Response<ResponseBody> {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_error(status, e.kind(), &e.to_string())
}

fn json_error(status: StatusCode, kind: &str, message: &str) -> Response<ResponseBody> {
    json_response(
        status,
        &json!({"error": kind, "code": status.as_u16(), "message": message}),
    )
}

fn status_response(status: StatusCode) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .body(full_body(Vec::new()))
        .unwrap_or_else(|_| Response::new(full_body(Vec::new())))
}

/// Add CORS headers to a response.
fn cors_headers(response: &mut Response<ResponseBody>) {
    use hyper::header::HeaderValue;

    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Origin",
        HeaderValue::from_static("*"),
    );
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, POST, PATCH, DELETE, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type, Content-Length, Accept-Encoding, Authorization"),
    );
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

fn require_json_content_type(req: &Request<Incoming>) -> Result<()> {
    let content_type = req
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if content_type.contains("application/json") {
        Ok(())
    } else {
        Err(GalenaError::InvalidOperation(
            "Content-Type must be application/json".to_string(),
        ))
    }
}

/// Read the full request body, enforcing the size limit frame by frame.
async fn read_body(req: Request<Incoming>, max_size: usize) -> Result<Vec<u8>> {
    let mut body = req.into_body();
    let mut buf = Vec::new();

    while let Some(frame) = body.frame().await {
        let frame =
            frame.map_err(|e| GalenaError::Internal(format!("failed to read body: {e}")))?;
        if let Some(data) = frame.data_ref() {
            if buf.len() + data.len() > max_size {
                return Err(GalenaError::BodyTooLarge(max_size));
            }
            buf.extend_from_slice(data);
        }
    }

    Ok(buf)
}

fn require_param(query: &str, name: &str) -> Result<String> {
    let params = parse_query_params(query);
    query_value(&params, name)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GalenaError::MissingParameter(name.to_string()))
}

/// Parse URL query parameters, preserving repeats and decoding
/// percent-escapes (filter expressions carry `[`, `]`, `=`, and `*`).
fn parse_query_params(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|s| !s.is_empty())
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?;
            let value = parts.next().unwrap_or("");
            Some((percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn query_value<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// All filter expressions from the query string: repeated `filter` params
/// and comma-separated lists both work.
fn filters_from_query(query: &str) -> Vec<String> {
    parse_query_params(query)
        .into_iter()
        .filter(|(key, _)| key == "filter")
        .flat_map(|(_, value)| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(high), Some(low)) => {
                        out.push(high * 16 + low);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
