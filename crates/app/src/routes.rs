use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::extract::multipart::MultipartError;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox::{
    ErrorKind, ExecError, ExecutionRequest, ExecutionStream, ExecutionSupervisor, OutputEvent,
    UploadedFile,
};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::activity::SessionActivity;

/// Bounds validation, staging and launch; the event stream itself is
/// bounded by the execution deadline.
const START_TIMEOUT_SECONDS: u64 = 60;
const PYTHON_ENTRYPOINT: &str = "main.py";
const PYTHON_COMMAND: &str = "python3 main.py";

#[derive(Clone)]
pub struct AppState {
    pub supervisor: ExecutionSupervisor,
    pub activity: SessionActivity,
}

#[derive(Debug, Deserialize)]
struct PythonRequest {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    status: &'static str,
    files: usize,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    error_type: &'static str,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            error_type: "invalid_request_error",
        }
    }
}

impl From<ExecError> for ApiError {
    fn from(err: ExecError) -> Self {
        let (status, error_type) = match err.kind() {
            ErrorKind::BadRequest => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ErrorKind::Forbidden => (StatusCode::FORBIDDEN, "forbidden_error"),
            ErrorKind::Launch => (StatusCode::BAD_GATEWAY, "sandbox_error"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };
        Self {
            status,
            message: err.to_string(),
            error_type,
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self {
            status: err.status(),
            message: err.body_text(),
            error_type: "invalid_request_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = Json(ErrorEnvelope {
            error: ErrorBody {
                message: self.message,
                error_type: self.error_type.to_owned(),
            },
        })
        .into_response();
        *response.status_mut() = self.status;
        response
    }
}

pub fn build_router(state: AppState, max_body_bytes: usize) -> Router {
    let start_timeout = Duration::from_secs(START_TIMEOUT_SECONDS);
    let execution_layers = ServiceBuilder::new()
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            start_timeout,
        ));
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthcheck))
        .route("/heartbeat", post(heartbeat_handler))
        .route(
            "/execute",
            post(execute_handler).layer(execution_layers.clone()),
        )
        .route(
            "/vm/default/python",
            post(python_handler).layer(execution_layers),
        )
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(log_request_response))
        .with_state(state)
}

async fn root() -> &'static str {
    "Welcome to Forge API"
}

async fn healthcheck() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();
    info!(%method, %uri, "request");
    let response = next.run(request).await;
    info!(
        %method,
        %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "response"
    );
    response
}

async fn execute_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut command = String::new();
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "command" => command = field.text().await?,
            "files" | "file" => {
                let file_name = field.file_name().unwrap_or_default().to_owned();
                let bytes = field.bytes().await?;
                files.push(UploadedFile::new(file_name, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let file_count = files.len();
    let stream = state
        .supervisor
        .start(ExecutionRequest { command, files })
        .await?;
    state.activity.record_files(file_count);
    Ok(event_stream(stream))
}

async fn python_handler(
    State(state): State<AppState>,
    Json(payload): Json<PythonRequest>,
) -> Result<Response, ApiError> {
    if payload.code.trim().is_empty() {
        return Err(ApiError::bad_request("code required"));
    }
    let request = ExecutionRequest::new(PYTHON_COMMAND).with_file(PYTHON_ENTRYPOINT, payload.code);
    let stream = state.supervisor.start(request).await?;
    state.activity.record_files(1);
    Ok(event_stream(stream))
}

async fn heartbeat_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<HeartbeatResponse> {
    let key = caller_key(&headers, peer);
    state.activity.touch(&key, tokio::time::Instant::now());
    Json(HeartbeatResponse {
        status: "ok",
        files: state.activity.known_files(),
    })
}

/// First hop of `x-forwarded-for` when present, so callers behind the web
/// proxy are told apart; the socket peer otherwise.
fn caller_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn event_stream(stream: ExecutionStream) -> Response {
    let sandbox_id = stream.sandbox_id().to_owned();
    let events = ReceiverStream::new(stream.into_receiver()).map(move |event| {
        if event.is_terminal() {
            info!(sandbox = %sandbox_id, %event, "terminal event");
        }
        Ok::<_, Infallible>(Event::default().data(frame_text(&event)))
    });
    Sse::new(events).into_response()
}

/// SSE data cannot carry carriage returns; a bare `\r` becomes a line break.
fn frame_text(event: &OutputEvent) -> String {
    event.to_string().replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use std::process::Stdio;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request as HttpRequest;
    use sandbox::launcher::render_script;
    use sandbox::{ExecutionLimits, SandboxHandle, SandboxLauncher};
    use tokio::process::{Child, Command};
    use tower::ServiceExt;

    use super::*;

    const BOUNDARY: &str = "forge-test-boundary";

    #[derive(Default)]
    struct ShellLauncher {
        launches: AtomicUsize,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SandboxLauncher for ShellLauncher {
        async fn launch(&self, handle: &SandboxHandle, command: &str) -> Result<Child, ExecError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().unwrap().push(command.to_owned());
            tokio::fs::write(&handle.script_path, render_script(&handle.workspace_dir, command))
                .await?;
            Command::new("sh")
                .arg(&handle.script_path)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|err| ExecError::Launch(err.to_string()))
        }

        async fn kill(&self, _handle: &SandboxHandle) -> Result<(), ExecError> {
            Ok(())
        }

        async fn remove(&self, _handle: &SandboxHandle) -> Result<(), ExecError> {
            Ok(())
        }
    }

    fn app() -> (Router, Arc<ShellLauncher>, SessionActivity) {
        let launcher = Arc::new(ShellLauncher::default());
        let activity = SessionActivity::new();
        let state = AppState {
            supervisor: ExecutionSupervisor::new(launcher.clone(), ExecutionLimits::default()),
            activity: activity.clone(),
        };
        let router = build_router(state, 1024 * 1024)
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 40000))));
        (router, launcher, activity)
    }

    fn multipart_body(command: &str, files: &[(&str, &str)]) -> String {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"command\"\r\n\r\n{command}\r\n"
        );
        for (name, content) in files {
            body.push_str(&format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{content}\r\n"
            ));
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn execute_request(command: &str, files: &[(&str, &str)]) -> HttpRequest<Body> {
        HttpRequest::post("/execute")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(command, files)))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthcheck_is_not_cached() {
        let (router, _, _) = app();
        let response = router
            .oneshot(HttpRequest::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn root_returns_banner() {
        let (router, _, _) = app();
        let response = router
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "Welcome to Forge API");
    }

    #[tokio::test]
    async fn execute_streams_framed_lines() {
        let (router, launcher, _) = app();
        let response = router
            .oneshot(execute_request("cat note.txt", &[("note.txt", "hi\nthere\n")]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(body_text(response).await, "data: hi\n\ndata: there\n\n");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_reports_exit_code_as_data() {
        let (router, _, _) = app();
        let response = router
            .oneshot(execute_request("echo a; exit 7", &[]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "data: a\n\ndata: exit-code:7\n\n");
    }

    #[tokio::test]
    async fn validation_errors_are_http_errors() {
        let (router, launcher, _) = app();
        let forbidden = router
            .clone()
            .oneshot(execute_request("echo x; sudo id", &[]))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = serde_json::from_str(&body_text(forbidden).await).unwrap();
        assert_eq!(body["error"]["type"], "forbidden_error");

        let empty = router.oneshot(execute_request("  ", &[])).await.unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn python_endpoint_stages_main_py() {
        let (router, launcher, _) = app();
        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/vm/default/python")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"code":"print('hi')"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            launcher.commands.lock().unwrap().as_slice(),
            [PYTHON_COMMAND.to_owned()]
        );

        let empty = router
            .oneshot(
                HttpRequest::post("/vm/default/python")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"code":"   "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn heartbeat_tracks_callers_and_reports_files() {
        let (router, _, activity) = app();
        let response = router
            .clone()
            .oneshot(execute_request("cat a.txt", &[("a.txt", "a")]))
            .await
            .unwrap();
        body_text(response).await;

        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/heartbeat")
                    .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok", "files": 1}));

        let response = router
            .oneshot(HttpRequest::post("/heartbeat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(activity.tracked(), 2);
    }

    #[test]
    fn caller_key_prefers_forwarded_header() {
        let peer = SocketAddr::from(([192, 168, 1, 5], 1234));
        let mut headers = HeaderMap::new();
        assert_eq!(caller_key(&headers, peer), "192.168.1.5");
        headers.insert("x-forwarded-for", HeaderValue::from_static(" 198.51.100.7 ,1.1.1.1"));
        assert_eq!(caller_key(&headers, peer), "198.51.100.7");
    }

    #[test]
    fn frames_never_contain_carriage_returns() {
        let text = frame_text(&OutputEvent::Line("10%\r50%".to_owned()));
        assert_eq!(text, "10%\n50%");
    }
}
