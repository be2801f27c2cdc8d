use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Json},
    routing::{get, post},
};
use diagnosis_flow::{
    DiagnosisRunner, FlowError, InMemorySessionStorage, PromptParams, REPORT_FILE_NAME,
    RunnerSettings, UploadedImage,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
    agent::{AgentSettings, LiteratureSearch, OpenRouterAgentFactory, PubMedSearch},
    config::ServiceConfig,
    models::{
        AnalysisResponse, ChatRequest, ChatResponse, CredentialRequest, DISCLAIMER,
        PreviewResponse, SessionResponse, TranscriptQuery, TranscriptResponse,
    },
};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<Value>)>;
type ApiError = (StatusCode, Json<Value>);

const INDEX_HTML: &str = include_str!("../static/index.html");

fn bad_request_error(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn not_found_error(message: &str, id: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": message,
            "session_id": id
        })),
    )
}

fn status_error(status: StatusCode, message: &str, details: &str) -> ApiError {
    (
        status,
        Json(json!({
            "error": message,
            "details": details
        })),
    )
}

/// Maps pipeline failures onto HTTP responses. The message is shown to the user verbatim.
fn flow_error(session_id: &str, e: FlowError) -> ApiError {
    let details = e.to_string();
    match e {
        FlowError::SessionNotFound(_) => not_found_error("Session not found", session_id),
        FlowError::InvalidInput(_) | FlowError::UnsupportedImage { .. } => {
            bad_request_error(&details)
        }
        FlowError::MissingCredential => status_error(
            StatusCode::PRECONDITION_REQUIRED,
            "Please configure your API key first",
            &details,
        ),
        FlowError::NoAnalysis => status_error(
            StatusCode::CONFLICT,
            "No analysis available. Please analyze an image first",
            &details,
        ),
        FlowError::Agent(_) => {
            warn!("Agent failure for session {}: {}", session_id, details);
            status_error(StatusCode::BAD_GATEWAY, "Model request failed", &details)
        }
        FlowError::Report(_) | FlowError::Io(_) => {
            error!("Local failure for session {}: {}", session_id, details);
            status_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal processing error",
                &details,
            )
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: DiagnosisRunner,
    pub chat_history_limit: usize,
}

pub fn create_app(config: &ServiceConfig) -> Router {
    let app_state = create_app_state(config);
    build_router(app_state, config.max_upload_bytes)
}

fn create_app_state(config: &ServiceConfig) -> AppState {
    let http = reqwest::Client::new();
    let literature = config
        .literature_search
        .then(|| Arc::new(PubMedSearch::new(http.clone())) as Arc<dyn LiteratureSearch>);

    let agents = OpenRouterAgentFactory::new(
        http,
        AgentSettings {
            model_id: config.model_id.clone(),
            max_tokens: config.max_tokens,
        },
        literature,
    );

    let settings = RunnerSettings {
        temp_dir: config.temp_dir.clone(),
        chat_policy: config.chat_policy,
        ..RunnerSettings::default()
    };

    let storage = match config.session_idle_minutes {
        0 => InMemorySessionStorage::new(),
        minutes => InMemorySessionStorage::with_idle_timeout(Duration::from_secs(minutes * 60)),
    };

    AppState {
        runner: DiagnosisRunner::new(
            Arc::new(storage),
            Arc::new(agents),
            settings,
        ),
        chat_history_limit: config.chat_history_limit,
    }
}

pub fn build_router(app_state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/sessions", post(start_session))
        .route("/sessions/{session_id}", get(get_session).delete(end_session))
        .route(
            "/sessions/{session_id}/credential",
            axum::routing::put(set_credential).delete(clear_credential),
        )
        .route("/sessions/{session_id}/images", post(preview_images))
        .route("/sessions/{session_id}/analyze", post(analyze_images))
        .route("/sessions/{session_id}/reset", post(reset_session))
        .route("/sessions/{session_id}/report.pdf", get(download_report))
        .route(
            "/sessions/{session_id}/chat",
            post(ask_follow_up).get(get_transcript),
        )
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn root() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn start_session(State(state): State<AppState>) -> ApiResult<Value> {
    let session = state
        .runner
        .start_session()
        .await
        .map_err(|e| flow_error("", e))?;

    Ok(Json(json!({
        "session_id": session.id,
        "created_at": session.created_at.to_rfc3339(),
    })))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionResponse> {
    let snapshot = state
        .runner
        .snapshot(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(SessionResponse {
        session_id,
        credential_configured: snapshot.credential_configured,
        analysis: snapshot.analysis,
        transcript: snapshot.transcript,
    }))
}

async fn end_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Value> {
    state
        .runner
        .end_session(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(json!({ "session_id": session_id, "status": "ended" })))
}

async fn set_credential(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CredentialRequest>,
) -> ApiResult<Value> {
    state
        .runner
        .set_credential(&session_id, &request.api_key)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(json!({
        "session_id": session_id,
        "credential_configured": true,
        "message": "API key saved"
    })))
}

async fn clear_credential(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Value> {
    state
        .runner
        .clear_credential(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(json!({
        "session_id": session_id,
        "credential_configured": false
    })))
}

/// Keeps the status axum assigns, so an oversized body is reported as 413.
fn multipart_error(message: &str, e: MultipartError) -> ApiError {
    let status = e.status();
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("Rejected upload over the size limit: {}", e);
    }
    status_error(status, message, &e.body_text())
}

struct UploadForm {
    images: Vec<UploadedImage>,
    params: PromptParams,
}

/// File fields become images; `modality` and `region` text fields parameterise the prompt.
async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, ApiError> {
    let mut images = Vec::new();
    let mut params = PromptParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("Invalid upload", e))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);

        match (name.as_str(), file_name) {
            (_, Some(file_name)) => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error("Invalid upload", e))?;
                images.push(UploadedImage::new(file_name, bytes.to_vec()));
            }
            ("modality", None) | ("region", None) => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| multipart_error("Invalid form field", e))?;
                let value = Some(value).filter(|v| !v.trim().is_empty());
                if name == "modality" {
                    params.modality = value;
                } else {
                    params.region = value;
                }
            }
            _ => {}
        }
    }

    Ok(UploadForm { images, params })
}

async fn preview_images(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<PreviewResponse> {
    state
        .runner
        .load(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    let form = read_upload_form(multipart).await?;
    info!(
        "Previewing {} upload(s) for session {}",
        form.images.len(),
        session_id
    );
    let images = state
        .runner
        .preview_images(form.images)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(PreviewResponse { session_id, images }))
}

async fn analyze_images(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<AnalysisResponse> {
    let form = read_upload_form(multipart).await?;
    info!(
        "Starting analysis of {} image(s) for session {}",
        form.images.len(),
        session_id
    );

    let outcome = state
        .runner
        .analyze(&session_id, form.images, form.params)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(AnalysisResponse {
        session_id,
        revision: outcome.revision,
        analysis: outcome.analysis,
        images: outcome.images,
        disclaimer: DISCLAIMER.to_string(),
    }))
}

async fn reset_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Value> {
    state
        .runner
        .reset(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(json!({ "session_id": session_id, "status": "reset" })))
}

async fn download_report(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .runner
        .export_report(&session_id)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    info!(
        "Serving {} ({} page(s)) for session {}",
        REPORT_FILE_NAME, report.page_count, session_id
    );

    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", REPORT_FILE_NAME),
            ),
        ],
        report.bytes,
    ))
}

async fn ask_follow_up(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> ApiResult<ChatResponse> {
    let outcome = state
        .runner
        .follow_up(&session_id, &request.question)
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(ChatResponse {
        session_id,
        question: outcome.question,
        answer: outcome.answer,
        analysis_revision: outcome.analysis_revision,
        transcript_len: outcome.transcript_len,
    }))
}

async fn get_transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TranscriptQuery>,
) -> ApiResult<TranscriptResponse> {
    let limit = query.last.unwrap_or(state.chat_history_limit);
    let entries = state
        .runner
        .transcript(&session_id, Some(limit))
        .await
        .map_err(|e| flow_error(&session_id, e))?;

    Ok(Json(TranscriptResponse {
        session_id,
        entries,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use diagnosis_flow::{AgentFactory, Credential, MedicalAgent};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const BOUNDARY: &str = "diagnosis-test-boundary";

    struct ScriptedAgent;

    #[async_trait]
    impl MedicalAgent for ScriptedAgent {
        async fn analyze(&self, _prompt: &str, images: &[PathBuf]) -> diagnosis_flow::Result<String> {
            Ok(format!(
                "### 1. Image Type & Region\n- Chest X-ray\n### 2. Key Findings\n- {} image(s) reviewed",
                images.len()
            ))
        }

        async fn follow_up(&self, _context: &str, question: &str) -> diagnosis_flow::Result<String> {
            if question.contains("fail") {
                return Err(FlowError::Agent("upstream timeout".to_string()));
            }
            Ok("Rest and follow up with your physician.".to_string())
        }
    }

    #[derive(Clone, Default)]
    struct ScriptedFactory {
        created: Arc<AtomicUsize>,
    }

    impl AgentFactory for ScriptedFactory {
        fn create(&self, _credential: &Credential) -> Arc<dyn MedicalAgent> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Arc::new(ScriptedAgent)
        }
    }

    fn test_app(temp_dir: &std::path::Path) -> (Router, ScriptedFactory) {
        test_app_with_limit(temp_dir, 5 * 1024 * 1024)
    }

    fn test_app_with_limit(
        temp_dir: &std::path::Path,
        max_upload_bytes: usize,
    ) -> (Router, ScriptedFactory) {
        let factory = ScriptedFactory::default();
        let runner = DiagnosisRunner::new(
            Arc::new(InMemorySessionStorage::new()),
            Arc::new(factory.clone()),
            RunnerSettings {
                temp_dir: temp_dir.to_path_buf(),
                ..RunnerSettings::default()
            },
        );
        let state = AppState {
            runner,
            chat_history_limit: 6,
        };
        (build_router(state, max_upload_bytes), factory)
    }

    fn png_bytes() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(32, 24, Rgb([10, 10, 10])));
        let mut buffer = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    fn multipart_body(file_name: &str, bytes: &[u8], modality: Option<&str>) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"images\"; filename=\"{}\"\r\nContent-Type: image/png\r\n\r\n",
                BOUNDARY, file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
        if let Some(modality) = modality {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"modality\"\r\n\r\n{}\r\n",
                    BOUNDARY, modality
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn send_json(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let (status, bytes) = send(app, request).await;
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn new_session(app: &Router) -> String {
        let (status, body) = send_json(app, empty_request("POST", "/sessions")).await;
        assert_eq!(status, StatusCode::OK);
        body["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn serves_ui_and_health() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());

        let (status, body) = send(&app, empty_request("GET", "/")).await;
        assert_eq!(status, StatusCode::OK);
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains("Medical Imaging Diagnosis"));
        assert!(page.contains("addEventListener(\"pagehide\""));
        assert!(page.contains("renderMarkdown($(\"analysis\"), data.analysis)"));

        let (status, body) = send_json(&app, empty_request("GET", "/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());
        let (status, body) = send_json(&app, empty_request("GET", "/sessions/missing")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["session_id"], "missing");
    }

    #[tokio::test]
    async fn analysis_requires_credential() {
        let dir = tempfile::tempdir().unwrap();
        let (app, factory) = test_app(dir.path());
        let id = new_session(&app).await;

        let request = multipart_request(
            &format!("/sessions/{}/analyze", id),
            multipart_body("chest.png", &png_bytes(), None),
        );
        let (status, _) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preview_returns_metadata_without_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (app, factory) = test_app(dir.path());
        let id = new_session(&app).await;

        let request = multipart_request(
            &format!("/sessions/{}/images", id),
            multipart_body("chest.png", &png_bytes(), None),
        );
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["images"][0]["metadata"]["format"], "PNG");
        assert_eq!(body["images"][0]["metadata"]["width"], 32);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);

        let request = multipart_request(
            &format!("/sessions/{}/images", id),
            multipart_body("notes.txt", b"hello", None),
        );
        let (status, _) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        let dir = tempfile::tempdir().unwrap();
        let (app, factory) = test_app_with_limit(dir.path(), 1024);
        let id = new_session(&app).await;

        let request = multipart_request(
            &format!("/sessions/{}/images", id),
            multipart_body("chest.png", &vec![7u8; 16 * 1024], None),
        );
        let (status, _) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn analyze_export_and_chat() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());
        let id = new_session(&app).await;

        let (status, _) = send_json(
            &app,
            json_request("PUT", &format!("/sessions/{}/credential", id), json!({"api_key": "sk-test"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send_json(
            &app,
            json_request("POST", &format!("/sessions/{}/chat", id), json!({"question": "Is it bad?"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT, "{}", body);

        let request = multipart_request(
            &format!("/sessions/{}/analyze", id),
            multipart_body("chest.png", &png_bytes(), Some("X-ray")),
        );
        let (status, body) = send_json(&app, request).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["revision"], 1);
        assert!(body["analysis"].as_str().unwrap().contains("1 image(s) reviewed"));
        assert_eq!(body["disclaimer"], DISCLAIMER);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let response = app
            .clone()
            .oneshot(empty_request("GET", &format!("/sessions/{}/report.pdf", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"diagnosis_report.pdf\""
        );
        let pdf = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(pdf.starts_with(b"%PDF"));

        let (status, body) = send_json(
            &app,
            json_request("POST", &format!("/sessions/{}/chat", id), json!({"question": "What now?"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["transcript_len"], 2);
        assert_eq!(body["analysis_revision"], 1);

        let (status, _) = send_json(
            &app,
            json_request("POST", &format!("/sessions/{}/chat", id), json!({"question": "please fail"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);

        let (status, body) =
            send_json(&app, empty_request("GET", &format!("/sessions/{}/chat?last=1", id))).await;
        assert_eq!(status, StatusCode::OK);
        let entries = body["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["speaker"], "assistant");

        let (_, body) = send_json(&app, empty_request("GET", &format!("/sessions/{}", id))).await;
        assert_eq!(body["transcript"].as_array().unwrap().len(), 2);
        assert_eq!(body["credential_configured"], true);
    }

    #[tokio::test]
    async fn reset_and_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let (app, _) = test_app(dir.path());
        let id = new_session(&app).await;

        let (status, _) =
            send_json(&app, empty_request("DELETE", &format!("/sessions/{}/credential", id))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            send_json(&app, empty_request("POST", &format!("/sessions/{}/reset", id))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            send_json(&app, empty_request("GET", &format!("/sessions/{}/report.pdf", id))).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send_json(&app, empty_request("DELETE", &format!("/sessions/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send_json(&app, empty_request("GET", &format!("/sessions/{}", id))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
