use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Form, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::SearchError;
use crate::models::{HealthResponse, SearchRequest, SearchResponse, SpeechRequest};
use crate::search::SearchService;
use crate::tts::TtsClient;
use crate::voice::QueryListener;

#[derive(Clone)]
pub struct AppState {
    search: SearchService,
    listener: Arc<dyn QueryListener>,
    tts: Option<TtsClient>,
    health: HealthResponse,
}

impl AppState {
    pub fn new(
        search: SearchService,
        listener: Arc<dyn QueryListener>,
        tts: Option<TtsClient>,
        health: HealthResponse,
    ) -> Self {
        Self {
            search,
            listener,
            tts,
            health,
        }
    }

    pub fn health(&self) -> &HealthResponse {
        &self.health
    }
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/search/", post(search_handler))
        .route("/voice_search/", post(voice_search_handler))
        .route("/speech/", post(speech_handler))
        .route("/health", get(health_handler))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub async fn run_server(config: &AppConfig, state: AppState) -> Result<()> {
    let app = router(state, &config.cors_origins);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn search_handler(
    State(state): State<AppState>,
    Form(request): Form<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    tracing::info!("search query: {:?}", request.text_query);
    let outcome = state
        .search
        .search(&request.text_query, state.search.default_k())
        .await?;
    Ok(Json(outcome.into()))
}

async fn voice_search_handler(
    State(state): State<AppState>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = state.listener.listen_for_query().await;
    if query.is_empty() {
        tracing::info!("voice search heard nothing; returning no results");
        return Ok(Json(SearchResponse::default()));
    }

    tracing::info!("voice search query: {:?}", query);
    let outcome = state
        .search
        .search(&query, state.search.default_k())
        .await?;
    Ok(Json(outcome.into()))
}

async fn speech_handler(
    State(state): State<AppState>,
    Form(request): Form<SpeechRequest>,
) -> Result<Response, ApiError> {
    let Some(tts) = state.tts.as_ref() else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "text-to-speech is not configured",
        ));
    };

    if request.text.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "text must not be empty",
        ));
    }

    let audio = tts.synthesize(&request.text).await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response())
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.health.clone())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<SearchError> for ApiError {
    fn from(value: SearchError) -> Self {
        let status = match value {
            SearchError::EmptyQuery => StatusCode::UNPROCESSABLE_ENTITY,
            SearchError::NotInitialized | SearchError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("{}", value);
        }
        Self::new(status, value.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        tracing::error!("{:#}", value);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{value:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::config::TtsConfig;
    use crate::search::tests::FixedRetriever;

    struct FixedListener(&'static str);

    #[async_trait]
    impl QueryListener for FixedListener {
        async fn listen_for_query(&self) -> String {
            self.0.to_string()
        }
    }

    fn origins() -> Vec<String> {
        vec![
            "http://localhost:3000".to_string(),
            "http://localhost".to_string(),
        ]
    }

    fn health(loaded: bool) -> HealthResponse {
        HealthResponse {
            retrieval_model: loaded,
            vector_store: loaded,
            transcription_model: false,
        }
    }

    fn app_with(
        retriever: Option<Arc<FixedRetriever>>,
        heard: &'static str,
        tts: Option<TtsClient>,
    ) -> Router {
        let loaded = retriever.is_some();
        let search = SearchService::new(
            retriever.map(|r| r as Arc<dyn crate::search::PageRetriever>),
            3,
        );
        let state = AppState::new(search, Arc::new(FixedListener(heard)), tts, health(loaded));
        router(state, &origins())
    }

    fn form_post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn text_search_returns_at_most_three_images() {
        let app = app_with(Some(Arc::new(FixedRetriever::new(10))), "", None);

        let response = app
            .oneshot(form_post("/search/", "text_query=fashion"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let images = body["image_base64_list"].as_array().unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(images[0], "fashion-0");
    }

    #[tokio::test]
    async fn text_search_without_model_is_500_with_detail() {
        let app = app_with(None, "", None);

        let response = app
            .oneshot(form_post("/search/", "text_query=fashion"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = json_body(response).await;
        assert_eq!(
            body["detail"],
            "RAG model or vector store not loaded. Check server logs."
        );
    }

    #[tokio::test]
    async fn invalid_search_forms_are_422() {
        let app = app_with(Some(Arc::new(FixedRetriever::new(3))), "", None);

        let missing = app
            .clone()
            .oneshot(form_post("/search/", "other=1"))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let blank = app
            .oneshot(form_post("/search/", "text_query=+++"))
            .await
            .unwrap();
        assert_eq!(blank.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(blank).await["detail"], "text_query must not be empty");
    }

    #[tokio::test]
    async fn silent_voice_query_skips_search() {
        let retriever = Arc::new(FixedRetriever::new(3));
        let app = app_with(Some(retriever.clone()), "", None);

        let response = app
            .oneshot(form_post("/voice_search/", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body, serde_json::json!({ "image_base64_list": [] }));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spoken_query_is_searched() {
        let retriever = Arc::new(FixedRetriever::new(2));
        let app = app_with(Some(retriever.clone()), "test_query", None);

        let response = app
            .oneshot(form_post("/voice_search/", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        let images = body["image_base64_list"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1], "test_query-1");
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cors_preflight_mirrors_allowed_origin() {
        let app = app_with(None, "", None);

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/search/")
            .header(header::ORIGIN, "http://localhost:3000")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(preflight).await.unwrap();

        let headers = response.headers();
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:3000"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], "POST");

        let foreign = Request::builder()
            .method("OPTIONS")
            .uri("/search/")
            .header(header::ORIGIN, "http://evil.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(foreign).await.unwrap();
        assert!(response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .is_none());
    }

    #[tokio::test]
    async fn speech_without_key_is_503() {
        let app = app_with(None, "", None);

        let response = app
            .oneshot(form_post("/speech/", "text=hello"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            json_body(response).await["detail"],
            "text-to-speech is not configured"
        );
    }

    #[tokio::test]
    async fn speech_returns_mpeg_audio() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/audio/speech")
            .with_header("content-type", "audio/mpeg")
            .with_body([0xFFu8, 0xFB, 0x90])
            .create_async()
            .await;

        let tts = TtsClient::from_config(
            &TtsConfig {
                base_url: server.url(),
                api_key: Some("sk-test".to_string()),
                model: "tts-1".to_string(),
                voice: "alloy".to_string(),
            },
            Duration::from_secs(5),
        )
        .unwrap();
        let app = app_with(None, "", tts);

        let response = app
            .oneshot(form_post("/speech/", "text=three+results"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "audio/mpeg");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.as_ref(), &[0xFF, 0xFB, 0x90]);
    }

    #[tokio::test]
    async fn health_reports_loaded_handles() {
        let app = app_with(Some(Arc::new(FixedRetriever::new(1))), "", None);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({
                "retrieval_model": true,
                "vector_store": true,
                "transcription_model": false
            })
        );
    }
}
