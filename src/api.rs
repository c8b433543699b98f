use axum::{
    extract::{
        multipart::MultipartError, ws::WebSocketUpgrade, DefaultBodyLimit, Json, Multipart,
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::{
    app_state::AppState,
    auth::AuthOutcome,
    ingest::{IngestError, PdfUpload},
    session,
};

/// `?token=` para clientes WebSocket que no pueden fijar cabeceras.
#[derive(Debug, Deserialize)]
pub struct WsAuthParams {
    token: Option<String>,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let body_limit = app_state.config.max_upload_bytes;
    Router::new()
        .route("/api/v1/ws/chat", get(ws_chat_handler))
        .route("/api/v1/ws/chat/", get(ws_chat_handler))
        .route("/api/v1/pdfs/upload", post(upload_pdf_handler))
        .route("/api/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(app_state)
}

// --- Handlers ---

/// Autentica antes del upgrade; la sesión decide si acepta o cierra con 4001.
#[axum::debug_handler]
async fn ws_chat_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Option<Query<WsAuthParams>>,
    ws: WebSocketUpgrade,
) -> Response {
    let outcome = state
        .authenticator
        .authenticate(&headers, query_token(&params))
        .await;
    let pipeline = state.pipeline.clone();

    ws.on_upgrade(move |socket| async move {
        let (outbound, inbound) = socket.split();
        session::run_session(inbound, outbound, outcome, pipeline).await;
    })
}

fn query_token(params: &Option<Query<WsAuthParams>>) -> Option<&str> {
    params.as_ref().and_then(|Query(p)| p.token.as_deref())
}

#[axum::debug_handler]
async fn upload_pdf_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<serde_json::Value>, IngestError> {
    let owner = match state.authenticator.authenticate(&headers, None).await {
        AuthOutcome::Authenticated(identity) => identity,
        AuthOutcome::Anonymous(_) => return Err(IngestError::Unauthenticated),
    };

    let upload = read_upload(multipart).await?;
    info!(
        owner = %owner.id,
        file_name = ?upload.file_name,
        bytes = upload.bytes.len(),
        "Subida de PDF recibida"
    );

    let report = state
        .ingestor
        .ingest_pdf(&owner, upload)
        .await
        .inspect_err(|e| {
            if let IngestError::Processing { .. } = e {
                error!("Error procesando el PDF subido: {e}");
            }
        })?;

    Ok(Json(json!({
        "success": true,
        "message": "PDF uploaded and indexed successfully",
        "data": report,
    })))
}

async fn read_upload(mut multipart: Multipart) -> Result<PdfUpload, IngestError> {
    let invalid = |e: MultipartError| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            IngestError::PayloadTooLarge
        } else {
            IngestError::field("file", &format!("Invalid upload: {}", e.body_text()))
        }
    };

    let mut upload = PdfUpload::default();
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                upload.file_name = field.file_name().map(str::to_string);
                upload.bytes = field.bytes().await.map_err(invalid)?.to_vec();
            }
            Some("title") => upload.title = Some(field.text().await.map_err(invalid)?),
            _ => {}
        }
    }
    Ok(upload)
}

#[axum::debug_handler]
async fn health_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.ping().await {
        Ok(()) => Ok(Json(json!({ "status": "ok" }))),
        Err(e) => {
            error!("Error en el health check de Neo4j: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Authenticator;
    use crate::config::AppConfig;
    use crate::ingest::Ingestor;
    use crate::models::Identity;
    use crate::neo4j_client::Neo4jStore;
    use crate::testing::{
        pipeline_with, sign_token, FakeEmbedder, FakeExtractor, InMemoryIndex, InMemoryRegistry,
        ScriptedGenerator, StaticDirectory,
    };
    use axum::body::Body;
    use axum::extract::{FromRequest, Request};
    use axum::http::{header, HeaderValue};
    use axum::response::IntoResponse;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;

    const SECRET: &str = "api-secret";
    const BOUNDARY: &str = "XBOUNDARYX";

    fn config() -> AppConfig {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("NEO4J_URI", "neo4j://localhost:7687"),
            ("NEO4J_USER", "neo4j"),
            ("NEO4J_PASSWORD", "secret"),
            ("OPENAI_API_KEY", "sk-test"),
            ("JWT_SECRET", SECRET),
        ]);
        AppConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    fn state(registry: Arc<InMemoryRegistry>, extracted: &str) -> AppState {
        let cfg = config();
        let embedder = Arc::new(FakeEmbedder::default());
        let index = Arc::new(InMemoryIndex::default());
        AppState {
            config: Arc::new(cfg.clone()),
            store: Arc::new(Neo4jStore::new(&cfg)),
            authenticator: Authenticator::new(
                SECRET,
                Arc::new(StaticDirectory::with_user("42", "ana")),
            ),
            pipeline: pipeline_with(
                embedder.clone(),
                index.clone(),
                Arc::new(ScriptedGenerator::empty()),
            ),
            ingestor: Ingestor {
                embedder,
                index,
                documents: registry,
                extractor: Arc::new(FakeExtractor::new(Ok(extracted.to_string()))),
                chunk_size: 2,
                upload_dir: None,
            },
        }
    }

    fn bearer_headers() -> HeaderMap {
        let token = sign_token(
            SECRET,
            &json!({"user_id": 42, "exp": chrono::Utc::now().timestamp() + 600}),
        );
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    /// Cuerpo multipart con partes `(nombre, fichero, contenido)`.
    async fn multipart(parts: &[(&str, Option<&str>, &[u8])]) -> Multipart {
        let mut body = Vec::new();
        for (name, file_name, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match file_name {
                Some(f) => format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{f}\"\r\n"),
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n"),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(b"\r\n");
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/pdfs/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        Multipart::from_request(req, &()).await.unwrap()
    }

    async fn into_parts(result: Result<Json<Value>, IngestError>) -> (StatusCode, Value) {
        let resp = result.into_response();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn read_upload_maps_file_and_title_fields() {
        let form = multipart(&[
            ("title", None, b"Manual de usuario".as_slice()),
            ("file", Some("manual.pdf"), b"%PDF-1.4".as_slice()),
            ("otro", None, b"ignorado".as_slice()),
        ])
        .await;
        let upload = read_upload(form).await.unwrap();
        assert_eq!(upload.file_name.as_deref(), Some("manual.pdf"));
        assert_eq!(upload.bytes, b"%PDF-1.4");
        assert_eq!(upload.title.as_deref(), Some("Manual de usuario"));
    }

    #[tokio::test]
    async fn oversized_upload_is_413() {
        // Sin DefaultBodyLimit explícito, axum aplica 2 MB.
        let big = vec![b'a'; 3 * 1024 * 1024];
        let form = multipart(&[("file", Some("grande.pdf"), big.as_slice())]).await;
        let err = read_upload(form).await.unwrap_err();
        assert!(matches!(err, IngestError::PayloadTooLarge));
        assert_eq!(err.into_response().status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn anonymous_upload_is_401() {
        let registry = Arc::new(InMemoryRegistry::default());
        let form = multipart(&[("file", Some("manual.pdf"), b"%PDF".as_slice())]).await;
        let result =
            upload_pdf_handler(State(state(registry.clone(), "a b")), HeaderMap::new(), form).await;

        let (status, body) = into_parts(result).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Authentication required");
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn non_pdf_upload_is_400_naming_file_field() {
        let registry = Arc::new(InMemoryRegistry::default());
        let form = multipart(&[("file", Some("notes.txt"), b"hola".as_slice())]).await;
        let result =
            upload_pdf_handler(State(state(registry.clone(), "a b")), bearer_headers(), form).await;

        let (status, body) = into_parts(result).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"error": "Invalid data", "details": {"file": ["Only PDF files are allowed."]}})
        );
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn pdf_upload_returns_success_envelope() {
        let registry = Arc::new(InMemoryRegistry::default());
        let form = multipart(&[
            ("file", Some("manual.pdf"), b"%PDF".as_slice()),
            ("title", None, b"Manual".as_slice()),
        ])
        .await;
        let result =
            upload_pdf_handler(State(state(registry.clone(), "a b c d e")), bearer_headers(), form)
                .await;

        let (status, body) = into_parts(result).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["message"], "PDF uploaded and indexed successfully");
        assert_eq!(body["data"]["chunks_count"], 3);
        let pdf_id = body["data"]["pdf_id"].as_str().unwrap();
        assert!(registry.is_indexed(pdf_id));
    }

    #[tokio::test]
    async fn ws_token_is_read_from_query_string() {
        let uri = "/api/v1/ws/chat?token=abc".parse().unwrap();
        let params = Some(Query::<WsAuthParams>::try_from_uri(&uri).unwrap());
        assert_eq!(query_token(&params), Some("abc"));
        assert_eq!(query_token(&None), None);

        let token = sign_token(
            SECRET,
            &json!({"user_id": "42", "exp": chrono::Utc::now().timestamp() + 600}),
        );
        let uri = format!("/api/v1/ws/chat?token={token}").parse().unwrap();
        let params = Some(Query::<WsAuthParams>::try_from_uri(&uri).unwrap());
        let auth = state(Arc::new(InMemoryRegistry::default()), "").authenticator;
        assert_eq!(
            auth.authenticate(&HeaderMap::new(), query_token(&params)).await,
            AuthOutcome::Authenticated(Identity {
                id: "42".into(),
                username: "ana".into()
            })
        );
    }
}
