//! Ingesta de un PDF subido: validación, extracción de texto, chunking,
//! embeddings en un único lote e inserción en el índice vectorial.
//!
//! El documento sólo se marca como indexado cuando todos los chunks se han
//! insertado; cualquier fallo intermedio lo deja sin indexar.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    error::{RagError, RagResult},
    llm::Embedder,
    models::{ChunkMetadata, Identity, NewDocument},
    vector_store::VectorIndex,
};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
const MAX_TITLE_CHARS: usize = 75;

/// Persistencia de los metadatos de los documentos subidos.
#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    /// Crea el registro (sin indexar) y devuelve su id.
    async fn create(&self, doc: &NewDocument) -> RagResult<String>;
    async fn mark_indexed(&self, document_id: &str) -> RagResult<()>;
}

/// Extracción del texto plano de un PDF.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract_text(&self, bytes: Vec<u8>) -> RagResult<String>;
}

/// Extractor basado en `pdf-extract`, ejecutado en un hilo bloqueante.
pub struct PdfExtractor;

#[async_trait]
impl TextExtractor for PdfExtractor {
    async fn extract_text(&self, bytes: Vec<u8>) -> RagResult<String> {
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes))
            .await
            .map_err(|e| RagError::Internal(format!("La extracción del PDF abortó: {e}")))?
            .map_err(|e| RagError::Internal(format!("No se pudo extraer texto del PDF: {e}")))
    }
}

/// Fichero recibido en el formulario multipart.
#[derive(Debug, Clone, Default)]
pub struct PdfUpload {
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub pdf_id: String,
    pub chunks_count: usize,
}

/// Errores por campo, al estilo `{"file": ["..."]}`.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("se requiere autenticación")]
    Unauthenticated,

    #[error("datos inválidos: {0:?}")]
    Validation(FieldErrors),

    #[error("el PDF no contiene texto")]
    EmptyDocument,

    #[error("el fichero supera el tamaño máximo permitido")]
    PayloadTooLarge,

    #[error("fallo procesando el documento {document_id}: {source}")]
    Processing {
        document_id: String,
        #[source]
        source: RagError,
    },
}

impl IngestError {
    pub fn field(field: &str, message: &str) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.to_string()]);
        IngestError::Validation(errors)
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            IngestError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "Authentication required",
                    "details": "A valid bearer token is required to upload documents"
                }),
            ),
            IngestError::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "Invalid data", "details": fields }),
            ),
            IngestError::EmptyDocument => (
                StatusCode::BAD_REQUEST,
                json!({
                    "error": "The uploaded PDF is empty",
                    "details": "No text content found in the PDF file"
                }),
            ),
            IngestError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                json!({
                    "error": "File too large",
                    "details": "The uploaded file exceeds the maximum allowed size"
                }),
            ),
            IngestError::Processing { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Internal server error",
                    "details": "Failed to process the PDF file"
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

/// Trocea el texto en grupos de `chunk_size` palabras, unidas por un espacio.
/// El último chunk puede ser más corto; un texto vacío no produce chunks.
pub fn chunk_text(text: &str, chunk_size: usize) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    words
        .chunks(chunk_size.max(1))
        .map(|group| group.join(" "))
        .collect()
}

/// Valida el formulario antes de hacer ningún trabajo.
pub fn validate_upload(upload: &PdfUpload) -> Result<String, IngestError> {
    let mut errors = FieldErrors::new();

    let file_name = match upload.file_name.as_deref().map(base_name) {
        None | Some("") => Err("No file was submitted."),
        Some(name) if !name.ends_with(".pdf") => Err("Only PDF files are allowed."),
        Some(_) if upload.bytes.is_empty() => Err("The submitted file is empty."),
        Some(name) => Ok(name.to_string()),
    };
    if let Err(message) = &file_name {
        errors.insert("file".into(), vec![message.to_string()]);
    }

    if let Some(title) = &upload.title {
        if title.chars().count() > MAX_TITLE_CHARS {
            errors.insert(
                "title".into(),
                vec![format!(
                    "Ensure this field has no more than {MAX_TITLE_CHARS} characters."
                )],
            );
        }
    }

    match file_name {
        Ok(name) if errors.is_empty() => Ok(name),
        _ => Err(IngestError::Validation(errors)),
    }
}

fn base_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
}

#[derive(Clone)]
pub struct Ingestor {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub documents: Arc<dyn DocumentRegistry>,
    pub extractor: Arc<dyn TextExtractor>,
    pub chunk_size: usize,
    /// Directorio donde guardar el PDF original; `None` no lo guarda.
    pub upload_dir: Option<PathBuf>,
}

impl Ingestor {
    pub async fn ingest_pdf(
        &self,
        owner: &Identity,
        upload: PdfUpload,
    ) -> Result<IngestReport, IngestError> {
        let file_name = validate_upload(&upload)?;
        let title = upload.title.clone().unwrap_or_default();

        let document_id = self
            .documents
            .create(&NewDocument {
                title,
                file_name: file_name.clone(),
                owner_id: owner.id.clone(),
            })
            .await
            .map_err(|source| IngestError::Processing {
                document_id: "-".into(),
                source,
            })?;

        let processing = |source: RagError| IngestError::Processing {
            document_id: document_id.clone(),
            source,
        };

        if let Some(dir) = &self.upload_dir {
            store_upload(dir, &document_id, &file_name, &upload.bytes)
                .await
                .map_err(processing)?;
        }

        let text = self
            .extractor
            .extract_text(upload.bytes)
            .await
            .map_err(processing)?;

        if text.trim().is_empty() {
            warn!(%document_id, %file_name, "PDF sin texto extraíble");
            return Err(IngestError::EmptyDocument);
        }

        let chunks = chunk_text(&text, self.chunk_size);
        let vectors = self.embedder.embed(&chunks).await.map_err(processing)?;
        if vectors.len() != chunks.len() {
            return Err(processing(RagError::EmbeddingService(format!(
                "Se esperaban {} embeddings y llegaron {}",
                chunks.len(),
                vectors.len()
            ))));
        }

        for (i, (chunk, vector)) in chunks.iter().zip(vectors.iter()).enumerate() {
            let metadata = ChunkMetadata {
                pdf_name: file_name.clone(),
                chunk_index: i as i64,
            };
            self.index
                .upsert(&format!("{document_id}_{i}"), vector, chunk, &metadata)
                .await
                .map_err(processing)?;
        }

        self.documents
            .mark_indexed(&document_id)
            .await
            .map_err(processing)?;

        info!(
            %document_id,
            %file_name,
            owner = %owner.id,
            chunks = chunks.len(),
            "PDF ingerido e indexado"
        );
        Ok(IngestReport {
            pdf_id: document_id,
            chunks_count: chunks.len(),
        })
    }
}

async fn store_upload(dir: &Path, document_id: &str, file_name: &str, bytes: &[u8]) -> RagResult<()> {
    let target_dir = dir.join("documents").join("pdfs");
    tokio::fs::create_dir_all(&target_dir)
        .await
        .map_err(|e| RagError::Internal(format!("No se pudo crear {}: {e}", target_dir.display())))?;
    let path = target_dir.join(format!("{document_id}_{file_name}"));
    tokio::fs::write(&path, bytes).await.map_err(|e| {
        error!(path = %path.display(), "Error guardando el PDF: {e}");
        RagError::Internal(format!("No se pudo guardar {}: {e}", path.display()))
    })
}
