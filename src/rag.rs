//! Recuperación y construcción del prompt.
//!
//! Flujo de una consulta:
//!   1. Embedding de la pregunta (lote de un solo elemento).
//!   2. Búsqueda de los `top_k` chunks más cercanos en el índice vectorial.
//!   3. Contexto = textos de los chunks en orden de ranking, separados por `---`.
//!   4. Prompt que obliga a responder sólo con ese contexto.
//!   5. Apertura del stream de generación.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::{
    config::AppConfig,
    error::{RagError, RagResult, UpstreamError},
    llm::{ByteStream, Embedder, Generator},
    models::RetrievedChunk,
    vector_store::VectorIndex,
};

pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";
pub const UNKNOWN_ANSWER: &str = "I don't know.";

/// Parámetros del ciclo de consulta.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub default_top_k: usize,
    pub max_top_k: usize,
    pub stream_idle_timeout: Option<Duration>,
}

impl QuerySettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            default_top_k: cfg.default_top_k,
            max_top_k: cfg.max_top_k,
            stream_idle_timeout: cfg.stream_idle_timeout,
        }
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_top_k: 3,
            max_top_k: 20,
            stream_idle_timeout: None,
        }
    }
}

/// Servicios que usa cada ciclo de consulta. Se clona por conexión.
#[derive(Clone)]
pub struct RagPipeline {
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub generator: Arc<dyn Generator>,
    pub settings: QuerySettings,
}

impl RagPipeline {
    /// Embedding de la pregunta + búsqueda vectorial.
    pub async fn retrieve(&self, question: &str, top_k: usize) -> RagResult<Vec<RetrievedChunk>> {
        let mut vectors = self.embedder.embed(&[question.to_string()]).await?;
        let query_vec = vectors.pop().ok_or_else(|| {
            RagError::EmbeddingService("No se pudo generar embedding de la query".into())
        })?;

        let results = self.index.query(&query_vec, top_k).await?;
        debug!(top_k, hits = results.len(), "Chunks recuperados");
        Ok(results)
    }

    pub async fn open_generation(&self, prompt: &str) -> Result<ByteStream, UpstreamError> {
        self.generator.open_stream(prompt).await
    }
}

pub fn build_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer using ONLY the provided context. \
         If the answer is not in the context, respond '{UNKNOWN_ANSWER}'\n\n\
         Context:\n{context}\n\n\
         Question: {question}\n\n\
         Answer:"
    )
}
