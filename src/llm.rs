//! Acceso a los servicios de IA: embeddings (vía Rig) y generación en
//! streaming contra un endpoint `/chat/completions` compatible con OpenAI.

use std::time::Instant;

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use rig::client::EmbeddingsClient as _;
use rig::embeddings::EmbeddingModel as _;
use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
use serde_json::json;
use tracing::{debug, error, info};

use crate::{
    config::AppConfig,
    error::{make_snippet, RagError, RagResult, UpstreamError},
};

const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

/// Bytes crudos del cuerpo de la respuesta en streaming.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, UpstreamError>>;

/// Servicio de embeddings: un lote de textos, un vector por texto y en orden.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>>;
}

/// Servicio de generación con salida incremental.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Abre la petición. Un estado no-2xx se devuelve como
    /// [`UpstreamError::Status`] antes de leer ningún byte del cuerpo.
    async fn open_stream(&self, prompt: &str) -> Result<ByteStream, UpstreamError>;
}

/// Gestor de LLMs y embeddings.
///
/// Embeddings y generación comparten la misma clave y la misma URL base.
#[derive(Clone)]
pub struct LlmManager {
    pub embedding_model: String,
    pub chat_model: String,
    embeddings: openai::EmbeddingModel,
    chat_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl LlmManager {
    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        // Sin timeout global: el stream dura lo que tarde el modelo.
        let http = reqwest::Client::builder().build()?;
        let chat_url = format!("{}/chat/completions", cfg.openai_base_url);

        let embedding_model = if cfg.llm_embedding_model.is_empty() {
            TEXT_EMBEDDING_3_SMALL.to_string()
        } else {
            cfg.llm_embedding_model.clone()
        };
        let client = openai::Client::builder(&cfg.openai_api_key)
            .base_url(&cfg.openai_base_url)
            .build();
        let embeddings =
            client.embedding_model_with_ndims(&embedding_model, cfg.embedding_dimensions);

        info!(
            %embedding_model,
            chat_model = %cfg.llm_chat_model,
            %chat_url,
            "LlmManager inicializado"
        );

        Ok(Self {
            embedding_model,
            chat_model: cfg.llm_chat_model.clone(),
            embeddings,
            chat_url,
            api_key: cfg.openai_api_key.clone(),
            http,
        })
    }

    fn chat_model_name(&self) -> &str {
        if self.chat_model.is_empty() {
            DEFAULT_CHAT_MODEL
        } else {
            self.chat_model.as_str()
        }
    }
}

#[async_trait]
impl Embedder for LlmManager {
    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        // Una única llamada para todo el lote; los reintentos son cosa del llamante.
        let embeddings = self
            .embeddings
            .embed_texts(texts.to_vec())
            .await
            .map_err(|e| RagError::EmbeddingService(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(RagError::EmbeddingService(format!(
                "Número de embeddings ({}) distinto al número de textos ({})",
                embeddings.len(),
                texts.len()
            )));
        }

        debug!(
            batch = texts.len(),
            model = %self.embedding_model,
            latency_ms = started.elapsed().as_millis(),
            "Embeddings generados"
        );
        Ok(embeddings.into_iter().map(|e| e.vec).collect())
    }
}

#[async_trait]
impl Generator for LlmManager {
    async fn open_stream(&self, prompt: &str) -> Result<ByteStream, UpstreamError> {
        let body = json!({
            "model": self.chat_model_name(),
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
        });

        debug!(
            model = %self.chat_model_name(),
            prompt_len = prompt.len(),
            "POST {}", self.chat_url
        );

        let resp = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let snippet = make_snippet(&text);
            error!(
                %status,
                url = %self.chat_url,
                %snippet,
                "El servicio de generación devolvió un estado no exitoso"
            );
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                snippet,
            });
        }

        let stream = resp
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(UpstreamError::from);
        Ok(stream.boxed())
    }
}
