//! Dobles de prueba en memoria para los servicios externos.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use futures::{Stream, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use crate::{
    auth::IdentityResolver,
    error::{RagError, RagResult, UpstreamError},
    ingest::{DocumentRegistry, TextExtractor},
    llm::{ByteStream, Embedder, Generator},
    models::{ChunkMetadata, Identity, NewDocument, RetrievedChunk},
    rag::{QuerySettings, RagPipeline},
    vector_store::VectorIndex,
};

const FAKE_DIMENSIONS: usize = 32;

/// Firma un JWT HS256 con los claims dados.
pub fn sign_token(secret: impl AsRef<[u8]>, claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(json!({"alg": "HS256", "typ": "JWT"}).to_string());
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_ref()).unwrap();
    mac.update(format!("{header}.{payload}").as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{header}.{payload}.{signature}")
}

/// Línea SSE con un fragmento de texto en formato chat-completions.
pub fn sse_delta(text: &str) -> String {
    format!(
        "data: {}\n",
        json!({"choices": [{"delta": {"content": text}}]})
    )
}

pub fn pipeline_with(
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
) -> RagPipeline {
    RagPipeline {
        embedder,
        index,
        generator,
        settings: QuerySettings::default(),
    }
}

// ---------------------------------------------------------------------------
// Usuarios

#[derive(Default)]
pub struct StaticDirectory {
    users: HashMap<String, String>,
    failing: bool,
}

impl StaticDirectory {
    pub fn with_user(id: &str, username: &str) -> Self {
        let mut users = HashMap::new();
        users.insert(id.to_string(), username.to_string());
        Self {
            users,
            failing: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            users: HashMap::new(),
            failing: true,
        }
    }
}

#[async_trait]
impl IdentityResolver for StaticDirectory {
    async fn resolve(&self, user_id: &str) -> RagResult<Option<Identity>> {
        if self.failing {
            return Err(RagError::IndexUnavailable("directorio caído".into()));
        }
        Ok(self.users.get(user_id).map(|username| Identity {
            id: user_id.to_string(),
            username: username.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Embeddings

/// Embeddings deterministas: bolsa de palabras sobre unas pocas dimensiones.
#[derive(Default)]
pub struct FakeEmbedder {
    calls: Mutex<Vec<Vec<String>>>,
    failure: Mutex<Option<String>>,
}

impl FakeEmbedder {
    pub fn vector_for(&self, text: &str) -> Vec<f64> {
        let mut v = vec![0.0; FAKE_DIMENSIONS];
        for word in text.split_whitespace() {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
            v[bucket % FAKE_DIMENSIONS] += 1.0;
        }
        v
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> RagResult<Vec<Vec<f64>>> {
        self.calls.lock().unwrap().push(texts.to_vec());
        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(RagError::EmbeddingService(message));
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

// ---------------------------------------------------------------------------
// Índice vectorial

struct StoredChunk {
    id: String,
    vector: Vec<f64>,
    text: String,
    metadata: ChunkMetadata,
}

/// Índice en memoria con similitud coseno. Conserva el orden de inserción.
#[derive(Default)]
pub struct InMemoryIndex {
    chunks: Mutex<Vec<StoredChunk>>,
    upserts_left: Mutex<Option<usize>>,
    queries_fail: AtomicBool,
}

impl InMemoryIndex {
    pub fn ids(&self) -> Vec<String> {
        self.chunks.lock().unwrap().iter().map(|c| c.id.clone()).collect()
    }

    pub fn metadata(&self, id: &str) -> Option<ChunkMetadata> {
        self.chunks
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.metadata.clone())
    }

    /// Tras `n` inserciones correctas, las siguientes fallan.
    pub fn fail_upserts_after(&self, n: usize) {
        *self.upserts_left.lock().unwrap() = Some(n);
    }

    pub fn fail_queries(&self) {
        self.queries_fail.store(true, Ordering::SeqCst);
    }
}

fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        text: &str,
        metadata: &ChunkMetadata,
    ) -> RagResult<()> {
        if let Some(left) = self.upserts_left.lock().unwrap().as_mut() {
            if *left == 0 {
                return Err(RagError::IndexUnavailable("índice caído".into()));
            }
            *left -= 1;
        }

        let stored = StoredChunk {
            id: id.to_string(),
            vector: vector.to_vec(),
            text: text.to_string(),
            metadata: metadata.clone(),
        };
        let mut chunks = self.chunks.lock().unwrap();
        match chunks.iter_mut().find(|c| c.id == id) {
            Some(existing) => *existing = stored,
            None => chunks.push(stored),
        }
        Ok(())
    }

    async fn query(&self, vector: &[f64], top_k: usize) -> RagResult<Vec<RetrievedChunk>> {
        if self.queries_fail.load(Ordering::SeqCst) {
            return Err(RagError::IndexUnavailable("índice caído".into()));
        }
        let chunks = self.chunks.lock().unwrap();
        let mut scored: Vec<(f64, &StoredChunk)> =
            chunks.iter().map(|c| (cosine(vector, &c.vector), c)).collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, c)| RetrievedChunk {
                text: c.text.clone(),
                metadata: c.metadata.clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Generación

/// Respuesta preparada para una llamada a `open_stream`.
pub enum Script {
    /// Cuerpo 2xx entregado en estos fragmentos.
    Chunks(Vec<Result<Vec<u8>, UpstreamError>>),
    /// Estado no-2xx.
    Status(u16),
    /// Fallo antes de recibir la respuesta.
    ConnectError,
    /// Cuerpo 2xx que nunca entrega datos.
    Hang,
}

/// Generador que responde con guiones en orden de llamada.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    prompts: Mutex<Vec<String>>,
    hang_started: Arc<AtomicBool>,
    hang_dropped: Arc<AtomicBool>,
}

impl ScriptedGenerator {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn hang_started(&self) -> bool {
        self.hang_started.load(Ordering::SeqCst)
    }

    /// `true` cuando el stream colgado ha sido descartado.
    pub fn hang_dropped(&self) -> bool {
        self.hang_dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn open_stream(&self, prompt: &str) -> Result<ByteStream, UpstreamError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Chunks(parts)) => Ok(futures::stream::iter(parts).boxed()),
            Some(Script::Status(status)) => Err(UpstreamError::Status {
                status,
                snippet: "upstream failure".into(),
            }),
            Some(Script::ConnectError) | None => {
                Err(UpstreamError::Transport("conexión rechazada".into()))
            }
            Some(Script::Hang) => {
                self.hang_started.store(true, Ordering::SeqCst);
                Ok(HangingStream {
                    dropped: self.hang_dropped.clone(),
                }
                .boxed())
            }
        }
    }
}

struct HangingStream {
    dropped: Arc<AtomicBool>,
}

impl Stream for HangingStream {
    type Item = Result<Vec<u8>, UpstreamError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Pending
    }
}

impl Drop for HangingStream {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Ingesta

/// Registro de documentos: id → indexado.
#[derive(Default)]
pub struct InMemoryRegistry {
    documents: Mutex<HashMap<String, bool>>,
    next_id: Mutex<u64>,
}

impl InMemoryRegistry {
    pub fn is_indexed(&self, id: &str) -> bool {
        self.documents.lock().unwrap().get(id).copied().unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.documents.lock().unwrap().len()
    }

    pub fn indexed_count(&self) -> usize {
        self.documents.lock().unwrap().values().filter(|v| **v).count()
    }
}

#[async_trait]
impl DocumentRegistry for InMemoryRegistry {
    async fn create(&self, _doc: &NewDocument) -> RagResult<String> {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = format!("doc-{next}");
        self.documents.lock().unwrap().insert(id.clone(), false);
        Ok(id)
    }

    async fn mark_indexed(&self, document_id: &str) -> RagResult<()> {
        match self.documents.lock().unwrap().get_mut(document_id) {
            Some(indexed) => {
                *indexed = true;
                Ok(())
            }
            None => Err(RagError::Internal(format!("no existe {document_id}"))),
        }
    }
}

/// Extractor que devuelve siempre el mismo resultado.
pub struct FakeExtractor {
    result: Result<String, String>,
}

impl FakeExtractor {
    pub fn new(result: RagResult<String>) -> Self {
        Self {
            result: result.map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl TextExtractor for FakeExtractor {
    async fn extract_text(&self, _bytes: Vec<u8>) -> RagResult<String> {
        self.result.clone().map_err(RagError::Internal)
    }
}
