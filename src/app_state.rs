use std::sync::Arc;

use crate::{
    auth::Authenticator,
    config::AppConfig,
    ingest::{Ingestor, PdfExtractor},
    llm::LlmManager,
    neo4j_client::Neo4jStore,
    rag::{QuerySettings, RagPipeline},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<Neo4jStore>,
    pub authenticator: Authenticator,
    pub pipeline: RagPipeline,
    pub ingestor: Ingestor,
}

impl AppState {
    /// Cablea los servicios del proceso. Neo4j se conecta en el primer uso.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Neo4jStore::new(cfg));
        let llm = Arc::new(LlmManager::from_config(cfg)?);

        let authenticator = Authenticator::new(cfg.jwt_secret.as_bytes(), store.clone());

        let pipeline = RagPipeline {
            embedder: llm.clone(),
            index: store.clone(),
            generator: llm.clone(),
            settings: QuerySettings::from_config(cfg),
        };

        let ingestor = Ingestor {
            embedder: llm,
            index: store.clone(),
            documents: store.clone(),
            extractor: Arc::new(PdfExtractor),
            chunk_size: cfg.chunk_size,
            upload_dir: Some(cfg.upload_dir.clone()),
        };

        Ok(Self {
            config: Arc::new(cfg.clone()),
            store,
            authenticator,
            pipeline,
            ingestor,
        })
    }
}
