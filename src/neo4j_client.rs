//! Conexión a Neo4j compartida por todo el proceso.
//!
//! [`Neo4jStore`] se construye en `main` y se inyecta como índice vectorial,
//! directorio de usuarios y registro de documentos. La conexión (y el esquema)
//! se inicializa de forma perezosa una sola vez, aunque varias conexiones la
//! pidan a la vez.

use async_trait::async_trait;
use chrono::Utc;
use neo4rs::{query, Graph};
use tokio::sync::OnceCell;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::{
    auth::IdentityResolver,
    config::AppConfig,
    error::{RagError, RagResult},
    ingest::DocumentRegistry,
    models::{Identity, NewDocument},
    vector_store,
};

pub struct Neo4jStore {
    cfg: AppConfig,
    graph: OnceCell<Graph>,
}

impl Neo4jStore {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            graph: OnceCell::new(),
        }
    }

    /// Devuelve la conexión, creándola (y asegurando el esquema) en el primer uso.
    /// Si la inicialización falla, el siguiente uso lo vuelve a intentar.
    pub async fn graph(&self) -> RagResult<&Graph> {
        self.graph
            .get_or_try_init(|| async {
                let graph = connect_from_config(&self.cfg).await?;
                ensure_schema(&graph).await?;
                vector_store::ensure_chunk_vector_index(&graph, self.cfg.embedding_dimensions)
                    .await?;
                Ok::<Graph, RagError>(graph)
            })
            .await
    }

    /// Health check: `RETURN 1`.
    pub async fn ping(&self) -> RagResult<()> {
        self.graph().await?.run(query("RETURN 1")).await?;
        Ok(())
    }
}

pub async fn connect_from_config(cfg: &AppConfig) -> RagResult<Graph> {
    let url = Url::parse(&cfg.neo4j_uri)
        .map_err(|e| RagError::IndexUnavailable(format!("NEO4J_URI inválida: {e}")))?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.neo4j_user, &cfg.neo4j_password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea constraints básicos para las etiquetas propias: :Document y :Chunk.
pub async fn ensure_schema(graph: &Graph) -> RagResult<()> {
    let statements = [
        // Document.id único
        "CREATE CONSTRAINT doc_id IF NOT EXISTS
         FOR (d:Document)
         REQUIRE d.id IS UNIQUE",
        // Chunk.id único
        "CREATE CONSTRAINT chunk_id IF NOT EXISTS
         FOR (c:Chunk)
         REQUIRE c.id IS UNIQUE",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints básicos creados).");
    Ok(())
}

#[async_trait]
impl IdentityResolver for Neo4jStore {
    async fn resolve(&self, user_id: &str) -> RagResult<Option<Identity>> {
        let graph = self.graph().await?;
        let mut cursor = graph
            .execute(
                query(
                    "MATCH (u:User) WHERE toString(u.id) = $id
                     RETURN toString(u.id) AS id, u.username AS username
                     LIMIT 1",
                )
                .param("id", user_id.to_string()),
            )
            .await?;

        let Some(row) = cursor.next().await? else {
            return Ok(None);
        };
        let id: String = row.get("id").unwrap_or_else(|| user_id.to_string());
        let username: String = row.get("username").unwrap_or_else(|| "Unknown".to_string());
        Ok(Some(Identity { id, username }))
    }
}

#[async_trait]
impl DocumentRegistry for Neo4jStore {
    async fn create(&self, doc: &NewDocument) -> RagResult<String> {
        let graph = self.graph().await?;
        let id = Uuid::new_v4().to_string();

        graph
            .run(
                query(
                    "CREATE (d:Document {id: $id, title: $title, file_name: $file_name,
                                         owner_id: $owner_id, uploaded_at: datetime($uploaded_at),
                                         is_indexed: false})
                     WITH d
                     OPTIONAL MATCH (u:User) WHERE toString(u.id) = $owner_id
                     FOREACH (_ IN CASE WHEN u IS NULL THEN [] ELSE [1] END |
                         MERGE (u)-[:UPLOADED]->(d))",
                )
                .param("id", id.clone())
                .param("title", doc.title.clone())
                .param("file_name", doc.file_name.clone())
                .param("owner_id", doc.owner_id.clone())
                .param("uploaded_at", Utc::now().to_rfc3339()),
            )
            .await?;

        Ok(id)
    }

    async fn mark_indexed(&self, document_id: &str) -> RagResult<()> {
        let graph = self.graph().await?;
        let mut cursor = graph
            .execute(
                query(
                    "MATCH (d:Document {id: $id})
                     SET d.is_indexed = true, d.indexed_at = datetime($indexed_at)
                     RETURN d.id AS id",
                )
                .param("id", document_id.to_string())
                .param("indexed_at", Utc::now().to_rfc3339()),
            )
            .await?;

        match cursor.next().await? {
            Some(_) => Ok(()),
            None => Err(RagError::Internal(format!(
                "Documento {document_id} no encontrado al marcarlo como indexado"
            ))),
        }
    }
}
