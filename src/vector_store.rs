//! Índice vectorial de chunks.
//!
//! API pública:
//!   - trait [`VectorIndex`] (`upsert` / `query`)
//!   - `ensure_chunk_vector_index(&Graph, dims)`
//!   - implementación sobre Neo4j para [`Neo4jStore`].

use async_trait::async_trait;
use neo4rs::{query, Graph};
use tracing::{debug, info};

use crate::{
    error::{RagError, RagResult},
    models::{ChunkMetadata, RetrievedChunk},
    neo4j_client::Neo4jStore,
};

pub const CHUNK_INDEX_NAME: &str = "chunkEmbeddingIndex";

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Inserta o reemplaza el chunk con ese `id`.
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        text: &str,
        metadata: &ChunkMetadata,
    ) -> RagResult<()>;

    /// Hasta `top_k` chunks ordenados por similitud. Sin coincidencias → vacío.
    async fn query(&self, vector: &[f64], top_k: usize) -> RagResult<Vec<RetrievedChunk>>;
}

/// Garantiza que el índice vectorial sobre `:Chunk(embedding)` exista.
pub async fn ensure_chunk_vector_index(graph: &Graph, dimensions: usize) -> RagResult<()> {
    // ¿Ya existe el índice? Usamos la sintaxis moderna SHOW VECTOR INDEXES.
    let mut cursor = graph
        .execute(
            query("SHOW VECTOR INDEXES YIELD name WHERE name = $name RETURN name")
                .param("name", CHUNK_INDEX_NAME),
        )
        .await?;

    if cursor.next().await?.is_some() {
        info!("Índice vectorial '{CHUNK_INDEX_NAME}' ya existe.");
        return Ok(());
    }

    let cypher = format!(
        "\
CREATE VECTOR INDEX {CHUNK_INDEX_NAME} IF NOT EXISTS
FOR (c:Chunk)
ON (c.embedding)
OPTIONS {{
  indexConfig: {{
    `vector.dimensions`: {dimensions},
    `vector.similarity_function`: 'cosine'
  }}
}}"
    );

    graph.run(query(&cypher)).await?;
    info!("Índice vectorial '{CHUNK_INDEX_NAME}' creado ({dimensions} dimensiones).");

    Ok(())
}

#[async_trait]
impl VectorIndex for Neo4jStore {
    async fn upsert(
        &self,
        id: &str,
        vector: &[f64],
        text: &str,
        metadata: &ChunkMetadata,
    ) -> RagResult<()> {
        let graph = self.graph().await?;
        graph
            .run(
                query(
                    "MERGE (c:Chunk {id: $id})
                     SET c.text = $text, c.embedding = $embedding,
                         c.pdf_name = $pdf_name, c.chunk_index = $chunk_index",
                )
                .param("id", id.to_string())
                .param("text", text.to_string())
                .param("embedding", vector.to_vec())
                .param("pdf_name", metadata.pdf_name.clone())
                .param("chunk_index", metadata.chunk_index),
            )
            .await?;
        Ok(())
    }

    async fn query(&self, vector: &[f64], top_k: usize) -> RagResult<Vec<RetrievedChunk>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let graph = self.graph().await?;
        let mut cursor = graph
            .execute(
                query(
                    "CALL db.index.vector.queryNodes($index_name, $k, $embedding)
                     YIELD node, score
                     RETURN node.text AS text, node.pdf_name AS pdf_name,
                            node.chunk_index AS chunk_index, score
                     ORDER BY score DESC",
                )
                .param("index_name", CHUNK_INDEX_NAME)
                .param("k", top_k as i64)
                .param("embedding", vector.to_vec()),
            )
            .await?;

        let mut output = Vec::new();
        while let Some(row) = cursor.next().await? {
            let text: String = row
                .get("text")
                .ok_or_else(|| RagError::Internal("Falta campo 'text' en resultado de Neo4j".into()))?;
            let pdf_name: String = row.get("pdf_name").unwrap_or_default();
            let chunk_index: i64 = row.get("chunk_index").unwrap_or_default();
            output.push(RetrievedChunk {
                text,
                metadata: ChunkMetadata {
                    pdf_name,
                    chunk_index,
                },
            });
        }

        debug!(top_k, hits = output.len(), "Búsqueda vectorial completada");
        Ok(output)
    }
}
