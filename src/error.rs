//! Errores del pipeline RAG.
//!
//! [`RagError`] cubre todo lo que puede fallar entre la recepción de una
//! consulta y el final del stream de generación. El manejador de sesión los
//! traduce a eventos `error` del protocolo; nunca cierran la conexión.

use std::time::Duration;

use thiserror::Error;

/// Alias de resultado usado por los clientes de servicios externos.
pub type RagResult<T> = std::result::Result<T, RagError>;

#[derive(Debug, Error)]
pub enum RagError {
    /// Fallo de transporte o de API del servicio de embeddings.
    #[error("error en el servicio de embeddings: {0}")]
    EmbeddingService(String),

    /// El almacén vectorial no responde o no está inicializado.
    #[error("índice vectorial no disponible: {0}")]
    IndexUnavailable(String),

    /// Fallo del servicio de generación (estado HTTP, transporte o inactividad).
    #[error(transparent)]
    UpstreamGeneration(#[from] UpstreamError),

    /// Cualquier otro fallo inesperado.
    #[error("error interno: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Respuesta no-2xx antes de empezar el streaming.
    #[error("el servicio de generación devolvió el estado {status}: {snippet}")]
    Status { status: u16, snippet: String },

    #[error("error de transporte con el servicio de generación: {0}")]
    Transport(String),

    #[error("sin datos del servicio de generación durante {0:?}")]
    IdleTimeout(Duration),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        UpstreamError::Transport(err.to_string())
    }
}

impl From<neo4rs::Error> for RagError {
    fn from(err: neo4rs::Error) -> Self {
        RagError::IndexUnavailable(err.to_string())
    }
}

/// Recorta cuerpos de error largos antes de llevarlos a los logs.
pub fn make_snippet(body: &str) -> String {
    const MAX: usize = 300;
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX).collect();
    out.push('…');
    out
}
