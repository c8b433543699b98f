//! Modelos de dominio: identidad, chunks, resultados de recuperación y
//! eventos del protocolo WebSocket.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Usuario autenticado asociado a una conexión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub username: String,
}

/// Metadatos de procedencia de un chunk indexado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Nombre del fichero PDF del que procede el texto.
    pub pdf_name: String,
    pub chunk_index: i64,
}

/// Un chunk devuelto por el índice vectorial, en orden de similitud.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub text: String,
    pub metadata: ChunkMetadata,
}

/// Consulta ya validada, lista para el pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub query: String,
    pub top_k: usize,
}

/// Registro de un documento subido (lo persiste el registro de documentos).
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub file_name: String,
    pub owner_id: String,
}

/// Eventos que el servidor envía al cliente durante una sesión.
///
/// Los errores no llevan clave `type`; el resto sí.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Welcome { message: String },
    Delta { text: String },
    Error { error: String, details: String },
    Done,
}

impl ServerEvent {
    pub fn welcome(identity: &Identity) -> Self {
        ServerEvent::Welcome {
            message: format!("Connected as {}", identity.username),
        }
    }

    pub fn error(error: impl Into<String>, details: impl Into<String>) -> Self {
        ServerEvent::Error {
            error: error.into(),
            details: details.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ServerEvent::Welcome { message } => json!({ "type": "welcome", "message": message }),
            ServerEvent::Delta { text } => json!({ "type": "delta", "text": text }),
            ServerEvent::Error { error, details } => json!({ "error": error, "details": details }),
            ServerEvent::Done => json!({ "type": "done" }),
        }
    }

    pub fn into_message(self) -> Message {
        Message::Text(self.to_json().to_string())
    }
}
