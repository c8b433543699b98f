//! Carga y gestión de configuración de la aplicación (Neo4j, OpenAI, JWT y
//! parámetros del pipeline RAG).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,
    pub server_addr: String,

    pub openai_api_key: String,
    pub openai_base_url: String,
    pub llm_embedding_model: String,
    pub llm_chat_model: String,
    pub embedding_dimensions: usize,

    /// Secreto compartido con el emisor de tokens (HS256).
    pub jwt_secret: String,

    pub chunk_size: usize,
    pub default_top_k: usize,
    pub max_top_k: usize,
    /// `None` = sin límite de inactividad en el stream de generación.
    pub stream_idle_timeout: Option<Duration>,

    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que [`AppConfig::from_env`], pero leyendo de una función arbitraria.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow!("Falta {key} en el entorno"))
        };

        let neo4j_uri = required("NEO4J_URI")?;
        let neo4j_user = required("NEO4J_USER")?;
        let neo4j_password = required("NEO4J_PASSWORD")?;
        let openai_api_key = required("OPENAI_API_KEY")?;
        let jwt_secret = required("JWT_SECRET")?;

        let server_addr = lookup("SERVER_ADDR").unwrap_or_else(|| "127.0.0.1:3322".to_string());

        let openai_base_url = lookup("OPENAI_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();
        if !(openai_base_url.starts_with("http://") || openai_base_url.starts_with("https://")) {
            return Err(anyhow!(
                "OPENAI_BASE_URL debe empezar por http:// o https:// (valor: {openai_base_url})"
            ));
        }

        let llm_embedding_model = lookup("LLM_EMBEDDING_MODEL")
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let llm_chat_model =
            lookup("LLM_CHAT_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());

        let embedding_dimensions = parse_number(&lookup, "EMBEDDING_DIMENSIONS", 1536)?;
        let chunk_size = parse_number(&lookup, "CHUNK_SIZE", crate::ingest::DEFAULT_CHUNK_SIZE)?;
        let default_top_k = parse_number(&lookup, "DEFAULT_TOP_K", 3)?;
        let max_top_k = parse_number(&lookup, "MAX_TOP_K", 20)?;

        if chunk_size == 0 {
            return Err(anyhow!("CHUNK_SIZE debe ser mayor que 0"));
        }
        if default_top_k == 0 || default_top_k > max_top_k {
            return Err(anyhow!(
                "DEFAULT_TOP_K debe estar entre 1 y MAX_TOP_K ({max_top_k})"
            ));
        }

        // 0 o ausente desactiva el timeout de inactividad.
        let stream_idle_timeout = match parse_number(&lookup, "STREAM_IDLE_TIMEOUT_SECS", 0)? {
            0 => None,
            secs => Some(Duration::from_secs(secs as u64)),
        };

        let upload_dir = PathBuf::from(lookup("UPLOAD_DIR").unwrap_or_else(|| "media".to_string()));
        let max_upload_bytes = parse_number(&lookup, "MAX_UPLOAD_MB", 20)? * 1024 * 1024;

        Ok(Self {
            neo4j_uri,
            neo4j_user,
            neo4j_password,
            server_addr,
            openai_api_key,
            openai_base_url,
            llm_embedding_model,
            llm_chat_model,
            embedding_dimensions,
            jwt_secret,
            chunk_size,
            default_top_k,
            max_top_k,
            stream_idle_timeout,
            upload_dir,
            max_upload_bytes,
        })
    }
}

fn parse_number<F>(lookup: &F, key: &str, default: usize) -> Result<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| anyhow!("Valor numérico inválido en {key}: '{raw}'")),
    }
}
