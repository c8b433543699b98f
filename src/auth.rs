//! Autenticación de conexiones con JWT (HS256).
//!
//! El token llega en la cabecera `Authorization` (con o sin prefijo
//! `Bearer `) o en el parámetro `?token=` de la URL. Cualquier fallo degrada
//! a [`AuthOutcome::Anonymous`]: nunca se propaga un error desde aquí.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::{error::RagResult, models::Identity};

type HmacSha256 = Hmac<Sha256>;

/// Motivos por los que una conexión queda como anónima.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no se proporcionó token")]
    MissingToken,
    #[error("token mal formado: {0}")]
    Malformed(&'static str),
    #[error("algoritmo de firma no soportado: {0}")]
    UnsupportedAlgorithm(String),
    #[error("firma inválida")]
    BadSignature,
    #[error("token expirado")]
    Expired,
    #[error("el token no contiene user_id")]
    MissingSubject,
    #[error("usuario desconocido: {0}")]
    UnknownSubject(String),
    #[error("no se pudo resolver el usuario: {0}")]
    Lookup(String),
}

/// Resultado explícito de autenticar una conexión.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(Identity),
    Anonymous(AuthError),
}

/// Directorio de usuarios: resuelve el `user_id` de un token a una identidad.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, user_id: &str) -> RagResult<Option<Identity>>;
}

#[derive(Debug, Deserialize)]
struct JwtHeader {
    alg: String,
}

#[derive(Debug, Deserialize)]
struct Claims {
    user_id: Option<Value>,
    exp: Option<Value>,
}

#[derive(Clone)]
pub struct Authenticator {
    secret: Arc<Vec<u8>>,
    resolver: Arc<dyn IdentityResolver>,
}

impl Authenticator {
    pub fn new(secret: impl AsRef<[u8]>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            secret: Arc::new(secret.as_ref().to_vec()),
            resolver,
        }
    }

    /// Autentica una conexión a partir de sus cabeceras y del `?token=`.
    pub async fn authenticate(&self, headers: &HeaderMap, query_token: Option<&str>) -> AuthOutcome {
        let outcome = match extract_token(headers, query_token) {
            Some(token) => self.authenticate_token(&token).await,
            None => AuthOutcome::Anonymous(AuthError::MissingToken),
        };

        match &outcome {
            AuthOutcome::Authenticated(identity) => {
                info!(user_id = %identity.id, "Autenticación correcta");
            }
            AuthOutcome::Anonymous(reason) => {
                warn!(%reason, "Autenticación fallida");
            }
        }
        outcome
    }

    pub async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        let user_id = match verify_token(token, &self.secret, Utc::now().timestamp()) {
            Ok(user_id) => user_id,
            Err(reason) => return AuthOutcome::Anonymous(reason),
        };

        match self.resolver.resolve(&user_id).await {
            Ok(Some(identity)) => AuthOutcome::Authenticated(identity),
            Ok(None) => AuthOutcome::Anonymous(AuthError::UnknownSubject(user_id)),
            Err(e) => AuthOutcome::Anonymous(AuthError::Lookup(e.to_string())),
        }
    }
}

/// Obtiene el token crudo. La cabecera tiene prioridad sobre la query.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let raw = from_header.or_else(|| query_token.map(str::trim).filter(|v| !v.is_empty()))?;

    let token = match raw.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
        _ => raw,
    };
    (!token.is_empty()).then(|| token.to_string())
}

/// Verifica firma y expiración; devuelve el `user_id` del token.
pub fn verify_token(token: &str, secret: &[u8], now: i64) -> Result<String, AuthError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::Malformed("se esperaban tres segmentos"));
    };

    let header: JwtHeader = decode_segment(header_b64)?;
    if header.alg != "HS256" {
        return Err(AuthError::UnsupportedAlgorithm(header.alg));
    }

    let signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::Malformed("firma no es base64url"))?;
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| AuthError::Malformed("clave HMAC inválida"))?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(payload_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| AuthError::BadSignature)?;

    let claims: Claims = decode_segment(payload_b64)?;

    let exp = claims
        .exp
        .as_ref()
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .ok_or(AuthError::Malformed("falta la expiración (exp)"))?;
    if exp <= now {
        return Err(AuthError::Expired);
    }

    match claims.user_id {
        Some(Value::String(id)) if !id.trim().is_empty() => Ok(id),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(AuthError::MissingSubject),
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed("segmento no es base64url"))?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed("segmento no es JSON"))
}
