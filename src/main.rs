// Módulos de la aplicación
mod api;
mod app_state;
mod auth;
mod config;
mod error;
mod ingest;
mod llm;
mod models;
mod neo4j_client;
mod rag;
mod session;
mod sse;
mod vector_store;

#[cfg(test)]
mod testing;

use crate::app_state::AppState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Servicios compartidos (Neo4j, LLMs, autenticación, pipeline)
    let app_state = AppState::from_config(&cfg).expect("Error inicializando los servicios");

    // 4. Conexión anticipada a Neo4j. Si falla, se reintenta en el primer uso.
    match app_state.store.ping().await {
        Ok(()) => info!("Neo4j listo (esquema e índice vectorial asegurados)"),
        Err(e) => warn!("Neo4j no disponible al arrancar: {e}. Se reintentará bajo demanda."),
    }

    // 5. Router con CORS abierto
    let app = Router::new()
        .merge(api::create_router(app_state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // 6. Iniciar el servidor
    let server_addr = &app_state.config.server_addr;
    let listener = tokio::net::TcpListener::bind(server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);
    info!("   Chat WebSocket: ws://{}/api/v1/ws/chat", server_addr);

    // Apagado ordenado con Ctrl+C.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor HTTP");

    info!("✅ Servidor cerrado correctamente.");
}
