//! Manejador de sesión del chat por WebSocket.
//!
//! Cada conexión recorre:
//!
//! ```text
//! Connecting ─┬─> Rejected (anónimo, close 4001)
//!             └─> Authenticated ─> Idle ─> Retrieving ─> Prompting ─> Streaming ─> Idle ...
//!                                   any ─> Closed (desconexión)
//! ```
//!
//! Las consultas se serializan por conexión: mientras una está en curso, las
//! nuevas se rechazan con un evento `error` y la en curso sigue intacta. Al
//! desconectarse el cliente se descarta el ciclo en curso, lo que aborta la
//! petición de generación abierta.
//!
//! Todos los eventos de un ciclo pasan por un canal acotado hacia el único
//! escritor del socket, así que llegan al cliente en el orden producido.

use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message};
use futures::{future::OptionFuture, Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    auth::AuthOutcome,
    error::{RagError, UpstreamError},
    llm::ByteStream,
    models::{Identity, QueryRequest, ServerEvent},
    rag::{build_context, build_prompt, QuerySettings, RagPipeline},
    sse::{SseParser, StreamEvent},
};

/// Código de cierre para conexiones sin autenticar.
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;

const EVENT_BUFFER: usize = 64;

const INTERNAL_ERROR: &str = "Internal server error";
const INTERNAL_DETAILS: &str = "An error occurred while processing your request";
const STREAMING_ERROR: &str = "Streaming error";
const STREAMING_DETAILS: &str = "An error occurred while streaming the response";

/// Cómo terminó una sesión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Rejected,
    Closed,
}

/// Fase del ciclo de consulta en la que se produjo un fallo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    Retrieving,
    Prompting,
    Streaming,
}

/// Estado propio de la conexión.
#[derive(Debug)]
pub struct SessionContext {
    pub identity: Identity,
    pub queries_started: u64,
}

#[derive(Debug)]
struct CycleFailure {
    stage: QueryStage,
    error: RagError,
}

impl CycleFailure {
    fn at(stage: QueryStage, error: impl Into<RagError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }

    fn to_event(&self) -> ServerEvent {
        match self.stage {
            QueryStage::Retrieving | QueryStage::Prompting => {
                ServerEvent::error(INTERNAL_ERROR, INTERNAL_DETAILS)
            }
            QueryStage::Streaming => ServerEvent::error(STREAMING_ERROR, STREAMING_DETAILS),
        }
    }
}

type InFlight<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Ejecuta una sesión completa sobre las dos mitades del socket.
pub async fn run_session<I, O, E>(
    mut inbound: I,
    mut outbound: O,
    auth: AuthOutcome,
    pipeline: RagPipeline,
) -> SessionEnd
where
    I: Stream<Item = Result<Message, E>> + Unpin + Send,
    E: Display + Send,
    O: Sink<Message> + Unpin + Send,
    O::Error: Display,
{
    let identity = match auth {
        AuthOutcome::Authenticated(identity) => identity,
        AuthOutcome::Anonymous(reason) => {
            info!(%reason, "Conexión WS rechazada: usuario anónimo");
            let frame = CloseFrame {
                code: CLOSE_UNAUTHENTICATED,
                reason: "Unauthenticated".into(),
            };
            if let Err(e) = outbound.send(Message::Close(Some(frame))).await {
                debug!("No se pudo enviar el cierre 4001: {e}");
            }
            return SessionEnd::Rejected;
        }
    };

    let mut ctx = SessionContext {
        identity,
        queries_started: 0,
    };
    info!(user_id = %ctx.identity.id, "Conexión WS aceptada");

    if let Err(e) = outbound
        .send(ServerEvent::welcome(&ctx.identity).into_message())
        .await
    {
        warn!(user_id = %ctx.identity.id, "No se pudo enviar el saludo: {e}");
        return SessionEnd::Closed;
    }

    let (events_tx, mut events_rx) = mpsc::channel::<ServerEvent>(EVENT_BUFFER);
    let mut in_flight: Option<InFlight<'_>> = None;

    let close_reason = loop {
        tokio::select! {
            frame = inbound.next() => {
                let payload = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    // Los binarios no traen texto: se tratan como mensaje vacío.
                    Some(Ok(Message::Binary(_))) => String::new(),
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        break format!("cierre del cliente ({:?})", frame.map(|f| f.code));
                    }
                    Some(Err(e)) => break format!("error de transporte: {e}"),
                    None => break "conexión terminada".to_string(),
                };

                let reply = if in_flight.is_some() {
                    debug!(user_id = %ctx.identity.id, "Consulta rechazada: otra en curso");
                    Some(ServerEvent::error(
                        "Query in progress",
                        "Wait for the current answer to finish before sending a new query",
                    ))
                } else {
                    match parse_query_message(&payload, &pipeline.settings) {
                        Ok(request) => {
                            ctx.queries_started += 1;
                            info!(
                                user_id = %ctx.identity.id,
                                query_no = ctx.queries_started,
                                top_k = request.top_k,
                                "Consulta recibida"
                            );
                            in_flight = Some(Box::pin(answer_query(
                                &pipeline,
                                ctx.identity.id.clone(),
                                request,
                                events_tx.clone(),
                            )));
                            None
                        }
                        Err(event) => Some(event),
                    }
                };

                if let Some(event) = reply {
                    // Primero lo que quede en el canal, para no adelantar eventos.
                    if let Err(e) = flush_pending(&mut events_rx, &mut outbound).await {
                        break format!("error enviando: {e}");
                    }
                    if let Err(e) = outbound.send(event.into_message()).await {
                        break format!("error enviando: {e}");
                    }
                }
            }
            Some(event) = events_rx.recv() => {
                if let Err(e) = outbound.send(event.into_message()).await {
                    break format!("error enviando: {e}");
                }
            }
            Some(()) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                in_flight = None;
            }
        }
    };

    if in_flight.take().is_some() {
        info!(user_id = %ctx.identity.id, "Consulta en curso cancelada por desconexión");
    }
    info!(
        user_id = %ctx.identity.id,
        queries = ctx.queries_started,
        reason = %close_reason,
        "Conexión WS cerrada"
    );
    SessionEnd::Closed
}

async fn flush_pending<O>(
    events_rx: &mut mpsc::Receiver<ServerEvent>,
    outbound: &mut O,
) -> Result<(), O::Error>
where
    O: Sink<Message> + Unpin,
{
    while let Ok(event) = events_rx.try_recv() {
        outbound.send(event.into_message()).await?;
    }
    Ok(())
}

/// Valida un mensaje entrante. En caso de error devuelve el evento a enviar.
pub fn parse_query_message(raw: &str, settings: &QuerySettings) -> Result<QueryRequest, ServerEvent> {
    if raw.is_empty() {
        return Err(ServerEvent::error("Empty message", "No message content provided"));
    }

    let payload: Value = serde_json::from_str(raw)
        .map_err(|_| ServerEvent::error("Invalid JSON", "Message must be valid JSON format"))?;
    let Value::Object(fields) = payload else {
        return Err(ServerEvent::error("Invalid JSON", "Message must be a JSON object"));
    };

    // top_k se interpreta antes que query: un valor no numérico es un fallo interno.
    let top_k = parse_top_k(fields.get("top_k"), settings)?;

    match fields.get("query") {
        Some(Value::String(query)) if !query.trim().is_empty() => Ok(QueryRequest {
            query: query.clone(),
            top_k,
        }),
        None | Some(Value::String(_)) => Err(ServerEvent::error(
            "Missing query",
            "Field 'query' is required and cannot be empty",
        )),
        Some(other) => {
            error!(query = %other, "query no es texto en el mensaje entrante");
            Err(ServerEvent::error(INTERNAL_ERROR, INTERNAL_DETAILS))
        }
    }
}

fn parse_top_k(value: Option<&Value>, settings: &QuerySettings) -> Result<usize, ServerEvent> {
    let non_numeric = |shown: &Value| {
        error!(top_k = %shown, "top_k no numérico en el mensaje entrante");
        ServerEvent::error(INTERNAL_ERROR, INTERNAL_DETAILS)
    };

    let raw = match value {
        None => return Ok(settings.default_top_k),
        Some(v @ Value::Number(n)) => n.as_i64().ok_or_else(|| non_numeric(v))?,
        Some(v @ Value::String(s)) => s.trim().parse::<i64>().map_err(|_| non_numeric(v))?,
        Some(other) => return Err(non_numeric(other)),
    };

    if raw < 1 {
        return Err(ServerEvent::error(
            "Invalid top_k",
            "Field 'top_k' must be a positive integer",
        ));
    }
    let requested = usize::try_from(raw).unwrap_or(usize::MAX);
    if requested > settings.max_top_k {
        debug!(requested, max = settings.max_top_k, "top_k recortado");
    }
    Ok(requested.min(settings.max_top_k))
}

/// Ciclo completo de una consulta. Los fallos se registran y se convierten en
/// un único evento `error`; nunca cierran la conexión.
async fn answer_query(
    pipeline: &RagPipeline,
    user_id: String,
    request: QueryRequest,
    events: mpsc::Sender<ServerEvent>,
) {
    if let Err(failure) = run_cycle(pipeline, &request, &events).await {
        error!(
            %user_id,
            stage = ?failure.stage,
            error = %failure.error,
            query = %request.query,
            top_k = request.top_k,
            "Fallo procesando la consulta"
        );
        emit(&events, failure.to_event()).await;
    }
}

async fn run_cycle(
    pipeline: &RagPipeline,
    request: &QueryRequest,
    events: &mpsc::Sender<ServerEvent>,
) -> Result<(), CycleFailure> {
    // Retrieving
    let chunks = pipeline
        .retrieve(&request.query, request.top_k)
        .await
        .map_err(|e| CycleFailure::at(QueryStage::Retrieving, e))?;

    if chunks.is_empty() {
        emit(
            events,
            ServerEvent::error(
                "No relevant context found",
                "No matching documents found in the knowledge base",
            ),
        )
        .await;
        return Ok(());
    }

    // Prompting
    let context = build_context(&chunks);
    if context.trim().is_empty() {
        return Err(CycleFailure::at(
            QueryStage::Prompting,
            RagError::Internal("los chunks recuperados no contienen texto".into()),
        ));
    }
    let prompt = build_prompt(&context, &request.query);

    let stream = match pipeline.open_generation(&prompt).await {
        Ok(stream) => stream,
        Err(UpstreamError::Status { status, .. }) => {
            emit(
                events,
                ServerEvent::error(
                    "LLM service error",
                    format!("External AI service returned error {status}"),
                ),
            )
            .await;
            emit(events, ServerEvent::Done).await;
            return Ok(());
        }
        Err(e) => return Err(CycleFailure::at(QueryStage::Streaming, e)),
    };

    // Streaming
    relay_stream(stream, events, pipeline.settings.stream_idle_timeout)
        .await
        .map_err(|e| CycleFailure::at(QueryStage::Streaming, e))
}

/// Reenvía el stream de generación como eventos `delta` y termina con un
/// único `done`, ya sea por `[DONE]` o por el fin natural del cuerpo.
pub async fn relay_stream(
    mut stream: ByteStream,
    events: &mpsc::Sender<ServerEvent>,
    idle_timeout: Option<Duration>,
) -> Result<(), UpstreamError> {
    let mut parser = SseParser::new();

    loop {
        let next = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| UpstreamError::IdleTimeout(limit))?,
            None => stream.next().await,
        };

        let (parsed, body_ended) = match next {
            Some(Ok(bytes)) => (parser.feed(&bytes), false),
            Some(Err(e)) => return Err(e),
            None => (parser.finish(), true),
        };

        for event in parsed {
            if let StreamEvent::Delta(text) = event {
                if !emit(events, ServerEvent::Delta { text }).await {
                    return Ok(());
                }
            }
        }

        if parser.is_finished() || body_ended {
            emit(events, ServerEvent::Done).await;
            return Ok(());
        }
    }
}

/// `false` si la sesión ya no escucha (cliente desconectado).
async fn emit(events: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    events.send(event).await.is_ok()
}
