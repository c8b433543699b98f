//! Parser incremental del stream `data: ...` que devuelve el servicio de
//! generación (estilo server-sent events).
//!
//! Funciona en cuatro pasos por fragmento recibido:
//!   1. Acumular los bytes en un buffer.
//!   2. Cortar por `\n` y decodificar cada línea completa como UTF-8.
//!   3. Comprobar el prefijo `data: `.
//!   4. Interpretar la carga: `[DONE]` o un registro JSON con `choices`.
//!
//! Las líneas que no encajan se descartan en silencio. Tras `[DONE]` el parser
//! queda terminado e ignora cualquier byte restante.

use serde_json::Value;
use tracing::trace;

const DATA_PREFIX: &str = "data: ";
const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
}

/// Resultado de intentar interpretar una línea.
#[derive(Debug, PartialEq, Eq)]
enum LineOutcome {
    Event(StreamEvent),
    Skipped,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` una vez recibido `[DONE]`.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Procesa un fragmento de bytes y devuelve los eventos de las líneas
    /// completas que contiene, en orden de llegada.
    pub fn feed(&mut self, fragment: &[u8]) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(fragment);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.push_line(&line[..line.len() - 1], &mut events) {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Vacía la última línea pendiente (cuerpo terminado sin `\n` final).
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished || self.buffer.is_empty() {
            self.buffer.clear();
            return events;
        }
        let rest = std::mem::take(&mut self.buffer);
        self.push_line(&rest, &mut events);
        events
    }

    /// Devuelve `true` si la línea cerró el stream.
    fn push_line(&mut self, raw: &[u8], events: &mut Vec<StreamEvent>) -> bool {
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(_) => {
                trace!(len = raw.len(), "Línea no UTF-8 descartada del stream");
                return false;
            }
        };

        match parse_line(line) {
            LineOutcome::Event(StreamEvent::Done) => {
                self.finished = true;
                events.push(StreamEvent::Done);
                true
            }
            LineOutcome::Event(event) => {
                events.push(event);
                false
            }
            LineOutcome::Skipped => false,
        }
    }
}

fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim();
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return LineOutcome::Skipped;
    };
    if payload == DONE_MARKER {
        return LineOutcome::Event(StreamEvent::Done);
    }

    let record: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => {
            trace!("Registro JSON inválido descartado del stream");
            return LineOutcome::Skipped;
        }
    };

    match extract_delta(&record) {
        Some(text) if !text.is_empty() => LineOutcome::Event(StreamEvent::Delta(text.to_string())),
        _ => LineOutcome::Skipped,
    }
}

/// `choices[0].delta.content`, o `choices[0].text` si no hay contenido.
fn extract_delta(record: &Value) -> Option<&str> {
    let choice = record.get("choices")?.as_array()?.first()?;
    match choice.get("delta").and_then(|d| d.get("content")) {
        Some(Value::String(content)) => Some(content.as_str()),
        Some(Value::Null) | None => choice.get("text").and_then(Value::as_str),
        Some(_) => None,
    }
}
