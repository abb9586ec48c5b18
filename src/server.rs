// ABOUTME: HTTP surface: GET streams a source's entities, POST applies a batch to a sink
// ABOUTME: Routes /{system}/{endpoint} through the shared registry

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use crate::entity::{encode_entity, entity_stream, Entity};
use crate::error::BridgeError;
use crate::registry::{Registry, System};
use crate::sink::{Sink, WriteStats};
use crate::source::EntityStream;

/// Default limit for POST bodies.
pub const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    max_body_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct ReadParams {
    since: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    is_full: Option<String>,
}

/// Creates the entity router. POST bodies larger than `max_body_bytes` get a 413.
pub fn router(registry: Arc<Registry>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/{system}/{endpoint}", get(read_entities).post(write_entities))
        .with_state(AppState {
            registry,
            max_body_bytes,
        })
}

/// Only the literal `true`, in any case, enables a full run.
fn is_full_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

fn not_found(err: BridgeError) -> Response {
    tracing::debug!("{}", err);
    (StatusCode::NOT_FOUND, format!("{}\n", err)).into_response()
}

fn payload_too_large(limit: usize) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        format!("request body exceeds {} bytes\n", limit),
    )
        .into_response()
}

fn server_error(context: &str, err: anyhow::Error) -> Response {
    tracing::error!("{} failed: {:?}", context, err);
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}\n", err)).into_response()
}

/// `GET /{system}/{source}?since=cursor` streams a JSON array of entities.
async fn read_entities(
    State(state): State<AppState>,
    Path((system_id, source_id)): Path<(String, String)>,
    Query(params): Query<ReadParams>,
) -> Response {
    let (system, source) = match state.registry.resolve_source(&system_id, &source_id) {
        Ok(found) => found,
        Err(e) => return not_found(e),
    };
    let label = format!("{}/{}", system_id, source_id);

    let opened = async {
        let client = system
            .pool()
            .get()
            .await
            .with_context(|| format!("Failed to get a connection for system '{}'", system_id))?;
        source.read(&label, client, params.since.as_deref()).await
    }
    .await;

    match opened {
        Ok(entities) => (
            [(header::CONTENT_TYPE, JSON_CONTENT_TYPE)],
            json_array_body(label, entities),
        )
            .into_response(),
        Err(e) => server_error(&format!("Read from '{}'", label), e),
    }
}

/// Frames the entity stream as `[e1,e2,...]`. A mid-stream error aborts the body.
fn json_array_body(label: String, entities: EntityStream) -> Body {
    let mut first = true;
    let items = entities.map(move |entity| {
        let entity = entity.inspect_err(|e| {
            tracing::error!("Read from '{}' failed mid-stream: {:?}", label, e)
        })?;
        let mut chunk = Vec::with_capacity(128);
        if !first {
            chunk.push(b',');
        }
        first = false;
        serde_json::to_writer(&mut chunk, &encode_entity(&entity))
            .context("Failed to serialize entity")?;
        Ok::<_, anyhow::Error>(Bytes::from(chunk))
    });

    let framed = stream::once(async { Ok(Bytes::from_static(b"[")) })
        .chain(items)
        .chain(stream::once(async { Ok(Bytes::from_static(b"]")) }));
    Body::from_stream(framed)
}

/// `POST /{system}/{sink}?is_full=bool` applies a JSON array of entities.
///
/// The body is decoded while it is written, so memory stays flat however long
/// the batch is.
async fn write_entities(
    State(state): State<AppState>,
    Path((system_id, sink_id)): Path<(String, String)>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let (system, sink) = match state.registry.resolve_sink(&system_id, &sink_id) {
        Ok(found) => found,
        Err(e) => return not_found(e),
    };
    let is_full = is_full_flag(params.is_full.as_deref());

    let limit = state.max_body_bytes;
    if declared_length(&headers).is_some_and(|length| length > limit) {
        return payload_too_large(limit);
    }
    let exceeded = Arc::new(AtomicBool::new(false));
    let entities = entity_stream(limited(body, limit, exceeded.clone()));

    match apply_batch(system, sink, entities, is_full).await {
        Ok(stats) => {
            tracing::debug!(
                "Write to '{}/{}' applied {} entities",
                system_id,
                sink_id,
                stats.entities()
            );
            StatusCode::OK.into_response()
        }
        Err(e) if exceeded.load(Ordering::SeqCst) => {
            tracing::warn!("Write to '{}/{}' rejected: {:#}", system_id, sink_id, e);
            payload_too_large(limit)
        }
        Err(e) => server_error(&format!("Write to '{}/{}'", system_id, sink_id), e),
    }
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Body bytes, failing once more than `limit` bytes have arrived. The flag
/// is set before the failing chunk is handed on.
fn limited(
    body: Body,
    limit: usize,
    exceeded: Arc<AtomicBool>,
) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    let mut received = 0usize;
    body.into_data_stream().map(move |chunk| {
        let chunk = chunk.map_err(io::Error::other)?;
        received += chunk.len();
        if received > limit {
            exceeded.store(true, Ordering::SeqCst);
            return Err(io::Error::other(format!("request body exceeds {} bytes", limit)));
        }
        Ok(chunk)
    })
}

async fn apply_batch<S>(
    system: &System,
    sink: &Sink,
    mut entities: S,
    is_full: bool,
) -> Result<WriteStats>
where
    S: Stream<Item = Result<Entity, BridgeError>> + Unpin,
{
    // A body that is malformed from its first element never takes a connection.
    let first = match entities.next().await {
        Some(Err(e)) => return Err(e.into()),
        first => first,
    };

    let mut client = system
        .pool()
        .get()
        .await
        .with_context(|| format!("Failed to get a connection for system '{}'", system.id()))?;
    let entities = stream::iter(first).chain(entities);
    sink.write_stream(&mut client, entities, is_full).await
}
