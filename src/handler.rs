use std::sync::Arc;
use std::time::Instant;

use async_stream::stream;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, LAST_MODIFIED, RANGE, SERVER,
};
use axum::http::{HeaderMap, Response, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::Json;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::fetcher::ChunkFetcher;
use crate::ingest::{IngestProgress, IngestReceipt, Ingestor, ProgressSender};
use crate::links::LinkRegistry;
use crate::page::{sanitize_filename, ShowPage};
use crate::pool::SessionPool;
use crate::range::{parse_range_header, RangeRequest};
use crate::store::{Media, ObjectDescriptor, ObjectStore};
use crate::trace::{trace_event, SharedTrace};
use crate::translator::{stream_range, FetchPlan, ObjectReader};

const SERVER_NAME: &str = concat!("linkstream/", env!("CARGO_PKG_VERSION"));
const FILE_NAME_HEADER: &str = "x-file-name";
const PROGRESS_BUFFER: usize = 16;

/// Shared application state injected into every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pool: Arc<SessionPool<dyn ObjectStore>>,
    pub fetcher: Arc<ChunkFetcher>,
    pub links: Arc<LinkRegistry>,
    pub ingestor: Arc<Ingestor>,
    pub trace: SharedTrace,
}

impl AppState {
    fn object(&self, sequence: u64) -> ObjectDescriptor {
        ObjectDescriptor::new(self.config.container.clone(), sequence)
    }
}

// ---------------------------------------------------------------------------
// Streaming endpoint
// ---------------------------------------------------------------------------

pub async fn handle_stream(
    State(state): State<AppState>,
    Path((object_id, _file_name)): Path<(u64, String)>,
    headers: HeaderMap,
) -> GatewayResult<Response<Body>> {
    let object = state.object(object_id);
    serve(&state, &object, &headers, true).await.inspect_err(|e| {
        warn!(
            object = %object,
            range = %range_label(&headers),
            "stream request failed: {e}"
        )
    })
}

/// Same headers as GET, no body, no workload taken.
pub async fn handle_stream_head(
    State(state): State<AppState>,
    Path((object_id, _file_name)): Path<(u64, String)>,
    headers: HeaderMap,
) -> GatewayResult<Response<Body>> {
    let object = state.object(object_id);
    serve(&state, &object, &headers, false).await.inspect_err(|e| {
        debug!(
            object = %object,
            range = %range_label(&headers),
            "head request failed: {e}"
        )
    })
}

/// Raw `Range` header for log lines, `-` when absent.
fn range_label(headers: &HeaderMap) -> &str {
    headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
}

async fn serve(
    state: &AppState,
    object: &ObjectDescriptor,
    headers: &HeaderMap,
    with_body: bool,
) -> GatewayResult<Response<Body>> {
    let (_, store) = state.pool.select()?;

    // Live size from the store, so Content-Length is not promised from a
    // stale copy.
    let media = store
        .stat(object)
        .await?
        .ok_or_else(|| GatewayError::NotFound(object.to_string()))?;

    let range = parse_range_header(
        headers.get(RANGE).and_then(|v| v.to_str().ok()),
        media.size,
    )?;

    let Some(effective) = range.or_else(|| RangeRequest::full(media.size)) else {
        // Empty object, no range: 200 with an empty body.
        return Ok(build_response(&media, None, 0, Body::empty()));
    };
    let plan = FetchPlan::new(media.size, effective, state.config.chunk_size)?;

    if !with_body {
        return Ok(build_response(
            &media,
            range,
            plan.requested_length,
            Body::empty(),
        ));
    }

    // Select and acquire under one lock so a burst of requests spreads out.
    let guard = state.pool.checkout()?;
    let client = guard.id();
    info!(
        object = %object,
        client,
        from = effective.from_byte,
        until = effective.until_byte,
        parts = plan.part_count,
        "stream start"
    );
    trace_event(&state.trace, || json!({
        "event": "stream_start",
        "object": object.to_string(),
        "from": effective.from_byte,
        "until": effective.until_byte,
        "parts": plan.part_count,
        "client": client,
    }));

    let reader = ObjectReader {
        fetcher: state.fetcher.clone(),
        store: guard.handle().clone(),
        object: object.clone(),
        partition: media.partition.clone(),
    };
    let chunks = stream_range(plan, reader, state.trace.clone());
    let trace = state.trace.clone();
    let label = object.to_string();

    let body_stream = stream! {
        // Dropping the guard, on completion or when the client goes away and
        // hyper drops this body, releases the workload.
        let _guard = guard;
        let t0 = Instant::now();
        let mut sent = 0u64;
        let mut chunks = std::pin::pin!(chunks);

        while let Some(item) = chunks.next().await {
            match item {
                Ok(bytes) => {
                    sent += bytes.len() as u64;
                    yield Ok::<Bytes, std::io::Error>(bytes);
                }
                Err(e) => {
                    error!(
                        object = %label,
                        client,
                        from = effective.from_byte,
                        until = effective.until_byte,
                        sent,
                        "stream aborted: {e}"
                    );
                    yield Err(std::io::Error::other("upstream fetch failed"));
                    return;
                }
            }
        }

        if sent < plan.requested_length {
            warn!(
                object = %label,
                client,
                sent,
                promised = plan.requested_length,
                "object ended before the declared length"
            );
        } else {
            info!(object = %label, client, sent, "stream done");
        }
        trace_event(&trace, || json!({
            "event": "stream_done",
            "object": label,
            "sent": sent,
            "elapsed_ms": t0.elapsed().as_secs_f64() * 1000.0,
        }));
    };

    Ok(build_response(
        &media,
        range,
        plan.requested_length,
        Body::from_stream(body_stream),
    ))
}

fn build_response(
    media: &Media,
    range: Option<RangeRequest>,
    content_length: u64,
    body: Body,
) -> Response<Body> {
    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };

    let mut b = Response::builder()
        .status(status)
        .header(SERVER, SERVER_NAME)
        .header(CONTENT_TYPE, media.content_type())
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, content_length)
        .header(
            CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", sanitize_filename(&media.name)),
        );
    if let Some(r) = range {
        b = b.header(CONTENT_RANGE, r.content_range(media.size));
    }
    if let Some(v) = &media.last_modified {
        b = b.header(LAST_MODIFIED, v.as_str());
    }
    b.body(body)
        .unwrap_or_else(|_| GatewayError::Internal("invalid response header".into()).into_response())
}

// ---------------------------------------------------------------------------
// Landing page
// ---------------------------------------------------------------------------

pub async fn handle_show(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> GatewayResult<Html<String>> {
    show_page(&state, &token)
        .await
        .map(|page| Html(page.render()))
        .inspect_err(|e| warn!(token = %token, "show request failed: {e}"))
}

async fn show_page(state: &AppState, token: &str) -> GatewayResult<ShowPage> {
    let object = state.links.resolve(token)?;
    let (_, store) = state.pool.select()?;
    let media = store
        .stat(&object)
        .await?
        .ok_or_else(|| GatewayError::NotFound(object.to_string()))?;
    Ok(ShowPage::new(&state.config.base_url, object.sequence, &media))
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

pub async fn handle_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> GatewayResult<Json<IngestReceipt>> {
    let name = headers
        .get(FILE_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            urlencoding::decode(v)
                .map(|n| n.into_owned())
                .unwrap_or_else(|_| v.to_string())
        })
        .ok_or_else(|| GatewayError::BadRequest("missing X-File-Name header".into()))?;
    let mime_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let receipt = state
        .ingestor
        .ingest_stream(
            &name,
            mime_type,
            body.into_data_stream(),
            Some(progress_logger(name.clone())),
        )
        .await
        .inspect_err(|e| warn!(name = %name, "upload failed: {e}"))?;
    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
pub struct UrlIngestRequest {
    pub url: String,
}

pub async fn handle_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UrlIngestRequest>,
) -> GatewayResult<Json<IngestReceipt>> {
    let owner = state
        .config
        .owner_token
        .as_deref()
        .ok_or(GatewayError::Unauthorized)?;
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented != Some(owner) {
        return Err(GatewayError::Unauthorized);
    }

    let receipt = state
        .ingestor
        .ingest_url(&req.url, Some(progress_logger(req.url.clone())))
        .await
        .inspect_err(|e| warn!(url = %req.url, "url ingestion failed: {e}"))?;
    Ok(Json(receipt))
}

/// Channel whose events are only logged; the transfer never waits on it.
fn progress_logger(label: String) -> ProgressSender {
    let (tx, mut rx) = mpsc::channel::<IngestProgress>(PROGRESS_BUFFER);
    tokio::spawn(async move {
        while let Some(p) = rx.recv().await {
            debug!(
                source = %label,
                stage = ?p.stage,
                done = p.bytes_done,
                total = ?p.bytes_total,
                "ingest progress"
            );
        }
    });
    tx
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "clients": state.pool.snapshot(),
        "cached_sessions": state.fetcher.cached_sessions(),
        "links": state.links.len(),
    }))
}
