//! Durable event streaming over HTTP.
//!
//! `GET /streams/{project_key}?offset=N&limit=M` returns a JSON slice of
//! the project's events past `offset`. With `live=true` the same endpoint
//! becomes a server-sent-event feed: history past `offset` replays first,
//! then committed events stream as they land. Events that arrive during
//! replay queue in the subscription and drain before the live phase, so
//! frames are strictly sequence-ordered and never duplicated.

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::any,
    Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tower_http::trace::TraceLayer;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::event::{EventFilter, EventRecord};
use crate::services::event_store::EventService;

#[derive(Debug, Clone)]
pub struct StreamServerConfig {
    pub host: String,
    /// Port 0 asks the OS for a free port; `url()` reports the real one.
    pub port: u16,
    pub max_limit: u32,
    pub default_limit: u32,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_limit: 1000,
            default_limit: 100,
        }
    }
}

struct StreamsState {
    events: EventService,
    config: StreamServerConfig,
    shutdown: watch::Receiver<bool>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

/// The streaming server. `start` is one-shot per instance lifetime;
/// `stop` is idempotent and closes every open subscriber stream.
pub struct StreamServer {
    events: EventService,
    config: StreamServerConfig,
    running: Mutex<Option<Running>>,
}

impl StreamServer {
    pub fn new(events: EventService, config: StreamServerConfig) -> Self {
        Self {
            events,
            config,
            running: Mutex::new(None),
        }
    }

    /// Bind and serve; returns the concrete base URL.
    pub async fn start(&self) -> CoreResult<String> {
        if self.running.lock().expect("stream server lock").is_some() {
            return Err(CoreError::Invalid("stream server already started".to_string()));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(StreamsState {
            events: self.events.clone(),
            config: self.config.clone(),
            shutdown: shutdown_rx.clone(),
        });

        let router = Router::new()
            .route("/streams/{project_key}", any(stream_entry))
            .fallback(not_found)
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| CoreError::Internal(format!("bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| CoreError::Internal(format!("local_addr failed: {e}")))?;

        let mut graceful = shutdown_rx;
        let handle = tokio::spawn(async move {
            let shutdown = async move {
                let _ = graceful.changed().await;
            };
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(%error, "stream server terminated");
            }
        });

        let mut running = self.running.lock().expect("stream server lock");
        if running.is_some() {
            // Lost a start race; shut this instance down again.
            let _ = shutdown_tx.send(true);
            return Err(CoreError::Invalid("stream server already started".to_string()));
        }
        *running = Some(Running { addr, shutdown: shutdown_tx, handle });

        tracing::info!(%addr, "stream server listening");
        Ok(format!("http://{addr}"))
    }

    /// Stop and release every subscriber. Safe to call twice.
    pub async fn stop(&self) {
        let running = self.running.lock().expect("stream server lock").take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.handle.await;
        }
    }

    pub fn url(&self) -> Option<String> {
        self.running
            .lock()
            .expect("stream server lock")
            .as_ref()
            .map(|r| format!("http://{}", r.addr))
    }

    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }
}

// -- handlers --

#[derive(Debug, Deserialize)]
struct StreamParams {
    offset: Option<i64>,
    limit: Option<u32>,
    live: Option<bool>,
}

/// One element of the JSON slice response.
#[derive(Debug, Serialize)]
struct StreamItem {
    offset: i64,
    /// The stringified event, as dashboards expect.
    data: String,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

fn error_response(status: StatusCode, kind: &str, message: &str, hint: Option<&str>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorDetail {
                kind: kind.to_string(),
                message: message.to_string(),
                hint: hint.map(str::to_string),
            },
        }),
    )
        .into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not_found", "unknown path", None)
}

async fn stream_entry(
    State(state): State<Arc<StreamsState>>,
    method: Method,
    Path(project_key): Path<String>,
    Query(params): Query<StreamParams>,
) -> Response {
    if method != Method::GET {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unsupported method", None);
    }

    let offset = params.offset.unwrap_or(0);
    if offset < 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid",
            "offset must be non-negative",
            Some("pass offset=0 to read from the beginning"),
        );
    }

    let head = match state.events.latest_sequence(&project_key).await {
        Ok(head) => head,
        Err(error) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", &error.to_string(), None)
        }
    };
    if head == 0 {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            &format!("unknown project: {project_key}"),
            None,
        );
    }

    if params.live.unwrap_or(false) {
        live_stream(state, project_key, offset).await
    } else {
        json_slice(state, project_key, offset, params.limit).await
    }
}

async fn json_slice(
    state: Arc<StreamsState>,
    project_key: String,
    offset: i64,
    limit: Option<u32>,
) -> Response {
    let limit = limit
        .unwrap_or(state.config.default_limit)
        .min(state.config.max_limit);

    let filter = EventFilter::new()
        .project(&project_key)
        .after_sequence(offset)
        .limit(limit);

    match state.events.read_events(&filter).await {
        Ok(events) => {
            let items: Vec<StreamItem> = events.iter().map(to_item).collect();
            Json(items).into_response()
        }
        Err(error) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", &error.to_string(), None)
        }
    }
}

fn to_item(event: &EventRecord) -> StreamItem {
    StreamItem {
        offset: event.sequence,
        data: serde_json::to_string(event).unwrap_or_default(),
        timestamp: event.timestamp,
    }
}

/// Subscriber lifecycle: Replaying -> Live -> Closed. Subscribing before
/// the history read means appends during replay wait in the channel; the
/// `last_sent` watermark drops any frame already replayed.
async fn live_stream(state: Arc<StreamsState>, project_key: String, offset: i64) -> Response {
    let receiver = state.events.subscribe();
    let shutdown = state.shutdown.clone();

    let filter = EventFilter::new().project(&project_key).after_sequence(offset);
    let history = match state.events.read_events(&filter).await {
        Ok(events) => events,
        Err(error) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", &error.to_string(), None)
        }
    };

    let last_sent = history.last().map_or(offset, |e| e.sequence);
    let replay = stream::iter(
        history
            .into_iter()
            .map(|event| Ok::<SseEvent, Infallible>(to_frame(&event)))
            .collect::<Vec<_>>(),
    );

    let live = stream::unfold(
        LiveState { receiver, shutdown, last_sent, project_key },
        |mut s| async move {
            loop {
                tokio::select! {
                    _ = s.shutdown.changed() => return None,
                    received = s.receiver.recv() => match received {
                        Ok(event) => {
                            if event.project_key != s.project_key || event.sequence <= s.last_sent {
                                continue;
                            }
                            s.last_sent = event.sequence;
                            let frame = to_frame(&event);
                            return Some((Ok::<SseEvent, Infallible>(frame), s));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                        // Fell behind the channel; the client reconnects
                        // with its last offset to backfill.
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "sse subscriber lagged");
                            continue;
                        }
                    },
                }
            }
        },
    );

    sse_response(replay.chain(live))
}

struct LiveState {
    receiver: broadcast::Receiver<EventRecord>,
    shutdown: watch::Receiver<bool>,
    last_sent: i64,
    project_key: String,
}

fn to_frame(event: &EventRecord) -> SseEvent {
    SseEvent::default()
        .id(event.sequence.to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<SseEvent, Infallible>> + Send + 'static,
{
    let sse = Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        sse,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;

    #[tokio::test]
    async fn double_start_fails_and_double_stop_is_idempotent() {
        let pool = create_migrated_test_pool().await.unwrap();
        let server = StreamServer::new(EventService::new(pool), StreamServerConfig::default());

        let url = server.start().await.unwrap();
        assert!(url.starts_with("http://127.0.0.1:"));
        assert!(server.url().is_some());

        assert!(matches!(server.start().await, Err(CoreError::Invalid(_))));

        server.stop().await;
        assert!(server.url().is_none());
        server.stop().await;
    }
}
