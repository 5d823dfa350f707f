//! HTTP API for the chatbot.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/` | Service information |
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/chat` | Answer one message (non-streaming) |
//! | `POST` | `/chat/stream` | Answer one message as SSE events |
//! | `POST` | `/email/submit` | Attach an email to a session |
//! | `POST` | `/email/skip` | Use the one-time skip at the quota boundary |
//! | `POST` | `/session/clear` | Drop a session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Invalid session" } }
//! ```
//!
//! Error codes: `bad_request` (400), `internal` (500).
//!
//! # Session exclusivity
//!
//! Every handler that touches quota state locks the session for the
//! whole request, including the streaming one (the lock lives inside
//! the SSE producer task). Two concurrent requests for one session
//! cannot both pass the gate at the quota boundary; different sessions
//! never contend.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser
//! widget can call the API cross-origin.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::config::Config;
use crate::generate::GeminiGenerator;
use crate::models::GateDecision;
use crate::pipeline::{validate_message, Pipeline, RunOutcome};
use crate::retrieval::IndexRetriever;
use crate::store::SessionStore;
use crate::usage::UsageStore;
use crate::{db, migrate};

const LIMIT_REACHED_MESSAGE: &str =
    "You've reached the free query limit. Please provide your email to continue.";
const EMAIL_REQUIRED_MESSAGE: &str = "Email is required to continue.";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    sessions: Arc<SessionStore>,
    pipeline: Arc<Pipeline>,
    usage: UsageStore,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        sessions: Arc<SessionStore>,
        pipeline: Arc<Pipeline>,
        usage: UsageStore,
    ) -> Self {
        Self {
            config,
            sessions,
            pipeline,
            usage,
        }
    }
}

/// Starts the HTTP server.
///
/// Opens the index database, wires up retrieval and generation, and
/// binds to `[server].bind`. Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config.db.path).await?;
    migrate::run_migrations(&pool).await?;

    let retriever = IndexRetriever::new(
        pool.clone(),
        config.retrieval.clone(),
        config.embedding.clone(),
    );
    let generator = GeminiGenerator::new(&config.generation)?;
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(retriever),
        Arc::new(generator),
        config.retrieval.clone(),
    ));

    let sessions = Arc::new(SessionStore::new(config.session.ttl_secs));
    let usage = UsageStore::new(pool, config.usage.enabled);

    // Periodic TTL sweep; in-flight sessions are skipped.
    let sweep_store = Arc::clone(&sessions);
    let sweep_every = Duration::from_secs(config.session.ttl_secs.max(60) / 2);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(sweep_every);
        loop {
            tick.tick().await;
            let evicted = sweep_store.evict_expired();
            if evicted > 0 {
                debug!("Evicted {} expired sessions", evicted);
            }
        }
    });

    let state = AppState::new(config, sessions, pipeline, usage);
    let app = build_router(state);

    info!("Chat server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Assembles the router. Separate from [`run_server`] so tests can
/// drive it in-process.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/chat", post(handle_chat))
        .route("/chat/stream", post(handle_chat_stream))
        .route("/email/submit", post(handle_email_submit))
        .route("/email/skip", post(handle_email_skip))
        .route("/session/clear", post(handle_session_clear))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ Request/response bodies ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    session_id: Option<String>,
    email: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
    sources: String,
    session_id: String,
    require_email: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_count: Option<u32>,
}

#[derive(Deserialize)]
struct EmailRequest {
    email: String,
    session_id: String,
}

#[derive(Deserialize)]
struct SessionRequest {
    session_id: String,
}

#[derive(Serialize)]
struct EmailResponse {
    success: bool,
    message: String,
    session_id: String,
}

// ============ GET / and GET /health ============

async fn handle_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "name": "Campus Chat API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "online",
        "endpoints": {
            "health": "/health",
            "chat": "/chat",
            "stream": "/chat/stream",
            "email_submit": "/email/submit",
            "email_skip": "/email/skip",
            "session_clear": "/session/clear"
        }
    }))
}

async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.sessions.len(),
    }))
}

// ============ POST /chat ============

/// Non-streaming chat. The session lock is held from gate check through
/// quota increment so concurrent requests cannot race past the limit.
async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let message = req.message.trim().to_string();
    if let Some(reply) = validate_message(&message) {
        return Err(bad_request(reply));
    }

    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(SessionStore::new_session_id);
    let handle = state.sessions.get_or_create(&session_id);
    let mut session = handle.lock().await;

    if let Some(email) = req.email.as_deref() {
        if !session.email_provided {
            let outcome = session.submit_email(email);
            if !outcome.success {
                return Err(bad_request(outcome.message));
            }
            state.usage.save_email(email, &session_id).await;
        }
    }

    let decision = session.gate(&message, state.config.session.free_query_limit);

    if let GateDecision::RequireEmail { .. } = decision {
        return Ok(Json(ChatResponse {
            answer: String::new(),
            sources: String::new(),
            session_id,
            require_email: true,
            skip_count: Some(session.skip_count),
        }));
    }

    let (answer, sources) = state.pipeline.answer(&message).await;

    session.record_completion(&decision);
    state
        .usage
        .log_query(
            &session_id,
            session.user_email.as_deref(),
            &message,
            answer.len(),
        )
        .await;

    Ok(Json(ChatResponse {
        answer,
        sources,
        session_id,
        require_email: false,
        skip_count: None,
    }))
}

// ============ POST /chat/stream ============

/// Streaming chat over SSE. Data events carry `{content, sources, done}`;
/// a blocked request emits a single terminal event with `require_email`,
/// the blocking message, and `skip_allowed` instead.
///
/// The producer task owns the session lock for the lifetime of the
/// stream. Quota increment and usage logging happen only after the
/// terminal event was accepted by the client channel; a disconnect
/// aborts generation and records nothing.
async fn handle_chat_stream(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let message = req.message.trim().to_string();
    if let Some(reply) = validate_message(&message) {
        return Err(bad_request(reply));
    }

    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(SessionStore::new_session_id);
    let handle = state.sessions.get_or_create(&session_id);

    let (sse_tx, sse_rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let mut session = handle.lock().await;

        if let Some(email) = req.email.as_deref() {
            if !session.email_provided {
                let outcome = session.submit_email(email);
                if !outcome.success {
                    let payload = serde_json::json!({
                        "error": outcome.message,
                        "done": true,
                    });
                    let _ = sse_tx.send(Event::default().data(payload.to_string())).await;
                    return;
                }
                state.usage.save_email(email, &session_id).await;
            }
        }

        let decision = session.gate(&message, state.config.session.free_query_limit);

        if let GateDecision::RequireEmail { skip_allowed } = decision {
            let blocking = if skip_allowed {
                LIMIT_REACHED_MESSAGE
            } else {
                EMAIL_REQUIRED_MESSAGE
            };
            let payload = serde_json::json!({
                "require_email": true,
                "message": blocking,
                "skip_allowed": skip_allowed,
                "skip_count": session.skip_count,
                "session_id": session_id,
                "done": true,
            });
            let _ = sse_tx.send(Event::default().data(payload.to_string())).await;
            return;
        }

        let (ev_tx, mut ev_rx) = mpsc::channel(32);
        let run = state.pipeline.run(&message, ev_tx);

        // The forward future owns the receiver: when it exits, the
        // receiver drops, the pipeline's next send fails, and generation
        // is abandoned. Holding the receiver alive here instead would
        // leave the pipeline blocked on a full channel after a client
        // disconnect, with this task pinning the session lock.
        let sid = session_id.as_str();
        let forward = async move {
            let mut terminal_sent = false;
            while let Some(ev) = ev_rx.recv().await {
                let payload = if ev.done {
                    serde_json::json!({
                        "content": ev.content,
                        "sources": ev.sources,
                        "done": true,
                        "session_id": sid,
                    })
                } else {
                    serde_json::json!({
                        "content": ev.content,
                        "sources": ev.sources,
                        "done": false,
                    })
                };
                let done = ev.done;
                if sse_tx
                    .send(Event::default().data(payload.to_string()))
                    .await
                    .is_err()
                {
                    // Client gone
                    break;
                }
                if done {
                    terminal_sent = true;
                }
            }
            drop(ev_rx);
            terminal_sent
        };

        let (outcome, terminal_sent) = tokio::join!(run, forward);

        if terminal_sent {
            if let RunOutcome::Delivered { answer, .. } = outcome {
                session.record_completion(&decision);
                state
                    .usage
                    .log_query(
                        &session_id,
                        session.user_email.as_deref(),
                        &message,
                        answer.len(),
                    )
                    .await;
            }
        }
    });

    let stream = ReceiverStream::new(sse_rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ POST /email/submit ============

/// Attach an email to an existing session. Invalid addresses are
/// rejected without mutating session state; unknown sessions are a 400.
async fn handle_email_submit(
    State(state): State<AppState>,
    Json(req): Json<EmailRequest>,
) -> Result<Json<EmailResponse>, AppError> {
    let handle = state
        .sessions
        .get(&req.session_id)
        .ok_or_else(|| bad_request("Invalid session"))?;
    let mut session = handle.lock().await;

    let outcome = session.submit_email(&req.email);
    if !outcome.success {
        return Err(bad_request(outcome.message));
    }

    state.usage.save_email(&req.email, &req.session_id).await;

    // A pending message, if any, is replayed by the client resend; the
    // gate now admits it unconditionally.
    Ok(Json(EmailResponse {
        success: true,
        message: outcome.message,
        session_id: req.session_id,
    }))
}

// ============ POST /email/skip ============

/// Use the one-time skip. Only valid exactly at the quota boundary with
/// the skip unused; rejections carry the reason and change nothing.
async fn handle_email_skip(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<Json<EmailResponse>, AppError> {
    let handle = state
        .sessions
        .get(&req.session_id)
        .ok_or_else(|| bad_request("Invalid session"))?;
    let mut session = handle.lock().await;

    let outcome = session.use_skip(state.config.session.free_query_limit);

    Ok(Json(EmailResponse {
        success: outcome.success,
        message: outcome.message,
        session_id: req.session_id,
    }))
}

// ============ POST /session/clear ============

async fn handle_session_clear(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Json<EmailResponse> {
    state.sessions.clear(&req.session_id);
    Json(EmailResponse {
        success: true,
        message: "Session cleared".to_string(),
        session_id: req.session_id,
    })
}
