//! End-to-end quota flow over the HTTP API.
//!
//! Drives the router in-process with stub retrieval/generation backends
//! and walks the whole anonymous-session lifecycle: two free answers,
//! the email wall, the one-time skip replay, and email capture.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use campus_chat::config::{
    Config, DbConfig, EmbeddingConfig, GenerationConfig, RetrievalConfig, ServerConfig,
    SessionConfig, UsageConfig,
};
use campus_chat::generate::Generator;
use campus_chat::models::{ChunkType, Passage};
use campus_chat::pipeline::Pipeline;
use campus_chat::retrieval::Retriever;
use campus_chat::server::{build_router, AppState};
use campus_chat::store::SessionStore;
use campus_chat::usage::UsageStore;
use campus_chat::{db, migrate};

struct StubRetriever;

#[async_trait]
impl Retriever for StubRetriever {
    async fn search(&self, _query: &str, _k: usize) -> anyhow::Result<Vec<Passage>> {
        let passage = |text: &str| Passage {
            text: text.to_string(),
            chunk_type: ChunkType::Plain,
            title: Some("SRMIST Ramapuram Admission Guide".to_string()),
            source_url: Some("https://www.srmist.edu.in/admissions".to_string()),
            score: 1.0,
        };
        Ok(vec![
            passage(&"Admissions open in April and close in June each year. ".repeat(4)),
            passage(&"The B.Tech program spans eight semesters of coursework. ".repeat(4)),
        ])
    }
}

struct StubGenerator;

#[async_trait]
impl Generator for StubGenerator {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok("Admissions close in June.".to_string())
    }

    async fn stream(&self, _prompt: &str, tx: mpsc::Sender<String>) -> anyhow::Result<()> {
        for chunk in ["Admissions ", "close ", "in June."] {
            if tx.send(chunk.to_string()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Streams enough chunks to keep the event channel saturated, so an
/// abandoned stream that is not cancelled stays wedged.
struct ChattyGenerator;

#[async_trait]
impl Generator for ChattyGenerator {
    async fn complete(&self, _prompt: &str) -> anyhow::Result<String> {
        Ok("A long answer about admissions.".to_string())
    }

    async fn stream(&self, _prompt: &str, tx: mpsc::Sender<String>) -> anyhow::Result<()> {
        for _ in 0..300 {
            if tx.send("word ".to_string()).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

fn test_config(db_path: PathBuf) -> Config {
    Config {
        db: DbConfig { path: db_path },
        retrieval: RetrievalConfig::default(),
        embedding: EmbeddingConfig::default(),
        generation: GenerationConfig::default(),
        session: SessionConfig::default(),
        server: ServerConfig {
            bind: "127.0.0.1:0".to_string(),
        },
        usage: UsageConfig { enabled: true },
    }
}

async fn test_app() -> (TempDir, Router) {
    test_app_with(Arc::new(StubGenerator)).await
}

async fn test_app_with(generator: Arc<dyn Generator>) -> (TempDir, Router) {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path().join("index.db"));

    let pool = db::connect(&config.db.path).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let pipeline = Arc::new(Pipeline::new(
        Arc::new(StubRetriever),
        generator,
        config.retrieval.clone(),
    ));
    let sessions = Arc::new(SessionStore::new(config.session.ttl_secs));
    let usage = UsageStore::new(pool, config.usage.enabled);
    let state = AppState::new(Arc::new(config), sessions, pipeline, usage);

    (dir, build_router(state))
}

async fn post_json(app: &Router, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn chat(app: &Router, session_id: &str, message: &str) -> serde_json::Value {
    let (status, body) = post_json(
        app,
        "/chat",
        serde_json::json!({ "message": message, "session_id": session_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn test_full_quota_lifecycle() {
    let (_dir, app) = test_app().await;
    let sid = "session_lifecycle";

    // Queries 1 and 2: answered freely
    for n in 1..=2 {
        let body = chat(&app, sid, &format!("question {n} about admission")).await;
        assert_eq!(body["require_email"], false, "query {n} should pass");
        assert_eq!(body["answer"], "Admissions close in June.");
        assert_eq!(body["session_id"], sid);
    }

    // Query 3: blocked, skip still available
    let body = chat(&app, sid, "third question about admission").await;
    assert_eq!(body["require_email"], true);
    assert_eq!(body["answer"], "");
    assert_eq!(body["skip_count"], 0);

    // Skip once
    let (status, body) = post_json(&app, "/email/skip", serde_json::json!({ "session_id": sid })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    // Resend of the blocked question: answered without counting
    let body = chat(&app, sid, "third question about admission").await;
    assert_eq!(body["require_email"], false);
    assert_eq!(body["answer"], "Admissions close in June.");

    // Query 4: blocked again, skip no longer offered
    let body = chat(&app, sid, "fourth question about admission").await;
    assert_eq!(body["require_email"], true);

    // Second skip is refused
    let (status, body) = post_json(&app, "/email/skip", serde_json::json!({ "session_id": sid })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Skip already used.");

    // Malformed email is rejected without unblocking anything
    let (status, _) = post_json(
        &app,
        "/email/submit",
        serde_json::json!({ "session_id": sid, "email": "not-an-email" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body = chat(&app, sid, "still blocked question").await;
    assert_eq!(body["require_email"], true);

    // Valid email unblocks the session permanently
    let (status, body) = post_json(
        &app,
        "/email/submit",
        serde_json::json!({ "session_id": sid, "email": "student@example.edu" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    for n in 5..=8 {
        let body = chat(&app, sid, &format!("question {n} about admission")).await;
        assert_eq!(body["require_email"], false, "authenticated query {n}");
    }
}

#[tokio::test]
async fn test_validation_rejected_without_counting() {
    let (_dir, app) = test_app().await;
    let sid = "session_validation";

    let (status, _) = post_json(&app, "/chat", serde_json::json!({ "message": "   ", "session_id": sid })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let long = "x".repeat(1500);
    let (status, _) = post_json(&app, "/chat", serde_json::json!({ "message": long, "session_id": sid })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Rejected messages consumed none of the free quota
    for n in 1..=2 {
        let body = chat(&app, sid, &format!("real question {n}")).await;
        assert_eq!(body["require_email"], false);
    }
    let body = chat(&app, sid, "now over the limit").await;
    assert_eq!(body["require_email"], true);
}

#[tokio::test]
async fn test_email_endpoints_require_known_session() {
    let (_dir, app) = test_app().await;

    let (status, body) = post_json(
        &app,
        "/email/submit",
        serde_json::json!({ "session_id": "session_ghost", "email": "a@b.edu" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _) = post_json(&app, "/email/skip", serde_json::json!({ "session_id": "session_ghost" })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_session_clear_resets_quota() {
    let (_dir, app) = test_app().await;
    let sid = "session_reset";

    for _ in 0..2 {
        chat(&app, sid, "a question about courses").await;
    }
    let body = chat(&app, sid, "blocked now").await;
    assert_eq!(body["require_email"], true);

    let (status, body) = post_json(&app, "/session/clear", serde_json::json!({ "session_id": sid })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let body = chat(&app, sid, "fresh session question").await;
    assert_eq!(body["require_email"], false);
}

#[tokio::test]
async fn test_inline_email_bypasses_gate() {
    let (_dir, app) = test_app().await;
    let sid = "session_inline";

    for _ in 0..2 {
        chat(&app, sid, "a question about hostels").await;
    }

    let (status, body) = post_json(
        &app,
        "/chat",
        serde_json::json!({
            "message": "third question about hostels",
            "session_id": sid,
            "email": "inline@example.edu"
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["require_email"], false);
    assert_eq!(body["answer"], "Admissions close in June.");
}

#[tokio::test]
async fn test_chat_stream_emits_incremental_events() {
    let (_dir, app) = test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/chat/stream")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "message": "when do admissions close", "session_id": "session_sse" })
                .to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);

    let events: Vec<serde_json::Value> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .filter_map(|d| serde_json::from_str(d).ok())
        .collect();

    assert!(events.len() >= 2, "expected partial and terminal events");
    for pair in events.windows(2) {
        let prev = pair[0]["content"].as_str().unwrap_or("");
        let next = pair[1]["content"].as_str().unwrap_or("");
        assert!(next.starts_with(prev), "stream content must grow");
    }

    let terminal = events.last().unwrap();
    assert_eq!(terminal["done"], true);
    assert_eq!(terminal["content"], "Admissions close in June.");
    assert_eq!(terminal["session_id"], "session_sse");
    assert_eq!(events.iter().filter(|e| e["done"] == true).count(), 1);
}

#[tokio::test]
async fn test_stream_disconnect_frees_the_session() {
    let (_dir, app) = test_app_with(Arc::new(ChattyGenerator)).await;
    let sid = "session_disconnect";

    let request = Request::builder()
        .method("POST")
        .uri("/chat/stream")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "message": "tell me everything about admission", "session_id": sid })
                .to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Read one frame, then hang up mid-stream
    let mut body = response.into_body().into_data_stream();
    let _ = body.next().await;
    drop(body);

    // The session must not stay locked by the abandoned stream task
    let (status, follow_up) = tokio::time::timeout(
        Duration::from_secs(5),
        post_json(
            &app,
            "/chat",
            serde_json::json!({ "message": "next question about admission", "session_id": sid }),
        ),
    )
    .await
    .expect("session lock never released after disconnect");
    assert_eq!(status, StatusCode::OK);
    assert_eq!(follow_up["require_email"], false);

    // The abandoned stream consumed no quota: one more free answer,
    // then the wall
    let body = chat(&app, sid, "second question about admission").await;
    assert_eq!(body["require_email"], false);
    let body = chat(&app, sid, "third question about admission").await;
    assert_eq!(body["require_email"], true);
}

#[tokio::test]
async fn test_chat_stream_blocked_session_gets_terminal_event() {
    let (_dir, app) = test_app().await;
    let sid = "session_sse_blocked";

    for _ in 0..2 {
        chat(&app, sid, "a question about placements").await;
    }

    let request = Request::builder()
        .method("POST")
        .uri("/chat/stream")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "message": "one too many", "session_id": sid }).to_string(),
        ))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    let event: serde_json::Value = text
        .lines()
        .find_map(|l| l.strip_prefix("data: "))
        .and_then(|d| serde_json::from_str(d).ok())
        .unwrap();

    assert_eq!(event["require_email"], true);
    assert_eq!(event["skip_allowed"], true);
    assert_eq!(event["skip_count"], 0);
    assert_eq!(event["done"], true);
}
