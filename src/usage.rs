//! Usage tracking: captured emails and per-query logs.
//!
//! Both writes are best-effort. A failed insert is logged and swallowed
//! so accounting problems never break an in-flight answer.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;

const MAX_LOGGED_QUERY_CHARS: usize = 500;

#[derive(Clone)]
pub struct UsageStore {
    pool: SqlitePool,
    enabled: bool,
}

impl UsageStore {
    pub fn new(pool: SqlitePool, enabled: bool) -> Self {
        Self { pool, enabled }
    }

    /// Record a captured email, bumping counters on repeat submissions.
    pub async fn save_email(&self, email: &str, session_id: &str) {
        if !self.enabled {
            return;
        }
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            INSERT INTO email_users (email, created_at, last_used, total_queries, session_id)
            VALUES (?1, ?2, ?2, 1, ?3)
            ON CONFLICT(email) DO UPDATE SET
                last_used = ?2,
                total_queries = total_queries + 1,
                session_id = ?3
            "#,
        )
        .bind(email)
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to save email: {}", e);
        }
    }

    /// Log one answered query. The query text is clamped so a pasted
    /// wall of text cannot bloat the log table.
    pub async fn log_query(
        &self,
        session_id: &str,
        email: Option<&str>,
        query: &str,
        response_length: usize,
    ) {
        if !self.enabled {
            return;
        }
        let stored: String = query.chars().take(MAX_LOGGED_QUERY_CHARS).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO usage_logs (session_id, email, query, query_length, response_length, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(session_id)
        .bind(email)
        .bind(&stored)
        .bind(query.chars().count() as i64)
        .bind(response_length as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to log query: {}", e);
        }
    }
}
