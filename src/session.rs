//! Free-query/email/skip state machine for anonymous conversations.
//!
//! One pure implementation consumed by every transport (HTTP JSON, SSE,
//! REPL), so gate decisions and counter timing cannot drift between
//! surfaces.
//!
//! # States (while anonymous, with limit `L`)
//!
//! | State | Condition |
//! |-------|-----------|
//! | Free | `query_count < L` |
//! | AtLimit | `query_count == L`, skip unused |
//! | SkippedOnce | `query_count == L`, skip used |
//! | Blocked | `query_count > L` |
//! | Authenticated | `email_provided` (terminal; quota checks bypassed) |
//!
//! `query_count` is incremented only after an answer has been fully
//! delivered, never when a request is blocked or a stream is abandoned.

use chrono::{DateTime, Utc};

use crate::models::GateDecision;

/// Quota/email state for one anonymous conversation.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub query_count: u32,
    pub email_provided: bool,
    pub user_email: Option<String>,
    /// 0 or 1; the one-time skip allowance at the quota boundary.
    pub skip_count: u32,
    /// A message captured while blocked, deferred pending an email/skip
    /// decision. At most one at a time; consumed exactly once.
    pub pending_message: Option<String>,
    /// Set by a successful skip; the next gate check at the boundary
    /// admits one message as a replay without counting it, then clears
    /// this. Pending presence alone is not enough: later blocked
    /// messages also store a pending, and those must stay blocked.
    pub replay_ready: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Result of an email or skip submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub success: bool,
    pub message: String,
    /// The deferred message to replay, when the submission unblocked one.
    pub pending: Option<String>,
}

impl SubmitOutcome {
    fn rejected(message: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            pending: None,
        }
    }
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            query_count: 0,
            email_provided: false,
            user_email: None,
            skip_count: 0,
            pending_message: None,
            replay_ready: false,
            created_at: now,
            last_seen: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl_secs: u64) -> bool {
        (now - self.last_seen).num_seconds() >= ttl_secs as i64
    }

    /// Gate an incoming message. Must be called before any retrieval or
    /// generation work; never awaits.
    ///
    /// After a skip, exactly one follow-up message at the quota boundary
    /// is admitted as a replay of the deferred question without counting
    /// against the quota; any later message in that state is blocked
    /// with no skip offered.
    pub fn gate(&mut self, message: &str, free_query_limit: u32) -> GateDecision {
        self.touch();

        if self.email_provided {
            return GateDecision::Allow;
        }

        if self.query_count < free_query_limit {
            return GateDecision::Allow;
        }

        if self.query_count == free_query_limit {
            if self.skip_count == 0 {
                self.pending_message = Some(message.to_string());
                return GateDecision::RequireEmail { skip_allowed: true };
            }
            if self.replay_ready {
                self.replay_ready = false;
                self.pending_message = None;
                return GateDecision::AllowAsPendingReplay;
            }
            self.pending_message = Some(message.to_string());
            return GateDecision::RequireEmail {
                skip_allowed: false,
            };
        }

        self.pending_message = Some(message.to_string());
        GateDecision::RequireEmail {
            skip_allowed: false,
        }
    }

    /// Record one fully delivered answer. Only `Allow` decisions count
    /// against the quota, and only while the session is anonymous.
    /// Cancelled or blocked requests never reach this.
    pub fn record_completion(&mut self, decision: &GateDecision) {
        self.touch();
        if !self.email_provided && *decision == GateDecision::Allow {
            self.query_count += 1;
        }
    }

    /// Accept an email address for this session.
    ///
    /// Invalid addresses are rejected without mutating any state. On
    /// success quota enforcement is permanently disabled and the stored
    /// pending message (if any) is handed back for replay.
    ///
    /// The skip allowance is reset here, so authenticating regains a
    /// fresh skip. Quota checks are bypassed once `email_provided` is
    /// set, which makes the reset unobservable today; it is kept in
    /// this one place in case the policy ever changes.
    pub fn submit_email(&mut self, email: &str) -> SubmitOutcome {
        if !is_valid_email(email) {
            return SubmitOutcome::rejected("Invalid email format");
        }

        self.touch();
        self.email_provided = true;
        self.user_email = Some(email.to_string());
        self.skip_count = 0;
        self.replay_ready = false;

        SubmitOutcome {
            success: true,
            message: "Email saved successfully".to_string(),
            pending: self.pending_message.take(),
        }
    }

    /// Use the one-time skip allowance at the quota boundary.
    ///
    /// Accepted iff `query_count == free_query_limit` and the skip is
    /// unused; anything else (stale client state, second skip) is
    /// rejected with no side effects. Arms a one-shot replay so the
    /// follow-up gate check admits the resent question without
    /// incrementing.
    pub fn use_skip(&mut self, free_query_limit: u32) -> SubmitOutcome {
        if self.email_provided {
            return SubmitOutcome::rejected("Skip not needed; email already provided.");
        }

        if self.query_count != free_query_limit {
            return SubmitOutcome::rejected("Skip not allowed at this stage.");
        }

        if self.skip_count >= 1 {
            return SubmitOutcome::rejected("Skip already used.");
        }

        self.touch();
        self.skip_count = 1;
        self.replay_ready = true;

        SubmitOutcome {
            success: true,
            message: "Skip accepted. Please wait while we process your previous question."
                .to_string(),
            pending: None,
        }
    }

    /// Take the pending message for immediate replay (skip/email paths on
    /// transports that process in-band rather than waiting for a resend).
    pub fn take_pending(&mut self) -> Option<String> {
        self.pending_message.take()
    }
}

/// Syntactic email check: local part, `@`, domain with a dot-separated
/// alphabetic TLD of at least two characters. Case-insensitive.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._%+-".contains(c))
    {
        return false;
    }

    if domain.contains('@') {
        return false;
    }

    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };

    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || ".-".contains(c))
    {
        return false;
    }

    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}
