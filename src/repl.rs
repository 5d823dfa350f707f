//! Interactive console transport.
//!
//! Drives the same gate → pipeline → record-completion sequence as the
//! HTTP server against a single local session. At the quota boundary
//! the prompt explains the `EMAIL_SUBMIT:<address>` and `SKIP_EMAIL`
//! commands; a deferred question is replayed automatically after
//! either one succeeds.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::generate::GeminiGenerator;
use crate::models::AnswerEvent;
use crate::pipeline::Pipeline;
use crate::retrieval::IndexRetriever;
use crate::session::Session;
use crate::store::SessionStore;
use crate::usage::UsageStore;
use crate::{db, migrate};

const EMAIL_COMMAND: &str = "EMAIL_SUBMIT:";
const SKIP_COMMAND: &str = "SKIP_EMAIL";

pub async fn run_repl(config: &Config) -> Result<()> {
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
    let usage = UsageStore::new(pool, config.usage.enabled);

    let mut session = Session::new(SessionStore::new_session_id());
    let limit = config.session.free_query_limit;

    println!("Campus chat. Type a question, or 'exit' to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        tokio::io::stdout().flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim().to_string();

        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }

        if let Some(email) = input.strip_prefix(EMAIL_COMMAND) {
            let outcome = session.submit_email(email.trim());
            println!("{}", outcome.message);
            if outcome.success {
                usage.save_email(email.trim(), &session.session_id).await;
                if let Some(pending) = outcome.pending {
                    answer_question(&pipeline, &usage, &mut session, &pending, limit).await;
                }
            }
            continue;
        }

        if input == SKIP_COMMAND {
            let outcome = session.use_skip(limit);
            println!("{}", outcome.message);
            if outcome.success {
                if let Some(pending) = session.pending_message.clone() {
                    answer_question(&pipeline, &usage, &mut session, &pending, limit).await;
                }
            }
            continue;
        }

        answer_question(&pipeline, &usage, &mut session, &input, limit).await;
    }

    println!("Goodbye!");
    Ok(())
}

/// Gate one question and, if admitted, stream the answer to stdout.
async fn answer_question(
    pipeline: &Arc<Pipeline>,
    usage: &UsageStore,
    session: &mut Session,
    question: &str,
    limit: u32,
) {
    use crate::models::GateDecision;

    let decision = session.gate(question, limit);

    if let GateDecision::RequireEmail { skip_allowed } = decision {
        println!("You've reached the free query limit.");
        println!("Enter {}your@email.com to continue.", EMAIL_COMMAND);
        if skip_allowed {
            println!("Or enter {} to answer this one question without an email.", SKIP_COMMAND);
        }
        return;
    }

    let (tx, mut rx) = mpsc::channel::<AnswerEvent>(32);
    let run = pipeline.run(question, tx);

    let print_events = async {
        let mut printed = 0usize;
        let mut sources = String::new();
        while let Some(ev) = rx.recv().await {
            // Event content is cumulative; print only the new suffix.
            if ev.content.len() > printed {
                if let Some(suffix) = ev.content.get(printed..) {
                    print!("{}", suffix);
                    let _ = tokio::io::stdout().flush().await;
                }
                printed = ev.content.len();
            }
            if ev.done {
                sources = ev.sources;
            }
        }
        sources
    };

    let (outcome, sources) = tokio::join!(run, print_events);
    println!();
    if !sources.is_empty() {
        println!("{}", sources);
    }

    if let crate::pipeline::RunOutcome::Delivered { answer, .. } = outcome {
        session.record_completion(&decision);
        usage
            .log_query(
                &session.session_id,
                session.user_email.as_deref(),
                question,
                answer.len(),
            )
            .await;
    }
}
