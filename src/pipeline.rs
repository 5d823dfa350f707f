//! Streaming response coordinator.
//!
//! Drives retrieval → context assembly → generation → formatting for
//! one question, pushing [`AnswerEvent`]s into a sink channel. Event
//! content grows by accumulation until the single terminal event, which
//! also carries the citations block. Fast paths (greetings, date/time,
//! no relevant passages) emit the terminal event directly.
//!
//! The caller owns post-delivery accounting: [`RunOutcome::Delivered`]
//! means the sink accepted the terminal event, and only then should
//! quota counters or usage logs be touched. A dropped sink means the
//! client went away; generation is abandoned and nothing is recorded.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::citations::{format_sources, should_show_sources};
use crate::config::RetrievalConfig;
use crate::context::build_structured_context;
use crate::format::{awaiting_marker_completion, format_answer};
use crate::generate::{Generator, DEGRADE_MESSAGE};
use crate::models::{AnswerEvent, Passage};
use crate::prompt;
use crate::retrieval::Retriever;

pub const MAX_MESSAGE_CHARS: usize = 1000;
pub const EMPTY_MESSAGE: &str = "Please ask a question about the university.";
pub const OVERSIZED_MESSAGE: &str = "Please keep your questions under 1000 characters.";
pub const RETRIEVAL_ERROR_MESSAGE: &str =
    "I'm having trouble accessing the knowledge base. Please try again.";
pub const GENERIC_ERROR_MESSAGE: &str =
    "I encountered an error processing your question. Please try again.";

const MIN_CONTEXT_CHARS: usize = 100;

const NO_EVENTS_MESSAGE: &str = "I don't have current information about upcoming events in my \
database. Please check the university's official website or contact the student affairs office \
for the latest event schedule.";
const NO_DOCS_MESSAGE: &str = "I don't have specific information about that topic in my \
database. Could you please rephrase your question or ask about something more specific to the \
university?";
const THIN_CONTEXT_MESSAGE: &str = "I found some related information, but it's not detailed \
enough to provide a comprehensive answer. Please try rephrasing your question or ask about a \
more specific topic.";

/// Reject messages that should never reach the gate or the pipeline.
/// Returns the canned reply for invalid input.
pub fn validate_message(message: &str) -> Option<&'static str> {
    if message.trim().is_empty() {
        return Some(EMPTY_MESSAGE);
    }
    if message.chars().count() > MAX_MESSAGE_CHARS {
        return Some(OVERSIZED_MESSAGE);
    }
    None
}

/// What happened to the terminal event.
#[derive(Debug)]
pub enum RunOutcome {
    /// The sink accepted the terminal event; `answer`/`sources` mirror it.
    Delivered { answer: String, sources: String },
    /// The sink was dropped before the terminal event landed.
    ClientGone,
}

pub struct Pipeline {
    retriever: Arc<dyn Retriever>,
    generator: Arc<dyn Generator>,
    retrieval: RetrievalConfig,
}

impl Pipeline {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn Generator>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            retriever,
            generator,
            retrieval,
        }
    }

    /// Answer one question, streaming events into `tx`. Internal faults
    /// never escape: they degrade to [`GENERIC_ERROR_MESSAGE`].
    pub async fn run(&self, question: &str, tx: mpsc::Sender<AnswerEvent>) -> RunOutcome {
        match self.run_inner(question, &tx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Pipeline error for question: {}", e);
                finish(&tx, GENERIC_ERROR_MESSAGE, "").await
            }
        }
    }

    /// Non-streaming variant: same stages, but generation goes through
    /// the blocking [`Generator::complete`] call and only the final
    /// `(answer, sources)` pair is returned.
    pub async fn answer(&self, question: &str) -> (String, String) {
        let (passages, context, rag_prompt) = match self.prepare(question).await {
            Prepared::Canned(reply) => return (reply, String::new()),
            Prepared::Generate {
                passages,
                context,
                prompt,
            } => (passages, context, prompt),
        };

        let raw = match self.generator.complete(&rag_prompt).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Generation failed: {}", e);
                return (DEGRADE_MESSAGE.to_string(), String::new());
            }
        };

        let final_answer = format_answer(&raw);
        if final_answer.trim().is_empty() {
            return (DEGRADE_MESSAGE.to_string(), String::new());
        }

        let sources = self.sources_for(&final_answer, &context, &passages, question);
        (final_answer, sources)
    }

    /// Run the stages shared by both variants: validation, fast paths,
    /// retrieval, context assembly, prompt construction.
    async fn prepare(&self, question: &str) -> Prepared {
        if let Some(reply) = validate_message(question) {
            return Prepared::Canned(reply.to_string());
        }

        if prompt::is_date_question(question) {
            return Prepared::Canned(prompt::date_response());
        }
        if prompt::is_time_question(question) {
            return Prepared::Canned(prompt::time_response());
        }
        if prompt::is_greeting(question) {
            return Prepared::Canned(prompt::greeting_response());
        }

        let passages = match self.retriever.search(question, self.retrieval.top_k).await {
            Ok(passages) => passages,
            Err(e) => {
                warn!("Retriever error: {}", e);
                return Prepared::Canned(RETRIEVAL_ERROR_MESSAGE.to_string());
            }
        };

        if passages.is_empty() {
            return Prepared::Canned(no_docs_response(question).to_string());
        }

        let context = build_structured_context(&passages);
        if context.len() < MIN_CONTEXT_CHARS {
            return Prepared::Canned(THIN_CONTEXT_MESSAGE.to_string());
        }

        let prompt = prompt::build_rag_prompt(&context, question);
        Prepared::Generate {
            passages,
            context,
            prompt,
        }
    }

    fn sources_for(
        &self,
        answer: &str,
        context: &str,
        passages: &[Passage],
        question: &str,
    ) -> String {
        if should_show_sources(answer, context, passages, question) {
            format_sources(passages, &self.retrieval.brand)
        } else {
            String::new()
        }
    }

    async fn run_inner(
        &self,
        question: &str,
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> anyhow::Result<RunOutcome> {
        let (passages, context, rag_prompt) = match self.prepare(question).await {
            Prepared::Canned(reply) => return Ok(finish(tx, &reply, "").await),
            Prepared::Generate {
                passages,
                context,
                prompt,
            } => (passages, context, prompt),
        };

        let (gen_tx, mut gen_rx) = mpsc::channel::<String>(32);
        let generator = Arc::clone(&self.generator);
        let gen_task =
            tokio::spawn(async move { generator.stream(&rag_prompt, gen_tx).await });

        let mut accumulated = String::new();
        while let Some(chunk) = gen_rx.recv().await {
            accumulated.push_str(&chunk);
            // Hold back while a marker token is in flight; emitting it
            // would make the visible text shrink once it completes.
            if awaiting_marker_completion(&accumulated) {
                continue;
            }
            let formatted = format_answer(&accumulated);
            if tx.send(AnswerEvent::partial(formatted)).await.is_err() {
                // Client disconnected mid-stream: stop generating,
                // record nothing.
                gen_task.abort();
                return Ok(RunOutcome::ClientGone);
            }
        }

        match gen_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if accumulated.is_empty() {
                    warn!("Generation failed before any output: {}", e);
                    return Ok(finish(tx, DEGRADE_MESSAGE, "").await);
                }
                // Partial output already reached the client; finalize
                // what we have rather than retracting it.
                warn!("Generation failed mid-stream, finalizing partial answer: {}", e);
            }
            Err(join_err) => anyhow::bail!("generation task failed: {}", join_err),
        }

        let final_answer = format_answer(&accumulated);
        if final_answer.trim().is_empty() {
            return Ok(finish(tx, DEGRADE_MESSAGE, "").await);
        }

        let sources = self.sources_for(&final_answer, &context, &passages, question);
        Ok(finish(tx, &final_answer, &sources).await)
    }
}

/// Outcome of the shared pre-generation stages.
enum Prepared {
    /// A fixed reply that skips generation entirely.
    Canned(String),
    /// Everything needed to call the generation backend.
    Generate {
        passages: Vec<Passage>,
        context: String,
        prompt: String,
    },
}

fn no_docs_response(question: &str) -> &'static str {
    let lower = question.to_lowercase();
    if lower.contains("event") || lower.contains("upcoming") {
        NO_EVENTS_MESSAGE
    } else {
        NO_DOCS_MESSAGE
    }
}

async fn finish(tx: &mpsc::Sender<AnswerEvent>, content: &str, sources: &str) -> RunOutcome {
    let event = AnswerEvent::terminal(content, sources);
    if tx.send(event).await.is_ok() {
        RunOutcome::Delivered {
            answer: content.to_string(),
            sources: sources.to_string(),
        }
    } else {
        RunOutcome::ClientGone
    }
}
