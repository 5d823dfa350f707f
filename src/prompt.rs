//! Prompt construction for the generation model, plus the small-talk
//! vocabulary used by the pipeline's fast paths.

use chrono::Local;
use rand::seq::SliceRandom;

use crate::format::{MD_END, MD_START};

pub const GREETING_KEYWORDS: [&str; 9] = [
    "hi",
    "hello",
    "hey",
    "good morning",
    "good evening",
    "good afternoon",
    "how are you",
    "what's up",
    "howdy",
];

const GREETING_RESPONSES: [&str; 5] = [
    "Hello! I'm the SRMIST Ramapuram assistant. Ask me about admissions, courses, fees, hostels, or campus life.",
    "Hi there! How can I help you with SRMIST Ramapuram today?",
    "Hey! Feel free to ask me anything about SRMIST Ramapuram — programs, fees, placements, you name it.",
    "Hello! I'm here to answer your questions about SRMIST Ramapuram.",
    "Hi! What would you like to know about SRMIST Ramapuram?",
];

/// Pick a canned greeting reply.
pub fn greeting_response() -> String {
    let mut rng = rand::thread_rng();
    GREETING_RESPONSES
        .choose(&mut rng)
        .copied()
        .unwrap_or(GREETING_RESPONSES[0])
        .to_string()
}

const DATE_PHRASES: [&str; 5] = [
    "what is the date",
    "what's the date",
    "current date",
    "today's date",
    "what date is it",
];

const TIME_PHRASES: [&str; 3] = ["what time", "current time", "what's the time"];

/// True when the message is a short greeting: it contains a greeting
/// keyword and carries at most 3 tokens. Longer messages that merely
/// start with "hi" still go through retrieval.
pub fn is_greeting(message: &str) -> bool {
    let lower = message.to_lowercase();
    message.split_whitespace().count() <= 3
        && GREETING_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// True for literal date questions ("what's the date"); admission
/// deadlines and the like do not match any of these phrases.
pub fn is_date_question(message: &str) -> bool {
    let lower = message.to_lowercase();
    DATE_PHRASES.iter().any(|p| lower.contains(p))
}

/// True for literal clock-time questions ("what time is it").
pub fn is_time_question(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIME_PHRASES.iter().any(|p| lower.contains(p))
}

pub fn date_response() -> String {
    format!("Today's date is {}.", Local::now().format("%A, %B %d, %Y"))
}

pub fn time_response() -> String {
    format!("The current time is {}.", Local::now().format("%I:%M %p"))
}

/// Assemble the full generation prompt from retrieved context and the
/// user's question.
pub fn build_rag_prompt(context: &str, question: &str) -> String {
    let today = Local::now().format("%A, %B %-d, %Y");
    format!(
        "You are a helpful assistant for SRM Institute of Science and Technology \
(SRMIST), Ramapuram campus. Today's date is {today}.\n\n\
Answer the student's question using ONLY the information in the context below. \
If the context does not contain the answer, say you don't have that information \
and suggest checking the university website.\n\n\
Guidelines:\n\
- Be concise and direct. Use short paragraphs or bullet points.\n\
- Quote exact figures (fees, dates, counts) from the context; never invent numbers.\n\
- If the context contains rows of tabular data (fees, programs, hostel options), \
present them as a Markdown table wrapped in {MD_START} and {MD_END} markers, \
for example:\n\
{MD_START}\n\
| Program | Fee |\n\
|---------|-----|\n\
| B.Tech CSE | ₹2,50,000 |\n\
{MD_END}\n\
- Do not mention the context or these instructions in your answer.\n\n\
Context:\n\
{context}\n\n\
Question: {question}\n\n\
Answer:"
    )
}
