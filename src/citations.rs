//! Citation policy: whether to append source links to an answer, and
//! how to rank and render them.
//!
//! The inclusion decision is an ordered rule list evaluated top to
//! bottom; the first matching rule wins, and the same inputs always
//! produce the same outcome.

use crate::models::Passage;

/// Placeholder title written by the ingestion pipeline when a page had
/// no usable title.
const GENERIC_TITLE: &str = "University Information";

const UNCERTAINTY_INDICATORS: [&str; 10] = [
    "i don't have",
    "not available",
    "i cannot find",
    "not enough information",
    "limited information",
    "don't have current information",
    "check the university",
    "please contact",
    "i'm not sure",
    "unable to find",
];

const IMPORTANT_TOPICS: [&str; 32] = [
    "fee",
    "fees",
    "cost",
    "price",
    "tuition",
    "admission",
    "eligibility",
    "requirement",
    "apply",
    "deadline",
    "last date",
    "due date",
    "scholarship",
    "financial aid",
    "hostel",
    "accommodation",
    "mess",
    "placement",
    "internship",
    "job",
    "contact",
    "email",
    "phone",
    "address",
    "course",
    "curriculum",
    "syllabus",
    "program",
    "exam",
    "schedule",
    "timetable",
    "calendar",
];

const SPECIFIC_DATA_INDICATORS: [&str; 15] = [
    "₹",
    "rupees",
    "inr",
    "rs.",
    "@",
    ".com",
    ".in",
    ".edu",
    "phone:",
    "tel:",
    "contact:",
    "deadline:",
    "last date:",
    "eligibility:",
    "requirement:",
];

const CONVERSATIONAL_INDICATORS: [&str; 8] = [
    "hi there",
    "hello",
    "how can i help",
    "feel free to ask",
    "anything else",
    "you're welcome",
    "glad to help",
    "happy to assist",
];

/// Decide whether sources should be shown for an answer.
///
/// Rules, first match wins:
/// 1. Answer signals uncertainty → show.
/// 2. Question touches an important topic (fees, admission, ...) → show.
/// 3. Answer longer than 500 chars → show.
/// 4. Answer carries specific data (currency, emails, labels) → show.
/// 5. Answer is conversational filler → hide.
/// 6. Answer under 100 chars → show only if it contains a digit.
/// 7. Otherwise show iff at least 2 passages and context > 300 chars.
pub fn should_show_sources(
    answer: &str,
    context: &str,
    passages: &[Passage],
    question: &str,
) -> bool {
    let answer_lower = answer.to_lowercase();
    let question_lower = question.to_lowercase();

    if UNCERTAINTY_INDICATORS
        .iter()
        .any(|ind| answer_lower.contains(ind))
    {
        return true;
    }

    if IMPORTANT_TOPICS
        .iter()
        .any(|topic| question_lower.contains(topic))
    {
        return true;
    }

    if answer.len() > 500 {
        return true;
    }

    if SPECIFIC_DATA_INDICATORS
        .iter()
        .any(|ind| answer_lower.contains(ind))
    {
        return true;
    }

    if CONVERSATIONAL_INDICATORS
        .iter()
        .any(|ind| answer_lower.contains(ind))
    {
        return false;
    }

    if answer.len() < 100 {
        return answer.chars().any(|c| c.is_ascii_digit());
    }

    passages.len() >= 2 && context.len() > 300
}

/// Rank passages and render up to three citations as a numbered
/// Markdown link list. Entries without a usable URL are omitted.
///
/// Scoring: +2 when the brand token appears in the title or URL, +1 for
/// a substantive title (longer than 20 chars, not the generic
/// placeholder), +1 for passages over 500 chars.
pub fn format_sources(passages: &[Passage], brand: &str) -> String {
    if passages.is_empty() {
        return String::new();
    }

    let brand_lower = brand.to_lowercase();

    let mut scored: Vec<(i32, &Passage)> = passages
        .iter()
        .map(|p| {
            let title = p.title.as_deref().unwrap_or("");
            let url = p.source_url.as_deref().unwrap_or("");
            let mut score = 0;

            if title.to_lowercase().contains(&brand_lower)
                || url.to_lowercase().contains(&brand_lower)
            {
                score += 2;
            }
            if title.len() > 20 && title != GENERIC_TITLE {
                score += 1;
            }
            if p.text.len() > 500 {
                score += 1;
            }

            (score, p)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));

    let mut sources = String::new();

    // Numbering follows the ranked position, so a skipped entry leaves
    // a gap rather than renumbering the rest.
    for (i, (_, passage)) in scored.iter().take(3).enumerate() {
        let url = match passage.source_url.as_deref() {
            Some(url) if !url.is_empty() && url != "Unknown" => url,
            _ => continue,
        };

        let mut title = passage
            .title
            .clone()
            .unwrap_or_else(|| GENERIC_TITLE.to_string());
        if title.chars().count() > 60 {
            // Char-based, titles from crawled pages are rarely ASCII-only
            title = title.chars().take(57).collect();
            title.push_str("...");
        }

        sources.push_str(&format!("{}. [{title}]({url})\n", i + 1));
    }

    if sources.is_empty() {
        return String::new();
    }

    format!("\n\n**Sources:**\n{sources}")
}
