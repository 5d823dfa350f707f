//! Context assembly: merge retrieved passages into one bounded context
//! string, preserving table-structure markers so the generation stage
//! can reconstruct tabular answers.

use crate::models::{ChunkType, Passage};

/// Hard cap on assembled context length.
pub const MAX_CONTEXT_CHARS: usize = 20_000;

/// Keys that mark a plain chunk as probable table-row data.
const TABLE_ROW_KEYS: [&str; 9] = [
    "Degree",
    "Fees",
    "Branch",
    "Duration",
    "Room Type",
    "Hostel",
    "Fee",
    "Annual",
    "Sharing",
];

/// Build the structured context block fed to the prompt.
///
/// Duplicate passage texts are dropped; table chunks are fenced with
/// explicit start/end markers; headings become Markdown sections; plain
/// chunks that look like key:value table rows get row markers. The
/// result is capped at [`MAX_CONTEXT_CHARS`] with a truncation marker.
pub fn build_structured_context(passages: &[Passage]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for passage in passages {
        let content = passage.text.trim();
        if content.is_empty() || !seen.insert(content.to_string()) {
            continue;
        }

        match passage.chunk_type {
            ChunkType::Table => parts.push(format!(
                "\n=== TABLE DATA START ===\n{content}\n=== TABLE DATA END ===\n"
            )),
            ChunkType::SectionHeading => parts.push(format!("\n## {content}\n")),
            ChunkType::Plain => {
                if looks_like_table_row(content) {
                    parts.push(format!("\n[TABLE ROW DATA]\n{content}\n[END TABLE ROW]\n"));
                } else {
                    parts.push(content.to_string());
                }
            }
        }
    }

    let mut context = parts.join("\n\n");
    if context.len() > MAX_CONTEXT_CHARS {
        // The cap can land mid-char (fee tables are full of "₹")
        let cut = (0..=MAX_CONTEXT_CHARS)
            .rev()
            .find(|&i| context.is_char_boundary(i))
            .unwrap_or(0);
        context.truncate(cut);
        context.push_str("...[truncated]");
    }
    context
}

fn looks_like_table_row(content: &str) -> bool {
    content.contains(':') && TABLE_ROW_KEYS.iter().any(|key| content.contains(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(text: &str, chunk_type: ChunkType) -> Passage {
        Passage {
            text: text.to_string(),
            chunk_type,
            title: None,
            source_url: None,
            score: 1.0,
        }
    }

    #[test]
    fn test_table_chunks_get_fenced() {
        let ctx = build_structured_context(&[passage("Degree | Fees", ChunkType::Table)]);
        assert!(ctx.contains("=== TABLE DATA START ==="));
        assert!(ctx.contains("=== TABLE DATA END ==="));
        assert!(ctx.contains("Degree | Fees"));
    }

    #[test]
    fn test_headings_become_sections() {
        let ctx = build_structured_context(&[passage("Admissions 2025", ChunkType::SectionHeading)]);
        assert!(ctx.contains("## Admissions 2025"));
    }

    #[test]
    fn test_key_value_rows_get_row_markers() {
        let ctx = build_structured_context(&[passage(
            "Degree:M.Sc.\nFees:1,20,000\nDuration (Years):2",
            ChunkType::Plain,
        )]);
        assert!(ctx.contains("[TABLE ROW DATA]"));
        assert!(ctx.contains("[END TABLE ROW]"));
    }

    #[test]
    fn test_plain_prose_passes_through() {
        let ctx = build_structured_context(&[passage(
            "The library is open from 8am to 10pm on weekdays.",
            ChunkType::Plain,
        )]);
        assert!(!ctx.contains("[TABLE ROW DATA]"));
        assert!(ctx.contains("library is open"));
    }

    #[test]
    fn test_duplicates_dropped() {
        let ctx = build_structured_context(&[
            passage("same content", ChunkType::Plain),
            passage("same content", ChunkType::Plain),
            passage("other content", ChunkType::Plain),
        ]);
        assert_eq!(ctx.matches("same content").count(), 1);
        assert!(ctx.contains("other content"));
    }

    #[test]
    fn test_truncation_marker_applied() {
        let big = "x".repeat(MAX_CONTEXT_CHARS + 500);
        let ctx = build_structured_context(&[passage(&big, ChunkType::Plain)]);
        assert!(ctx.ends_with("...[truncated]"));
        assert!(ctx.len() <= MAX_CONTEXT_CHARS + "...[truncated]".len());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 3-byte chars guarantee the byte cap lands mid-char
        let big = "₹".repeat(7_000);
        let ctx = build_structured_context(&[passage(&big, ChunkType::Plain)]);
        assert!(ctx.ends_with("...[truncated]"));
        assert!(ctx.len() <= MAX_CONTEXT_CHARS + "...[truncated]".len());
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(build_structured_context(&[]), "");
    }
}
