//! Answer formatting: extract embedded table markup from raw model
//! output and splice rendered Markdown tables into the surrounding text.
//!
//! Two marker conventions are supported: a pre-rendered Markdown block
//! (`<<MARKDOWN_TABLE>> ... <<END_MARKDOWN_TABLE>>`) and a structured
//! headers/rows JSON encoding (`<<TABLE_JSON>> ... <<END_TABLE_JSON>>`).
//! When neither form parses, stray marker tokens are stripped and the
//! text is otherwise returned unchanged.
//!
//! [`format_answer`] is idempotent; the streaming path re-applies it to
//! the growing accumulated buffer on every chunk.

pub const MD_START: &str = "<<MARKDOWN_TABLE>>";
pub const MD_END: &str = "<<END_MARKDOWN_TABLE>>";
pub const JSON_START: &str = "<<TABLE_JSON>>";
pub const JSON_END: &str = "<<END_TABLE_JSON>>";

/// Parse raw model output into clean display text.
pub fn format_answer(raw: &str) -> String {
    // Pre-rendered Markdown table wins; any JSON block is dropped.
    if let Some((before, inner, after)) = split_block(raw, MD_START, MD_END) {
        let mut out = String::new();
        out.push_str(&remove_block(before, JSON_START, JSON_END));
        out.push_str(inner.trim());
        out.push_str(&remove_block(after, JSON_START, JSON_END));
        return out.trim().to_string();
    }

    // Structured JSON table: render to Markdown in place.
    if let Some((before, inner, after)) = split_block(raw, JSON_START, JSON_END) {
        if let Some(table) = render_json_table(inner.trim()) {
            return format!("{before}{table}{after}").trim().to_string();
        }
    }

    strip_stray_markers(raw).trim().to_string()
}

/// True while a streaming accumulation ends in something the formatter
/// will later consume: an opened block missing its closer, an in-flight
/// `<<...>>` token, or a trailing `<` that may become one. Emitting such
/// a prefix would make the visible text shrink once the token completes,
/// so the streaming loop holds these back.
pub fn awaiting_marker_completion(raw: &str) -> bool {
    if block_open(raw, MD_START, MD_END) || block_open(raw, JSON_START, JSON_END) {
        return true;
    }
    // A `<<` whose token has no '>' yet could still close into a
    // strippable `<<...>>`; once a '>' appears the stripper leaves it.
    if let Some(open) = raw.rfind("<<") {
        if !raw[open + 2..].contains('>') {
            return true;
        }
    }
    raw.ends_with('<')
}

fn block_open(text: &str, start: &str, end: &str) -> bool {
    match text.rfind(start) {
        Some(i) => !text[i + start.len()..].contains(end),
        None => false,
    }
}

/// Split `text` around the first complete `start ... end` block.
fn split_block<'a>(
    text: &'a str,
    start: &str,
    end: &str,
) -> Option<(&'a str, &'a str, &'a str)> {
    let s = text.find(start)?;
    let inner_start = s + start.len();
    let e = text[inner_start..].find(end)? + inner_start;
    Some((&text[..s], &text[inner_start..e], &text[e + end.len()..]))
}

/// Remove a complete `start ... end` block including its content.
fn remove_block(text: &str, start: &str, end: &str) -> String {
    match split_block(text, start, end) {
        Some((before, _, after)) => format!("{before}{after}"),
        None => text.to_string(),
    }
}

/// Render a `{ "headers": [...], "rows": [[...]] }` encoding as a
/// Markdown table. Returns `None` when the JSON does not parse into
/// that shape.
fn render_json_table(json_str: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(json_str).ok()?;
    let headers = value.get("headers")?.as_array()?;
    let rows = value.get("rows")?.as_array()?;

    if headers.is_empty() {
        return None;
    }

    let header_cells: Vec<String> = headers.iter().map(cell_text).collect();

    let mut table = String::from("\n| ");
    table.push_str(&header_cells.join(" | "));
    table.push_str(" |\n|");
    table.push_str(&vec!["---"; header_cells.len()].join("|"));
    table.push_str("|\n");

    for row in rows {
        let cells: Vec<String> = row
            .as_array()
            .map(|cells| cells.iter().map(cell_text).collect())
            .unwrap_or_default();
        table.push_str("| ");
        table.push_str(&cells.join(" | "));
        table.push_str(" |\n");
    }

    Some(table)
}

fn cell_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drop leftover marker tokens: bare table markers, unparseable JSON
/// blocks (with their content), and any remaining `<<...>>` token.
fn strip_stray_markers(text: &str) -> String {
    let mut cleaned = text.replace(MD_START, "").replace(MD_END, "");

    while let Some((before, _, after)) = split_block(&cleaned, JSON_START, JSON_END) {
        cleaned = format!("{before}{after}");
    }

    // Remove remaining <<...>> tokens whose content has no '>'.
    let mut out = String::with_capacity(cleaned.len());
    let mut rest = cleaned.as_str();
    while let Some(open) = rest.find("<<") {
        let after_open = &rest[open + 2..];
        match after_open.find(">>") {
            Some(close) if !after_open[..close].contains('>') => {
                out.push_str(&rest[..open]);
                rest = &after_open[close + 2..];
            }
            _ => {
                out.push_str(&rest[..open + 2]);
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markdown_block_spliced_in_place() {
        let raw = "Here are the fees:\n<<MARKDOWN_TABLE>>\n| Degree | Fees |\n|---|---|\n| M.Sc. | 1,20,000 |\n<<END_MARKDOWN_TABLE>>\nLet me know if you need more.";
        let out = format_answer(raw);
        assert!(out.contains("| Degree | Fees |"));
        assert!(!out.contains("<<MARKDOWN_TABLE>>"));
        assert!(!out.contains("<<END_MARKDOWN_TABLE>>"));
        assert!(out.starts_with("Here are the fees:"));
        assert!(out.ends_with("Let me know if you need more."));
    }

    #[test]
    fn test_markdown_block_drops_json_block() {
        let raw = "<<TABLE_JSON>>{\"headers\":[\"a\"],\"rows\":[]}<<END_TABLE_JSON>>\nAnswer\n<<MARKDOWN_TABLE>>| a |<<END_MARKDOWN_TABLE>>";
        let out = format_answer(raw);
        assert!(!out.contains("TABLE_JSON"));
        assert!(out.contains("| a |"));
    }

    #[test]
    fn test_json_table_rendered() {
        let raw = "Fee structure:\n<<TABLE_JSON>>{\"headers\":[\"Degree\",\"Fees\"],\"rows\":[[\"M.Sc.\",\"1,20,000\"],[\"B.Tech\",null]]}<<END_TABLE_JSON>>";
        let out = format_answer(raw);
        assert!(out.contains("| Degree | Fees |"));
        assert!(out.contains("| M.Sc. | 1,20,000 |"));
        assert!(out.contains("| B.Tech |  |"));
        assert!(!out.contains("<<TABLE_JSON>>"));
    }

    #[test]
    fn test_malformed_json_block_stripped() {
        let raw = "Answer text <<TABLE_JSON>>{not json<<END_TABLE_JSON>> more text";
        let out = format_answer(raw);
        assert_eq!(out, "Answer text  more text");
    }

    #[test]
    fn test_stray_markers_removed() {
        let raw = "Text <<SOME_MARKER>> more <<MARKDOWN_TABLE>> text";
        let out = format_answer(raw);
        assert_eq!(out, "Text  more  text");
    }

    #[test]
    fn test_plain_text_unchanged() {
        let raw = "The admission deadline is June 30.";
        assert_eq!(format_answer(raw), raw);
    }

    #[test]
    fn test_idempotence() {
        let inputs = [
            "",
            "plain answer with no markers",
            "Here:\n<<MARKDOWN_TABLE>>| a | b |\n|---|---|\n| 1 | 2 |<<END_MARKDOWN_TABLE>>\ndone",
            "<<TABLE_JSON>>{\"headers\":[\"x\"],\"rows\":[[1]]}<<END_TABLE_JSON>>",
            "<<TABLE_JSON>>broken<<END_TABLE_JSON>>",
            "dangling <<MARKDOWN_TABLE>> start only",
            "weird <<marker>> tokens <<here>>",
            "a < b << c >> d",
        ];
        for input in inputs {
            let once = format_answer(input);
            let twice = format_answer(&once);
            assert_eq!(once, twice, "not idempotent for {input:?}");
        }
    }

    #[test]
    fn test_awaiting_marker_completion() {
        // Held: partial token, open block, trailing angle brackets
        assert!(awaiting_marker_completion("Fees: x <<MARKDOWN_TA"));
        assert!(awaiting_marker_completion("Fees: x <<MARKDOWN_TABLE>>| a |"));
        assert!(awaiting_marker_completion(
            "x <<TABLE_JSON>>{\"headers\":[\"a\"]"
        ));
        assert!(awaiting_marker_completion("x <"));
        assert!(awaiting_marker_completion("x <<"));

        // Not held: plain text, completed tokens, closed blocks
        assert!(!awaiting_marker_completion("plain answer"));
        assert!(!awaiting_marker_completion("x <<FOO>> y"));
        assert!(!awaiting_marker_completion(
            "x <<MARKDOWN_TABLE>>| a |<<END_MARKDOWN_TABLE>> y"
        ));
        assert!(!awaiting_marker_completion("a < b"));
    }

    #[test]
    fn test_incomplete_block_mid_stream() {
        // A streaming prefix that has opened but not closed a block keeps
        // the visible text stable rather than panicking.
        let raw = "Fees below:\n<<MARKDOWN_TABLE>>| partial";
        let out = format_answer(raw);
        assert!(out.starts_with("Fees below:"));
    }
}
