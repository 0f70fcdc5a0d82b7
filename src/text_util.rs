/// Maximum number of characters in a snippet before truncation.
pub const DEFAULT_SNIPPET_MAX_CHARS: usize = 240;

/// Characters of context kept before the first match in a snippet.
const SNIPPET_LEAD_CHARS: usize = 60;

/// Collapse every run of whitespace into a single space and trim the ends.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Accumulates text fragments into paragraphs.
///
/// Fragments inside one paragraph are joined with whitespace collapsed;
/// [`ParagraphBuffer::break_paragraph`] closes the current paragraph.
/// Empty paragraphs are dropped.
#[derive(Debug, Default)]
pub struct ParagraphBuffer {
    paragraphs: Vec<String>,
    current: String,
}

impl ParagraphBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, fragment: &str) {
        // A fragment boundary is a word boundary only when the source had
        // whitespace there; "<b>Move</b>Absolute" stays one word.
        let starts_with_space =
            fragment.starts_with(|c: char| c.is_whitespace());
        let ends_with_space = fragment.ends_with(|c: char| c.is_whitespace());
        let collapsed = collapse_whitespace(fragment);

        if collapsed.is_empty() {
            if !fragment.is_empty() && !self.current.is_empty() {
                self.pad();
            }
            return;
        }
        if starts_with_space && !self.current.is_empty() {
            self.pad();
        }
        self.current.push_str(&collapsed);
        if ends_with_space {
            self.pad();
        }
    }

    pub fn break_paragraph(&mut self) {
        let paragraph = self.current.trim_end();
        if !paragraph.is_empty() {
            self.paragraphs.push(paragraph.to_string());
        }
        self.current.clear();
    }

    /// Finish the last paragraph and join all paragraphs with newlines.
    pub fn finish(mut self) -> String {
        self.break_paragraph();
        self.paragraphs.join("\n")
    }

    fn pad(&mut self) {
        if !self.current.ends_with(' ') {
            self.current.push(' ');
        }
    }
}

/// Cut `text` to at most `max_chars` characters, appending "..." when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", text[..byte_idx].trim_end()),
        None => text.to_string(),
    }
}

/// Extract a short snippet around the first occurrence of any of `terms`.
///
/// Matching is case-insensitive and works on whole paragraphs (lines). When
/// no term occurs, the start of the first paragraph is returned. Returns
/// `None` for empty text.
pub fn extract_snippet(text: &str, terms: &[String]) -> Option<String> {
    let first = text.lines().find(|line| !line.trim().is_empty())?;

    for line in text.lines() {
        let lowered = line.to_lowercase();
        // Lowercasing can change byte lengths; only trust positions when it
        // did not.
        if lowered.len() != line.len() {
            if terms.iter().any(|t| lowered.contains(t.as_str())) {
                return Some(truncate_chars(line, DEFAULT_SNIPPET_MAX_CHARS));
            }
            continue;
        }

        let hit = terms
            .iter()
            .filter(|t| !t.is_empty())
            .filter_map(|t| lowered.find(t.as_str()))
            .min();
        if let Some(byte_pos) = hit {
            return Some(window_around(line, byte_pos));
        }
    }

    Some(truncate_chars(first, DEFAULT_SNIPPET_MAX_CHARS))
}

fn window_around(line: &str, byte_pos: usize) -> String {
    let match_char = line[..byte_pos].chars().count();
    let start_char = match_char.saturating_sub(SNIPPET_LEAD_CHARS);
    let start_byte = line
        .char_indices()
        .nth(start_char)
        .map_or(line.len(), |(idx, _)| idx);

    let tail = truncate_chars(&line[start_byte..], DEFAULT_SNIPPET_MAX_CHARS);
    if start_char > 0 {
        format!("...{}", tail.trim_start())
    } else {
        tail
    }
}
