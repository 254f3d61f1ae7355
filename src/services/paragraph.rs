//! Cuts a stream of completion fragments into paragraphs.

/// A paragraph ends at the first blank line.
pub const PARAGRAPH_BREAK: &str = "\n\n";

/// Buffers fragments and releases every complete paragraph as soon as its
/// closing blank line has arrived. Released paragraphs keep the break.
#[derive(Debug, Default)]
pub struct ParagraphSplitter {
    buffer: String,
}

impl ParagraphSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer.push_str(fragment);

        let mut paragraphs = Vec::new();
        while let Some(pos) = self.buffer.find(PARAGRAPH_BREAK) {
            let mut end = pos + PARAGRAPH_BREAK.len();
            // A run of blank lines closes a single paragraph.
            while self.buffer[end..].starts_with('\n') {
                end += 1;
            }
            paragraphs.push(self.buffer.drain(..end).collect());
        }
        paragraphs
    }

    /// Unterminated text left once the stream has ended, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        (!rest.trim().is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split_all(fragments: &[&str]) -> (Vec<String>, Option<String>) {
        let mut splitter = ParagraphSplitter::new();
        let mut paragraphs = Vec::new();
        for fragment in fragments {
            paragraphs.extend(splitter.push(fragment));
        }
        (paragraphs, splitter.finish())
    }

    #[test]
    fn test_flush_on_break_and_keep_remainder() {
        let (paragraphs, rest) = split_all(&["Once", " upon", " a time.\n\n", "The end."]);
        assert_eq!(paragraphs, vec!["Once upon a time.\n\n"]);
        assert_eq!(rest.as_deref(), Some("The end."));
    }

    #[test]
    fn test_break_split_across_fragments() {
        let (paragraphs, rest) = split_all(&["First.\n", "\nSecond.", "\n\n"]);
        assert_eq!(paragraphs, vec!["First.\n\n", "Second.\n\n"]);
        assert!(rest.is_none());
    }

    #[test]
    fn test_several_paragraphs_in_one_fragment() {
        let (paragraphs, rest) = split_all(&["A.\n\nB.\n\n\nC."]);
        assert_eq!(paragraphs, vec!["A.\n\n", "B.\n\n\n"]);
        assert_eq!(rest.as_deref(), Some("C."));
    }

    #[test]
    fn test_whitespace_remainder_is_not_returned() {
        let mut splitter = ParagraphSplitter::new();
        assert!(splitter.push("Done.\n\n").len() == 1);
        assert!(splitter.push("  ").is_empty());
        assert!(splitter.finish().is_none());
        assert_eq!(splitter.push("Next.\n\n"), vec!["Next.\n\n"]);
    }
}
