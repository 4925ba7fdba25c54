use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::constants::{DEFAULT_OVERLAP, DEFAULT_WINDOW};
use crate::error::{CoreError, CoreResult};

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static LEADING_PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+\s+").unwrap());
static HYPHEN_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\w+)-\s+(\w+)").unwrap());

/// Normalize extracted document text before segmentation and extraction.
/// Curly quotes become straight, words split across a line break are rejoined,
/// whitespace collapses, a leading page number is dropped.
pub fn clean_text(text: &str) -> String {
    let quoted: String = text
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect();
    let collapsed = WHITESPACE.replace_all(&quoted, " ");
    let trimmed = collapsed.trim_start();
    let unnumbered = LEADING_PAGE_NUMBER.replace(trimmed, "");
    HYPHEN_BREAK
        .replace_all(&unnumbered, "${1}${2}")
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    pub window: usize,
    pub overlap: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

/// Splits text into overlapping word windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    window: usize,
    overlap: usize,
}

impl Segmenter {
    pub fn new(window: usize, overlap: usize) -> CoreResult<Self> {
        if window == 0 {
            return Err(CoreError::config("segment window must be at least 1 word"));
        }
        if overlap >= window {
            return Err(CoreError::config(format!(
                "segment overlap ({overlap}) must be smaller than window ({window})"
            )));
        }
        Ok(Self { window, overlap })
    }

    pub fn from_config(config: &SegmentConfig) -> CoreResult<Self> {
        Self::new(config.window, config.overlap)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Lazily yields chunks of `text`. Calling again restarts from the first window.
    pub fn segments<'a>(&self, text: &'a str) -> Segments<'a> {
        Segments {
            words: text.split_whitespace().collect(),
            window: self.window,
            step: self.window - self.overlap,
            start: 0,
        }
    }

    pub fn segment(&self, text: &str) -> Vec<String> {
        self.segments(text).collect()
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

pub struct Segments<'a> {
    words: Vec<&'a str>,
    window: usize,
    step: usize,
    start: usize,
}

impl Iterator for Segments<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.start >= self.words.len() {
            return None;
        }
        let end = (self.start + self.window).min(self.words.len());
        let chunk = self.words[self.start..end].join(" ");
        self.start += self.step;
        Some(chunk)
    }
}

/// Free-function form of [`Segmenter::segment`].
pub fn segment(text: &str, window: usize, overlap: usize) -> CoreResult<Vec<String>> {
    Ok(Segmenter::new(window, overlap)?.segment(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(Segmenter::new(0, 0), Err(CoreError::Config(_))));
        assert!(matches!(Segmenter::new(5, 5), Err(CoreError::Config(_))));
        assert!(matches!(Segmenter::new(5, 9), Err(CoreError::Config(_))));
        assert!(Segmenter::new(5, 4).is_ok());
    }

    #[test]
    fn test_overlapping_windows() {
        let chunks = segment("a b c d e f g", 4, 2).unwrap();
        assert_eq!(chunks, vec!["a b c d", "c d e f", "e f g"]);
    }

    #[test]
    fn test_trailing_window_after_full_reach() {
        // a window starts at every word index below the count
        let chunks = segment("a b c d e f", 4, 2).unwrap();
        assert_eq!(chunks, vec!["a b c d", "c d e f", "e f"]);
    }

    #[test]
    fn test_window_count_follows_step() {
        let words: Vec<String> = (0..10).map(|i| format!("w{i}")).collect();
        let chunks = segment(&words.join(" "), 5, 2).unwrap();
        // starts at 0, 3, 6, 9
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3], "w9");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(segment("", 10, 2).unwrap().is_empty());
        assert!(segment("   \n\t ", 10, 2).unwrap().is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        assert_eq!(segment("one two", 1200, 150).unwrap(), vec!["one two"]);
    }

    #[test]
    fn test_restartable() {
        let seg = Segmenter::new(3, 1).unwrap();
        let text = "a b c d e f g h";
        let first: Vec<_> = seg.segments(text).collect();
        let second: Vec<_> = seg.segments(text).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_clean_text() {
        let raw = "12   \u{201C}Duty\u{201D} is   philo-\n  sophy\u{2019}s   care.\n";
        assert_eq!(clean_text(raw), "\"Duty\" is philosophy's care.");
    }

    #[test]
    fn test_clean_text_keeps_inner_numbers() {
        assert_eq!(clean_text("In 1900 he wrote"), "In 1900 he wrote");
    }

    proptest! {
        #[test]
        fn prop_zero_overlap_concatenates(words in proptest::collection::vec("[a-z]{1,8}", 0..60), window in 1usize..12) {
            let text = words.join("  \n ");
            let chunks = segment(&text, window, 0).unwrap();
            prop_assert_eq!(chunks.join(" "), words.join(" "));
        }

        #[test]
        fn prop_chunks_never_exceed_window(words in proptest::collection::vec("[a-z]{1,5}", 1..80), window in 2usize..10, overlap in 0usize..2) {
            let text = words.join(" ");
            for chunk in segment(&text, window, overlap).unwrap() {
                prop_assert!(chunk.split(' ').count() <= window);
            }
        }
    }
}
