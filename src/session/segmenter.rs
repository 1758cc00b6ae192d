//! Batches chat deltas into speakable segments for synthesis.

/// Characters that close a segment
const TERMINATORS: &[char] = &['。', '！', '？', '.', '!', '?', '\n'];

#[derive(Debug)]
pub struct SentenceSegmenter {
    buffer: String,
    max_chars: usize,
}

impl SentenceSegmenter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_chars: max_chars.max(1),
        }
    }

    /// Add a delta. Returns a segment when the delta closes a sentence or the
    /// buffered text reaches the length limit.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.buffer.push_str(delta);
        let closes = delta.contains(TERMINATORS);
        let long = self.buffer.trim().chars().count() >= self.max_chars;
        if closes || long { self.take() } else { None }
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn take(&mut self) -> Option<String> {
        let segment = self.buffer.trim().to_string();
        self.buffer.clear();
        (!segment.is_empty()).then_some(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_terminators() {
        let mut seg = SentenceSegmenter::new(50);
        assert_eq!(seg.push("Hello"), None);
        assert_eq!(seg.push(" world."), Some("Hello world.".to_string()));
        assert_eq!(seg.push("你好"), None);
        assert_eq!(seg.push("！"), Some("你好！".to_string()));
        assert_eq!(seg.finish(), None);
    }

    #[test]
    fn test_splits_on_length() {
        let mut seg = SentenceSegmenter::new(5);
        assert_eq!(seg.push("abc"), None);
        assert_eq!(seg.push("def"), Some("abcdef".to_string()));
        assert_eq!(seg.pending(), "");
    }

    #[test]
    fn test_never_emits_blank_segments() {
        let mut seg = SentenceSegmenter::new(50);
        assert_eq!(seg.push("  \n"), None);
        assert_eq!(seg.push("   "), None);
        assert_eq!(seg.finish(), None);
    }

    #[test]
    fn test_finish_flushes_remainder() {
        let mut seg = SentenceSegmenter::new(50);
        seg.push("no terminator here");
        assert_eq!(seg.finish(), Some("no terminator here".to_string()));
    }
}
