//! Accumulates streamed generator fragments into one effect source.

use tokio::sync::watch;

use crate::core::types::EffectSource;

/// Order-preserving concatenation of generator fragments.
///
/// Every append republishes the full text on the optional preview channel.
/// The accumulator is consumed either by [`finalize`](Self::finalize) on a
/// completed stream or by [`discard`](Self::discard) when the stream broke, so
/// truncated text can never reach the normalizer.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    fragments: usize,
    preview: Option<watch::Sender<String>>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulator that publishes each intermediate text to `preview`.
    pub fn with_preview(preview: watch::Sender<String>) -> Self {
        Self {
            preview: Some(preview),
            ..Self::default()
        }
    }

    /// Append `fragment` (possibly empty) and return the text so far.
    pub fn append(&mut self, fragment: &str) -> &str {
        self.text.push_str(fragment);
        self.fragments += 1;
        if let Some(preview) = &self.preview {
            preview.send_replace(self.text.clone());
        }
        &self.text
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Number of fragments appended, empty ones included.
    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// Complete the stream and hand the full text on.
    pub fn finalize(self) -> EffectSource {
        EffectSource::new(self.text)
    }

    /// Drop the partial text after a stream error. Returns the bytes dropped.
    pub fn discard(self) -> usize {
        self.text.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_concatenates_in_order() {
        let mut acc = StreamAccumulator::new();
        assert_eq!(acc.append("function createAnimation("), "function createAnimation(");
        assert_eq!(
            acc.append("container) {}"),
            "function createAnimation(container) {}"
        );
        assert_eq!(acc.fragment_count(), 2);
    }

    /// Empty fragments are counted and leave the text untouched.
    #[test]
    fn empty_fragments_are_kept() {
        let mut acc = StreamAccumulator::new();
        acc.append("a");
        acc.append("");
        acc.append("b");
        assert_eq!(acc.fragment_count(), 3);
        assert_eq!(acc.finalize().as_str(), "ab");
    }

    #[test]
    fn append_publishes_preview() {
        let (tx, rx) = watch::channel(String::new());
        let mut acc = StreamAccumulator::with_preview(tx);
        acc.append("let x");
        assert_eq!(*rx.borrow(), "let x");
        acc.append(" = 1;");
        assert_eq!(*rx.borrow(), "let x = 1;");
    }

    #[test]
    fn discard_reports_dropped_bytes() {
        let mut acc = StreamAccumulator::new();
        acc.append("partial");
        assert_eq!(acc.discard(), 7);
    }
}
