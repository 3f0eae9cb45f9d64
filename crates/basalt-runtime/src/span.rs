//! Source location tracking

use serde::{Deserialize, Serialize};

/// A half-open character range in the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Starting character offset
    pub start: usize,
    /// Ending character offset (exclusive)
    pub end: usize,
}

impl Span {
    /// Create a new span
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Create a dummy span for testing
    pub fn dummy() -> Self {
        Self { start: 0, end: 0 }
    }

    /// Length of the span in characters
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Whether the span covers no bytes
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let span = Span::new(2, 10);
        assert_eq!(span.start, 2);
        assert_eq!(span.len(), 8);
        assert!(!span.is_empty());
    }
}
