//! Error types with source location tracking.
//!
//! Every static error surfaced by the core carries a [`Span`] pointing
//! at the node that produced it, so the diagnostic list can render a
//! source-located message without walking the tree a second time.
//!
//! # Example
//!
//! ```
//! use a68_base::{SpannedError, Span, Result};
//!
//! fn check_dimension(n: i64, span: Span) -> Result<()> {
//!     if n < 1 {
//!         return Err(SpannedError::new("invalid dimension in declarer", span));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_dimension(0, Span::new(0, 4)).unwrap_err();
//! assert!(err.to_string().contains("invalid dimension"));
//! ```

use crate::span::Span;
use std::fmt;

/// An error annotated with its source location.
///
/// Implements [`std::error::Error`] and [`fmt::Display`]. The display format is:
/// `{message} at {start}..{end}`.
#[derive(Debug, Clone)]
pub struct SpannedError {
    /// Human-readable error description.
    pub message: String,
    /// Location in source where the error occurred.
    pub span: Span,
}

impl SpannedError {
    /// Creates an error with the given message and source location.
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl fmt::Display for SpannedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}..{}", self.message, self.span.start, self.span.end)
    }
}

impl std::error::Error for SpannedError {}

/// Alias for `std::result::Result<T, SpannedError>`.
pub type Result<T> = std::result::Result<T, SpannedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spanned_error_display() {
        let err = SpannedError::new("cyclic mode", Span::new(5, 10));
        let display = format!("{}", err);
        assert!(display.contains("cyclic mode"));
        assert!(display.contains("5..10"));
    }
}
