//! Static and runtime error kinds, and the diagnostic list / traceback
//! machinery.

use std::fmt;

use a68_base::Span;

use crate::runtime::frame::FramePointer;

/// A static error: accumulates in a [`Diagnostics`] list and
/// is never individually fatal. Evaluation is only attempted once the
/// accumulated count is zero.
#[derive(Debug, Clone)]
pub enum StaticErrorKind {
    CannotCoerce { from: String, to: String, context: String },
    CyclicMode,
    IllFormedMode,
    UndeclaredIndicant { name: String },
    UndeclaredIdentifier { name: String },
    UndeclaredOperator { symbol: String },
    AmbiguousSpecifier,
    InvalidDimension,
    NotAUnitedMode { mode: String },
}

impl fmt::Display for StaticErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticErrorKind::CannotCoerce { from, to, context } => {
                write!(f, "cannot coerce {from} to {to} in {context} context")
            }
            StaticErrorKind::CyclicMode => write!(f, "cyclic mode"),
            StaticErrorKind::IllFormedMode => write!(f, "ill-formed mode"),
            StaticErrorKind::UndeclaredIndicant { name } => {
                write!(f, "indicant {name} not declared in range")
            }
            StaticErrorKind::UndeclaredIdentifier { name } => {
                write!(f, "identifier {name} not declared in range")
            }
            StaticErrorKind::UndeclaredOperator { symbol } => {
                write!(f, "operator {symbol} has not been declared in this range")
            }
            StaticErrorKind::AmbiguousSpecifier => write!(f, "ambiguous mode in specifier"),
            StaticErrorKind::InvalidDimension => write!(f, "invalid dimension in declarer"),
            StaticErrorKind::NotAUnitedMode { mode } => write!(f, "{mode} is not a united mode"),
        }
    }
}

/// A source-located static error.
#[derive(Debug, Clone)]
pub struct StaticError {
    pub kind: StaticErrorKind,
    pub span: Span,
}

impl fmt::Display for StaticError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}..{}", self.kind, self.span.start, self.span.end)
    }
}

impl std::error::Error for StaticError {}

/// A runtime error, split into the two propagation policies the spec
/// distinguishes: recoverable diagnostics that downgrade to a warning, and
/// fatal errors that longjump to the top-level handler.
#[derive(Debug, Clone)]
pub enum RuntimeErrorKind {
    // Recoverable as diagnostics.
    PrecisionNotImplemented,
    ValueVoided,

    // Fatal.
    NilNameDereference,
    UninitialisedValue,
    IndexOutOfBounds { index: i64, lower: i64, upper: i64 },
    TrimmerBoundsMismatch,
    ScopeViolation,
    IntegerOverflow,
    RealOverflow,
    DivisionByZero,
    ArithmeticException,
    InvalidArgument { operation: String },
    HeapExhausted,
    JumpAcrossThreads,
    AssertionFalse,
    PrecisionOutOfRange,
}

impl RuntimeErrorKind {
    /// Whether this kind longjumps to the interpreter's exit label rather
    /// than accumulating as a recoverable diagnostic.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RuntimeErrorKind::PrecisionNotImplemented | RuntimeErrorKind::ValueVoided
        )
    }
}

impl fmt::Display for RuntimeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeErrorKind::PrecisionNotImplemented => {
                write!(f, "precision not implemented, downgraded")
            }
            RuntimeErrorKind::ValueVoided => write!(f, "value voided"),
            RuntimeErrorKind::NilNameDereference => write!(f, "nil name dereference"),
            RuntimeErrorKind::UninitialisedValue => write!(f, "value is uninitialised"),
            RuntimeErrorKind::IndexOutOfBounds { index, lower, upper } => {
                write!(f, "index {index} out of bounds {lower}:{upper}")
            }
            RuntimeErrorKind::TrimmerBoundsMismatch => write!(f, "bounds mismatch in trimmer"),
            RuntimeErrorKind::ScopeViolation => {
                write!(f, "scope violation on name/proc/format assignment or return")
            }
            RuntimeErrorKind::IntegerOverflow => write!(f, "integer overflow"),
            RuntimeErrorKind::RealOverflow => write!(f, "real overflow"),
            RuntimeErrorKind::DivisionByZero => write!(f, "division by zero"),
            RuntimeErrorKind::ArithmeticException => {
                write!(f, "arithmetic exception from numeric collaborator")
            }
            RuntimeErrorKind::InvalidArgument { operation } => {
                write!(f, "invalid argument to primitive {operation}")
            }
            RuntimeErrorKind::HeapExhausted => write!(f, "heap exhausted after collection"),
            RuntimeErrorKind::JumpAcrossThreads => write!(f, "label jump across threads"),
            RuntimeErrorKind::AssertionFalse => write!(f, "assertion false"),
            RuntimeErrorKind::PrecisionOutOfRange => {
                write!(f, "precision implementation out of range on storage")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: RuntimeErrorKind,
    pub span: Span,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}..{}", self.kind, self.span.start, self.span.end)
    }
}

impl std::error::Error for RuntimeError {}

/// One frame's contribution to a [`Traceback`].
#[derive(Debug, Clone, Copy)]
pub struct TracebackFrame {
    pub frame: FramePointer,
    pub span: Span,
}

/// A stack traceback, built by walking the live dynamic-link chain at the
/// point a fatal [`RuntimeError`] is raised.
#[derive(Debug, Clone, Default)]
pub struct Traceback {
    pub frames: Vec<TracebackFrame>,
}

impl fmt::Display for Traceback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tf) in self.frames.iter().enumerate() {
            writeln!(f, "  #{i} at {}..{}", tf.span.start, tf.span.end)?;
        }
        Ok(())
    }
}

/// The accumulated list of static errors for one compilation unit.
#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<StaticError>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    pub fn push(&mut self, kind: StaticErrorKind, span: Span) {
        self.errors.push(StaticError { kind, span });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn count(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StaticError> {
        self.errors.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostics_accumulate_without_failing_individually() {
        let mut diags = Diagnostics::new();
        diags.push(StaticErrorKind::CyclicMode, Span::new(0, 3));
        diags.push(StaticErrorKind::AmbiguousSpecifier, Span::new(4, 9));
        assert_eq!(diags.count(), 2);
        assert!(!diags.is_empty());
    }

    #[test]
    fn recoverable_runtime_kinds_are_not_fatal() {
        assert!(!RuntimeErrorKind::ValueVoided.is_fatal());
        assert!(!RuntimeErrorKind::PrecisionNotImplemented.is_fatal());
        assert!(RuntimeErrorKind::DivisionByZero.is_fatal());
    }

    #[test]
    fn static_error_display_includes_span() {
        let err = StaticError {
            kind: StaticErrorKind::CyclicMode,
            span: Span::new(2, 8),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("cyclic mode"));
        assert!(rendered.contains("2..8"));
    }
}
