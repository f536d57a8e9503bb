//! Runtime resource model: frame stack, expression stack, heap, and
//! the dynamic-scope guard that ties them together.

pub mod frame;
pub mod heap;
pub mod value;

pub use frame::{FramePointer, FrameStack};
pub use heap::{GcRoots, HandleId, Heap};
pub use value::{FormatValue, Locale, ProcedureBody, ProcedureValue, Reference, RowDescriptor, Tuple};

use a68_base::{Span, SpannedError};

/// A separate contiguous segment for temporaries and procedure arguments
///. Pushed/popped by raw memory size; the stack
/// pointer snapshot at clause entry is the voidening point a semicolon
/// resets to, and the point the `Voiding` evaluator action discards back to.
pub struct ExpressionStack {
    bytes: Vec<u8>,
    sp: usize,
}

impl ExpressionStack {
    pub fn new(capacity: usize) -> Self {
        ExpressionStack {
            bytes: vec![0; capacity],
            sp: 0,
        }
    }

    pub fn pointer(&self) -> usize {
        self.sp
    }

    pub fn push_bytes(&mut self, data: &[u8]) -> Result<(), SpannedError> {
        if self.sp + data.len() > self.bytes.len() {
            return Err(SpannedError::new("expression stack exhausted", Span::default()));
        }
        self.bytes[self.sp..self.sp + data.len()].copy_from_slice(data);
        self.sp += data.len();
        Ok(())
    }

    pub fn pop_bytes(&mut self, len: usize) -> &[u8] {
        self.sp -= len;
        &self.bytes[self.sp..self.sp + len]
    }

    /// Resets the stack pointer to a snapshot, discarding anything pushed
    /// since.
    pub fn reset_to(&mut self, snapshot: usize) {
        self.sp = snapshot;
    }
}

impl Default for ExpressionStack {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Owns the frame stack, expression stack, and heap for one interpreter
/// instance.
pub struct RuntimeMemory {
    pub frames: FrameStack,
    pub expr: ExpressionStack,
    pub heap: Heap,
}

impl RuntimeMemory {
    pub fn new(expr_capacity: usize, heap_capacity: usize) -> Self {
        RuntimeMemory {
            frames: FrameStack::new(),
            expr: ExpressionStack::new(expr_capacity),
            heap: Heap::new(heap_capacity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expression_stack_voiding_resets_to_snapshot() {
        let mut stack = ExpressionStack::new(64);
        let snapshot = stack.pointer();
        stack.push_bytes(&[1, 2, 3, 4]).unwrap();
        stack.reset_to(snapshot);
        assert_eq!(stack.pointer(), snapshot);
    }

    #[test]
    fn push_pop_round_trips_bytes() {
        let mut stack = ExpressionStack::new(64);
        stack.push_bytes(&[9, 8, 7]).unwrap();
        let popped = stack.pop_bytes(3).to_vec();
        assert_eq!(popped, vec![9, 8, 7]);
        assert_eq!(stack.pointer(), 0);
    }

    #[test]
    fn overflowing_push_is_an_error() {
        let mut stack = ExpressionStack::new(2);
        assert!(stack.push_bytes(&[1, 2, 3]).is_err());
    }
}
