//! Runtime value shapes that live on the expression stack or inside heap
//! blocks.

use crate::mode::ModeId;
use crate::node::NodeId;
use crate::runtime::frame::FramePointer;
use crate::runtime::heap::HandleId;

/// A name: a two-word value plus a distinguished NIL and a dynamic-scope
/// tag.
///
/// A non-nil reference addresses its referent in exactly one of two
/// places: a heap block (`handle`) or a `LOC`-allocated frame slot
/// (`frame`); it is never both. The scope tag is the static-link level
/// that bounds the referent's lifetime: it is never shallower (numerically
/// smaller) than the handle's allocation level. `Reference::NIL` carries neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub handle: Option<HandleId>,
    pub frame: Option<FramePointer>,
    pub offset: u32,
    pub scope: u32,
}

impl Reference {
    pub const NIL: Reference = Reference {
        handle: None,
        frame: None,
        offset: 0,
        scope: 0,
    };

    pub fn is_nil(&self) -> bool {
        self.handle.is_none() && self.frame.is_none()
    }
}

/// One dimension's bookkeeping for a [`RowDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuple {
    pub lower_bound: i64,
    pub upper_bound: i64,
    /// Stride between consecutive elements along this dimension ("span").
    pub span: i64,
    pub shift: i64,
}

impl Tuple {
    /// Number of elements this dimension ranges over, or `0` if the bound
    /// pair is empty (`upper < lower`).
    pub fn len(&self) -> i64 {
        (self.upper_bound - self.lower_bound + 1).max(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `l:u@r` trimmer application: new lower `l`, new
    /// upper `u`, shifted so the new lower maps to the old `l - r`.
    pub fn trim(&self, new_lower: i64, new_upper: i64, shift_origin: i64) -> Tuple {
        Tuple {
            lower_bound: new_lower,
            upper_bound: new_upper,
            span: self.span,
            shift: self.shift + (new_lower - shift_origin) * self.span,
        }
    }
}

/// Array descriptor: handle plus one [`Tuple`] per
/// dimension. Slicing computes a flat index as `Σ span_i · k_i − shift_i`.
#[derive(Debug, Clone)]
pub struct RowDescriptor {
    pub handle: HandleId,
    pub element_mode: ModeId,
    pub element_size: u32,
    pub slice_offset: u32,
    pub field_offset: u32,
    pub dimensions: Vec<Tuple>,
}

impl RowDescriptor {
    /// Computes the flat byte offset of an element given one MEEK-INT
    /// index per dimension, bounds-checking each against its tuple.
    pub fn flat_offset(&self, indices: &[i64]) -> Result<u32, (usize, i64, Tuple)> {
        let mut index_sum: i64 = -self.field_offset as i64;
        for (dim, &k) in indices.iter().enumerate() {
            let tuple = self.dimensions[dim];
            if k < tuple.lower_bound || k > tuple.upper_bound {
                return Err((dim, k, tuple));
            }
            index_sum += tuple.span * k - tuple.shift;
        }
        Ok((self.slice_offset as i64 + index_sum * self.element_size as i64) as u32)
    }
}

/// Which function backs a [`ProcedureValue`].
#[derive(Debug, Clone)]
pub enum ProcedureBody {
    /// A standard-environment primitive, identified by name since the
    /// primitives themselves live in `ops.rs`'s registry.
    Standard(a68_base::Symbol),
    User(NodeId),
    /// The `SKIP` default procedure value.
    Skip,
}

/// A curried procedure's partially-bound arguments, held in a heap block
/// alongside per-argument "filled" flags.
#[derive(Debug, Clone)]
pub struct Locale {
    pub handle: HandleId,
    pub filled: Vec<bool>,
    pub values_offset: u32,
}

/// A procedure value: body, captured static-link
/// environment, optional locale, and full mode.
#[derive(Debug, Clone)]
pub struct ProcedureValue {
    pub body: ProcedureBody,
    pub environ_level: u32,
    pub locale: Option<Locale>,
    pub mode: ModeId,
}

/// A format value: format-text node plus captured environment.
#[derive(Debug, Clone, Copy)]
pub struct FormatValue {
    pub text: NodeId,
    pub environ_level: u32,
}
