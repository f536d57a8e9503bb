#![cfg_attr(docsrs, feature(doc_cfg))]

//! # a68-core
//!
//! Mode algebra, coercion engine, scope/environment resolver, runtime
//! memory model, tree-walking evaluator, and primitive operator set for an
//! Algol 68 interpreter core.
//!
//! This crate implements the **semantic core** described by the project's
//! design document: the layers that make a tree-walking Algol 68
//! interpreter non-trivial. It does not parse source text — it consumes an
//! already-built tree of [`node::Node`]s (whatever front end builds that
//! tree is a separate, out-of-scope collaborator) and type-checks,
//! coerces, resolves scope for, and evaluates it.
//!
//! ## Layers
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`mode`] | Mode (type) construction, equivalence, and derived-mode memoisation |
//! | [`coerce`] | The SOFT/WEAK/MEEK/FIRM/STRONG coercion lattice and coercion-node insertion |
//! | [`scope`] | Symbol tables, tags, frame-offset assignment, label resolution |
//! | [`runtime`] | Frame stack, expression stack, handle-indirected heap, mark–compact collector |
//! | [`eval`] | The tree-walking evaluator with per-node propagator caching |
//! | [`ops`] | Primitive operations over INT, REAL, BOOL, CHAR, BITS, COMPLEX |
//! | [`node`] | The tree vertex type the other layers annotate |
//! | [`diagnostic`] | Static/runtime error kinds and the diagnostic list |
//!
//! Layers depend only on lower layers: `mode` is foundational, `eval` sits
//! on top of all the others. See `DESIGN.md` at the workspace root for the
//! grounding of each module against its reference implementation.

pub mod coerce;
pub mod diagnostic;
pub mod eval;
pub mod mode;
pub mod node;
pub mod ops;
pub mod runtime;
pub mod scope;

pub use diagnostic::{Diagnostics, RuntimeError, RuntimeErrorKind, StaticError, StaticErrorKind, Traceback};
pub use eval::{generator_heap_symbol, Evaluator, Value};
pub use mode::{Mode, ModeId, ModeShape, ModeTable, Pack, PackItem, Primitive};
pub use node::{Attribute, Node, NodeArena, NodeId, Propagator};
pub use ops::Scalar;
pub use runtime::RuntimeMemory;
pub use scope::{ScopeResolver, Storage, TableId, Tag, TagId, TagKind};

/// Fixed-size heap- and frame-slot width the evaluator uses for every
/// scalar value.
pub const SCALAR_SLOT_SIZE: u32 = 8;

/// Construction parameters for one interpreter instance.
///
/// Mirrors `logicaffeine_language::Session`'s role: a small constructible
/// struct carrying the long-lived configuration an evaluation run needs,
/// rather than reading environment variables.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub frame_stack_initial: usize,
    pub expression_stack_capacity: usize,
    pub heap_capacity: usize,
    pub default_deflex_policy: coerce::DeflexPolicy,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            frame_stack_initial: 0,
            expression_stack_capacity: 1 << 16,
            heap_capacity: 1 << 20,
            default_deflex_policy: coerce::DeflexPolicy::Safe,
        }
    }
}

/// One interpreter instance: owns the mode table, node arena, scope
/// resolver, and runtime memory for a single compilation unit.
/// Multiple `Interpreter`s may coexist in one process since nothing here
/// is process-global.
pub struct Interpreter {
    pub options: Options,
    pub modes: mode::ModeTable,
    pub nodes: node::NodeArena,
    pub scope: scope::ScopeResolver,
    pub memory: runtime::RuntimeMemory,
    pub diagnostics: diagnostic::Diagnostics,
}

impl Interpreter {
    pub fn new(options: Options) -> Self {
        Interpreter {
            memory: runtime::RuntimeMemory::new(options.expression_stack_capacity, options.heap_capacity),
            options,
            modes: mode::ModeTable::new(),
            nodes: node::NodeArena::new(),
            scope: scope::ScopeResolver::new(),
            diagnostics: diagnostic::Diagnostics::new(),
        }
    }

    /// Evaluates `root` in `table`/`frame` if, and only if, no static
    /// errors have accumulated.
    pub fn evaluate(
        &mut self,
        root: node::NodeId,
        table: scope::TableId,
        frame: runtime::FramePointer,
        interner: &a68_base::Interner,
    ) -> Result<eval::Value, diagnostic::RuntimeError> {
        if !self.diagnostics.is_empty() {
            return Err(diagnostic::RuntimeError {
                kind: diagnostic::RuntimeErrorKind::InvalidArgument {
                    operation: "evaluation attempted with outstanding static errors".to_string(),
                },
                span: a68_base::Span::default(),
            });
        }
        let mut evaluator = eval::Evaluator {
            modes: &mut self.modes,
            nodes: &mut self.nodes,
            scope: &mut self.scope,
            memory: &mut self.memory,
            interner,
        };
        evaluator.eval(root, table, frame)
    }
}
