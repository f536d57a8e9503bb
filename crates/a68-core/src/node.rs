//! Tree vertices handed to the core by the front end.
//!
//! A front end builds a tree of [`Node`]s once.
//! The core never changes the tree's shape except to splice coercion nodes
//! and to record "next in sequence" shortcut links; everything else
//! the core does is filling in the scratch annotation fields on existing
//! nodes. Nodes live in a [`NodeArena`] and are addressed by [`NodeId`],
//! following the "cyclic graphs without raw cycles" design note:
//! parent/child/sibling links are indices into the arena, not pointers, so
//! the arena itself can be a plain `Vec` with no lifetime gymnastics.

use a68_base::Symbol;
use std::cell::Cell;

use crate::mode::ModeId;
use crate::scope::{TableId, TagId};

/// Stable handle to a [`Node`] inside a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Sentinel used where "no node" is a valid value (e.g. an absent
    /// `FROM` part of a loop clause).
    pub const NONE: NodeId = NodeId(u32::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// The syntactic category of a node.
///
/// This is a practical subset of the ~200 attributes the front end's closed
/// alphabet distinguishes — every construct the evaluator's tree walk
/// dispatches on has a variant; attributes the core never inspects directly (literal
/// punctuation, bracket tokens) are not represented since the front end
/// would only ever hand the core node kinds the evaluator dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    // Enclosed clauses
    ClosedClause,
    CollateralClause,
    Conditional,
    IntegerCase,
    UnitedCase,
    Loop,
    Parallel,
    /// Wrapper for a loop clause's optional `FROM e` part.
    LoopFrom,
    /// Wrapper for a loop clause's optional `BY e` part.
    LoopBy,
    /// Wrapper for a loop clause's optional `TO`/`DOWNTO e` part.
    LoopTo,
    /// Wrapper for a loop clause's optional `WHILE w` part.
    LoopWhile,
    /// Wrapper for a loop clause's required `DO s` part.
    LoopDo,
    /// Wrapper for a loop clause's optional `UNTIL u` part.
    LoopUntil,
    /// One dimension's `lower:upper` bound pair in a row generator or
    /// declarer.
    Bound,

    // Declarations
    ModeDeclaration,
    IdentityDeclaration,
    VariableDeclaration,
    ProcedureDeclaration,
    OperatorDeclaration,
    PriorityDeclaration,

    // Units
    Assignation,
    IdentityRelation,
    RoutineText,
    Skip,
    Jump,
    AndThen,
    OrElse,
    Assertion,
    Generator,
    Selection,
    Slice,
    Trimmer,
    Denoter,
    Cast,
    Call,
    Formula,
    MonadicFormula,
    Nihil,
    Identifier,
    OperatorRef,
    Label,

    // Coercions
    Dereferencing,
    Deproceduring,
    Widening,
    Rowing,
    Uniting,
    Voiding,
}

impl Attribute {
    /// Whether this attribute is one the coercion inserter ever splices in.
    pub fn is_coercion(self) -> bool {
        matches!(
            self,
            Attribute::Dereferencing
                | Attribute::Deproceduring
                | Attribute::Widening
                | Attribute::Rowing
                | Attribute::Uniting
                | Attribute::Voiding
        )
    }

    /// Whether run-time must dereference/deprocedure down to a
    /// non-procedure mode before voiding this kind of node.
    pub fn is_primary_comorf(self) -> bool {
        matches!(
            self,
            Attribute::Selection
                | Attribute::Slice
                | Attribute::Call
                | Attribute::Formula
                | Attribute::MonadicFormula
                | Attribute::Identifier
                | Attribute::RoutineText
        )
    }
}

/// A cached evaluator entry point, monotonically specialised on first
/// execution.
///
/// Starts at `Generic` and narrows to one of a small closed set once the
/// evaluator has seen what kind of unit actually sits at this node. The
/// specialisation is idempotent — storing the same variant twice from two
/// racing parallel-clause threads is harmless — so a plain `Cell` (rather
/// than an atomic) is sufficient as long as the enum fits a machine word,
/// which a fieldless enum does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagator {
    Generic,
    LocalIdentifier,
    DerefLocalIdentifier,
    Constant,
    DyadicQuick,
}

impl Default for Propagator {
    fn default() -> Self {
        Propagator::Generic
    }
}

/// A tree vertex.
///
/// Annotation fields (`mode`, `table`, `tag`, propagator cache, frame
/// offset/level, constant cache, sequence link) are `Cell`s: the front end
/// creates the node once with them empty, and later passes fill them in
/// without needing `&mut` access to the whole arena.
pub struct Node {
    pub attribute: Attribute,
    pub symbol: Symbol,
    pub parent: Cell<NodeId>,
    pub first_child: Cell<NodeId>,
    pub next_sibling: Cell<NodeId>,
    /// For coercion nodes: the node being wrapped.
    pub sub: Cell<NodeId>,
    pub table: Cell<Option<TableId>>,
    pub tag: Cell<Option<TagId>>,
    pub mode: Cell<Option<ModeId>>,

    // Coercion-engine scratch fields.
    pub sort: Cell<Option<crate::coerce::Context>>,
    pub need_dns: Cell<bool>,

    // Evaluator scratch fields.
    pub propagator: Cell<Propagator>,
    pub frame_offset: Cell<u32>,
    pub lexical_level: Cell<u32>,
    pub seq_link: Cell<NodeId>,
}

impl Node {
    fn bare(attribute: Attribute, symbol: Symbol) -> Self {
        Node {
            attribute,
            symbol,
            parent: Cell::new(NodeId::NONE),
            first_child: Cell::new(NodeId::NONE),
            next_sibling: Cell::new(NodeId::NONE),
            sub: Cell::new(NodeId::NONE),
            table: Cell::new(None),
            tag: Cell::new(None),
            mode: Cell::new(None),
            sort: Cell::new(None),
            need_dns: Cell::new(false),
            propagator: Cell::new(Propagator::Generic),
            frame_offset: Cell::new(0),
            lexical_level: Cell::new(0),
            seq_link: Cell::new(NodeId::NONE),
        }
    }
}

/// Owns every [`Node`] created for one compilation unit.
///
/// Mirrors the arena pattern `a68_base::Arena` already gives us, but keeps
/// nodes in a dense `Vec` indexed by [`NodeId`] rather than behind
/// individually-boxed references, since the tree walk needs to mutate
/// sibling/child links in place when splicing coercions.
#[derive(Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        NodeArena { nodes: Vec::new() }
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Allocates a leaf node with no children.
    pub fn leaf(&mut self, attribute: Attribute, symbol: Symbol) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node::bare(attribute, symbol));
        id
    }

    /// Allocates a node and attaches `children` as its child list, in
    /// order, wiring up `parent`/`first_child`/`next_sibling`.
    pub fn with_children(
        &mut self,
        attribute: Attribute,
        symbol: Symbol,
        children: &[NodeId],
    ) -> NodeId {
        let id = self.leaf(attribute, symbol);
        self.set_children(id, children);
        id
    }

    /// Rewires `parent`'s child list to `children`, in order.
    pub fn set_children(&mut self, parent: NodeId, children: &[NodeId]) {
        let mut prev: Option<NodeId> = None;
        for &child in children {
            self.get(child).parent.set(parent);
            match prev {
                None => self.get(parent).first_child.set(child),
                Some(p) => self.get(p).next_sibling.set(child),
            }
            prev = Some(child);
        }
        if let Some(p) = prev {
            self.get(p).next_sibling.set(NodeId::NONE);
        } else {
            self.get(parent).first_child.set(NodeId::NONE);
        }
    }

    /// Iterates a node's direct children in order.
    pub fn children(&self, parent: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        let mut cur = self.get(parent).first_child.get();
        std::iter::from_fn(move || {
            if cur.is_none() {
                None
            } else {
                let this = cur;
                cur = self.get(this).next_sibling.get();
                Some(this)
            }
        })
    }

    /// Splices a new coercion node of `attribute` between `target`'s parent
    /// and `target` itself, wrapping `target`: the new node's `sub` points at
    /// the wrapped node, and its `mode` is the coercion's target mode. Returns the
    /// new wrapper node, which callers should chain further coercions onto
    /// or install as the child in `target`'s old position.
    pub fn splice_coercion(
        &mut self,
        attribute: Attribute,
        target: NodeId,
        target_mode: ModeId,
    ) -> NodeId {
        debug_assert!(attribute.is_coercion());
        let wrapper = self.leaf(attribute, Symbol::EMPTY);
        let w = self.get(wrapper);
        w.sub.set(target);
        w.mode.set(Some(target_mode));
        let parent = self.get(target).parent.get();
        w.parent.set(parent);
        if !parent.is_none() {
            // Replace `target` with `wrapper` in the parent's child list.
            let mut cur = self.get(parent).first_child.get();
            if cur == target {
                self.get(parent).first_child.set(wrapper);
            } else {
                loop {
                    let next = self.get(cur).next_sibling.get();
                    if next == target {
                        self.get(cur).next_sibling.set(wrapper);
                        break;
                    }
                    cur = next;
                }
            }
            w.next_sibling.set(self.get(target).next_sibling.get());
        }
        self.get(target).parent.set(wrapper);
        self.get(target).next_sibling.set(NodeId::NONE);
        wrapper
    }
}
