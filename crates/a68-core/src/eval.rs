//! The tree-walking evaluator: executes a checked, coerced,
//! scope-resolved tree against a [`RuntimeMemory`] instance.
//!
//! Each node's [`crate::node::Propagator`] cell is consulted first; a node
//! visited for the first time runs the generic attribute dispatch below
//! and then, for a handful of hot shapes (local-identifier load, its
//! dereferencing wrapper, constants, dyadic formulas), narrows its own
//! cell so later visits skip straight to a cheaper path.

use a68_base::{Interner, Span};

use crate::coerce::resolve_dyadic;
use crate::diagnostic::{RuntimeError, RuntimeErrorKind};
use crate::mode::{ModeId, ModeShape, ModeTable, Primitive};
use crate::node::{Attribute, NodeArena, NodeId, Propagator};
use crate::ops::{self, Scalar};
use crate::runtime::value::{Locale, ProcedureBody, ProcedureValue, Reference, RowDescriptor, Tuple};
use crate::runtime::{FramePointer, GcRoots, HandleId, RuntimeMemory};
use crate::scope::{ScopeResolver, Storage, TableId, TagId};

type EvalResult = Result<Value, RuntimeError>;

/// An empty root set, used where an allocation's own referent cannot yet be
/// reachable from anywhere else (a generator's fresh block, a locale's
/// private argument block) so collection during that one call has nothing
/// of this evaluator's own making to protect beyond what `roots` already
/// covers by construction.
struct NoRoots;

impl GcRoots for NoRoots {
    fn roots(&self) -> Vec<HandleId> {
        Vec::new()
    }
}

/// A fully-evaluated value passed between tree nodes. Composite values that
/// live in the heap are represented by their [`Reference`]; the
/// evaluator dereferences through `crate::runtime::heap::Heap` when a
/// scalar is actually needed.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Scalar),
    Reference(Reference),
    Procedure(ProcedureValue),
    /// A value coerced into a UNION, tagged with the variant mode actually
    /// held. `UnitedCase` matches against the tag.
    Union(ModeId, Box<Value>),
    /// A non-local jump in flight, carrying the target label's tag. Not a
    /// user-visible value: `eval_serial` either resolves it against a
    /// label declared in its own table or lets it keep propagating
    /// outward.
    Jump(TagId),
    Void,
}

impl Value {
    fn expect_scalar(self, span: Span) -> Result<Scalar, RuntimeError> {
        match self {
            Value::Scalar(s) => Ok(s),
            _ => Err(RuntimeError {
                kind: RuntimeErrorKind::InvalidArgument {
                    operation: "expected scalar value".to_string(),
                },
                span,
            }),
        }
    }

    fn expect_reference(self, span: Span) -> Result<Reference, RuntimeError> {
        match self {
            Value::Reference(r) => Ok(r),
            _ => Err(RuntimeError {
                kind: RuntimeErrorKind::InvalidArgument {
                    operation: "expected reference value".to_string(),
                },
                span,
            }),
        }
    }
}

/// Ties the lower layers together for one evaluation.
pub struct Evaluator<'a> {
    pub modes: &'a mut ModeTable,
    pub nodes: &'a mut NodeArena,
    pub scope: &'a mut ScopeResolver,
    pub memory: &'a mut RuntimeMemory,
    pub interner: &'a Interner,
}

impl<'a> Evaluator<'a> {
    /// Evaluates `node` in lexical table `table` and current frame `frame`,
    /// yielding a void context.
    pub fn eval_voided(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let snapshot = self.memory.expr.pointer();
        let result = self.eval(node, table, frame);
        self.memory.expr.reset_to(snapshot);
        result.map(|v| match v {
            jump @ Value::Jump(_) => jump,
            _ => Value::Void,
        })
    }

    /// Core dispatch.
    ///
    /// `table` is the ambient lexical table inherited from the caller, but a
    /// node that opens its own lexical level (a routine text's parameter
    /// table, a closed clause's own declarations) carries that table on its
    /// `table` scratch field; when
    /// present it overrides the inherited one for this node and everything
    /// evaluated beneath it, which is how a procedure body's own parameters
    /// and locals resolve against their own table rather than the call
    /// site's.
    pub fn eval(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let attribute = self.nodes.get(node).attribute;
        let table = self.nodes.get(node).table.get().unwrap_or(table);
        let span = Span::default();

        if attribute.is_coercion() {
            return self.eval_coercion(node, attribute, table, frame);
        }

        match self.nodes.get(node).propagator.get() {
            Propagator::Constant => return self.eval_denoter(node),
            Propagator::LocalIdentifier => return self.eval_identifier_load(node, table, frame),
            Propagator::DerefLocalIdentifier => {
                let mode = self.nodes.get(node).mode.get();
                let v = self.eval_identifier_load(node, table, frame)?;
                return self.dereference_value(v, mode, span);
            }
            _ => {}
        }

        match attribute {
            Attribute::Denoter => {
                self.nodes.get(node).propagator.set(Propagator::Constant);
                self.eval_denoter(node)
            }
            Attribute::Identifier => {
                self.nodes.get(node).propagator.set(Propagator::LocalIdentifier);
                self.eval_identifier_load(node, table, frame)
            }
            Attribute::Skip => Ok(Value::Void),
            Attribute::Nihil => Ok(Value::Reference(Reference::NIL)),
            Attribute::ClosedClause | Attribute::CollateralClause => {
                self.eval_serial(node, table, frame)
            }
            Attribute::Assignation => self.eval_assignation(node, table, frame),
            Attribute::Formula | Attribute::MonadicFormula => self.eval_formula(node, table, frame),
            Attribute::Generator => self.eval_generator(node, table, frame),
            Attribute::Loop => self.eval_loop(node, table, frame),
            Attribute::Conditional => self.eval_conditional(node, table, frame),
            Attribute::IntegerCase => self.eval_integer_case(node, table, frame),
            Attribute::UnitedCase => self.eval_united_case(node, table, frame),
            Attribute::Slice => self.eval_slice(node, table, frame),
            Attribute::Trimmer => Ok(Value::Void),
            Attribute::Selection => self.eval_selection(node, table, frame),
            Attribute::Call => self.eval_call(node, table, frame),
            Attribute::RoutineText => self.eval_routine_text(node, table, frame),
            Attribute::AndThen => self.eval_and_then(node, table, frame),
            Attribute::OrElse => self.eval_or_else(node, table, frame),
            Attribute::Assertion => self.eval_assertion(node, table, frame),
            Attribute::IdentityRelation => self.eval_identity_relation(node, table, frame),
            Attribute::Jump => self.eval_jump(node, table),
            Attribute::Label => {
                let target = self.nodes.get(node).first_child.get();
                self.eval(target, table, frame)
            }
            Attribute::Cast => {
                let target = self.nodes.get(node).first_child.get();
                self.eval(target, table, frame)
            }
            Attribute::Parallel => self.eval_serial(node, table, frame),
            Attribute::OperatorRef => self.eval_operator_ref(node, table),
            Attribute::IdentityDeclaration => self.eval_identity_declaration(node, table, frame),
            Attribute::VariableDeclaration => self.eval_variable_declaration(node, table, frame),
            Attribute::ModeDeclaration
            | Attribute::OperatorDeclaration
            | Attribute::PriorityDeclaration
            | Attribute::ProcedureDeclaration => Ok(Value::Void),
            _ => Ok(Value::Void),
        }
    }

    /// Coercion action for a coercion node wrapping `sub`.
    fn eval_coercion(
        &mut self,
        node: NodeId,
        attribute: Attribute,
        table: TableId,
        frame: FramePointer,
    ) -> EvalResult {
        let sub = self.nodes.get(node).sub.get();
        let inner = self.eval(sub, table, frame)?;
        let span = Span::default();
        match attribute {
            Attribute::Dereferencing => {
                let target_mode = self.nodes.get(node).mode.get();
                self.dereference_value(inner, target_mode, span)
            }
            Attribute::Deproceduring => self.deprocedure_value(inner, table, frame, span),
            Attribute::Widening => self.widen_value(inner, node),
            Attribute::Voiding => Ok(Value::Void),
            Attribute::Uniting => {
                let target = self
                    .nodes
                    .get(node)
                    .mode
                    .get()
                    .expect("uniting node carries its target union mode");
                Ok(Value::Union(target, Box::new(inner)))
            }
            Attribute::Rowing => Ok(inner),
            _ => Ok(inner),
        }
    }

    /// Reads a scalar out from behind a [`Reference`], whether it
    /// addresses a heap block or a `LOC`-allocated frame slot, and decodes
    /// it per `target_mode` (the coercion node's own mode, per invariant
    /// I4) rather than assuming INT. A target mode
    /// that is itself `REF`, or one of the composite shapes this evaluator
    /// always represents by reference even as a bare value (`ROW`, `FLEX`,
    /// `STRUCT` — Value's own doc comment: "composite values that live in
    /// the heap are represented by their Reference"), decodes the slot as
    /// another [`Reference`] rather than a scalar, so a dereferenced array
    /// or struct variable is something `eval_slice`/`eval_selection` can
    /// still address.
    fn dereference_value(&mut self, value: Value, target_mode: Option<ModeId>, span: Span) -> EvalResult {
        let r = value.expect_reference(span)?;
        if r.is_nil() {
            return Err(RuntimeError {
                kind: RuntimeErrorKind::NilNameDereference,
                span,
            });
        }
        let bits = if let Some(handle) = r.handle {
            let offset = (self.memory.heap.offset(handle) + r.offset) as usize;
            let bytes = &self.memory.heap.bytes()[offset..offset + 8];
            i64::from_le_bytes(bytes.try_into().unwrap())
        } else {
            let fp = r.frame.expect("non-nil, non-heap reference carries a frame pointer");
            let body = self.memory.frames.body(fp);
            let offset = r.offset as usize;
            i64::from_le_bytes(body[offset..offset + 8].try_into().unwrap())
        };
        let canon_shape = target_mode.map(|m| self.modes.shape(self.modes.canonical(m)).clone());
        if matches!(
            canon_shape,
            Some(ModeShape::Ref(_)) | Some(ModeShape::Row { .. }) | Some(ModeShape::Flex(_)) | Some(ModeShape::Struct(_))
        ) {
            return Ok(Value::Reference(decode_reference_bits(bits)));
        }
        Ok(Value::Scalar(decode_scalar(bits, target_mode, self.modes)))
    }

    fn deprocedure_value(
        &mut self,
        value: Value,
        table: TableId,
        frame: FramePointer,
        span: Span,
    ) -> EvalResult {
        match value {
            Value::Procedure(p) => self.invoke_procedure(p, Vec::new(), table, frame, span),
            other => Ok(other),
        }
    }

    fn widen_value(&mut self, value: Value, node: NodeId) -> EvalResult {
        let target = self
            .nodes
            .get(node)
            .mode
            .get()
            .expect("widening node carries its target mode");
        let scalar = match value {
            Value::Scalar(s) => s,
            other => return Ok(other),
        };
        let widened = match (scalar, self.modes.shape(target)) {
            (Scalar::Int(i), ModeShape::Primitive(Primitive::Real)) => Scalar::Real(i as f64),
            (other, _) => other,
        };
        Ok(Value::Scalar(widened))
    }

    fn eval_denoter(&mut self, node: NodeId) -> EvalResult {
        let symbol = self.nodes.get(node).symbol;
        let text = self.interner.resolve(symbol);
        let mode = self.nodes.get(node).mode.get();
        let scalar = match mode.map(|m| self.modes.shape(m).clone()) {
            Some(ModeShape::Primitive(Primitive::Real)) => {
                Scalar::Real(text.parse::<f64>().unwrap_or(0.0))
            }
            Some(ModeShape::Primitive(Primitive::Bool)) => Scalar::Bool(text == "true"),
            Some(ModeShape::Primitive(Primitive::Char)) => {
                Scalar::Char(text.chars().next().unwrap_or('\0'))
            }
            _ => Scalar::Int(text.parse::<i64>().unwrap_or(0)),
        };
        Ok(Value::Scalar(scalar))
    }

    /// Loads a local identifier by walking `(level, offset)` static links
    /// from the current frame. A PROC-moded tag is reconstructed
    /// directly from its defining routine text rather than read from the
    /// frame; a REF-moded tag (a variable name) yields a [`Reference`]
    /// into the owning frame rather than a decoded scalar.
    fn eval_identifier_load(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let symbol = self.nodes.get(node).symbol;
        let (tag_id, hops) = self
            .scope
            .resolve_identifier(table, symbol)
            .ok_or_else(|| RuntimeError {
                kind: RuntimeErrorKind::UninitialisedValue,
                span: Span::default(),
            })?;
        let tag = self.scope.tag(tag_id).clone();
        let owner_frame = self
            .memory
            .frames
            .walk_static(frame, hops)
            .expect("static-link chain matches the table chain by construction");

        if let Some(mode) = tag.mode {
            let shape = self.modes.shape(self.modes.canonical(mode)).clone();
            match shape {
                ModeShape::Proc(ref pack, _) => {
                    // The body is always reconstructed from the declaring
                    // routine text; only a curried locale (if this identity
                    // was bound to a partially-applied call) is read back
                    // from the frame slot.
                    let body_bits = i64::from_le_bytes(
                        self.memory.frames.body(owner_frame)
                            [tag.frame_offset as usize..tag.frame_offset as usize + 8]
                            .try_into()
                            .unwrap(),
                    );
                    let locale = decode_locale_bits(body_bits, pack.0.len());
                    return Ok(Value::Procedure(ProcedureValue {
                        body: ProcedureBody::User(tag.defining_node),
                        environ_level: self.memory.frames.header(owner_frame).lexical_level,
                        locale,
                        mode,
                    }));
                }
                ModeShape::Ref(_) => {
                    return Ok(Value::Reference(Reference {
                        handle: None,
                        frame: Some(owner_frame),
                        offset: tag.frame_offset,
                        scope: self.memory.frames.header(owner_frame).lexical_level,
                    }));
                }
                _ => {}
            }
        }

        let body = self.memory.frames.body(owner_frame);
        let offset = tag.frame_offset as usize;
        let bits = i64::from_le_bytes(body[offset..offset + 8].try_into().unwrap());
        Ok(Value::Scalar(decode_scalar(bits, tag.mode, self.modes)))
    }

    /// Evaluates each unit in sequence, voiding all but the last. A [`Value::Jump`] surfacing from a voided unit is
    /// resolved against this clause's own labels if it names one declared
    /// in `table`; otherwise it keeps propagating to the caller.
    fn eval_serial(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let children: Vec<NodeId> = self.nodes.children(node).collect();
        let mut last = Value::Void;
        let mut i = 0;
        while i < children.len() {
            let is_last = i + 1 == children.len();
            let child = children[i];
            let result = if is_last {
                self.eval(child, table, frame)?
            } else {
                self.eval_voided(child, table, frame)?
            };
            if let Value::Jump(target_tag) = result {
                let tag = self.scope.tag(target_tag);
                if tag.owner == table {
                    let symbol = tag.symbol;
                    if let Some(pos) = children.iter().position(|&c| {
                        self.nodes.get(c).attribute == Attribute::Label && self.nodes.get(c).symbol == symbol
                    }) {
                        i = pos;
                        last = Value::Void;
                        continue;
                    }
                }
                return Ok(Value::Jump(target_tag));
            }
            if is_last {
                last = result;
            }
            i += 1;
        }
        Ok(last)
    }

    fn eval_assignation(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let name_node = children.next().expect("assignation has a name child");
        let value_node = children.next().expect("assignation has a value child");
        let span = Span::default();
        let target = self.eval(name_node, table, frame)?.expect_reference(span)?;
        if target.is_nil() {
            return Err(RuntimeError {
                kind: RuntimeErrorKind::NilNameDereference,
                span,
            });
        }
        let value = self.eval(value_node, table, frame)?;
        let bits = match &value {
            Value::Reference(r) => {
                self.check_scope_guard(r.scope, target.scope, span)?;
                encode_reference_bits(*r)
            }
            Value::Procedure(p) => {
                self.check_scope_guard(p.environ_level, target.scope, span)?;
                match &p.locale {
                    Some(l) => encode_locale_bits(l),
                    None => 0,
                }
            }
            _ => scalar_to_bits(value.expect_scalar(span)?),
        };
        self.write_slot(target, bits);
        Ok(Value::Reference(target))
    }

    /// The dynamic-scope guard:
    /// a name/procedure/format value may only be stored somewhere that
    /// cannot outlive it, i.e. the target's own scope must be at least as
    /// deep as the value's.
    fn check_scope_guard(&self, value_scope: u32, target_scope: u32, span: Span) -> Result<(), RuntimeError> {
        if value_scope > target_scope {
            Err(RuntimeError {
                kind: RuntimeErrorKind::ScopeViolation,
                span,
            })
        } else {
            Ok(())
        }
    }

    fn write_slot(&mut self, target: Reference, bits: i64) {
        if let Some(handle) = target.handle {
            let offset = (self.memory.heap.offset(handle) + target.offset) as usize;
            self.memory.heap.bytes_mut()[offset..offset + 8].copy_from_slice(&bits.to_le_bytes());
        } else {
            let fp = target.frame.expect("non-nil, non-heap reference carries a frame pointer");
            let offset = target.offset as usize;
            self.memory.frames.body_mut(fp)[offset..offset + 8].copy_from_slice(&bits.to_le_bytes());
        }
    }

    /// A dyadic formula caches a "quick" propagator that inlines both
    /// operand evaluations and the resolved primitive.
    fn eval_formula(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let children: Vec<NodeId> = self.nodes.children(node).collect();
        let symbol = self.nodes.get(node).symbol;
        let op_name = self.interner.resolve(symbol);
        let span = Span::default();

        if children.len() == 2 {
            let left = self.eval(children[0], table, frame)?.expect_scalar(span)?;
            let right = self.eval(children[1], table, frame)?.expect_scalar(span)?;
            self.nodes.get(node).propagator.set(Propagator::DyadicQuick);
            let result = dispatch_primitive(op_name, left, Some(right))
                .map_err(|kind| RuntimeError { kind, span })?;
            Ok(Value::Scalar(result))
        } else {
            let only = self.eval(children[0], table, frame)?.expect_scalar(span)?;
            let result = dispatch_primitive(op_name, only, None)
                .map_err(|kind| RuntimeError { kind, span })?;
            Ok(Value::Scalar(result))
        }
    }

    /// `LOC T` / `HEAP T`: allocates and returns a REF.
    /// `T`'s own shape decides the block size — a STRUCT gets one slot per
    /// field, a ROW reads its `Bound` children left-to-right and lays out
    /// its elements row-major, everything else gets one flat scalar slot.
    fn eval_generator(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let storage = if self.nodes.get(node).symbol == generator_heap_symbol() {
            Storage::Heap
        } else {
            Storage::Loc
        };
        let mode = self.nodes.get(node).mode.get().unwrap_or(crate::mode::ModeId(0));
        let row_layout = self.row_layout_for_generator(node, mode, table, frame)?;
        let (size, row_meta) = match &row_layout {
            Some((element_mode, dims)) => {
                let element_size = self.mode_byte_size(*element_mode);
                let count: i64 = dims.iter().map(|t| t.len()).product();
                (element_size * count.max(0) as u32, Some((*element_mode, dims.clone())))
            }
            None => (self.mode_byte_size(mode), None),
        };
        match storage {
            Storage::Loc => {
                let offset = self.memory.frames.header(frame).body_size;
                self.memory.frames.widen_top(size);
                Ok(Value::Reference(Reference {
                    handle: None,
                    frame: Some(frame),
                    offset,
                    scope: self.memory.frames.header(frame).lexical_level,
                }))
            }
            Storage::Heap => {
                let storage_handle = self
                    .memory
                    .heap
                    .allocate(size, mode, self.modes, &NoRoots)
                    .map_err(|e| RuntimeError {
                        kind: RuntimeErrorKind::HeapExhausted,
                        span: e.span,
                    })?;
                let handle = match row_meta {
                    Some((element_mode, dims)) => {
                        // A row value is itself a reference to a small
                        // descriptor block, distinct from the element
                        // storage it addresses, so
                        // a later trim can allocate its own narrower
                        // descriptor without disturbing this one.
                        let descriptor = self
                            .memory
                            .heap
                            .allocate(0, mode, self.modes, &NoRoots)
                            .map_err(|e| RuntimeError {
                                kind: RuntimeErrorKind::HeapExhausted,
                                span: e.span,
                            })?;
                        self.memory.heap.set_row_meta(descriptor, storage_handle, 0, element_mode, dims);
                        descriptor
                    }
                    None => storage_handle,
                };
                Ok(Value::Reference(Reference {
                    handle: Some(handle),
                    frame: None,
                    offset: 0,
                    scope: self.memory.frames.header(frame).lexical_level,
                }))
            }
        }
    }

    /// If `mode` (peeling one `FLEX`) is a ROW, evaluates `node`'s `Bound`
    /// children left-to-right into row-major [`Tuple`]s;
    /// otherwise returns `None`.
    fn row_layout_for_generator(
        &mut self,
        node: NodeId,
        mode: ModeId,
        table: TableId,
        frame: FramePointer,
    ) -> Result<Option<(ModeId, Vec<Tuple>)>, RuntimeError> {
        let canon = self.modes.canonical(mode);
        let peeled = match self.modes.shape(canon) {
            ModeShape::Flex(inner) => self.modes.canonical(*inner),
            _ => canon,
        };
        let (dim, element_mode) = match self.modes.shape(peeled) {
            ModeShape::Row { dim, of } => (*dim, *of),
            _ => return Ok(None),
        };
        let span = Span::default();
        let bound_nodes: Vec<NodeId> = self
            .nodes
            .children(node)
            .filter(|&c| self.nodes.get(c).attribute == Attribute::Bound)
            .collect();
        let mut lower_upper = Vec::with_capacity(dim as usize);
        for &bound_node in bound_nodes.iter().take(dim as usize) {
            let mut parts = self.nodes.children(bound_node);
            let lower_node = parts.next().expect("bound has a lower child");
            let upper_node = parts.next().expect("bound has an upper child");
            let lower = match self.eval(lower_node, table, frame)?.expect_scalar(span)? {
                Scalar::Int(i) => i,
                _ => 1,
            };
            let upper = match self.eval(upper_node, table, frame)?.expect_scalar(span)? {
                Scalar::Int(i) => i,
                _ => lower,
            };
            lower_upper.push((lower, upper));
        }
        while lower_upper.len() < dim as usize {
            lower_upper.push((1, 0));
        }
        let lens: Vec<i64> = lower_upper.iter().map(|(l, u)| (u - l + 1).max(0)).collect();
        let mut spans = vec![1i64; dim as usize];
        for i in (0..dim as usize).rev() {
            if i + 1 < dim as usize {
                spans[i] = spans[i + 1] * lens[i + 1].max(1);
            }
        }
        let dims = lower_upper
            .iter()
            .zip(spans.iter())
            .map(|(&(lower, upper), &span_i)| Tuple {
                lower_bound: lower,
                upper_bound: upper,
                span: span_i,
                shift: lower * span_i,
            })
            .collect();
        Ok(Some((element_mode, dims)))
    }

    /// Flat byte size of one value of `mode` in this evaluator's untyped
    /// slot layout: a STRUCT gets one scalar slot per field, anything else
    /// (including every primitive and REF) fits in one.
    fn mode_byte_size(&self, mode: ModeId) -> u32 {
        match self.modes.shape(self.modes.canonical(mode)) {
            ModeShape::Struct(pack) => pack.0.len() as u32 * crate::SCALAR_SLOT_SIZE,
            _ => crate::SCALAR_SLOT_SIZE,
        }
    }

    /// `FOR i FROM f BY b TO t WHILE w DO s UNTIL u OD`. Every
    /// part but `DO` is optional; `FROM` defaults to 1, `BY` to 1, and an
    /// absent `TO`/`DOWNTO` runs unbounded. `DOWNTO` is told apart from `TO`
    /// by the `LoopTo` wrapper's own symbol text. A single frame is opened
    /// once and reinitialised each iteration so local declarations do not
    /// accumulate.
    fn eval_loop(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let span = Span::default();
        let mut from_node = None;
        let mut by_node = None;
        let mut to_node = None;
        let mut while_node = None;
        let mut do_node = None;
        let mut until_node = None;
        for child in self.nodes.children(node) {
            match self.nodes.get(child).attribute {
                Attribute::LoopFrom => from_node = Some(self.nodes.get(child).first_child.get()),
                Attribute::LoopBy => by_node = Some(self.nodes.get(child).first_child.get()),
                Attribute::LoopTo => to_node = Some(child),
                Attribute::LoopWhile => while_node = Some(self.nodes.get(child).first_child.get()),
                Attribute::LoopDo => do_node = Some(self.nodes.get(child).first_child.get()),
                Attribute::LoopUntil => until_node = Some(self.nodes.get(child).first_child.get()),
                _ => {}
            }
        }
        let body = do_node.expect("a loop clause always carries a DO part");

        let eval_int = |this: &mut Self, n: NodeId| -> Result<i64, RuntimeError> {
            match this.eval(n, table, frame)?.expect_scalar(span)? {
                Scalar::Int(i) => Ok(i),
                _ => Err(RuntimeError {
                    kind: RuntimeErrorKind::InvalidArgument {
                        operation: "loop bound".to_string(),
                    },
                    span,
                }),
            }
        };

        let from = match from_node {
            Some(n) => eval_int(self, n)?,
            None => 1,
        };
        let by = match by_node {
            Some(n) => eval_int(self, n)?,
            None => 1,
        };
        let downto = to_node
            .map(|n| self.interner.resolve(self.nodes.get(n).symbol) == "DOWNTO")
            .unwrap_or(false);
        let by = if downto && by > 0 { -by } else { by };
        let to = match to_node {
            Some(n) => {
                let bound_child = self.nodes.get(n).first_child.get();
                Some(eval_int(self, bound_child)?)
            }
            None => None,
        };

        // Loop-identifier tag, if this FOR loop declares one (node.symbol
        // is only ever non-empty when it does).
        let counter_tag = if self.nodes.get(node).symbol != a68_base::Symbol::EMPTY {
            self.scope.resolve_identifier(table, self.nodes.get(node).symbol)
        } else {
            None
        };

        let mut i = from;
        loop {
            if let Some(t) = to {
                if (by >= 0 && i > t) || (by < 0 && i < t) {
                    break;
                }
            }
            self.memory.frames.reinitialise_top();
            if let Some((tag_id, hops)) = counter_tag {
                let owner = self
                    .memory
                    .frames
                    .walk_static(frame, hops)
                    .expect("static-link chain matches the table chain by construction");
                let offset = self.scope.tag(tag_id).frame_offset as usize;
                self.memory.frames.body_mut(owner)[offset..offset + 8]
                    .copy_from_slice(&i.to_le_bytes());
            }
            if let Some(w) = while_node {
                let keep_going = matches!(
                    self.eval(w, table, frame)?.expect_scalar(span)?,
                    Scalar::Bool(true)
                );
                if !keep_going {
                    break;
                }
            }
            let result = self.eval_voided(body, table, frame)?;
            if let Value::Jump(target) = result {
                return Ok(Value::Jump(target));
            }
            if let Some(u) = until_node {
                let stop = matches!(
                    self.eval(u, table, frame)?.expect_scalar(span)?,
                    Scalar::Bool(true)
                );
                if stop {
                    break;
                }
            }
            i = match i.checked_add(by) {
                Some(n) => n,
                None => break,
            };
            if to.is_none() && by == 0 {
                break;
            }
        }
        Ok(Value::Void)
    }

    fn eval_conditional(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let enquiry = children.next().expect("conditional has an enquiry clause");
        let then_branch = children.next().expect("conditional has a then branch");
        let else_branch = children.next();
        let span = Span::default();
        let cond = self.eval(enquiry, table, frame)?.expect_scalar(span)?;
        let taken = matches!(cond, Scalar::Bool(true));
        if taken {
            self.eval(then_branch, table, frame)
        } else if let Some(else_node) = else_branch {
            self.eval(else_node, table, frame)
        } else {
            Ok(Value::Void)
        }
    }

    /// `CASE ~ IN ~, ~, ... OUT ~ ESAC`: the enquiry's
    /// value (1-based) selects an `IN` arm; the last child is always the
    /// `OUT` arm, evaluated when the index falls outside `1..=n`.
    fn eval_integer_case(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let children: Vec<NodeId> = self.nodes.children(node).collect();
        let span = Span::default();
        let enquiry = *children.first().expect("case clause has an enquiry unit");
        let out = *children.last().expect("case clause carries an OUT arm");
        let arms = &children[1..children.len() - 1];
        let index = match self.eval(enquiry, table, frame)?.expect_scalar(span)? {
            Scalar::Int(i) => i,
            _ => {
                return Err(RuntimeError {
                    kind: RuntimeErrorKind::InvalidArgument {
                        operation: "case enquiry".to_string(),
                    },
                    span,
                })
            }
        };
        if index >= 1 && (index as usize) <= arms.len() {
            self.eval(arms[index as usize - 1], table, frame)
        } else {
            self.eval(out, table, frame)
        }
    }

    /// `CASE ~ IN (mode): ~, ... OUT ~ ESAC`: the
    /// enquiry must evaluate to a [`Value::Union`]; the first arm whose
    /// declared mode matches the active variant runs, otherwise `OUT` does.
    fn eval_united_case(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let children: Vec<NodeId> = self.nodes.children(node).collect();
        let span = Span::default();
        let enquiry = *children.first().expect("conformity clause has an enquiry unit");
        let out = *children.last().expect("conformity clause carries an OUT arm");
        let arms = &children[1..children.len() - 1];
        let active_mode = match self.eval(enquiry, table, frame)? {
            Value::Union(mode, _) => mode,
            _ => {
                return Err(RuntimeError {
                    kind: RuntimeErrorKind::InvalidArgument {
                        operation: "conformity enquiry is not a united value".to_string(),
                    },
                    span,
                })
            }
        };
        for &arm in arms {
            if let Some(arm_mode) = self.nodes.get(arm).mode.get() {
                if self.modes.canonical(arm_mode) == self.modes.canonical(active_mode) {
                    return self.eval(arm, table, frame);
                }
            }
        }
        self.eval(out, table, frame)
    }

    /// Evaluates a subscript or trimmer per dimension against the row
    /// descriptor's tuples. A position is either a MEEK-INT
    /// subscript, which consumes its dimension and folds a bounds-checked
    /// contribution into the flat offset, or a [`Attribute::Trimmer`],
    /// which keeps its dimension but narrows its tuple — "if any position
    /// is a trimmer, a new descriptor is synthesised with adjusted bounds,
    /// span, and shift per dimension". A full subscript list (no trimmers)
    /// yields a reference to one element, same as before this distinction
    /// existed; a mixed or all-trimmer list yields a reference to a fresh
    /// sub-array view, registered under its own offset in the heap's row
    /// bookkeeping so further slices or a later dereference can find it.
    fn eval_slice(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let array_node = children.next().expect("slice has an array child");
        let span = Span::default();
        let array_ref = self.eval(array_node, table, frame)?.expect_reference(span)?;
        let descriptor = self
            .row_descriptor_of(array_ref)
            .ok_or_else(|| RuntimeError {
                kind: RuntimeErrorKind::InvalidArgument {
                    operation: "slice of non-row value".to_string(),
                },
                span,
            })?;

        let index_nodes: Vec<NodeId> = children.collect();
        let mut consumed_sum: i64 = -(descriptor.field_offset as i64);
        let mut new_dims = Vec::new();
        for (dim, &idx_node) in index_nodes.iter().enumerate() {
            let tuple = *descriptor
                .dimensions
                .get(dim)
                .expect("indexer position count matches the row's dimensionality");
            if self.nodes.get(idx_node).attribute == Attribute::Trimmer {
                new_dims.push(self.eval_trimmer(idx_node, tuple, table, frame)?);
            } else {
                let k = match self.eval(idx_node, table, frame)?.expect_scalar(span)? {
                    Scalar::Int(i) => i,
                    _ => {
                        return Err(RuntimeError {
                            kind: RuntimeErrorKind::InvalidArgument {
                                operation: "slice index".to_string(),
                            },
                            span,
                        })
                    }
                };
                if k < tuple.lower_bound || k > tuple.upper_bound {
                    return Err(RuntimeError {
                        kind: RuntimeErrorKind::IndexOutOfBounds {
                            index: k,
                            lower: tuple.lower_bound,
                            upper: tuple.upper_bound,
                        },
                        span,
                    });
                }
                consumed_sum += tuple.span * k - tuple.shift;
            }
        }
        let new_base = (descriptor.slice_offset as i64 + consumed_sum * descriptor.element_size as i64) as u32;

        if new_dims.is_empty() {
            // Fully subscripted down to one element: the handle/offset
            // pair addresses real storage bytes directly, same as any
            // other reference.
            return Ok(Value::Reference(Reference {
                handle: Some(descriptor.handle),
                frame: None,
                offset: new_base,
                scope: array_ref.scope,
            }));
        }

        // Still a sub-array: give it its own descriptor handle sharing
        // the same storage, rather than reusing `new_base` as a row-meta
        // key — a pure trim's base offset often coincides exactly with
        // the parent's, which would silently clobber the parent's own
        // bookkeeping if descriptors and storage shared one key space.
        let result_mode = self.nodes.get(node).mode.get().unwrap_or(descriptor.element_mode);
        let view = self
            .memory
            .heap
            .allocate(0, result_mode, self.modes, &NoRoots)
            .map_err(|e| RuntimeError {
                kind: RuntimeErrorKind::HeapExhausted,
                span: e.span,
            })?;
        self.memory
            .heap
            .set_row_meta(view, descriptor.handle, new_base, descriptor.element_mode, new_dims);
        Ok(Value::Reference(Reference {
            handle: Some(view),
            frame: None,
            offset: 0,
            scope: array_ref.scope,
        }))
    }

    /// Narrows one dimension's [`Tuple`] per a trimmer's optional
    /// `l:u@r` parts. Each part is
    /// either a unit node or an [`Attribute::Skip`] placeholder standing in
    /// for an omitted one. A trimmer with all three parts omitted leaves
    /// the dimension untouched; otherwise the requested bounds are checked
    /// against the old tuple, and the new lower bound is the explicit `@r`
    /// if given, else renumbered to start at 1.
    fn eval_trimmer(
        &mut self,
        trimmer_node: NodeId,
        old_tuple: Tuple,
        table: TableId,
        frame: FramePointer,
    ) -> Result<Tuple, RuntimeError> {
        let span = Span::default();
        let mut parts = self.nodes.children(trimmer_node);
        let lower_node = parts.next();
        let upper_node = parts.next();
        let shift_node = parts.next();

        let eval_part = |this: &mut Self, n: Option<NodeId>| -> Result<Option<i64>, RuntimeError> {
            match n {
                Some(n) if this.nodes.get(n).attribute != Attribute::Skip => {
                    match this.eval(n, table, frame)?.expect_scalar(span)? {
                        Scalar::Int(i) => Ok(Some(i)),
                        _ => Err(RuntimeError {
                            kind: RuntimeErrorKind::InvalidArgument {
                                operation: "trimmer bound".to_string(),
                            },
                            span,
                        }),
                    }
                }
                _ => Ok(None),
            }
        };

        let lower = eval_part(self, lower_node)?;
        let upper = eval_part(self, upper_node)?;
        let shift = eval_part(self, shift_node)?;

        if lower.is_none() && upper.is_none() && shift.is_none() {
            return Ok(old_tuple);
        }
        let l = lower.unwrap_or(old_tuple.lower_bound);
        let u = upper.unwrap_or(old_tuple.upper_bound);
        if l < old_tuple.lower_bound || u > old_tuple.upper_bound {
            return Err(RuntimeError {
                kind: RuntimeErrorKind::TrimmerBoundsMismatch,
                span,
            });
        }
        let d = match shift {
            Some(k) => l - k,
            None => l - 1,
        };
        Ok(old_tuple.trim(l - d, u - d, l))
    }

    /// Reconstructs a [`RowDescriptor`] from a reference's handle, which
    /// must itself be a ROW *descriptor* handle (one with row bookkeeping
    /// registered against it — either a generator's own fresh descriptor
    /// or a prior trim's), and resolves it down to the underlying storage
    /// handle plus base byte offset the descriptor's tuples index into.
    fn row_descriptor_of(&self, r: Reference) -> Option<RowDescriptor> {
        let handle = r.handle?;
        let meta = self.memory.heap.row_meta(handle)?.clone();
        let element_size = self.mode_byte_size(meta.element_mode);
        Some(RowDescriptor {
            handle: meta.storage,
            element_mode: meta.element_mode,
            element_size,
            slice_offset: meta.base_offset,
            field_offset: 0,
            dimensions: meta.dimensions,
        })
    }

    /// `s OF struct` field access. Every field occupies
    /// one fixed-width slot, matching the flat slot layout the rest of this
    /// evaluator gives every scalar.
    fn eval_selection(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let struct_node = self.nodes.get(node).first_child.get();
        let span = Span::default();
        let struct_ref = self.eval(struct_node, table, frame)?.expect_reference(span)?;
        let struct_mode = self.nodes.get(struct_node).mode.get().ok_or_else(|| RuntimeError {
            kind: RuntimeErrorKind::InvalidArgument {
                operation: "selection of an untyped operand".to_string(),
            },
            span,
        })?;
        let field = self.nodes.get(node).symbol;
        let canon = self.modes.canonical(struct_mode);
        let index = match self.modes.shape(canon) {
            ModeShape::Struct(pack) => pack.0.iter().position(|item| item.field_name == Some(field)),
            _ => None,
        }
        .ok_or_else(|| RuntimeError {
            kind: RuntimeErrorKind::InvalidArgument {
                operation: "selection field not found in struct mode".to_string(),
            },
            span,
        })?;
        let field_offset = index as u32 * crate::SCALAR_SLOT_SIZE;
        Ok(Value::Reference(Reference {
            handle: struct_ref.handle,
            frame: struct_ref.frame,
            offset: struct_ref.offset + field_offset,
            scope: struct_ref.scope,
        }))
    }

    /// `IS`/`ISNT`: compares two names for
    /// identity rather than comparing the values they address.
    fn eval_identity_relation(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let left = children.next().expect("identity relation has a left operand");
        let right = children.next().expect("identity relation has a right operand");
        let span = Span::default();
        let l = self.eval(left, table, frame)?.expect_reference(span)?;
        let r = self.eval(right, table, frame)?.expect_reference(span)?;
        let text = self.interner.resolve(self.nodes.get(node).symbol);
        let identical = l == r;
        let result = if text == "ISNT" { !identical } else { identical };
        Ok(Value::Scalar(Scalar::Bool(result)))
    }

    /// `GOTO label` / bare label jump. Resolution here only needs the lexical
    /// symbol table, since the target frame is found by scanning dynamic
    /// links outward once the [`Value::Jump`] reaches an enclosing serial
    /// clause whose table owns the label.
    fn eval_jump(&mut self, node: NodeId, table: TableId) -> EvalResult {
        let symbol = self.nodes.get(node).symbol;
        let span = Span::default();
        match self.scope.resolve_label(table, symbol) {
            Some((_, tag)) => Ok(Value::Jump(tag)),
            None => Err(RuntimeError {
                kind: RuntimeErrorKind::JumpAcrossThreads,
                span,
            }),
        }
    }

    /// An operator used as an operand, e.g. passed to `PROC(INT,INT)INT`
    /// formal parameter. Resolves the nearest
    /// overload visible from `table` and wraps it as a procedure value.
    fn eval_operator_ref(&mut self, node: NodeId, table: TableId) -> EvalResult {
        let symbol = self.nodes.get(node).symbol;
        let span = Span::default();
        let tag_id = self
            .scope
            .resolve_operators(table, symbol)
            .into_iter()
            .next()
            .ok_or_else(|| RuntimeError {
                kind: RuntimeErrorKind::InvalidArgument {
                    operation: "undeclared operator reference".to_string(),
                },
                span,
            })?;
        let tag = self.scope.tag(tag_id).clone();
        let mode = tag.mode.unwrap_or(ModeId(0));
        let body = if tag.is_standard_env {
            ProcedureBody::Standard(symbol)
        } else {
            ProcedureBody::User(tag.defining_node)
        };
        Ok(Value::Procedure(ProcedureValue {
            body,
            environ_level: self.scope.level_of(table),
            locale: None,
            mode,
        }))
    }

    /// `MODE x = e`: stores `e`'s value at
    /// the tag's frame offset. A plain PROC-moded initializer needs no
    /// storage — [`Evaluator::eval_identifier_load`] reconstructs it
    /// directly from the tag's defining routine text — but a curried
    /// initializer's locale is stored so later loads of `x` pick up the
    /// same partially-applied state rather than a fresh one.
    fn eval_identity_declaration(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let tag_id = self
            .nodes
            .get(node)
            .tag
            .get()
            .expect("identity declaration carries its resolved tag");
        let tag = self.scope.tag(tag_id).clone();
        let init = self.nodes.get(node).first_child.get();
        if init.is_none() {
            return Ok(Value::Void);
        }
        let value = self.eval(init, table, frame)?;
        let span = Span::default();
        let bits = match &value {
            Value::Procedure(p) => match &p.locale {
                Some(l) => encode_locale_bits(l),
                None => return Ok(Value::Void),
            },
            Value::Reference(r) => encode_reference_bits(*r),
            _ => scalar_to_bits(value.expect_scalar(span)?),
        };
        self.memory.frames.body_mut(frame)[tag.frame_offset as usize..tag.frame_offset as usize + 8]
            .copy_from_slice(&bits.to_le_bytes());
        Ok(Value::Void)
    }

    /// `MODE x := e`: like an identity
    /// declaration, but the tag's own mode is REF-wrapped — the initial
    /// value is stored as the referent, not the name itself.
    fn eval_variable_declaration(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        self.eval_identity_declaration(node, table, frame)
    }

    fn eval_call(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let callee_node = children.next().expect("call has a callee child");
        let span = Span::default();
        let callee = self.eval(callee_node, table, frame)?;
        let proc = match callee {
            Value::Procedure(p) => p,
            _ => {
                return Err(RuntimeError {
                    kind: RuntimeErrorKind::InvalidArgument {
                        operation: "call of a non-procedure value".to_string(),
                    },
                    span,
                })
            }
        };
        let mut args = Vec::new();
        for arg_node in children {
            args.push(self.eval(arg_node, table, frame)?.expect_scalar(span)?);
        }
        self.invoke_procedure(proc, args, table, frame, span)
    }

    /// Merges `args` into any existing locale; if every slot is filled the
    /// body is entered, otherwise a new partial procedure is pushed
    ///. Unfilled slots are bound left-to-right in
    /// declaration order regardless of how many earlier calls already
    /// partially applied this value.
    fn invoke_procedure(
        &mut self,
        proc: ProcedureValue,
        args: Vec<Scalar>,
        table: TableId,
        frame: FramePointer,
        span: Span,
    ) -> EvalResult {
        let total_params = match self.modes.shape(self.modes.canonical(proc.mode)).clone() {
            ModeShape::Proc(ref pack, _) => pack.0.len(),
            _ => args.len(),
        };

        let (handle, mut filled) = match &proc.locale {
            Some(l) => (l.handle, l.filled.clone()),
            None => {
                let block_size = (total_params * crate::SCALAR_SLOT_SIZE as usize) as u32;
                let h = self
                    .memory
                    .heap
                    .allocate(block_size, proc.mode, self.modes, &NoRoots)
                    .map_err(|e| RuntimeError {
                        kind: RuntimeErrorKind::HeapExhausted,
                        span: e.span,
                    })?;
                (h, vec![false; total_params])
            }
        };

        let mut incoming = args.into_iter();
        for i in 0..total_params {
            if filled[i] {
                continue;
            }
            let Some(arg) = incoming.next() else { break };
            let bits = scalar_to_bits(arg);
            let offset = self.memory.heap.offset(handle) as usize + i * crate::SCALAR_SLOT_SIZE as usize;
            self.memory.heap.bytes_mut()[offset..offset + 8].copy_from_slice(&bits.to_le_bytes());
            filled[i] = true;
        }

        if filled.iter().all(|&f| f) {
            match proc.body {
                ProcedureBody::User(body_node) => {
                    // A routine text's own node always re-wraps itself as a
                    // procedure value when evaluated directly; the unit actually run on a call is its child.
                    let unit = if self.nodes.get(body_node).attribute == Attribute::RoutineText {
                        self.nodes.get(body_node).first_child.get()
                    } else {
                        body_node
                    };
                    let new_frame =
                        self.memory.frames.push(Some(frame), proc.environ_level + 1, body_node, 0);
                    for i in 0..total_params {
                        let offset = self.memory.heap.offset(handle) as usize + i * crate::SCALAR_SLOT_SIZE as usize;
                        let bits = i64::from_le_bytes(
                            self.memory.heap.bytes()[offset..offset + 8].try_into().unwrap(),
                        );
                        self.memory.frames.widen_top(crate::SCALAR_SLOT_SIZE);
                        let body = self.memory.frames.body_mut(new_frame);
                        let foffset = i * crate::SCALAR_SLOT_SIZE as usize;
                        body[foffset..foffset + 8].copy_from_slice(&bits.to_le_bytes());
                    }
                    let result = self.eval(unit, table, new_frame);
                    self.memory.frames.pop();
                    result
                }
                ProcedureBody::Standard(symbol) => {
                    let name = self.interner.resolve(symbol);
                    let scalars: Vec<Scalar> = (0..total_params)
                        .map(|i| {
                            let offset =
                                self.memory.heap.offset(handle) as usize + i * crate::SCALAR_SLOT_SIZE as usize;
                            let bits = i64::from_le_bytes(
                                self.memory.heap.bytes()[offset..offset + 8].try_into().unwrap(),
                            );
                            decode_scalar(bits, None, self.modes)
                        })
                        .collect();
                    if scalars.len() == 2 {
                        dispatch_primitive(name, scalars[0], Some(scalars[1]))
                            .map(Value::Scalar)
                            .map_err(|kind| RuntimeError { kind, span })
                    } else if scalars.len() == 1 {
                        dispatch_primitive(name, scalars[0], None)
                            .map(Value::Scalar)
                            .map_err(|kind| RuntimeError { kind, span })
                    } else {
                        Ok(Value::Void)
                    }
                }
                ProcedureBody::Skip => Ok(Value::Void),
            }
        } else {
            Ok(Value::Procedure(ProcedureValue {
                body: proc.body,
                environ_level: proc.environ_level,
                locale: Some(Locale {
                    handle,
                    filled,
                    values_offset: 0,
                }),
                mode: proc.mode,
            }))
        }
    }

    /// Pushes a PROC value whose environment is the current frame's
    /// static-link level.
    fn eval_routine_text(&mut self, node: NodeId, _table: TableId, frame: FramePointer) -> EvalResult {
        let mode = self.nodes.get(node).mode.get().unwrap_or(crate::mode::ModeId(0));
        Ok(Value::Procedure(ProcedureValue {
            body: ProcedureBody::User(node),
            environ_level: self.memory.frames.header(frame).lexical_level,
            locale: None,
            mode,
        }))
    }

    fn eval_and_then(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let left = children.next().unwrap();
        let right = children.next().unwrap();
        let span = Span::default();
        let lv = self.eval(left, table, frame)?.expect_scalar(span)?;
        if matches!(lv, Scalar::Bool(false)) {
            return Ok(Value::Scalar(Scalar::Bool(false)));
        }
        self.eval(right, table, frame)
    }

    fn eval_or_else(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let mut children = self.nodes.children(node);
        let left = children.next().unwrap();
        let right = children.next().unwrap();
        let span = Span::default();
        let lv = self.eval(left, table, frame)?.expect_scalar(span)?;
        if matches!(lv, Scalar::Bool(true)) {
            return Ok(Value::Scalar(Scalar::Bool(true)));
        }
        self.eval(right, table, frame)
    }

    fn eval_assertion(&mut self, node: NodeId, table: TableId, frame: FramePointer) -> EvalResult {
        let child = self.nodes.get(node).first_child.get();
        let span = Span::default();
        let v = self.eval(child, table, frame)?.expect_scalar(span)?;
        if matches!(v, Scalar::Bool(true)) {
            Ok(Value::Void)
        } else {
            Err(RuntimeError {
                kind: RuntimeErrorKind::AssertionFalse,
                span,
            })
        }
    }
}

/// Decodes a raw little-endian 64-bit slot back into a [`Scalar`] per
/// `mode`'s primitive shape, mirroring [`Evaluator::eval_denoter`]'s own
/// per-mode construction. Falls back to `Scalar::Int` for an unresolved mode,
/// matching every other untyped-slot reader in this evaluator.
fn decode_scalar(bits: i64, mode: Option<ModeId>, modes: &ModeTable) -> Scalar {
    match mode.map(|m| modes.shape(modes.canonical(m)).clone()) {
        Some(ModeShape::Primitive(Primitive::Real)) => Scalar::Real(f64::from_bits(bits as u64)),
        Some(ModeShape::Primitive(Primitive::Bool)) => Scalar::Bool(bits != 0),
        Some(ModeShape::Primitive(Primitive::Char)) => {
            Scalar::Char(char::from_u32(bits as u32).unwrap_or('\0'))
        }
        Some(ModeShape::Primitive(Primitive::Bits)) => Scalar::Bits(bits as u64),
        _ => Scalar::Int(bits),
    }
}

/// Encodes a [`Scalar`] into the raw little-endian 64-bit slot representation
/// every frame/heap segment in this evaluator uses. `Complex` has no one-slot representation here and
/// is not addressable through a single scalar slot; callers never reach it
/// since COMPLEX values do not flow through assignation or argument passing
/// in this evaluator slice.
fn scalar_to_bits(s: Scalar) -> i64 {
    match s {
        Scalar::Int(i) => i,
        Scalar::Real(r) => r.to_bits() as i64,
        Scalar::Bool(b) => b as i64,
        Scalar::Char(c) => c as i64,
        Scalar::Bits(b) => b as i64,
        Scalar::Complex(_, _) => 0,
    }
}

/// Packs a [`Reference`] into the same untyped 64-bit slot a scalar would
/// occupy. Bit 63 distinguishes
/// a heap handle from a `LOC` frame pointer, bit 62 flags NIL, the low 32
/// bits hold the handle/frame id, and the remaining bits hold the byte
/// offset and dynamic-scope tag.
fn encode_reference_bits(r: Reference) -> i64 {
    if r.is_nil() {
        return (1u64 << 62) as i64;
    }
    let (is_heap, id) = match (r.handle, r.frame) {
        (Some(h), _) => (1u64, h.0 as u64),
        (None, Some(f)) => (0u64, f.0 as u64),
        _ => (0u64, 0u64),
    };
    let offset = (r.offset as u64) & 0x3F_FFFF;
    let scope = (r.scope as u64) & 0xFF;
    let bits = id | (offset << 32) | (scope << 54) | (is_heap << 63);
    bits as i64
}

/// Inverse of [`encode_reference_bits`].
fn decode_reference_bits(bits: i64) -> Reference {
    let bits = bits as u64;
    if bits & (1 << 62) != 0 {
        return Reference::NIL;
    }
    let is_heap = bits >> 63 != 0;
    let id = (bits & 0xFFFF_FFFF) as u32;
    let offset = ((bits >> 32) & 0x3F_FFFF) as u32;
    let scope = ((bits >> 54) & 0xFF) as u32;
    if is_heap {
        Reference {
            handle: Some(HandleId(id)),
            frame: None,
            offset,
            scope,
        }
    } else {
        Reference {
            handle: None,
            frame: Some(FramePointer(id)),
            offset,
            scope,
        }
    }
}

/// Packs a curried procedure's [`Locale`] into one untyped 64-bit slot: the
/// locale's heap handle (offset by one so zero means "no locale") in the low
/// 32 bits, and which parameters are already filled as a bitmap in the high
/// 32 bits. `values_offset` is not
/// stored — it is always the locale block's own base, recomputed on readback.
fn encode_locale_bits(l: &Locale) -> i64 {
    let mut bitmap: u32 = 0;
    for (i, &f) in l.filled.iter().enumerate().take(32) {
        if f {
            bitmap |= 1 << i;
        }
    }
    let low = l.handle.0.wrapping_add(1);
    ((bitmap as u64) << 32 | low as u64) as i64
}

/// Inverse of [`encode_locale_bits`]. Returns `None` for the zero sentinel
/// (a plain, uncurried procedure value with nothing bound yet).
fn decode_locale_bits(bits: i64, param_count: usize) -> Option<Locale> {
    let bits = bits as u64;
    let low = (bits & 0xFFFF_FFFF) as u32;
    if low == 0 {
        return None;
    }
    let handle = HandleId(low - 1);
    let bitmap = (bits >> 32) as u32;
    let filled = (0..param_count).map(|i| bitmap & (1 << i) != 0).collect();
    Some(Locale {
        handle,
        filled,
        values_offset: 0,
    })
}

fn dispatch_primitive(name: &str, a: Scalar, b: Option<Scalar>) -> Result<Scalar, RuntimeErrorKind> {
    match (name, a, b) {
        ("+", Scalar::Int(x), Some(Scalar::Int(y))) => ops::int_add(x, y),
        ("-", Scalar::Int(x), Some(Scalar::Int(y))) => ops::int_sub(x, y),
        ("*", Scalar::Int(x), Some(Scalar::Int(y))) => ops::int_mul(x, y),
        ("/", Scalar::Int(x), Some(Scalar::Int(y))) => ops::int_div(x, y),
        ("+", Scalar::Real(x), Some(Scalar::Real(y))) => ops::real_add(x, y),
        ("-", Scalar::Real(x), Some(Scalar::Real(y))) => ops::real_sub(x, y),
        ("*", Scalar::Real(x), Some(Scalar::Real(y))) => ops::real_mul(x, y),
        ("/", Scalar::Real(x), Some(Scalar::Real(y))) => ops::real_div(x, y),
        ("AND", Scalar::Bool(x), Some(Scalar::Bool(y))) => ops::bool_and(x, y),
        ("OR", Scalar::Bool(x), Some(Scalar::Bool(y))) => ops::bool_or(x, y),
        ("NOT", Scalar::Bool(x), None) => ops::bool_not(x),
        _ => Err(RuntimeErrorKind::InvalidArgument {
            operation: name.to_string(),
        }),
    }
}

// Used to mark a generator as HEAP-allocating by node symbol; a real front
// end would instead carry this as part of the generator node's attribute
// or a dedicated field, but the tree-only contract here only gives us
// `symbol`, so the HEAP/LOC distinction is threaded through it.
pub fn generator_heap_symbol() -> a68_base::Symbol {
    a68_base::Symbol::EMPTY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RuntimeMemory;
    use a68_base::Interner;

    fn fresh<'a>(
        modes: &'a mut ModeTable,
        nodes: &'a mut NodeArena,
        scope: &'a mut ScopeResolver,
        memory: &'a mut RuntimeMemory,
        interner: &'a Interner,
    ) -> Evaluator<'a> {
        Evaluator {
            modes,
            nodes,
            scope,
            memory,
            interner,
        }
    }

    #[test]
    fn evaluates_integer_addition_formula() {
        // BEGIN INT i = 3 + 4; ... END.
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();
        let plus = interner.intern("+");
        let three = interner.intern("3");
        let four = interner.intern("4");
        let int_mode = modes.standard(Primitive::Int);

        let lhs = nodes.leaf(Attribute::Denoter, three);
        nodes.get(lhs).mode.set(Some(int_mode));
        let rhs = nodes.leaf(Attribute::Denoter, four);
        nodes.get(rhs).mode.set(Some(int_mode));
        let formula = nodes.with_children(Attribute::Formula, plus, &[lhs, rhs]);

        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let result = eval.eval(formula, table, frame).unwrap();
        match result {
            Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 7),
            other => panic!("expected Int(7), got {other:?}"),
        }
    }

    #[test]
    fn voiding_resets_expression_stack_pointer() {
        // The expression-stack pointer at clause exit must equal its entry value.
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let interner = Interner::new();
        let skip = nodes.leaf(Attribute::Skip, a68_base::Symbol::EMPTY);
        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let snapshot = memory.expr.pointer();
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        eval.eval_voided(skip, table, frame).unwrap();
        assert_eq!(eval.memory.expr.pointer(), snapshot);
    }

    #[test]
    fn assertion_false_is_a_fatal_error() {
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();
        let sym = interner.intern("false");
        let bool_mode = modes.standard(Primitive::Bool);
        let lit = nodes.leaf(Attribute::Denoter, sym);
        nodes.get(lit).mode.set(Some(bool_mode));
        let assertion = nodes.with_children(Attribute::Assertion, a68_base::Symbol::EMPTY, &[lit]);
        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let err = eval.eval(assertion, table, frame).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::AssertionFalse));
    }

    /// Builds an `l:u@r` trimmer node; an absent part is represented by an
    /// `Attribute::Skip` child (the internal convention `eval_trimmer`
    /// expects), never a bare missing child.
    fn build_trimmer(
        nodes: &mut NodeArena,
        interner: &mut Interner,
        int_mode: ModeId,
        lower: Option<i64>,
        upper: Option<i64>,
        shift: Option<i64>,
    ) -> NodeId {
        let part = |nodes: &mut NodeArena, interner: &mut Interner, v: Option<i64>| -> NodeId {
            match v {
                Some(n) => {
                    let sym = interner.intern(&n.to_string());
                    let lit = nodes.leaf(Attribute::Denoter, sym);
                    nodes.get(lit).mode.set(Some(int_mode));
                    lit
                }
                None => nodes.leaf(Attribute::Skip, a68_base::Symbol::EMPTY),
            }
        };
        let l = part(nodes, interner, lower);
        let u = part(nodes, interner, upper);
        let r = part(nodes, interner, shift);
        nodes.with_children(Attribute::Trimmer, a68_base::Symbol::EMPTY, &[l, u, r])
    }

    #[test]
    fn eval_trimmer_ported_from_genie_trimmer_revised_lower_bound() {
        // `[1:10] arr`, trimmed `[3:7 @ 1]`: L=3, U=7, D=L-1=2, so the new
        // dimension renumbers to 1:5 with shift -1 (matches
        // `original_source/source/engine.c`'s `genie_trimmer`).
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();
        let int_mode = modes.standard(Primitive::Int);
        let trimmer = build_trimmer(&mut nodes, &mut interner, int_mode, Some(3), Some(7), Some(1));
        let old_tuple = Tuple { lower_bound: 1, upper_bound: 10, span: 1, shift: 1 };
        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let new_tuple = eval.eval_trimmer(trimmer, old_tuple, table, frame).unwrap();
        assert_eq!(new_tuple.lower_bound, 1);
        assert_eq!(new_tuple.upper_bound, 5);
        assert_eq!(new_tuple.shift, -1);
    }

    #[test]
    fn eval_trimmer_with_all_parts_omitted_is_a_no_op() {
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();
        let int_mode = modes.standard(Primitive::Int);
        let trimmer = build_trimmer(&mut nodes, &mut interner, int_mode, None, None, None);
        let old_tuple = Tuple { lower_bound: 1, upper_bound: 10, span: 1, shift: 1 };
        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let new_tuple = eval.eval_trimmer(trimmer, old_tuple, table, frame).unwrap();
        assert_eq!(new_tuple, old_tuple);
    }

    #[test]
    fn eval_trimmer_rejects_bounds_wider_than_the_original() {
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();
        let int_mode = modes.standard(Primitive::Int);
        let trimmer = build_trimmer(&mut nodes, &mut interner, int_mode, Some(0), None, None);
        let old_tuple = Tuple { lower_bound: 1, upper_bound: 10, span: 1, shift: 1 };
        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 0);
        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let err = eval.eval_trimmer(trimmer, old_tuple, table, frame).unwrap_err();
        assert!(matches!(err.kind, RuntimeErrorKind::TrimmerBoundsMismatch));
    }

    /// Declares `REF [1:5] INT arr`, heap-allocates its backing row via a
    /// generator, and hand-fills five element slots, mirroring what
    /// `eval_identity_declaration`/`eval_generator` would do for
    /// `HEAP [1:5] INT arr`.
    fn declare_and_fill_array(
        modes: &mut ModeTable,
        nodes: &mut NodeArena,
        scope: &mut ScopeResolver,
        memory: &mut RuntimeMemory,
        interner: &mut Interner,
    ) -> (TableId, FramePointer, TagId, ModeId, ModeId) {
        let int_mode = modes.standard(Primitive::Int);
        let row_mode = modes.make_row(1, int_mode);
        let ref_row_mode = modes.make_ref(row_mode);

        let table = scope.new_table(None);
        let frame = memory.frames.push(None, 0, NodeId::NONE, 8);
        let arr_sym = interner.intern("arr");
        let tag_id = scope.declare_identifier(table, arr_sym, ref_row_mode, NodeId::NONE, Storage::Loc, 8);

        let one = interner.intern("1");
        let five = interner.intern("5");
        let lower = nodes.leaf(Attribute::Denoter, one);
        nodes.get(lower).mode.set(Some(int_mode));
        let upper = nodes.leaf(Attribute::Denoter, five);
        nodes.get(upper).mode.set(Some(int_mode));
        let bound = nodes.with_children(Attribute::Bound, a68_base::Symbol::EMPTY, &[lower, upper]);
        let generator = nodes.with_children(Attribute::Generator, generator_heap_symbol(), &[bound]);
        nodes.get(generator).mode.set(Some(row_mode));
        let decl = nodes.with_children(Attribute::IdentityDeclaration, a68_base::Symbol::EMPTY, &[generator]);
        nodes.get(decl).tag.set(Some(tag_id));

        {
            let mut eval = fresh(modes, nodes, scope, memory, interner);
            eval.eval(decl, table, frame).unwrap();

            let bits = i64::from_le_bytes(
                eval.memory.frames.body(frame)[0..8].try_into().unwrap(),
            );
            let descriptor_ref = decode_reference_bits(bits);
            let descriptor = eval.row_descriptor_of(descriptor_ref).expect("row descriptor");
            let base = eval.memory.heap.offset(descriptor.handle) as usize + descriptor.slice_offset as usize;
            for (i, v) in [10i64, 20, 30, 40, 50].iter().enumerate() {
                let off = base + i * 8;
                eval.memory.heap.bytes_mut()[off..off + 8].copy_from_slice(&v.to_le_bytes());
            }
        }
        (table, frame, tag_id, int_mode, row_mode)
    }

    #[test]
    fn subscript_slice_of_a_declared_array_reads_the_right_element() {
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(1024, 1024);
        let mut interner = Interner::new();
        let (table, frame, _tag, int_mode, row_mode) =
            declare_and_fill_array(&mut modes, &mut nodes, &mut scope, &mut memory, &mut interner);

        let arr_sym = interner.intern("arr");
        let arr_ident = nodes.leaf(Attribute::Identifier, arr_sym);
        let deref = nodes.splice_coercion(Attribute::Dereferencing, arr_ident, row_mode);
        let three = interner.intern("3");
        let idx = nodes.leaf(Attribute::Denoter, three);
        nodes.get(idx).mode.set(Some(int_mode));
        let slice = nodes.with_children(Attribute::Slice, a68_base::Symbol::EMPTY, &[deref, idx]);

        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let element_ref = eval.eval(slice, table, frame).unwrap();
        let span = a68_base::Span::default();
        let value = eval.dereference_value(element_ref, Some(int_mode), span).unwrap();
        match value {
            Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 30),
            other => panic!("expected Int(30), got {other:?}"),
        }
    }

    #[test]
    fn trimmed_slice_registers_a_narrower_view_without_disturbing_the_original() {
        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(1024, 1024);
        let mut interner = Interner::new();
        let (table, frame, _tag, int_mode, row_mode) =
            declare_and_fill_array(&mut modes, &mut nodes, &mut scope, &mut memory, &mut interner);

        let arr_sym = interner.intern("arr");
        let arr_ident = nodes.leaf(Attribute::Identifier, arr_sym);
        let deref = nodes.splice_coercion(Attribute::Dereferencing, arr_ident, row_mode);
        let trimmer = build_trimmer(&mut nodes, &mut interner, int_mode, Some(2), Some(4), None);
        let slice = nodes.with_children(Attribute::Slice, a68_base::Symbol::EMPTY, &[deref, trimmer]);

        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let view_ref = eval.eval(slice, table, frame).unwrap().expect_reference(a68_base::Span::default()).unwrap();
        let view = eval.row_descriptor_of(view_ref).expect("trimmed row descriptor");
        assert_eq!(view.dimensions[0].lower_bound, 1);
        assert_eq!(view.dimensions[0].upper_bound, 3);

        // New index 1 maps to the original array's element 2 (value 20).
        let flat = view.flat_offset(&[1]).unwrap();
        let base = eval.memory.heap.offset(view.handle) as usize;
        let bits = i64::from_le_bytes(
            eval.memory.heap.bytes()[base + flat as usize..base + flat as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(bits, 20);

        // Re-reading "arr" from scratch must still see the original, full
        // 1:5 bounds — a prior bug let the trimmed view's registration
        // clobber the base array's own row bookkeeping.
        let original_bits =
            i64::from_le_bytes(eval.memory.frames.body(frame)[0..8].try_into().unwrap());
        let original_ref = decode_reference_bits(original_bits);
        let original = eval.row_descriptor_of(original_ref).expect("original row descriptor");
        assert_eq!(original.dimensions[0].lower_bound, 1);
        assert_eq!(original.dimensions[0].upper_bound, 5);
    }

    #[test]
    fn proc_call_resolves_parameters_against_the_routine_s_own_table() {
        // PROC add = (INT a, INT b) INT: a + b; print(add(2, 3))
        //. "a"/"b" are declared in the routine text's own
        // parameter table, a child of the call site's table, not the call
        // site's table itself — a node that opens its own lexical level
        // carries that table on its `table` scratch field, which `eval`
        // must prefer over the table inherited from its caller.
        use crate::mode::{Pack, PackItem};

        let mut modes = ModeTable::new();
        let mut nodes = NodeArena::new();
        let mut scope = ScopeResolver::new();
        let mut memory = RuntimeMemory::new(256, 256);
        let mut interner = Interner::new();

        let int_mode = modes.standard(Primitive::Int);
        let proc_mode = modes.make_proc(
            Pack(vec![
                PackItem { mode: int_mode, field_name: None },
                PackItem { mode: int_mode, field_name: None },
            ]),
            int_mode,
        );

        let root_table = scope.new_table(None);
        let param_table = scope.new_table(Some(root_table));

        let a_sym = interner.intern("a");
        let b_sym = interner.intern("b");
        scope.declare_identifier(param_table, a_sym, int_mode, NodeId::NONE, Storage::Loc, 8);
        scope.declare_identifier(param_table, b_sym, int_mode, NodeId::NONE, Storage::Loc, 8);

        let a_ident = nodes.leaf(Attribute::Identifier, a_sym);
        let b_ident = nodes.leaf(Attribute::Identifier, b_sym);
        let plus = interner.intern("+");
        let body = nodes.with_children(Attribute::Formula, plus, &[a_ident, b_ident]);
        // The body's own node carries the parameter table: everything
        // evaluated under it resolves "a"/"b" there instead of wherever
        // the call happened to come from.
        nodes.get(body).table.set(Some(param_table));

        let routine_text = nodes.with_children(Attribute::RoutineText, a68_base::Symbol::EMPTY, &[body]);
        nodes.get(routine_text).mode.set(Some(proc_mode));

        let add_sym = interner.intern("add");
        let add_tag = scope.declare_identifier(
            root_table,
            add_sym,
            proc_mode,
            routine_text,
            Storage::Loc,
            8,
        );
        let _ = add_tag;

        // An unrelated "a" bound directly in the root table proves the
        // call resolves against the routine's own table, not the caller's:
        // if the override were missing, the formula would pick up this
        // value (99) instead of the argument (2).
        let shadow_sym = interner.intern("a");
        scope.declare_identifier(root_table, shadow_sym, int_mode, NodeId::NONE, Storage::Loc, 8);

        let frame = memory.frames.push(None, 0, NodeId::NONE, 16);
        {
            let shadow_bits = 99i64.to_le_bytes();
            memory.frames.body_mut(frame)[8..16].copy_from_slice(&shadow_bits);
        }

        let two = interner.intern("2");
        let three = interner.intern("3");
        let arg_a = nodes.leaf(Attribute::Denoter, two);
        nodes.get(arg_a).mode.set(Some(int_mode));
        let arg_b = nodes.leaf(Attribute::Denoter, three);
        nodes.get(arg_b).mode.set(Some(int_mode));
        let callee = nodes.leaf(Attribute::Identifier, add_sym);
        let call = nodes.with_children(Attribute::Call, a68_base::Symbol::EMPTY, &[callee, arg_a, arg_b]);

        let mut eval = fresh(&mut modes, &mut nodes, &mut scope, &mut memory, &interner);
        let result = eval.eval(call, root_table, frame).unwrap();
        match result {
            Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 5),
            other => panic!("expected Int(5), got {other:?}"),
        }
    }
}
