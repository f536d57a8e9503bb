//! End-to-end scenarios driven entirely through `a68_core`'s public surface
//!: each test builds a node tree by hand — the scanner, refinement
//! preprocessor and parser are out-of-scope collaborators this crate never
//! sees — wires up tags/frames the way a front end's declaration pass
//! would, and drives it through `Interpreter::evaluate`, the way
//! `logicaffeine_compile`'s interpreter tests construct `Stmt`/`Expr` trees
//! directly rather than round-tripping through a parser.

use a68_base::{Interner, Symbol};
use a68_core::{
    generator_heap_symbol, Attribute, Interpreter, ModeId, NodeId, Options, Pack, PackItem,
    Primitive, RuntimeErrorKind, Scalar, Storage, Value,
};

fn int_denoter(interp: &mut Interpreter, interner: &mut Interner, n: i64, int_mode: ModeId) -> NodeId {
    let sym = interner.intern(&n.to_string());
    let node = interp.nodes.leaf(Attribute::Denoter, sym);
    interp.nodes.get(node).mode.set(Some(int_mode));
    node
}

/// `BEGIN INT i = 3 + 4; i END`, through the public
/// `Interpreter` API rather than a bare `Evaluator`.
#[test]
fn closed_clause_binds_an_identity_and_reads_it_back() {
    let mut interp = Interpreter::new(Options::default());
    let mut interner = Interner::new();
    let int_mode = interp.modes.standard(Primitive::Int);

    let table = interp.scope.new_table(None);
    let i_sym = interner.intern("i");
    let i_tag = interp
        .scope
        .declare_identifier(table, i_sym, int_mode, NodeId::NONE, Storage::Loc, 8);

    let three = int_denoter(&mut interp, &mut interner, 3, int_mode);
    let four = int_denoter(&mut interp, &mut interner, 4, int_mode);
    let plus = interner.intern("+");
    let formula = interp.nodes.with_children(Attribute::Formula, plus, &[three, four]);
    let decl = interp
        .nodes
        .with_children(Attribute::IdentityDeclaration, Symbol::EMPTY, &[formula]);
    interp.nodes.get(decl).tag.set(Some(i_tag));

    let i_ident = interp.nodes.leaf(Attribute::Identifier, i_sym);
    let closed = interp
        .nodes
        .with_children(Attribute::ClosedClause, Symbol::EMPTY, &[decl, i_ident]);

    let frame = interp.memory.frames.push(None, 0, NodeId::NONE, 8);
    let result = interp.evaluate(closed, table, frame, &interner).unwrap();
    match result {
        Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 7),
        other => panic!("expected Int(7), got {other:?}"),
    }
}

/// Declares `[1:3] INT xs`, fills it via ordinary tree-level assignments
/// (`xs[k] := v`, the same path a real assignment statement takes), and
/// returns everything a caller needs to read elements back or probe bounds.
struct DeclaredArray {
    table: a68_core::TableId,
    frame: a68_core::runtime::FramePointer,
    int_mode: ModeId,
    row_mode: ModeId,
    xs_sym: Symbol,
    decl_and_fills: Vec<NodeId>,
}

fn declare_and_fill_xs(interp: &mut Interpreter, interner: &mut Interner) -> DeclaredArray {
    let int_mode = interp.modes.standard(Primitive::Int);
    let row_mode = interp.modes.make_row(1, int_mode);
    let ref_row_mode = interp.modes.make_ref(row_mode);

    let table = interp.scope.new_table(None);
    let xs_sym = interner.intern("xs");
    let xs_tag = interp
        .scope
        .declare_identifier(table, xs_sym, ref_row_mode, NodeId::NONE, Storage::Loc, 8);

    let lower = int_denoter(interp, interner, 1, int_mode);
    let upper = int_denoter(interp, interner, 3, int_mode);
    let bound = interp.nodes.with_children(Attribute::Bound, Symbol::EMPTY, &[lower, upper]);
    let generator = interp
        .nodes
        .with_children(Attribute::Generator, generator_heap_symbol(), &[bound]);
    interp.nodes.get(generator).mode.set(Some(row_mode));
    let decl = interp
        .nodes
        .with_children(Attribute::IdentityDeclaration, Symbol::EMPTY, &[generator]);
    interp.nodes.get(decl).tag.set(Some(xs_tag));

    let mut decl_and_fills = vec![decl];
    for (idx, val) in [(1i64, 10i64), (2, 20), (3, 30)] {
        let arr_ident = interp.nodes.leaf(Attribute::Identifier, xs_sym);
        let deref = interp.nodes.splice_coercion(Attribute::Dereferencing, arr_ident, row_mode);
        let idx_node = int_denoter(interp, interner, idx, int_mode);
        let slice = interp
            .nodes
            .with_children(Attribute::Slice, Symbol::EMPTY, &[deref, idx_node]);
        let val_node = int_denoter(interp, interner, val, int_mode);
        let assign = interp
            .nodes
            .with_children(Attribute::Assignation, Symbol::EMPTY, &[slice, val_node]);
        decl_and_fills.push(assign);
    }

    let frame = interp.memory.frames.push(None, 0, NodeId::NONE, 8);
    DeclaredArray { table, frame, int_mode, row_mode, xs_sym, decl_and_fills }
}

/// `BEGIN [1:3] INT xs := (10, 20, 30); print(xs[2]) END` — reads back element 2 as 20.
#[test]
fn array_subscript_reads_the_element_just_assigned() {
    let mut interp = Interpreter::new(Options::default());
    let mut interner = Interner::new();
    let arr = declare_and_fill_xs(&mut interp, &mut interner);

    let final_ident = interp.nodes.leaf(Attribute::Identifier, arr.xs_sym);
    let final_deref = interp.nodes.splice_coercion(Attribute::Dereferencing, final_ident, arr.row_mode);
    let idx = int_denoter(&mut interp, &mut interner, 2, arr.int_mode);
    let final_slice = interp
        .nodes
        .with_children(Attribute::Slice, Symbol::EMPTY, &[final_deref, idx]);
    let final_load = interp
        .nodes
        .splice_coercion(Attribute::Dereferencing, final_slice, arr.int_mode);

    let mut body = arr.decl_and_fills.clone();
    body.push(final_load);
    let closed = interp.nodes.with_children(Attribute::ClosedClause, Symbol::EMPTY, &body);

    let result = interp.evaluate(closed, arr.table, arr.frame, &interner).unwrap();
    match result {
        Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 20),
        other => panic!("expected Int(20), got {other:?}"),
    }
}

/// `xs[4]` on a `[1:3]` array
/// raises a fatal `IndexOutOfBounds` rather than reading past the block.
#[test]
fn array_subscript_out_of_bounds_raises_index_error() {
    let mut interp = Interpreter::new(Options::default());
    let mut interner = Interner::new();
    let arr = declare_and_fill_xs(&mut interp, &mut interner);

    let final_ident = interp.nodes.leaf(Attribute::Identifier, arr.xs_sym);
    let final_deref = interp.nodes.splice_coercion(Attribute::Dereferencing, final_ident, arr.row_mode);
    let idx = int_denoter(&mut interp, &mut interner, 4, arr.int_mode);
    let final_slice = interp
        .nodes
        .with_children(Attribute::Slice, Symbol::EMPTY, &[final_deref, idx]);

    let mut body = arr.decl_and_fills.clone();
    body.push(final_slice);
    let closed = interp.nodes.with_children(Attribute::ClosedClause, Symbol::EMPTY, &body);

    let err = interp.evaluate(closed, arr.table, arr.frame, &interner).unwrap_err();
    match err.kind {
        RuntimeErrorKind::IndexOutOfBounds { index, lower, upper } => {
            assert_eq!((index, lower, upper), (4, 1, 3));
        }
        other => panic!("expected IndexOutOfBounds, got {other:?}"),
    }
}

/// `INT sum := 0; FOR i FROM 1 TO 5 DO sum +:= i OD; sum` — a `FOR` loop
/// mutating a variable one lexical level up. The loop's own counter must
/// live in a frame distinct from `sum`'s: `eval_loop` reinitialises the
/// *entire* current top frame every iteration, so the counter's frame is given to it
/// by running the loop as the body of its own nested, immediately-invoked
/// procedure — the same one-frame-per-activation mechanism a real
/// `PROC VOID: (FOR i ...)` inline call would use, rather than a bare block
/// sharing `sum`'s frame.
#[test]
fn for_loop_accumulates_into_an_outer_variable() {
    let mut interp = Interpreter::new(Options::default());
    let mut interner = Interner::new();
    let int_mode = interp.modes.standard(Primitive::Int);
    let ref_int_mode = interp.modes.make_ref(int_mode);
    let void_mode = interp.modes.standard(Primitive::Void);
    let proc_mode = interp.modes.make_proc(Pack(vec![]), void_mode);

    let outer_table = interp.scope.new_table(None);
    let sum_sym = interner.intern("sum");
    let sum_tag = interp
        .scope
        .declare_identifier(outer_table, sum_sym, ref_int_mode, NodeId::NONE, Storage::Loc, 8);
    let accumulate_sym = interner.intern("accumulate");

    let zero = int_denoter(&mut interp, &mut interner, 0, int_mode);
    let sum_decl = interp
        .nodes
        .with_children(Attribute::VariableDeclaration, Symbol::EMPTY, &[zero]);
    interp.nodes.get(sum_decl).tag.set(Some(sum_tag));

    // The loop's own table: a child of `outer_table`, holding only "i".
    let loop_table = interp.scope.new_table(Some(outer_table));
    let i_sym = interner.intern("i");
    let i_tag = interp
        .scope
        .declare_identifier(loop_table, i_sym, int_mode, NodeId::NONE, Storage::Loc, 8);
    let _ = i_tag;

    let from_expr = int_denoter(&mut interp, &mut interner, 1, int_mode);
    let from_wrapper = interp.nodes.with_children(Attribute::LoopFrom, Symbol::EMPTY, &[from_expr]);
    let to_expr = int_denoter(&mut interp, &mut interner, 5, int_mode);
    let to_sym = interner.intern("TO");
    let to_wrapper = interp.nodes.with_children(Attribute::LoopTo, to_sym, &[to_expr]);

    // `sum +:= i`, i.e. `sum := sum + i`.
    let sum_name = interp.nodes.leaf(Attribute::Identifier, sum_sym);
    let sum_value_ident = interp.nodes.leaf(Attribute::Identifier, sum_sym);
    let sum_deref = interp.nodes.splice_coercion(Attribute::Dereferencing, sum_value_ident, int_mode);
    let i_ident = interp.nodes.leaf(Attribute::Identifier, i_sym);
    let plus = interner.intern("+");
    let sum_plus_i = interp.nodes.with_children(Attribute::Formula, plus, &[sum_deref, i_ident]);
    let body_assign = interp
        .nodes
        .with_children(Attribute::Assignation, Symbol::EMPTY, &[sum_name, sum_plus_i]);
    let do_wrapper = interp.nodes.with_children(Attribute::LoopDo, Symbol::EMPTY, &[body_assign]);

    let loop_node = interp
        .nodes
        .with_children(Attribute::Loop, i_sym, &[from_wrapper, to_wrapper, do_wrapper]);
    interp.nodes.get(loop_node).table.set(Some(loop_table));

    let routine_text = interp.nodes.with_children(Attribute::RoutineText, Symbol::EMPTY, &[loop_node]);
    interp.nodes.get(routine_text).mode.set(Some(proc_mode));
    let accumulate_tag = interp.scope.declare_identifier(
        outer_table,
        accumulate_sym,
        proc_mode,
        routine_text,
        Storage::Loc,
        8,
    );
    let accumulate_decl = interp
        .nodes
        .with_children(Attribute::IdentityDeclaration, Symbol::EMPTY, &[routine_text]);
    interp.nodes.get(accumulate_decl).tag.set(Some(accumulate_tag));

    let callee = interp.nodes.leaf(Attribute::Identifier, accumulate_sym);
    let call = interp.nodes.with_children(Attribute::Call, Symbol::EMPTY, &[callee]);

    let sum_final_ident = interp.nodes.leaf(Attribute::Identifier, sum_sym);
    let sum_final_deref = interp.nodes.splice_coercion(Attribute::Dereferencing, sum_final_ident, int_mode);

    let closed = interp.nodes.with_children(
        Attribute::ClosedClause,
        Symbol::EMPTY,
        &[sum_decl, accumulate_decl, call, sum_final_deref],
    );

    let frame = interp.memory.frames.push(None, 0, NodeId::NONE, 16);
    let result = interp.evaluate(closed, outer_table, frame, &interner).unwrap();
    match result {
        Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 15),
        other => panic!("expected Int(15), got {other:?}"),
    }
}

/// Calling a two-parameter procedure with one argument yields a partially
/// applied [`Value::Procedure`] carrying a `Locale`; supplying the second
/// argument on a later call completes it. This is the mechanism the evaluator
/// actually implements for partial application — distinct from capturing a
/// nested routine text's free variables in a closure, which this evaluator
/// does not support once the defining call has returned.
#[test]
fn partial_call_returns_a_locale_then_completes_on_the_next_call() {
    let mut interp = Interpreter::new(Options::default());
    let mut interner = Interner::new();
    let int_mode = interp.modes.standard(Primitive::Int);
    let proc_mode = interp.modes.make_proc(
        Pack(vec![
            PackItem { mode: int_mode, field_name: None },
            PackItem { mode: int_mode, field_name: None },
        ]),
        int_mode,
    );

    let root_table = interp.scope.new_table(None);
    let param_table = interp.scope.new_table(Some(root_table));
    let a_sym = interner.intern("a");
    let b_sym = interner.intern("b");
    interp
        .scope
        .declare_identifier(param_table, a_sym, int_mode, NodeId::NONE, Storage::Loc, 8);
    interp
        .scope
        .declare_identifier(param_table, b_sym, int_mode, NodeId::NONE, Storage::Loc, 8);

    let a_ident = interp.nodes.leaf(Attribute::Identifier, a_sym);
    let b_ident = interp.nodes.leaf(Attribute::Identifier, b_sym);
    let plus = interner.intern("+");
    let body = interp.nodes.with_children(Attribute::Formula, plus, &[a_ident, b_ident]);
    interp.nodes.get(body).table.set(Some(param_table));
    let routine_text = interp.nodes.with_children(Attribute::RoutineText, Symbol::EMPTY, &[body]);
    interp.nodes.get(routine_text).mode.set(Some(proc_mode));

    let add_sym = interner.intern("add");
    interp
        .scope
        .declare_identifier(root_table, add_sym, proc_mode, routine_text, Storage::Loc, 8);

    // `PROC f = add(10)`: f is bound to the same routine text, partially
    // applied — its tag carries its own frame slot for the Locale bits.
    let f_sym = interner.intern("f");
    let f_tag = interp
        .scope
        .declare_identifier(root_table, f_sym, proc_mode, routine_text, Storage::Loc, 8);

    let ten = int_denoter(&mut interp, &mut interner, 10, int_mode);
    let callee = interp.nodes.leaf(Attribute::Identifier, add_sym);
    let partial_call = interp.nodes.with_children(Attribute::Call, Symbol::EMPTY, &[callee, ten]);
    let f_decl = interp
        .nodes
        .with_children(Attribute::IdentityDeclaration, Symbol::EMPTY, &[partial_call]);
    interp.nodes.get(f_decl).tag.set(Some(f_tag));

    let five = int_denoter(&mut interp, &mut interner, 5, int_mode);
    let f_callee = interp.nodes.leaf(Attribute::Identifier, f_sym);
    let second_call = interp.nodes.with_children(Attribute::Call, Symbol::EMPTY, &[f_callee, five]);

    let closed = interp
        .nodes
        .with_children(Attribute::ClosedClause, Symbol::EMPTY, &[f_decl, second_call]);

    let frame = interp.memory.frames.push(None, 0, NodeId::NONE, 16);
    let result = interp.evaluate(closed, root_table, frame, &interner).unwrap();
    match result {
        Value::Scalar(Scalar::Int(n)) => assert_eq!(n, 15),
        other => panic!("expected Int(15), got {other:?}"),
    }
}
