//! The coercion engine: decides whether a source mode can be brought
//! to a target mode under a context, and splices the coercion nodes that
//! record how.

use a68_base::{SpannedError, Span};

use crate::mode::{ModeId, ModeShape, ModeTable, Primitive};
use crate::node::{Attribute, NodeArena, NodeId};

/// The coercion-context lattice: `SOFT < WEAK < MEEK < FIRM <
/// STRONG`, each allowing every coercion of the weaker contexts plus its
/// own. Discriminants are assigned in increasing order so `Ord`/`PartialOrd`
/// follow the lattice directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Context {
    Soft,
    Weak,
    Meek,
    Firm,
    Strong,
}

/// How `FLEX`-ness is treated when testing row coercibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeflexPolicy {
    /// Equates `FLEX []A` and `[]A` outright.
    Force,
    /// Permits the relaxation one way, only if the source carries no `REF`.
    Alias,
    /// Permits it only for pure values (no `REF`, no `FLEX` residue below).
    Safe,
    /// Never relax `FLEX`-ness.
    NoDeflexing,
}

/// Tests `deprefable(M)`: `M` is `REF T` or a niladic `PROC () T`.
pub fn deprefable(table: &ModeTable, m: ModeId) -> bool {
    match table.shape(table.canonical(m)) {
        ModeShape::Ref(_) => true,
        ModeShape::Proc(pack, _) => pack.0.is_empty(),
        _ => false,
    }
}

/// The closed widening table over numeric standards,
/// one step at a time. [`widening_path`] below takes the transitive closure.
fn widens_one_step(table: &ModeTable, p: ModeId, q: ModeId) -> bool {
    let p = table.canonical(p);
    let q = table.canonical(q);
    match (table.shape(p), table.shape(q)) {
        (ModeShape::Primitive(Primitive::Int), ModeShape::Primitive(Primitive::Real)) => true,
        (ModeShape::Primitive(Primitive::Real), ModeShape::Primitive(Primitive::Complex)) => true,
        (ModeShape::Primitive(Primitive::Int), ModeShape::Long { depth: 1, of: Primitive::Int }) => {
            true
        }
        (
            ModeShape::Long { depth: d1, of: Primitive::Int },
            ModeShape::Long { depth: d2, of: Primitive::Int },
        ) if *d2 == d1 + 1 => true,
        (
            ModeShape::Long { depth, of: Primitive::Int },
            ModeShape::Long { depth: d2, of: Primitive::Real },
        ) if d2 == depth => true,
        (
            ModeShape::Long { depth: d1, of: Primitive::Real },
            ModeShape::Long { depth: d2, of: Primitive::Real },
        ) if *d2 == d1 + 1 => true,
        (
            ModeShape::Long { depth, of: Primitive::Real },
            ModeShape::Long { depth: d2, of: Primitive::Complex },
        ) if d2 == depth => true,
        (
            ModeShape::Long { depth: d1, of: Primitive::Complex },
            ModeShape::Long { depth: d2, of: Primitive::Complex },
        ) if *d2 == d1 + 1 => true,
        (ModeShape::Primitive(Primitive::Bits), ModeShape::Row { dim: 1, of })
            if matches!(table.shape(table.canonical(*of)), ModeShape::Primitive(Primitive::Bool)) =>
        {
            true
        }
        _ => false,
    }
}

/// Finds a chain of [`widens_one_step`] edges from `p` to `q`, returning the
/// mode reached after each step (the last element always `q`), or `None` if
/// no such chain exists. A breadth-first search over every mode this
/// program has actually interned, since the numeric ladder (`INT` through
/// however many `LONG`s the program declares, `REAL` through `COMPLEX`) has
/// no fixed length to enumerate independent of the mode table's own
/// contents.
fn widening_path(table: &ModeTable, p: ModeId, q: ModeId) -> Option<Vec<ModeId>> {
    let p = table.canonical(p);
    let q = table.canonical(q);
    if p == q {
        return None;
    }
    let mut parent: std::collections::HashMap<ModeId, ModeId> = std::collections::HashMap::new();
    let mut seen = vec![p];
    let mut frontier = vec![p];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for m in frontier {
            for raw_candidate in table.all_ids() {
                let candidate = table.canonical(raw_candidate);
                if candidate == m || seen.contains(&candidate) {
                    continue;
                }
                if widens_one_step(table, m, candidate) {
                    parent.insert(candidate, m);
                    if candidate == q {
                        let mut path = vec![candidate];
                        let mut cur = candidate;
                        while cur != p {
                            cur = parent[&cur];
                            if cur == p {
                                break;
                            }
                            path.push(cur);
                        }
                        path.reverse();
                        return Some(path);
                    }
                    seen.push(candidate);
                    next.push(candidate);
                }
            }
        }
        frontier = next;
    }
    None
}

/// Whether `p` widens to `q` through one or more [`widens_one_step`] edges.
pub fn widens(table: &ModeTable, p: ModeId, q: ModeId) -> bool {
    widening_path(table, p, q).is_some()
}

/// `unitable(M, U, ctx)`: `U` is a `UNION` and `M` is one of its
/// variants up to context-equivalence, or `M` is itself a `UNION` all of
/// whose variants are variants of `U`.
pub fn unitable(table: &ModeTable, m: ModeId, u: ModeId, ctx: Context, deflex: DeflexPolicy) -> bool {
    let u = table.canonical(u);
    let variants = match table.shape(u) {
        ModeShape::Union(pack) => pack.clone(),
        _ => return false,
    };
    let m_canon = table.canonical(m);
    if let ModeShape::Union(mine) = table.shape(m_canon) {
        return mine
            .0
            .iter()
            .all(|item| variants.0.iter().any(|v| v.mode == item.mode));
    }
    variants
        .0
        .iter()
        .any(|v| coercible(table, m, v.mode, ctx, deflex))
}

/// `strong_name(P, Q)`: `Q` is a `REF ROW` and either `P` equals `Q`
/// or `strong_name(P, name(Q))`.
pub fn strong_name(table: &mut ModeTable, p: ModeId, q: ModeId) -> bool {
    let q_canon = table.canonical(q);
    if !matches!(table.shape(q_canon), ModeShape::Ref(_)) {
        return false;
    }
    if table.canonical(p) == q_canon {
        return true;
    }
    match table.name(q_canon) {
        Some(named) if named != q_canon => strong_name(table, p, named),
        _ => false,
    }
}

/// `strong_slice(P, Q)`: the ladder of row-coercion fallbacks used
/// by `STRONG` coercibility for row/flex/ref targets.
pub fn strong_slice(table: &mut ModeTable, p: ModeId, q: ModeId) -> bool {
    let p_canon = table.canonical(p);
    let q_canon = table.canonical(q);
    if p_canon == q_canon {
        return true;
    }
    if widens(table, p_canon, q_canon) {
        return true;
    }
    if let Some(sliced) = table.slice(q_canon) {
        if strong_slice(table, p_canon, sliced) {
            return true;
        }
    }
    if let ModeShape::Flex(sub) = table.shape(q_canon).clone() {
        if strong_slice(table, p_canon, sub) {
            return true;
        }
    }
    if matches!(table.shape(q_canon), ModeShape::Ref(_)) {
        return strong_name(table, p_canon, q_canon);
    }
    false
}

/// `coercible(P, Q, strength, deflex)`: the central coercibility
/// predicate every position check and every coercion-insertion pass calls.
pub fn coercible(
    table: &ModeTable,
    p: ModeId,
    q: ModeId,
    strength: Context,
    deflex: DeflexPolicy,
) -> bool {
    let p = table.canonical(p);
    let q = table.canonical(q);

    // Pseudo-modes short-circuit.
    if matches!(table.shape(p), ModeShape::Primitive(Primitive::Hip)) {
        return true;
    }
    if matches!(table.shape(p), ModeShape::Vacuum) {
        return matches!(table.shape(q), ModeShape::Vacuum) || strength == Context::Strong;
    }
    if let ModeShape::Series(members) = table.shape(p) {
        return members
            .iter()
            .all(|&m| coercible(table, m, q, strength, deflex));
    }
    if let ModeShape::Stowed(members) = table.shape(p) {
        return members
            .iter()
            .all(|&m| coercible(table, m, q, strength, deflex));
    }

    if p == q {
        return true;
    }

    if flex_equatable(table, p, q, deflex) {
        return true;
    }

    if strength >= Context::Soft {
        // Deprocedure: PROC () T ~> T.
        if let ModeShape::Proc(pack, result) = table.shape(p) {
            if pack.0.is_empty() && coercible(table, *result, q, strength, deflex) {
                return true;
            }
        }
    }
    if strength >= Context::Weak {
        // Dereference when the wrapped mode is itself REF STRUCT/ROW or
        // when in a fully MEEK+ context, any REF.
        if let ModeShape::Ref(inner) = table.shape(p) {
            let inner_is_struct_or_row = matches!(
                table.shape(table.canonical(*inner)),
                ModeShape::Struct(_) | ModeShape::Row { .. } | ModeShape::Flex(_)
            );
            if (strength >= Context::Meek || inner_is_struct_or_row)
                && coercible(table, *inner, q, strength, deflex)
            {
                return true;
            }
        }
    }
    if strength >= Context::Firm {
        if unitable(table, p, q, strength, deflex) {
            return true;
        }
    }
    if strength >= Context::Strong {
        if widens(table, p, q) {
            return true;
        }
        // Rowing: make a single-element row of P's mode when Q is ROW P.
        if let ModeShape::Row { of, .. } = table.shape(q) {
            if coercible(table, p, *of, Context::Firm, deflex) {
                return true;
            }
        }
        // Voiding: anything coerces to VOID.
        if matches!(table.shape(q), ModeShape::Primitive(Primitive::Void)) {
            return true;
        }
    }
    false
}

/// Whether `p`/`q` differ only by `FLEX` at the outermost row layer, in a
/// way `deflex` permits.
fn flex_equatable(table: &ModeTable, p: ModeId, q: ModeId, deflex: DeflexPolicy) -> bool {
    let (flex_side, other) = match (table.shape(p), table.shape(q)) {
        (ModeShape::Flex(inner), _) => (*inner, q),
        (_, ModeShape::Flex(inner)) => (*inner, p),
        _ => return false,
    };
    if table.canonical(flex_side) != table.canonical(other) {
        return false;
    }
    match deflex {
        DeflexPolicy::Force => true,
        DeflexPolicy::Alias => !table.mode(p).has_ref && !table.mode(q).has_ref,
        DeflexPolicy::Safe => !table.mode(p).has_ref && !table.mode(q).has_ref,
        DeflexPolicy::NoDeflexing => false,
    }
}

/// Balancing: given a series of branch modes, picks the one every
/// other member is `STRONG`-coercible to. Ties prefer `FLEX` over
/// non-`FLEX`. Returns `None` if no member dominates.
pub fn balance(table: &ModeTable, branches: &[ModeId], deflex: DeflexPolicy) -> Option<ModeId> {
    let mut candidates: Vec<ModeId> = Vec::new();
    for &candidate in branches {
        if branches
            .iter()
            .all(|&other| coercible(table, other, candidate, Context::Strong, deflex))
        {
            candidates.push(candidate);
        }
    }
    if candidates.is_empty() {
        return None;
    }
    candidates
        .into_iter()
        .max_by_key(|&m| table.is_flex(m) as u8)
}

/// A resolved operator: its result mode and whether resolution required a
/// `FIRM` retry under `ALIAS_DEFLEXING` or a deprefed retry.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedOperator {
    pub result_mode: ModeId,
    pub needed_alias_retry: bool,
    pub needed_depref_retry: bool,
}

/// One declared operator overload: its two (or one, for monadic) operand
/// modes and its result mode.
#[derive(Debug, Clone, Copy)]
pub struct OperatorOverload {
    pub left: ModeId,
    pub right: Option<ModeId>,
    pub result: ModeId,
}

/// Dyadic operator resolution: exact match
/// first; then a union-balanced retry under `ALIAS_DEFLEXING`; then a
/// single deprefing of both operands before retrying the balanced search.
/// Operand coercions are always checked at `FIRM`.
pub fn resolve_dyadic(
    table: &mut ModeTable,
    overloads: &[OperatorOverload],
    left: ModeId,
    right: ModeId,
) -> Option<ResolvedOperator> {
    for ov in overloads {
        if let Some(r) = ov.right {
            if coercible(table, left, ov.left, Context::Firm, DeflexPolicy::NoDeflexing)
                && coercible(table, right, r, Context::Firm, DeflexPolicy::NoDeflexing)
            {
                return Some(ResolvedOperator {
                    result_mode: ov.result,
                    needed_alias_retry: false,
                    needed_depref_retry: false,
                });
            }
        }
    }

    // Synthesise a united operand mode by balancing, retry under ALIAS.
    if let Some(united) = balance(table, &[left, right], DeflexPolicy::Alias) {
        for ov in overloads {
            if let Some(r) = ov.right {
                if coercible(table, united, ov.left, Context::Firm, DeflexPolicy::Alias)
                    && coercible(table, united, r, Context::Firm, DeflexPolicy::Alias)
                {
                    return Some(ResolvedOperator {
                        result_mode: ov.result,
                        needed_alias_retry: true,
                        needed_depref_retry: false,
                    });
                }
            }
        }
    }

    // Depref both operands once, retry the balanced search.
    let left_depref = deprefed_once(table, left);
    let right_depref = deprefed_once(table, right);
    if left_depref != left || right_depref != right {
        if let Some(united) = balance(table, &[left_depref, right_depref], DeflexPolicy::Alias) {
            for ov in overloads {
                if let Some(r) = ov.right {
                    if coercible(table, united, ov.left, Context::Firm, DeflexPolicy::Alias)
                        && coercible(table, united, r, Context::Firm, DeflexPolicy::Alias)
                    {
                        return Some(ResolvedOperator {
                            result_mode: ov.result,
                            needed_alias_retry: true,
                            needed_depref_retry: true,
                        });
                    }
                }
            }
        }
    }
    None
}

fn deprefed_once(table: &ModeTable, m: ModeId) -> ModeId {
    let m = table.canonical(m);
    match table.shape(m) {
        ModeShape::Ref(inner) => table.canonical(*inner),
        _ => m,
    }
}

/// Inserts the coercion chain needed to bring `node` (whose a-priori mode
/// is `from`) to `to` under `strength`/`deflex`, splicing nodes via
/// [`NodeArena::splice_coercion`]. Returns an error if `from` is not coercible to `to` at all.
///
/// `voiding_is_primary_comorf` selects, when `to` is VOID, whether the
/// run-time must first dereference/deprocedure down to a non-procedure
/// mode (primary COMORFs: selection, slice, call, formula, identifier,
/// routine-text) before the final VOIDING step, or whether it voids
/// directly.
pub fn insert_coercions(
    table: &mut ModeTable,
    arena: &mut NodeArena,
    node: NodeId,
    from: ModeId,
    to: ModeId,
    strength: Context,
    deflex: DeflexPolicy,
    voiding_is_primary_comorf: bool,
    span: Span,
) -> Result<NodeId, SpannedError> {
    if !coercible(table, from, to, strength, deflex) {
        return Err(SpannedError::new(
            format!(
                "cannot coerce mode {:?} to {:?} in {:?} context",
                from, to, strength
            ),
            span,
        ));
    }

    let mut current = node;
    let mut current_mode = table.canonical(from);
    let to = table.canonical(to);

    if current_mode == to {
        return Ok(current);
    }

    let is_void_target = matches!(table.shape(to), ModeShape::Primitive(Primitive::Void));

    // Voiding a non-primary-COMORF unit (a plain identifier, a REF name,
    // anything that isn't a call/selection/slice/formula/routine-text) goes
    // straight to VOID without touching whatever it names: `whether_nonproc`
    // treats a mode like REF INT as already void-able, so there is nothing
    // to dereference or deprocedure away first.
    if is_void_target && !voiding_is_primary_comorf {
        current = arena.splice_coercion(Attribute::Voiding, current, to);
        return Ok(current);
    }

    // Deprocedure.
    if let ModeShape::Proc(pack, result) = table.shape(current_mode).clone() {
        if pack.0.is_empty() {
            current = arena.splice_coercion(Attribute::Deproceduring, current, result);
            current_mode = table.canonical(result);
        }
    }

    // Dereference repeatedly until we hit a non-REF mode or reach target.
    while current_mode != to {
        let inner = match table.shape(current_mode) {
            ModeShape::Ref(inner) => *inner,
            _ => break,
        };
        current = arena.splice_coercion(Attribute::Dereferencing, current, inner);
        current_mode = table.canonical(inner);
    }

    if current_mode == to {
        return Ok(current);
    }

    // Uniting.
    if matches!(table.shape(to), ModeShape::Union(_)) {
        current = arena.splice_coercion(Attribute::Uniting, current, to);
        current_mode = to;
    }

    if current_mode == to {
        return Ok(current);
    }

    // Widening: one WIDENING node per step of the chain, mirroring
    // `make_widening_coercion`'s per-step node insertion rather than a
    // single node jumping straight from the source mode to the target.
    if let Some(path) = widening_path(table, current_mode, to) {
        for step_mode in path {
            current = arena.splice_coercion(Attribute::Widening, current, step_mode);
            current_mode = step_mode;
        }
    }

    if current_mode == to {
        return Ok(current);
    }

    // Rowing.
    if let ModeShape::Row { of, .. } = table.shape(to) {
        if coercible(table, current_mode, *of, Context::Firm, deflex) {
            current = arena.splice_coercion(Attribute::Rowing, current, to);
            current_mode = to;
        }
    }

    if current_mode == to {
        return Ok(current);
    }

    // Voiding, last: reached only by primary COMORFs, after dereferencing
    // and deproceduring down to a non-procedure mode above.
    if is_void_target {
        current = arena.splice_coercion(Attribute::Voiding, current, to);
        current_mode = to;
    }

    if current_mode != to {
        return Err(SpannedError::new(
            format!(
                "cannot coerce mode {:?} to {:?} in {:?} context",
                from, to, strength
            ),
            span,
        ));
    }

    Ok(current)
}
