//! The mode table: construction, equivalence, and derived-mode memoisation.
//!
//! Modes are interned into an append-only [`ModeTable`] and referred to by
//! [`ModeId`] rather than by pointer, so equivalence collapse is a
//! union-find merge on indices instead of pointer surgery.

use std::cell::RefCell;
use std::collections::HashMap;

use a68_base::Symbol;

/// Stable handle to a canonical mode inside a [`ModeTable`].
///
/// Two `ModeId`s are only guaranteed comparable for equivalence *after*
/// [`ModeTable::resolve_equivalences`] has run; before that,
/// structurally-identical modes built in disjoint scopes may still hold
/// distinct ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModeId(pub u32);

/// A single (mode, optional field name) entry in a [`Pack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackItem {
    pub mode: ModeId,
    pub field_name: Option<Symbol>,
}

/// An ordered list of fields (STRUCT), parameters (PROC), or variants
/// (UNION). Order is semantically significant for STRUCT/PROC; for UNION
/// only the set matters but order is preserved for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pack(pub Vec<PackItem>);

impl Pack {
    pub fn modes(&self) -> impl Iterator<Item = ModeId> + '_ {
        self.0.iter().map(|item| item.mode)
    }
}

/// Primitive standard modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Int,
    Real,
    Bool,
    Char,
    Bits,
    Bytes,
    Format,
    File,
    Void,
    Error,
    Undefined,
    Hip,
    Complex,
    String,
}

/// A mode's shape, before equivalence collapse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeShape {
    Primitive(Primitive),
    /// `LONG`/`LONG LONG` prefix count applied to an `Int`/`Real`/`Bits`
    /// family member.
    Long { depth: u32, of: Primitive },
    Ref(ModeId),
    Proc(Pack, ModeId),
    Row { dim: u32, of: ModeId },
    Flex(ModeId),
    Struct(Pack),
    Union(Pack),
    /// Named by a `MODE <name> = <mode>` declaration; resolved to its
    /// right-hand mode during construction.
    Indicant(ModeId),
    /// Ordered pack used while balancing a series of branch modes.
    Series(Vec<ModeId>),
    /// Collateral display awaiting a target mode.
    Stowed(Vec<ModeId>),
    /// Empty row literal `()`.
    Vacuum,
    /// "any row-ish" pseudo-mode used internally by balancing.
    Rows,
}

/// A canonical representative of a type.
#[derive(Debug, Clone)]
pub struct Mode {
    pub shape: ModeShape,
    /// Set by [`ModeTable::resolve_equivalences`] when this mode is found
    /// structurally equivalent to an earlier one; all lookups must
    /// dereference through this field.
    pub equivalent: Option<ModeId>,
    pub well_formed: bool,
    pub has_ref: bool,
    pub has_flex: bool,
    pub has_rows: bool,
    pub byte_size: usize,
}

/// The append-only table of every mode constructed for one compilation
/// unit, plus memoisation caches for derived modes (`name`, `multiple`,
/// `deflex`, `trim`, `slice`).
pub struct ModeTable {
    modes: Vec<Mode>,
    // Derived-mode memoisation.
    name_cache: RefCell<HashMap<ModeId, ModeId>>,
    deflex_cache: RefCell<HashMap<ModeId, ModeId>>,
    trim_cache: RefCell<HashMap<ModeId, ModeId>>,
    slice_cache: RefCell<HashMap<ModeId, ModeId>>,
    multiple_cache: RefCell<HashMap<(ModeId, u32), ModeId>>,
    // Standard mode interning, so repeated lookups (e.g. `Int`) are O(1)
    // and always return the same id.
    standards: RefCell<HashMap<Primitive, ModeId>>,
}

impl Default for ModeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ModeTable {
    pub fn new() -> Self {
        ModeTable {
            modes: Vec::new(),
            name_cache: RefCell::new(HashMap::new()),
            deflex_cache: RefCell::new(HashMap::new()),
            trim_cache: RefCell::new(HashMap::new()),
            slice_cache: RefCell::new(HashMap::new()),
            multiple_cache: RefCell::new(HashMap::new()),
            standards: RefCell::new(HashMap::new()),
        }
    }

    fn push(&mut self, shape: ModeShape) -> ModeId {
        let has_ref = matches!(shape, ModeShape::Ref(_));
        let has_flex = matches!(shape, ModeShape::Flex(_));
        let id = ModeId(self.modes.len() as u32);
        self.modes.push(Mode {
            shape,
            equivalent: None,
            well_formed: true,
            has_ref,
            has_flex,
            has_rows: false,
            byte_size: 0,
        });
        id
    }

    /// Interns a standard primitive mode, returning the same id on repeat
    /// calls for the same primitive.
    pub fn standard(&mut self, prim: Primitive) -> ModeId {
        if let Some(&id) = self.standards.borrow().get(&prim) {
            return id;
        }
        let id = self.push(ModeShape::Primitive(prim));
        self.standards.borrow_mut().insert(prim, id);
        id
    }

    pub fn long(&mut self, depth: u32, of: Primitive) -> ModeId {
        self.push(ModeShape::Long { depth, of })
    }

    pub fn make_ref(&mut self, of: ModeId) -> ModeId {
        self.push(ModeShape::Ref(of))
    }

    pub fn make_proc(&mut self, args: Pack, result: ModeId) -> ModeId {
        self.push(ModeShape::Proc(args, result))
    }

    pub fn make_row(&mut self, dim: u32, of: ModeId) -> ModeId {
        self.push(ModeShape::Row { dim, of })
    }

    pub fn make_flex(&mut self, of: ModeId) -> ModeId {
        self.push(ModeShape::Flex(of))
    }

    pub fn make_struct(&mut self, fields: Pack) -> ModeId {
        self.push(ModeShape::Struct(fields))
    }

    /// Constructs a `UNION` mode, normalising it to a fixpoint first.
    pub fn make_union(&mut self, variants: Pack) -> ModeId {
        let normalised = self.normalise_union(variants);
        self.push(ModeShape::Union(normalised))
    }

    pub fn make_indicant(&mut self, target: ModeId) -> ModeId {
        self.push(ModeShape::Indicant(target))
    }

    pub fn make_series(&mut self, members: Vec<ModeId>) -> ModeId {
        self.push(ModeShape::Series(members))
    }

    pub fn vacuum(&mut self) -> ModeId {
        self.push(ModeShape::Vacuum)
    }

    pub fn shape(&self, id: ModeId) -> &ModeShape {
        &self.modes[id.0 as usize].shape
    }

    pub fn mode(&self, id: ModeId) -> &Mode {
        &self.modes[id.0 as usize]
    }

    /// Every mode id interned so far, in construction order. Used by the
    /// coercion engine's widening search, which has to walk the modes this
    /// particular program actually declared rather than an a priori
    /// numeric family (a program may never declare `LONG LONG REAL` at
    /// all, in which case there is no such mode to widen through).
    pub fn all_ids(&self) -> impl Iterator<Item = ModeId> + '_ {
        (0..self.modes.len() as u32).map(ModeId)
    }

    /// Dereferences through `equivalent` links to the canonical
    /// representative.
    pub fn canonical(&self, mut id: ModeId) -> ModeId {
        while let Some(next) = self.modes[id.0 as usize].equivalent {
            id = next;
        }
        id
    }

    // -- Union normalisation --------------------------------------

    /// Repeats absorb/contract to a fixpoint. "Absorb firm-related subsets"
    /// is left to the balancing helper in `coerce.rs`, which calls back
    /// into this table with already-firm-checked subsets; this function
    /// performs only the structural absorb+contract steps that do not need
    /// a coercion context.
    fn normalise_union(&self, pack: Pack) -> Pack {
        let mut items = pack.0;
        loop {
            let mut changed = false;

            // Absorb: flatten nested UNION members in place.
            let mut flattened = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                match &self.modes[self.canonical(item.mode).0 as usize].shape {
                    ModeShape::Union(inner) => {
                        changed = true;
                        flattened.extend(inner.0.iter().copied());
                    }
                    _ => flattened.push(item),
                }
            }
            items = flattened;

            // Contract: drop later duplicates (by canonical id).
            let mut seen = Vec::new();
            let mut contracted = Vec::with_capacity(items.len());
            for item in items.drain(..) {
                let canon = self.canonical(item.mode);
                if seen.contains(&canon) {
                    changed = true;
                    continue;
                }
                seen.push(canon);
                contracted.push(item);
            }
            items = contracted;

            if !changed {
                return Pack(items);
            }
        }
    }

    // -- Equivalence resolution ------------------------------------

    /// Runs the coinductive structural-equivalence test over every pair of
    /// modes and collapses equivalent ones by pointing the later one's
    /// `equivalent` field at the earlier. `O(n^2)` in the
    /// number of modes, which is acceptable for one program's mode table.
    pub fn resolve_equivalences(&mut self) {
        let n = self.modes.len();
        for i in 0..n {
            if self.modes[i].equivalent.is_some() {
                continue;
            }
            for j in (i + 1)..n {
                if self.modes[j].equivalent.is_some() {
                    continue;
                }
                let mut postulates = Vec::new();
                if self.structurally_equivalent(ModeId(i as u32), ModeId(j as u32), &mut postulates)
                {
                    self.modes[j].equivalent = Some(ModeId(i as u32));
                }
            }
        }
    }

    /// The coinductive bisimulation test. `postulates` holds pairs
    /// already assumed equivalent on the current recursion path, so
    /// self-referential modes (e.g. mutually-recursive STRUCTs) terminate
    /// instead of looping.
    fn structurally_equivalent(
        &self,
        a: ModeId,
        b: ModeId,
        postulates: &mut Vec<(ModeId, ModeId)>,
    ) -> bool {
        let a = self.canonical(a);
        let b = self.canonical(b);
        if a == b {
            return true;
        }
        if postulates.contains(&(a, b)) {
            return true;
        }
        postulates.push((a, b));
        let result = match (&self.modes[a.0 as usize].shape, &self.modes[b.0 as usize].shape) {
            (ModeShape::Primitive(p), ModeShape::Primitive(q)) => p == q,
            (ModeShape::Long { depth: d1, of: p1 }, ModeShape::Long { depth: d2, of: p2 }) => {
                d1 == d2 && p1 == p2
            }
            (ModeShape::Ref(p), ModeShape::Ref(q)) => {
                self.structurally_equivalent(*p, *q, postulates)
            }
            (ModeShape::Flex(p), ModeShape::Flex(q)) => {
                self.structurally_equivalent(*p, *q, postulates)
            }
            (ModeShape::Row { dim: d1, of: p1 }, ModeShape::Row { dim: d2, of: p2 }) => {
                d1 == d2 && self.structurally_equivalent(*p1, *p2, postulates)
            }
            (ModeShape::Proc(pa, ra), ModeShape::Proc(pb, rb)) => {
                pa.0.len() == pb.0.len()
                    && pa
                        .0
                        .iter()
                        .zip(pb.0.iter())
                        .all(|(x, y)| self.structurally_equivalent(x.mode, y.mode, postulates))
                    && self.structurally_equivalent(*ra, *rb, postulates)
            }
            (ModeShape::Struct(pa), ModeShape::Struct(pb)) => {
                pa.0.len() == pb.0.len()
                    && pa.0.iter().zip(pb.0.iter()).all(|(x, y)| {
                        x.field_name == y.field_name
                            && self.structurally_equivalent(x.mode, y.mode, postulates)
                    })
            }
            (ModeShape::Union(pa), ModeShape::Union(pb)) => {
                // Set equality under ≡.
                pa.0.len() == pb.0.len()
                    && pa.0.iter().all(|x| {
                        pb.0.iter()
                            .any(|y| self.structurally_equivalent(x.mode, y.mode, postulates))
                    })
            }
            (ModeShape::Vacuum, ModeShape::Vacuum) => true,
            (ModeShape::Rows, ModeShape::Rows) => true,
            _ => false,
        };
        postulates.pop();
        result
    }

    // -- Well-formedness -------------------------------

    /// A mode is well-formed iff every infinite traversal path back to its
    /// own defining indicant crosses at least one STRUCT ("yin") and one
    /// REF ("yang") constructor. Threaded as a (yin_seen, yang_seen) pair;
    /// re-encountering the same indicant with both flags set is success,
    /// with neither or only one set is the ill-formed/cyclic case.
    pub fn well_formed(&self, root: ModeId) -> bool {
        self.well_formed_rec(root, root, false, false, &mut Vec::new())
    }

    fn well_formed_rec(
        &self,
        indicant: ModeId,
        current: ModeId,
        yin: bool,
        yang: bool,
        visiting: &mut Vec<(ModeId, bool, bool)>,
    ) -> bool {
        let current = self.canonical(current);
        if current == self.canonical(indicant) && (visiting.is_empty() == false) {
            return yin && yang;
        }
        if visiting.contains(&(current, yin, yang)) {
            // Revisiting the same (mode, flags) state without having closed
            // the cycle at the indicant: this path never crosses both
            // constructors, so it is not well-formed via this route.
            return false;
        }
        visiting.push((current, yin, yang));
        let result = match &self.modes[current.0 as usize].shape {
            ModeShape::Ref(inner) => {
                self.well_formed_rec(indicant, *inner, yin, true, visiting)
            }
            ModeShape::Struct(pack) => pack
                .0
                .iter()
                .all(|item| self.well_formed_rec(indicant, item.mode, true, yang, visiting)),
            ModeShape::Flex(inner) | ModeShape::Row { of: inner, .. } => {
                self.well_formed_rec(indicant, *inner, yin, yang, visiting)
            }
            ModeShape::Proc(pack, result_mode) => {
                pack.0
                    .iter()
                    .all(|item| self.well_formed_rec(indicant, item.mode, yin, true, visiting))
                    && self.well_formed_rec(indicant, *result_mode, yin, true, visiting)
            }
            ModeShape::Union(pack) => pack
                .0
                .iter()
                .all(|item| self.well_formed_rec(indicant, item.mode, yin, yang, visiting)),
            ModeShape::Indicant(target) => {
                self.well_formed_rec(indicant, *target, yin, yang, visiting)
            }
            _ => true,
        };
        visiting.pop();
        result
    }

    // -- Derived modes -------------

    /// `name(M)`: for a STRUCT with fields `f_i : T_i`, the STRUCT with
    /// fields `f_i : REF T_i`. Used for SELECTION from `REF STRUCT`.
    pub fn name(&mut self, m: ModeId) -> Option<ModeId> {
        let m = self.canonical(m);
        if let Some(&cached) = self.name_cache.borrow().get(&m) {
            return Some(cached);
        }
        let fields = match &self.modes[m.0 as usize].shape {
            ModeShape::Struct(pack) => pack.0.clone(),
            _ => return None,
        };
        let mut new_fields = Vec::with_capacity(fields.len());
        for item in fields {
            let refm = self.make_ref(item.mode);
            new_fields.push(PackItem {
                mode: refm,
                field_name: item.field_name,
            });
        }
        let result = self.make_struct(Pack(new_fields));
        self.name_cache.borrow_mut().insert(m, result);
        Some(result)
    }

    /// `multiple(M, k)`: for a `k`-dimensional ROW of STRUCT, the STRUCT
    /// whose fields are `f_i : ROW^k T_i`. Used for multiple selection.
    pub fn multiple(&mut self, m: ModeId, k: u32) -> Option<ModeId> {
        let m = self.canonical(m);
        if let Some(&cached) = self.multiple_cache.borrow().get(&(m, k)) {
            return Some(cached);
        }
        let fields = match &self.modes[m.0 as usize].shape {
            ModeShape::Struct(pack) => pack.0.clone(),
            _ => return None,
        };
        let mut new_fields = Vec::with_capacity(fields.len());
        for item in fields {
            let rowed = self.make_row(k, item.mode);
            new_fields.push(PackItem {
                mode: rowed,
                field_name: item.field_name,
            });
        }
        let result = self.make_struct(Pack(new_fields));
        self.multiple_cache.borrow_mut().insert((m, k), result);
        Some(result)
    }

    /// `deflex(M)`: `M` with every `FLEX` stripped, at any depth reachable
    /// through ROW/REF. Assignment-compatibility of `STRING` to
    /// `[]CHAR` relies on this.
    pub fn deflex(&mut self, m: ModeId) -> ModeId {
        let m = self.canonical(m);
        if let Some(&cached) = self.deflex_cache.borrow().get(&m) {
            return cached;
        }
        let result = match self.modes[m.0 as usize].shape.clone() {
            ModeShape::Flex(inner) => self.deflex(inner),
            ModeShape::Row { dim, of } => {
                let of = self.deflex(of);
                self.make_row(dim, of)
            }
            ModeShape::Ref(inner) => {
                let inner = self.deflex(inner);
                self.make_ref(inner)
            }
            _ => m,
        };
        self.deflex_cache.borrow_mut().insert(m, result);
        result
    }

    /// `trim(M)`: the one-level deflex used by trimmers — strips a single
    /// outer `FLEX` without recursing into the element mode.
    pub fn trim(&mut self, m: ModeId) -> ModeId {
        let m = self.canonical(m);
        if let Some(&cached) = self.trim_cache.borrow().get(&m) {
            return cached;
        }
        let result = match &self.modes[m.0 as usize].shape {
            ModeShape::Flex(inner) => *inner,
            _ => m,
        };
        self.trim_cache.borrow_mut().insert(m, result);
        result
    }

    /// `slice(M)`: the element mode of a ROW (recursing through nested
    /// ROW-of-ROW), or `None` if `M` is not row-like.
    pub fn slice(&mut self, m: ModeId) -> Option<ModeId> {
        let m = self.canonical(m);
        if let Some(&cached) = self.slice_cache.borrow().get(&m) {
            return Some(cached);
        }
        let result = match &self.modes[m.0 as usize].shape {
            ModeShape::Row { of, .. } => *of,
            ModeShape::Flex(inner) => self.slice(*inner)?,
            _ => return None,
        };
        self.slice_cache.borrow_mut().insert(m, result);
        Some(result)
    }

    pub fn is_ref(&self, m: ModeId) -> bool {
        matches!(self.modes[self.canonical(m).0 as usize].shape, ModeShape::Ref(_))
    }

    pub fn is_flex(&self, m: ModeId) -> bool {
        matches!(self.modes[self.canonical(m).0 as usize].shape, ModeShape::Flex(_))
    }

    pub fn is_union(&self, m: ModeId) -> bool {
        matches!(self.modes[self.canonical(m).0 as usize].shape, ModeShape::Union(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_modes_are_interned() {
        let mut table = ModeTable::new();
        let a = table.standard(Primitive::Int);
        let b = table.standard(Primitive::Int);
        assert_eq!(a, b);
    }

    #[test]
    fn structurally_identical_modes_from_disjoint_scopes_canonicalise_equal() {
        // Two disjointly-built REF STRUCT (INT x) modes collapse to one id.
        let mut table = ModeTable::new();
        let int_a = table.standard(Primitive::Int);
        let struct_a = table.make_struct(Pack(vec![PackItem {
            mode: int_a,
            field_name: None,
        }]));
        let ref_a = table.make_ref(struct_a);

        let int_b = table.standard(Primitive::Int);
        let struct_b = table.make_struct(Pack(vec![PackItem {
            mode: int_b,
            field_name: None,
        }]));
        let ref_b = table.make_ref(struct_b);

        table.resolve_equivalences();
        assert_eq!(table.canonical(ref_a), table.canonical(ref_b));
    }

    #[test]
    fn mutually_recursive_struct_ref_is_well_formed() {
        // MODE A = STRUCT (INT x, REF B y), B = STRUCT (REF A z);
        let mut table = ModeTable::new();
        let int_m = table.standard(Primitive::Int);
        // Forward-declare A and B as indicants pointing at placeholder
        // structs, then patch: build bottom-up since we have no mutation
        // of existing Struct packs — allocate B first referencing a REF to
        // a yet-unbuilt A via an indicant placeholder.
        let a_struct_slot = table.push(ModeShape::Vacuum); // placeholder for A
        let ref_a = table.make_ref(a_struct_slot);
        let b_struct = table.make_struct(Pack(vec![PackItem {
            mode: ref_a,
            field_name: None,
        }]));
        let ref_b = table.make_ref(b_struct);
        let a_struct = table.make_struct(Pack(vec![
            PackItem {
                mode: int_m,
                field_name: None,
            },
            PackItem {
                mode: ref_b,
                field_name: None,
            },
        ]));
        // Patch the placeholder to be an indicant for the real A struct.
        table.modes[a_struct_slot.0 as usize].shape = ModeShape::Indicant(a_struct);

        assert!(table.well_formed(a_struct));
    }

    #[test]
    fn directly_self_referential_mode_is_not_well_formed() {
        // MODE A = A;
        let mut table = ModeTable::new();
        let slot = table.push(ModeShape::Vacuum);
        table.modes[slot.0 as usize].shape = ModeShape::Indicant(slot);
        assert!(!table.well_formed(slot));
    }

    #[test]
    fn deflex_strips_flex_at_any_depth() {
        let mut table = ModeTable::new();
        let ch = table.standard(Primitive::Char);
        let flex_row = table.make_flex(table.make_row(1, ch));
        let ref_flex_row = table.make_ref(flex_row);
        let deflexed = table.deflex(ref_flex_row);
        match table.shape(deflexed) {
            ModeShape::Ref(inner) => match table.shape(*inner) {
                ModeShape::Row { dim, of } => {
                    assert_eq!(*dim, 1);
                    assert_eq!(*of, ch);
                }
                other => panic!("expected ROW, got {other:?}"),
            },
            other => panic!("expected REF, got {other:?}"),
        }
    }

    #[test]
    fn union_normalisation_absorbs_and_contracts() {
        let mut table = ModeTable::new();
        let int_m = table.standard(Primitive::Int);
        let real_m = table.standard(Primitive::Real);
        let bool_m = table.standard(Primitive::Bool);
        let inner_union = table.make_union(Pack(vec![
            PackItem { mode: real_m, field_name: None },
            PackItem { mode: bool_m, field_name: None },
        ]));
        // UNION(INT, UNION(REAL, BOOL), INT) -> UNION(INT, REAL, BOOL)
        let outer = table.make_union(Pack(vec![
            PackItem { mode: int_m, field_name: None },
            PackItem { mode: inner_union, field_name: None },
            PackItem { mode: int_m, field_name: None },
        ]));
        match table.shape(outer) {
            ModeShape::Union(pack) => assert_eq!(pack.0.len(), 3),
            other => panic!("expected UNION, got {other:?}"),
        }
    }
}
