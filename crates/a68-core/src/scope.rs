//! Scope and environment resolution: symbol tables, tags, frame
//! offset assignment, and label-to-serial-clause binding.

use std::collections::HashMap;

use a68_base::Symbol;

use crate::mode::ModeId;
use crate::node::NodeId;

/// Stable handle to a [`SymbolTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub u32);

/// Stable handle to a [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(pub u32);

/// What kind of binding a [`Tag`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Identifier,
    Operator,
    Indicant,
    Label,
    /// Anonymous sweep-root: a temporary that must survive collection while
    /// a compound expression is on the stack.
    Anonymous,
}

/// Storage discipline for an identifier's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Loc,
    Heap,
}

/// An identifier/operator/indicant/label binding.
#[derive(Debug, Clone)]
pub struct Tag {
    pub owner: TableId,
    pub kind: TagKind,
    pub symbol: Symbol,
    pub mode: Option<ModeId>,
    pub defining_node: NodeId,
    /// Byte offset within the owning table's frame; always
    /// `< owner`'s frame-increment size.
    pub frame_offset: u32,
    pub storage: Storage,
    /// For procedures and formats: the deepest lexical level their body
    /// closes over.
    pub youngest_environ: Option<u32>,
    pub is_standard_env: bool,
}

/// Per-lexical-level bindings.
pub struct SymbolTable {
    pub level: u32,
    pub parent: Option<TableId>,
    identifiers: HashMap<Symbol, TagId>,
    operators: HashMap<Symbol, Vec<TagId>>,
    indicants: HashMap<Symbol, TagId>,
    labels: HashMap<Symbol, TagId>,
    /// Total bytes a frame at this level requires; grows as declarations
    /// are processed.
    pub frame_increment: u32,
    pub initialise_frame: bool,
    pub proc_ops: bool,
}

impl SymbolTable {
    fn new(level: u32, parent: Option<TableId>) -> Self {
        SymbolTable {
            level,
            parent,
            identifiers: HashMap::new(),
            operators: HashMap::new(),
            indicants: HashMap::new(),
            labels: HashMap::new(),
            frame_increment: 0,
            initialise_frame: false,
            proc_ops: false,
        }
    }
}

/// Owns every [`SymbolTable`] and [`Tag`] for one compilation unit, and
/// assigns frame offsets as identifiers are declared.
#[derive(Default)]
pub struct ScopeResolver {
    tables: Vec<SymbolTable>,
    tags: Vec<Tag>,
}

impl ScopeResolver {
    pub fn new() -> Self {
        ScopeResolver {
            tables: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Opens a new lexical level as a child of `parent` (or a root table if
    /// `parent` is `None`).
    pub fn new_table(&mut self, parent: Option<TableId>) -> TableId {
        let level = parent.map(|p| self.tables[p.0 as usize].level + 1).unwrap_or(0);
        let id = TableId(self.tables.len() as u32);
        self.tables.push(SymbolTable::new(level, parent));
        id
    }

    pub fn table(&self, id: TableId) -> &SymbolTable {
        &self.tables[id.0 as usize]
    }

    pub fn tag(&self, id: TagId) -> &Tag {
        &self.tags[id.0 as usize]
    }

    pub fn level_of(&self, id: TableId) -> u32 {
        self.tables[id.0 as usize].level
    }

    /// Declares an identifier in `table`, assigning it the next free offset
    /// in that table's frame and growing the frame-increment
    /// to match the declared mode's size.
    pub fn declare_identifier(
        &mut self,
        table: TableId,
        symbol: Symbol,
        mode: ModeId,
        defining_node: NodeId,
        storage: Storage,
        size: u32,
    ) -> TagId {
        let offset = self.tables[table.0 as usize].frame_increment;
        let tag_id = TagId(self.tags.len() as u32);
        self.tags.push(Tag {
            owner: table,
            kind: TagKind::Identifier,
            symbol,
            mode: Some(mode),
            defining_node,
            frame_offset: offset,
            storage,
            youngest_environ: None,
            is_standard_env: false,
        });
        self.tables[table.0 as usize].identifiers.insert(symbol, tag_id);
        self.tables[table.0 as usize].frame_increment += size;
        tag_id
    }

    /// Declares an operator overload; multiple declarations of the same
    /// symbol in one table accumulate (overload set), matching the pack of
    /// candidate [`crate::coerce::OperatorOverload`]s consulted at
    /// resolution time.
    pub fn declare_operator(
        &mut self,
        table: TableId,
        symbol: Symbol,
        mode: ModeId,
        defining_node: NodeId,
    ) -> TagId {
        let tag_id = TagId(self.tags.len() as u32);
        self.tags.push(Tag {
            owner: table,
            kind: TagKind::Operator,
            symbol,
            mode: Some(mode),
            defining_node,
            frame_offset: 0,
            storage: Storage::Loc,
            youngest_environ: None,
            is_standard_env: false,
        });
        self.tables[table.0 as usize]
            .operators
            .entry(symbol)
            .or_default()
            .push(tag_id);
        tag_id
    }

    pub fn declare_indicant(
        &mut self,
        table: TableId,
        symbol: Symbol,
        mode: ModeId,
        defining_node: NodeId,
    ) -> TagId {
        let tag_id = TagId(self.tags.len() as u32);
        self.tags.push(Tag {
            owner: table,
            kind: TagKind::Indicant,
            symbol,
            mode: Some(mode),
            defining_node,
            frame_offset: 0,
            storage: Storage::Loc,
            youngest_environ: None,
            is_standard_env: false,
        });
        self.tables[table.0 as usize].indicants.insert(symbol, tag_id);
        tag_id
    }

    pub fn declare_label(&mut self, table: TableId, symbol: Symbol, defining_node: NodeId) -> TagId {
        let tag_id = TagId(self.tags.len() as u32);
        self.tags.push(Tag {
            owner: table,
            kind: TagKind::Label,
            symbol,
            mode: None,
            defining_node,
            frame_offset: 0,
            storage: Storage::Loc,
            youngest_environ: None,
            is_standard_env: false,
        });
        self.tables[table.0 as usize].labels.insert(symbol, tag_id);
        tag_id
    }

    /// Walks outward from `table` through parent links looking up an
    /// identifier. Returns the tag and how many static links away it lives.
    pub fn resolve_identifier(&self, table: TableId, symbol: Symbol) -> Option<(TagId, u32)> {
        let mut cur = Some(table);
        let mut hops = 0;
        while let Some(t) = cur {
            if let Some(&tag) = self.tables[t.0 as usize].identifiers.get(&symbol) {
                return Some((tag, hops));
            }
            cur = self.tables[t.0 as usize].parent;
            hops += 1;
        }
        None
    }

    /// Walks outward for an indicant.
    pub fn resolve_indicant(&self, table: TableId, symbol: Symbol) -> Option<TagId> {
        let mut cur = Some(table);
        while let Some(t) = cur {
            if let Some(&tag) = self.tables[t.0 as usize].indicants.get(&symbol) {
                return Some(tag);
            }
            cur = self.tables[t.0 as usize].parent;
        }
        None
    }

    /// Walks outward collecting every operator overload visible for
    /// `symbol`, nearest scope first, ending with the standard environment.
    pub fn resolve_operators(&self, table: TableId, symbol: Symbol) -> Vec<TagId> {
        let mut found = Vec::new();
        let mut cur = Some(table);
        while let Some(t) = cur {
            if let Some(tags) = self.tables[t.0 as usize].operators.get(&symbol) {
                found.extend(tags.iter().copied());
            }
            cur = self.tables[t.0 as usize].parent;
        }
        found
    }

    /// Finds the table owning `symbol` as a label, searching outward from
    /// `from`.
    pub fn resolve_label(&self, from: TableId, symbol: Symbol) -> Option<(TableId, TagId)> {
        let mut cur = Some(from);
        while let Some(t) = cur {
            if let Some(&tag) = self.tables[t.0 as usize].labels.get(&symbol) {
                return Some((t, tag));
            }
            cur = self.tables[t.0 as usize].parent;
        }
        None
    }

    pub fn set_youngest_environ(&mut self, tag: TagId, level: u32) {
        let t = &mut self.tags[tag.0 as usize];
        t.youngest_environ = Some(t.youngest_environ.map_or(level, |y| y.min(level)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a68_base::Interner;

    #[test]
    fn identifier_offsets_stay_below_frame_increment() {
        let mut resolver = ScopeResolver::new();
        let mut interner = Interner::new();
        let root = resolver.new_table(None);
        let a = interner.intern("a");
        let b = interner.intern("b");
        resolver.declare_identifier(root, a, ModeId(0), NodeId::NONE, Storage::Loc, 8);
        resolver.declare_identifier(root, b, ModeId(1), NodeId::NONE, Storage::Loc, 4);
        let (tag_a, hops_a) = resolver.resolve_identifier(root, a).unwrap();
        let (tag_b, _) = resolver.resolve_identifier(root, b).unwrap();
        assert_eq!(hops_a, 0);
        assert_eq!(resolver.tag(tag_a).frame_offset, 0);
        assert_eq!(resolver.tag(tag_b).frame_offset, 8);
        assert!(resolver.tag(tag_b).frame_offset < resolver.table(root).frame_increment + 4);
    }

    #[test]
    fn nested_scope_resolves_outward() {
        let mut resolver = ScopeResolver::new();
        let mut interner = Interner::new();
        let root = resolver.new_table(None);
        let child = resolver.new_table(Some(root));
        let x = interner.intern("x");
        resolver.declare_identifier(root, x, ModeId(0), NodeId::NONE, Storage::Loc, 8);
        let (_, hops) = resolver.resolve_identifier(child, x).unwrap();
        assert_eq!(hops, 1);
        assert_eq!(resolver.level_of(child), 1);
    }

    #[test]
    fn operator_overloads_accumulate_and_search_outward() {
        let mut resolver = ScopeResolver::new();
        let mut interner = Interner::new();
        let root = resolver.new_table(None);
        let child = resolver.new_table(Some(root));
        let plus = interner.intern("+");
        resolver.declare_operator(root, plus, ModeId(0), NodeId::NONE);
        resolver.declare_operator(root, plus, ModeId(1), NodeId::NONE);
        let found = resolver.resolve_operators(child, plus);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn label_resolves_to_owning_table() {
        let mut resolver = ScopeResolver::new();
        let mut interner = Interner::new();
        let root = resolver.new_table(None);
        let child = resolver.new_table(Some(root));
        let l = interner.intern("done");
        resolver.declare_label(root, l, NodeId::NONE);
        let (owner, _) = resolver.resolve_label(child, l).unwrap();
        assert_eq!(owner, root);
    }
}
