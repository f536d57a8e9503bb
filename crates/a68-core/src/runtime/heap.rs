//! Handle-indirected heap with a mark–compact collector.

use a68_base::SpannedError;
use std::cell::Cell;
use std::collections::HashMap;

use crate::mode::{ModeId, ModeShape, ModeTable};
use crate::runtime::value::Tuple;

/// Stable handle into a [`Heap`]'s handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u32);

bitflags::bitflags! {
    /// Status bits stored per handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleStatus: u8 {
        const ALLOCATED = 0b0001;
        const COLOUR    = 0b0010;
        const NO_SWEEP  = 0b0100;
        const COOKIE    = 0b1000;
    }
}

/// An allocation descriptor: byte offset and size into the
/// heap segment, mode of contents, status bits, and free/live list links.
#[derive(Debug, Clone)]
struct Handle {
    offset: u32,
    size: u32,
    mode: ModeId,
    status: HandleStatus,
    prev: Option<HandleId>,
    next: Option<HandleId>,
}

/// A single compactible heap segment plus its handle table.
///
/// Mirrors the frame/expression stacks in spirit: a contiguous `Vec<u8>`
/// byte segment, sized up front, that the collector may shuffle live
/// blocks within but whose *handles* (not raw offsets) are what the rest
/// of the evaluator is allowed to hold onto.
pub struct Heap {
    bytes: Vec<u8>,
    handles: Vec<Handle>,
    free_list: Vec<HandleId>,
    live_head: Option<HandleId>,
    /// Re-entrancy guard around operations that hold raw pointers into the
    /// heap.
    in_gc: Cell<bool>,
    bump: u32,
    /// Row bookkeeping, one entry per ROW *descriptor* handle. Mirrors the original's own design: a row value is
    /// itself a heap reference to a small descriptor block distinct from
    /// the raw element storage it addresses, so trimming a row never has to reuse or renumber the storage handle's own
    /// byte offsets — it just allocates a fresh, zero-size descriptor
    /// handle pointing at the same storage with narrower tuples. Kept
    /// out-of-band rather than inside the raw byte segment since bounds
    /// are not themselves `ALGOL 68` data the user's program can read as
    /// bytes.
    row_meta: HashMap<HandleId, RowMeta>,
}

/// One ROW descriptor handle's bookkeeping: which
/// handle the actual element bytes live in, the byte offset within that
/// handle's block the first element's indexing starts from, the element
/// mode, and one [`Tuple`] per dimension.
#[derive(Debug, Clone)]
pub struct RowMeta {
    pub storage: HandleId,
    pub base_offset: u32,
    pub element_mode: ModeId,
    pub dimensions: Vec<Tuple>,
}

/// A root set the collector colours from: the live frame chain plus the
/// expression stack, each yielding the [`Reference`]-bearing slots it owns.
pub trait GcRoots {
    fn roots(&self) -> Vec<HandleId>;
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        Heap {
            bytes: vec![0; capacity],
            handles: Vec::new(),
            free_list: Vec::new(),
            live_head: None,
            in_gc: Cell::new(false),
            bump: 0,
            row_meta: HashMap::new(),
        }
    }

    /// Registers `descriptor` as a ROW descriptor handle addressing
    /// `storage` starting at `base_offset`, so `eval.rs`'s slice evaluation
    /// can reconstruct a [`crate::runtime::value::RowDescriptor`] from a
    /// bare handle. `descriptor` and `storage` may be
    /// the same handle (a generator's own fresh row has nothing to share
    /// storage with yet) or distinct (a trim's descriptor shares its
    /// parent's storage handle).
    pub fn set_row_meta(
        &mut self,
        descriptor: HandleId,
        storage: HandleId,
        base_offset: u32,
        element_mode: ModeId,
        dimensions: Vec<Tuple>,
    ) {
        self.row_meta.insert(
            descriptor,
            RowMeta { storage, base_offset, element_mode, dimensions },
        );
    }

    pub fn row_meta(&self, descriptor: HandleId) -> Option<&RowMeta> {
        self.row_meta.get(&descriptor)
    }

    pub fn up_garbage_sema(&self) -> Result<(), SpannedError> {
        if self.in_gc.get() {
            return Err(SpannedError::new(
                "garbage collector re-entered while already running",
                a68_base::Span::default(),
            ));
        }
        self.in_gc.set(true);
        Ok(())
    }

    pub fn down_garbage_sema(&self) {
        self.in_gc.set(false);
    }

    /// Allocates `size` bytes for `mode`, triggering a collection on
    /// failure and retrying once.
    pub fn allocate(
        &mut self,
        size: u32,
        mode: ModeId,
        modes: &ModeTable,
        roots: &dyn GcRoots,
    ) -> Result<HandleId, SpannedError> {
        if let Some(id) = self.try_allocate(size, mode) {
            return Ok(id);
        }
        self.collect(modes, roots)?;
        self.try_allocate(size, mode).ok_or_else(|| {
            SpannedError::new("heap exhausted after collection", a68_base::Span::default())
        })
    }

    fn try_allocate(&mut self, size: u32, mode: ModeId) -> Option<HandleId> {
        if self.bump as usize + size as usize > self.bytes.len() {
            return None;
        }
        let offset = self.bump;
        self.bump += size;
        if let Some(id) = self.free_list.pop() {
            let h = &mut self.handles[id.0 as usize];
            h.offset = offset;
            h.size = size;
            h.mode = mode;
            h.status = HandleStatus::ALLOCATED;
            self.link_live(id);
            return Some(id);
        }
        let id = HandleId(self.handles.len() as u32);
        self.handles.push(Handle {
            offset,
            size,
            mode,
            status: HandleStatus::ALLOCATED,
            prev: None,
            next: None,
        });
        self.link_live(id);
        Some(id)
    }

    fn link_live(&mut self, id: HandleId) {
        self.handles[id.0 as usize].next = self.live_head;
        self.handles[id.0 as usize].prev = None;
        if let Some(head) = self.live_head {
            self.handles[head.0 as usize].prev = Some(id);
        }
        self.live_head = Some(id);
    }

    pub fn offset(&self, id: HandleId) -> u32 {
        self.handles[id.0 as usize].offset
    }

    pub fn size(&self, id: HandleId) -> u32 {
        self.handles[id.0 as usize].size
    }

    pub fn mode_of(&self, id: HandleId) -> ModeId {
        self.handles[id.0 as usize].mode
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn set_no_sweep(&mut self, id: HandleId, protect: bool) {
        let h = &mut self.handles[id.0 as usize];
        if protect {
            h.status |= HandleStatus::NO_SWEEP;
        } else {
            h.status &= !HandleStatus::NO_SWEEP;
        }
    }

    fn live_handles(&self) -> Vec<HandleId> {
        let mut out = Vec::new();
        let mut cur = self.live_head;
        while let Some(id) = cur {
            out.push(id);
            cur = self.handles[id.0 as usize].next;
        }
        out
    }

    /// Runs a full mark–compact cycle: colour from roots, free
    /// uncoloured unpinned handles, compact the rest in live order.
    pub fn collect(&mut self, modes: &ModeTable, roots: &dyn GcRoots) -> Result<(), SpannedError> {
        self.up_garbage_sema()?;
        self.colour_phase(modes, roots);
        self.free_phase();
        self.compact_phase();
        self.down_garbage_sema();
        Ok(())
    }

    /// Phase 1 — colour: mark every handle transitively reachable from
    /// `roots`. Cycles are cut with the per-handle COOKIE bit, set during
    /// descent and cleared on return.
    fn colour_phase(&mut self, modes: &ModeTable, roots: &dyn GcRoots) {
        for h in &mut self.handles {
            h.status &= !HandleStatus::COLOUR;
            h.status &= !HandleStatus::COOKIE;
        }
        for root in roots.roots() {
            self.colour_from(modes, root);
        }
    }

    /// Colours `id` and descends into whatever it holds that can itself
    /// carry a handle: a ROW *descriptor* handle keeps
    /// its storage handle alive and, when its element mode carries a `REF`,
    /// walks every element slot in that storage; a STRUCT handle walks
    /// every `REF`-moded field slot directly off the pack, since a struct's
    /// fixed layout needs no bounds lookup. Every scalar slot in this
    /// evaluator is a fixed 8-byte little-endian word; a REF-moded slot's handle is read back out of
    /// the low 32 bits of that word, matching how `eval.rs` encodes a
    /// heap-handle-carrying reference into the same slot width. UNION-moded
    /// slots carry no runtime discriminant in this evaluator's byte layout
    /// — `Value::Union` only exists transiently on the expression stack
    /// — so there is nothing to descend into there; likewise a
    /// curried [`crate::runtime::value::Locale`]'s own heap block holds
    /// flat argument bytes with no pack to walk, so its handle is itself a
    /// GC root via the owning frame slot rather than something this
    /// function descends into a second time.
    fn colour_from(&mut self, modes: &ModeTable, id: HandleId) {
        let idx = id.0 as usize;
        if idx >= self.handles.len() {
            return;
        }
        if self.handles[idx].status.contains(HandleStatus::COOKIE) {
            return;
        }
        self.handles[idx].status |= HandleStatus::COOKIE;
        self.handles[idx].status |= HandleStatus::COLOUR;

        if let Some(meta) = self.row_meta.get(&id).cloned() {
            self.colour_from(modes, meta.storage);
            let canon = modes.canonical(meta.element_mode);
            if matches!(modes.shape(canon), ModeShape::Ref(_)) {
                let storage_idx = meta.storage.0 as usize;
                if storage_idx < self.handles.len() {
                    let storage_base =
                        self.handles[storage_idx].offset as usize + meta.base_offset as usize;
                    let count: i64 = meta.dimensions.iter().map(|t| t.len()).product();
                    for i in 0..count.max(0) as usize {
                        self.colour_slot(modes, storage_base + i * 8);
                    }
                }
            }
        } else if let ModeShape::Struct(pack) = modes.shape(modes.canonical(self.handles[idx].mode)) {
            let base_offset = self.handles[idx].offset as usize;
            for (field_index, item) in pack.0.iter().enumerate() {
                if matches!(modes.shape(modes.canonical(item.mode)), ModeShape::Ref(_)) {
                    self.colour_slot(modes, base_offset + field_index * 8);
                }
            }
        }

        self.handles[idx].status &= !HandleStatus::COOKIE;
    }

    /// Reads a heap-handle id out of the low 32 bits of the 8-byte slot at
    /// `byte_offset`, if any, and colours it (helper for `colour_from`'s
    /// ROW/STRUCT descent).
    fn colour_slot(&mut self, modes: &ModeTable, byte_offset: usize) {
        if byte_offset + 4 > self.bytes.len() {
            return;
        }
        let bits = u32::from_le_bytes(self.bytes[byte_offset..byte_offset + 4].try_into().unwrap());
        if bits != 0 {
            self.colour_from(modes, HandleId(bits));
        }
    }

    /// Phase 2 — free: unlink uncoloured, unpinned handles into the free
    /// list.
    fn free_phase(&mut self) {
        for id in self.live_handles() {
            let idx = id.0 as usize;
            let status = self.handles[idx].status;
            if !status.contains(HandleStatus::COLOUR) && !status.contains(HandleStatus::NO_SWEEP) {
                self.unlink(id);
                self.handles[idx].status = HandleStatus::empty();
                self.free_list.push(id);
                self.row_meta.remove(&id);
            }
        }
    }

    fn unlink(&mut self, id: HandleId) {
        let (prev, next) = {
            let h = &self.handles[id.0 as usize];
            (h.prev, h.next)
        };
        match prev {
            Some(p) => self.handles[p.0 as usize].next = next,
            None => self.live_head = next,
        }
        if let Some(n) = next {
            self.handles[n.0 as usize].prev = prev;
        }
    }

    /// Phase 3 — compact: slide every remaining live block down to the
    /// next free byte position, in live-list order, updating offsets in
    /// place.
    fn compact_phase(&mut self) {
        let mut cursor: u32 = 0;
        let mut cur = self.live_head;
        while let Some(id) = cur {
            let idx = id.0 as usize;
            let (old_offset, size) = (self.handles[idx].offset, self.handles[idx].size);
            if old_offset != cursor {
                self.bytes.copy_within(
                    old_offset as usize..(old_offset + size) as usize,
                    cursor as usize,
                );
                self.handles[idx].offset = cursor;
            }
            cursor += size;
            cur = self.handles[idx].next;
        }
        self.bump = cursor;
    }

    /// Test/inspection helper: whether a handle is currently marked COLOUR.
    pub fn is_coloured(&self, id: HandleId) -> bool {
        self.handles[id.0 as usize].status.contains(HandleStatus::COLOUR)
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.handles[id.0 as usize].status.contains(HandleStatus::ALLOCATED)
    }
}
