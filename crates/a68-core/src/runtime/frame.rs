//! Frame stack: dynamic/static links, lexical level, and frame bodies with
//! compile-time-known tag offsets.

use a68_base::SpannedError;

use crate::node::NodeId;

/// Stable index of a pushed [`FrameHeader`] within a [`FrameStack`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramePointer(pub u32);

/// A slot for a label's saved longjump target, filled in when a serial
/// clause containing labels is entered.
#[derive(Debug, Clone, Copy, Default)]
pub struct JumpBuffer {
    pub target_node: Option<NodeId>,
}

/// Per-frame header.
#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub dynamic_link: Option<FramePointer>,
    pub static_link: Option<FramePointer>,
    pub lexical_level: u32,
    pub tree_node: NodeId,
    pub jump_buffer: JumpBuffer,
    /// Watermark used by the dynamic-scope guard on assignment.
    pub scope_watermark: u32,
    /// Byte offset in the frame-body segment where this frame's body
    /// begins.
    pub body_offset: u32,
    pub body_size: u32,
}

/// A contiguous segment of frame headers plus their fixed-layout bodies
///. Procedure call always pushes a new frame; declarations within a
/// clause may widen the current frame by the owning table's increment,
/// which is why `body_size` can grow in place via [`FrameStack::widen_top`]
/// rather than only at push time.
pub struct FrameStack {
    headers: Vec<FrameHeader>,
    body: Vec<u8>,
}

impl FrameStack {
    pub fn new() -> Self {
        FrameStack {
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn depth(&self) -> u32 {
        self.headers.len() as u32
    }

    pub fn top(&self) -> Option<FramePointer> {
        if self.headers.is_empty() {
            None
        } else {
            Some(FramePointer(self.headers.len() as u32 - 1))
        }
    }

    pub fn header(&self, fp: FramePointer) -> &FrameHeader {
        &self.headers[fp.0 as usize]
    }

    /// Pushes a new frame whose static link is the enclosing lexical
    /// frame, with an initially empty body of `initial_size` bytes.
    pub fn push(
        &mut self,
        static_link: Option<FramePointer>,
        lexical_level: u32,
        tree_node: NodeId,
        initial_size: u32,
    ) -> FramePointer {
        let dynamic_link = self.top();
        let body_offset = self.body.len() as u32;
        self.body.resize(self.body.len() + initial_size as usize, 0);
        self.headers.push(FrameHeader {
            dynamic_link,
            static_link,
            lexical_level,
            tree_node,
            jump_buffer: JumpBuffer::default(),
            scope_watermark: lexical_level,
            body_offset,
            body_size: initial_size,
        });
        FramePointer(self.headers.len() as u32 - 1)
    }

    /// Widens the top frame's body by `extra` bytes. Only valid on the topmost frame since bodies are laid
    /// out contiguously.
    pub fn widen_top(&mut self, extra: u32) {
        let top = self.headers.len() - 1;
        self.body.resize(self.body.len() + extra as usize, 0);
        self.headers[top].body_size += extra;
    }

    /// Pops the topmost frame, truncating the body segment.
    pub fn pop(&mut self) {
        if let Some(h) = self.headers.pop() {
            self.body.truncate(h.body_offset as usize);
        }
    }

    /// Reinitialises the top frame for a new loop iteration: clears the
    /// body back to zero length beyond the header-declared constants and
    /// marks it ready for the initialisation list to replay.
    pub fn reinitialise_top(&mut self) {
        let top = self.headers.len() - 1;
        let offset = self.headers[top].body_offset as usize;
        let size = self.headers[top].body_size as usize;
        for b in &mut self.body[offset..offset + size] {
            *b = 0;
        }
    }

    pub fn body(&self, fp: FramePointer) -> &[u8] {
        let h = &self.headers[fp.0 as usize];
        &self.body[h.body_offset as usize..(h.body_offset + h.body_size) as usize]
    }

    pub fn body_mut(&mut self, fp: FramePointer) -> &mut [u8] {
        let h = &self.headers[fp.0 as usize];
        let (start, end) = (h.body_offset as usize, (h.body_offset + h.body_size) as usize);
        &mut self.body[start..end]
    }

    /// Walks `level` static links up from `from`, as an identifier
    /// reference's `(level, offset)` addressing demands.
    pub fn walk_static(&self, from: FramePointer, hops: u32) -> Option<FramePointer> {
        let mut cur = from;
        for _ in 0..hops {
            cur = self.headers[cur.0 as usize].static_link?;
        }
        Some(cur)
    }

    /// Scans the dynamic-link chain from `from` for the frame whose lexical
    /// level and tree node match a label's owning serial clause.
    pub fn find_jump_target(&self, from: FramePointer, owner_node: NodeId) -> Option<FramePointer> {
        let mut cur = Some(from);
        while let Some(fp) = cur {
            if self.headers[fp.0 as usize].tree_node == owner_node {
                return Some(fp);
            }
            cur = self.headers[fp.0 as usize].dynamic_link;
        }
        None
    }

    /// Unwinds (pops) frames from the top down to, but not including,
    /// `target`.
    pub fn unwind_to(&mut self, target: FramePointer) -> Result<(), SpannedError> {
        while let Some(top) = self.top() {
            if top == target {
                return Ok(());
            }
            self.pop();
        }
        Err(SpannedError::new(
            "jump target frame not found on the dynamic-link chain",
            a68_base::Span::default(),
        ))
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}
