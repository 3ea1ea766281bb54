//! Basic blocks and the function's control-flow graph (`BlockBasic`/`BlockGraph`).

use crate::pcodeop::{BlockId, OpId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Fallthrough,
    Taken,
    /// An edge that closes a loop back to an earlier block.
    Loop,
}

#[derive(Debug, Clone)]
pub struct BlockEdge {
    pub target: BlockId,
    pub kind: EdgeKind,
}

/// One basic block: an ordered op list plus in/out edges.
#[derive(Debug, Clone)]
pub struct BlockBasic {
    pub id: BlockId,
    pub ops: Vec<OpId>,
    pub in_edges: Vec<BlockEdge>,
    pub out_edges: Vec<BlockEdge>,
}

impl BlockBasic {
    fn new(id: BlockId) -> Self {
        Self { id, ops: Vec::new(), in_edges: Vec::new(), out_edges: Vec::new() }
    }

    pub fn is_entry(&self) -> bool {
        self.in_edges.is_empty()
    }
}

/// A rooted DAG of basic blocks ("the block graph forms a rooted
/// DAG of basic blocks plus a structured-control tree used by the
/// printer"). The structured-control tree itself belongs to the printer
/// (out of scope here); this owns only the block-level graph the
/// rewrite rules operate on.
#[derive(Debug, Clone, Default)]
pub struct BlockGraph {
    blocks: Vec<BlockBasic>,
    entry: Option<BlockId>,
}

impl BlockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockBasic::new(id));
        if self.entry.is_none() {
            self.entry = Some(id);
        }
        id
    }

    pub fn get(&self, id: BlockId) -> &BlockBasic {
        &self.blocks[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut BlockBasic {
        &mut self.blocks[id.0 as usize]
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind) {
        self.blocks[from.0 as usize].out_edges.push(BlockEdge { target: to, kind });
        self.blocks[to.0 as usize].in_edges.push(BlockEdge { target: from, kind });
    }

    /// Removes every edge touching `id` in either direction, without
    /// removing the block itself (callers detach before destroying).
    pub fn detach(&mut self, id: BlockId) {
        let outs: Vec<BlockId> = self.blocks[id.0 as usize].out_edges.iter().map(|e| e.target).collect();
        let ins: Vec<BlockId> = self.blocks[id.0 as usize].in_edges.iter().map(|e| e.target).collect();
        for out in outs {
            self.blocks[out.0 as usize].in_edges.retain(|e| e.target != id);
        }
        for inn in ins {
            self.blocks[inn.0 as usize].out_edges.retain(|e| e.target != id);
        }
        self.blocks[id.0 as usize].out_edges.clear();
        self.blocks[id.0 as usize].in_edges.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlockBasic> {
        self.blocks.iter()
    }

    /// True when `id` has exactly one in-edge and one out-edge — the
    /// "linear" blocks the conditional-execution walk climbs through
    ///.
    pub fn is_linear(&self, id: BlockId) -> bool {
        let b = self.get(id);
        b.in_edges.len() == 1 && b.out_edges.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_removes_both_directions() {
        let mut g = BlockGraph::new();
        let a = g.create_block();
        let b = g.create_block();
        let c = g.create_block();
        g.add_edge(a, b, EdgeKind::Fallthrough);
        g.add_edge(b, c, EdgeKind::Fallthrough);
        g.detach(b);
        assert!(g.get(a).out_edges.is_empty());
        assert!(g.get(c).in_edges.is_empty());
    }

    #[test]
    fn linear_block_has_one_in_one_out() {
        let mut g = BlockGraph::new();
        let a = g.create_block();
        let b = g.create_block();
        let c = g.create_block();
        g.add_edge(a, b, EdgeKind::Fallthrough);
        g.add_edge(b, c, EdgeKind::Fallthrough);
        assert!(g.is_linear(b));
        assert!(!g.is_linear(a));
    }
}
