//! Indexed container of operations for one function
//! (`PcodeOpBank`): a SeqNum tree, alive/dead lists, and per-opcode indices.

use std::collections::BTreeMap;
use std::collections::HashMap;

use anyhow::Result;

use crate::error::PcodeError;
use crate::opcode::OpCode;
use crate::pcodeop::{OpId, PcodeOp, SecondaryFlags, SeqNum};
use crate::space::Address;
use crate::varnode::VarnodeId;

/// Opcodes with a dedicated insertion-order index.
fn is_indexed_opcode(opcode: OpCode) -> bool {
    matches!(opcode, OpCode::Store | OpCode::Load | OpCode::Return | OpCode::CallOther)
}

#[derive(Default)]
pub struct PcodeOpBank {
    arena: Vec<PcodeOp>,
    seq_tree: BTreeMap<SeqNum, OpId>,
    alive_head: Option<OpId>,
    alive_tail: Option<OpId>,
    dead_head: Option<OpId>,
    dead_tail: Option<OpId>,
    per_opcode: HashMap<OpCode, Vec<OpId>>,
    retired: Vec<OpId>,
    destroyed: std::collections::HashSet<OpId>,
    time_counter: u64,
}

impl PcodeOpBank {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: OpId) -> &PcodeOp {
        &self.arena[id.0 as usize]
    }

    fn slot_mut(&mut self, id: OpId) -> &mut PcodeOp {
        &mut self.arena[id.0 as usize]
    }

    pub fn get(&self, id: OpId) -> Option<&PcodeOp> {
        if self.destroyed.contains(&id) {
            return None;
        }
        self.arena.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut PcodeOp> {
        if self.destroyed.contains(&id) {
            return None;
        }
        self.arena.get_mut(id.0 as usize)
    }

    /// Allocate an op at `address`, stamping a fresh time from the counter.
    /// Inserted into the sequence tree and the dead list, marked dead.
    pub fn create_at(&mut self, address: Address, order: u32, opcode: OpCode, num_inputs: usize) -> Result<OpId> {
        let time = self.time_counter;
        self.time_counter += 1;
        let seq = SeqNum::new(address, order, time);
        self.insert_new(seq, opcode, num_inputs)
    }

    /// Allocate an op at an explicit `SeqNum`; if its `time` is larger than
    /// any seen so far, raise the counter so future `create_at` calls never
    /// collide ("counters are saved/restored across decoding").
    pub fn create_with_seq(&mut self, seq: SeqNum, opcode: OpCode, num_inputs: usize) -> Result<OpId> {
        if self.seq_tree.contains_key(&seq) {
            return Err(PcodeError::invariant("shared sequence number").with_seqnum(seq).into());
        }
        if seq.time >= self.time_counter {
            self.time_counter = seq.time + 1;
        }
        self.insert_new(seq, opcode, num_inputs)
    }

    fn insert_new(&mut self, seq: SeqNum, opcode: OpCode, num_inputs: usize) -> Result<OpId> {
        let id = OpId(self.arena.len() as u32);
        let op = PcodeOp {
            id,
            opcode,
            inputs: vec![VarnodeId(u32::MAX); num_inputs],
            output: None,
            seq,
            parent: None,
            block_pos: None,
            primary: PcodeOp::primary_flags_for(opcode),
            secondary: SecondaryFlags(SecondaryFlags::DEAD),
            list_prev: None,
            list_next: None,
        };
        self.arena.push(op);
        self.seq_tree.insert(seq, id);
        self.push_dead(id);
        if is_indexed_opcode(opcode) {
            self.per_opcode.entry(opcode).or_default().push(id);
        }
        Ok(id)
    }

    fn push_dead(&mut self, id: OpId) {
        self.slot_mut(id).list_prev = self.dead_tail;
        self.slot_mut(id).list_next = None;
        if let Some(tail) = self.dead_tail {
            self.slot_mut(tail).list_next = Some(id);
        } else {
            self.dead_head = Some(id);
        }
        self.dead_tail = Some(id);
    }

    fn push_alive(&mut self, id: OpId) {
        self.slot_mut(id).list_prev = self.alive_tail;
        self.slot_mut(id).list_next = None;
        if let Some(tail) = self.alive_tail {
            self.slot_mut(tail).list_next = Some(id);
        } else {
            self.alive_head = Some(id);
        }
        self.alive_tail = Some(id);
    }

    /// Unlink `id` from whichever list (alive or dead) it currently sits in.
    fn unlink(&mut self, id: OpId, is_dead: bool) {
        let (prev, next) = {
            let op = self.slot(id);
            (op.list_prev, op.list_next)
        };
        match prev {
            Some(p) => self.slot_mut(p).list_next = next,
            None => {
                if is_dead {
                    self.dead_head = next;
                } else {
                    self.alive_head = next;
                }
            }
        }
        match next {
            Some(n) => self.slot_mut(n).list_prev = prev,
            None => {
                if is_dead {
                    self.dead_tail = prev;
                } else {
                    self.alive_tail = prev;
                }
            }
        }
        self.slot_mut(id).list_prev = None;
        self.slot_mut(id).list_next = None;
    }

    /// Changes opcode, re-indexing the per-opcode list and recomputing the
    /// opcode-derived flag bits (`changeOpcode`).
    pub fn change_opcode(&mut self, id: OpId, new_opcode: OpCode) -> Result<()> {
        let old_opcode = self.slot(id).opcode;
        if is_indexed_opcode(old_opcode) {
            if let Some(list) = self.per_opcode.get_mut(&old_opcode) {
                list.retain(|&x| x != id);
            }
        }
        self.slot_mut(id).opcode = new_opcode;
        self.slot_mut(id).primary = PcodeOp::primary_flags_for(new_opcode);
        if is_indexed_opcode(new_opcode) {
            self.per_opcode.entry(new_opcode).or_default().push(id);
        }
        Ok(())
    }

    /// Moves `id` from the dead list to the alive list. Fails if `id` is
    /// already alive.
    pub fn mark_alive(&mut self, id: OpId) -> Result<()> {
        if !self.slot(id).is_dead() {
            return Err(PcodeError::invariant("markAlive on an op already alive").with_seqnum(self.slot(id).seq).into());
        }
        self.unlink(id, true);
        self.slot_mut(id).secondary.clear(SecondaryFlags(SecondaryFlags::DEAD));
        self.push_alive(id);
        Ok(())
    }

    /// Moves `id` from the alive list to the dead list. Fails if `id` is
    /// already dead.
    pub fn mark_dead(&mut self, id: OpId) -> Result<()> {
        if self.slot(id).is_dead() {
            return Err(PcodeError::invariant("markDead on an op already dead").with_seqnum(self.slot(id).seq).into());
        }
        self.unlink(id, false);
        self.slot_mut(id).secondary.set(SecondaryFlags(SecondaryFlags::DEAD));
        self.push_dead(id);
        Ok(())
    }

    /// `id` must be dead; removes it from every index and appends it to the
    /// retirement list. Never reused (`destroy`).
    pub fn destroy(&mut self, id: OpId) -> Result<()> {
        if !self.slot(id).is_dead() {
            return Err(PcodeError::invariant("destroy on a live op").with_seqnum(self.slot(id).seq).into());
        }
        self.unlink(id, true);
        self.seq_tree.remove(&self.slot(id).seq);
        let opcode = self.slot(id).opcode;
        if is_indexed_opcode(opcode) {
            if let Some(list) = self.per_opcode.get_mut(&opcode) {
                list.retain(|&x| x != id);
            }
        }
        self.retired.push(id);
        self.destroyed.insert(id);
        Ok(())
    }

    /// Destroys every op currently in the dead list.
    pub fn destroy_dead(&mut self) -> Result<()> {
        let mut cur = self.dead_head;
        while let Some(id) = cur {
            cur = self.slot(id).list_next;
            self.destroy(id)?;
        }
        Ok(())
    }

    /// Splices `id` into the dead list right after `prev` (or at the head
    /// if `prev` is `None`). Both `id` and `prev` must already be dead.
    pub fn insert_after_dead(&mut self, id: OpId, prev: Option<OpId>) -> Result<()> {
        if !self.slot(id).is_dead() {
            return Err(PcodeError::invariant("insertAfterDead on a live op").with_seqnum(self.slot(id).seq).into());
        }
        if let Some(p) = prev {
            if !self.slot(p).is_dead() {
                return Err(PcodeError::invariant("insertAfterDead previous op is not dead").with_seqnum(self.slot(p).seq).into());
            }
        }
        self.unlink(id, true);
        match prev {
            None => {
                self.slot_mut(id).list_next = self.dead_head;
                self.slot_mut(id).list_prev = None;
                if let Some(head) = self.dead_head {
                    self.slot_mut(head).list_prev = Some(id);
                } else {
                    self.dead_tail = Some(id);
                }
                self.dead_head = Some(id);
            }
            Some(p) => {
                let next = self.slot(p).list_next;
                self.slot_mut(id).list_prev = Some(p);
                self.slot_mut(id).list_next = next;
                self.slot_mut(p).list_next = Some(id);
                match next {
                    Some(n) => self.slot_mut(n).list_prev = Some(id),
                    None => self.dead_tail = Some(id),
                }
            }
        }
        Ok(())
    }

    /// Splices the contiguous dead-list range `[first, last]` to just after
    /// `prev` (`moveSequenceDead`). All ops in the range, and
    /// `prev`, must be dead.
    pub fn move_sequence_dead(&mut self, first: OpId, last: OpId, prev: Option<OpId>) -> Result<()> {
        let mut ids = vec![first];
        let mut cur = first;
        while cur != last {
            let next = self
                .slot(cur)
                .list_next
                .ok_or_else(|| PcodeError::invariant("moveSequenceDead: last not reachable from first").with_seqnum(self.slot(cur).seq))?;
            ids.push(next);
            cur = next;
        }
        for &id in &ids {
            if !self.slot(id).is_dead() {
                return Err(PcodeError::invariant("moveSequenceDead on a live op").with_seqnum(self.slot(id).seq).into());
            }
        }
        let mut anchor = prev;
        for &id in &ids {
            self.insert_after_dead(id, anchor)?;
            anchor = Some(id);
        }
        Ok(())
    }

    /// Sets the incidental-copy flag on every COPY op within the dead-list
    /// range `[first, last]` (`markIncidentalCopy`).
    pub fn mark_incidental_copy(&mut self, first: OpId, last: OpId) -> Result<()> {
        let mut cur = Some(first);
        loop {
            let id = cur.ok_or_else(|| PcodeError::invariant("markIncidentalCopy: last not reachable from first"))?;
            if self.slot(id).opcode == OpCode::Copy {
                self.slot_mut(id).secondary.set(SecondaryFlags(SecondaryFlags::INCIDENTAL_COPY));
            }
            if id == last {
                break;
            }
            cur = self.slot(id).list_next;
        }
        Ok(())
    }

    /// Lower-bound by `SeqNum` at `addr` (order 0, time 0), then walks back
    /// within one instruction to the op flagged as the instruction's
    /// starting op (`seq.order == 0`). Fails if no op exists at or after
    /// `addr`.
    pub fn target(&self, addr: Address) -> Result<OpId> {
        let probe = SeqNum::new(addr, 0, 0);
        let (&found_seq, &id) = self
            .seq_tree
            .range(probe..)
            .next()
            .ok_or_else(|| PcodeError::invariant(format!("no op at or after {addr}")))?;
        if found_seq.address != addr {
            return Ok(id);
        }
        // Walk back within this instruction to the op flagged as its start
        // (order == 0); all ops for one address sit in one contiguous range
        // of the tree since the comparator keys on address before time,
        // ignoring `order`.
        let range_start = SeqNum::new(addr, 0, 0);
        let range_end = SeqNum::new(addr, 0, u64::MAX);
        let start = self
            .seq_tree
            .range(range_start..=range_end)
            .map(|(_, &id)| id)
            .find(|&id| self.slot(id).seq.order == 0)
            .unwrap_or(id);
        Ok(start)
    }

    pub fn find_op(&self, seq: SeqNum) -> Option<OpId> {
        self.seq_tree.get(&seq).copied()
    }

    /// The next op in global sequence order after `id`, ignoring block
    /// boundaries entirely. Block-aware fallthru (following the unique
    /// successor block when `id` is the last op of its own block) lives on
    /// `Funcdata`, the only type that also holds the block graph.
    pub fn next_in_sequence(&self, id: OpId) -> Option<OpId> {
        let seq = self.slot(id).seq;
        self.seq_tree.range((std::ops::Bound::Excluded(seq), std::ops::Bound::Unbounded)).next().map(|(_, &id)| id)
    }

    pub fn get_code_list(&self, opcode: OpCode) -> &[OpId] {
        self.per_opcode.get(&opcode).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &PcodeOp> {
        self.seq_tree.values().map(move |&id| self.slot(id))
    }

    pub fn iter_alive(&self) -> impl Iterator<Item = OpId> + '_ {
        std::iter::successors(self.alive_head, move |&id| self.slot(id).list_next)
    }

    pub fn iter_dead(&self) -> impl Iterator<Item = OpId> + '_ {
        std::iter::successors(self.dead_head, move |&id| self.slot(id).list_next)
    }

    pub fn time_counter(&self) -> u64 {
        self.time_counter
    }

    pub fn retired(&self) -> &[OpId] {
        &self.retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::SpaceIndex;

    fn addr(off: u64) -> Address {
        Address::new(SpaceIndex(0), off)
    }

    #[test]
    fn bank_insertion_ordering_by_address_then_time() {
        let mut bank = PcodeOpBank::new();
        let a = bank.create_with_seq(SeqNum::new(addr(0x100), 0, 0), OpCode::Copy, 1).unwrap();
        let b = bank.create_with_seq(SeqNum::new(addr(0x100), 1, 1), OpCode::Copy, 1).unwrap();
        let c = bank.create_with_seq(SeqNum::new(addr(0x104), 0, 2), OpCode::Copy, 1).unwrap();

        let at_0x100: Vec<_> = bank.iter_all().filter(|op| op.seq.address == addr(0x100)).map(|op| op.id).collect();
        assert_eq!(at_0x100, vec![a, b]);
        assert_eq!(bank.target(addr(0x104)).unwrap(), c);
        assert_eq!(bank.next_in_sequence(a), Some(b));
    }

    #[test]
    fn every_op_is_in_exactly_one_list() {
        let mut bank = PcodeOpBank::new();
        let a = bank.create_at(addr(0), 0, OpCode::Copy, 1).unwrap();
        assert!(bank.iter_dead().any(|id| id == a));
        bank.mark_alive(a).unwrap();
        assert!(bank.iter_alive().any(|id| id == a));
        assert!(!bank.iter_dead().any(|id| id == a));
    }

    #[test]
    fn mark_dead_twice_fails() {
        let mut bank = PcodeOpBank::new();
        let a = bank.create_at(addr(0), 0, OpCode::Copy, 1).unwrap();
        assert!(bank.mark_dead(a).is_err());
        bank.mark_alive(a).unwrap();
        bank.mark_dead(a).unwrap();
        assert!(bank.mark_dead(a).is_err());
    }

    #[test]
    fn find_op_returns_op_for_every_seqnum() {
        let mut bank = PcodeOpBank::new();
        let ids: Vec<_> = (0..5)
            .map(|i| bank.create_with_seq(SeqNum::new(addr(i * 4), 0, i), OpCode::Copy, 1).unwrap())
            .collect();
        for id in ids {
            let seq = bank.get(id).unwrap().seq;
            assert_eq!(bank.find_op(seq), Some(id));
        }
    }

    #[test]
    fn destroy_requires_dead_and_never_reuses_ids() {
        let mut bank = PcodeOpBank::new();
        let a = bank.create_at(addr(0), 0, OpCode::Copy, 1).unwrap();
        bank.mark_alive(a).unwrap();
        assert!(bank.destroy(a).is_err());
        bank.mark_dead(a).unwrap();
        bank.destroy(a).unwrap();
        assert!(bank.retired().contains(&a));
        assert!(bank.get(a).is_none());
    }

    #[test]
    fn shared_sequence_number_is_rejected() {
        let mut bank = PcodeOpBank::new();
        let seq = SeqNum::new(addr(0), 0, 0);
        bank.create_with_seq(seq, OpCode::Copy, 1).unwrap();
        assert!(bank.create_with_seq(seq, OpCode::Copy, 1).is_err());
    }

    #[test]
    fn per_opcode_index_tracks_only_the_four_opcodes() {
        let mut bank = PcodeOpBank::new();
        let s = bank.create_at(addr(0), 0, OpCode::Store, 3).unwrap();
        let _c = bank.create_at(addr(4), 0, OpCode::Copy, 1).unwrap();
        assert_eq!(bank.get_code_list(OpCode::Store), &[s]);
        assert!(bank.get_code_list(OpCode::Copy).is_empty());
    }

    #[test]
    fn change_opcode_reindexes() {
        let mut bank = PcodeOpBank::new();
        let id = bank.create_at(addr(0), 0, OpCode::Load, 2).unwrap();
        assert_eq!(bank.get_code_list(OpCode::Load), &[id]);
        bank.change_opcode(id, OpCode::Store).unwrap();
        assert!(bank.get_code_list(OpCode::Load).is_empty());
        assert_eq!(bank.get_code_list(OpCode::Store), &[id]);
        assert!(bank.get(id).unwrap().primary.is_special_flag());
    }
}
