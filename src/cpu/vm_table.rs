//! VM context table.
//!
//! A fixed number of slots holding suspended execution contexts. Slot 0 is
//! the interrupt save area; slots 1.. hold the parents of nested guests and
//! are used as a stack, so slot `n` is the parent of the guest `n` levels
//! deep.

use crate::cpu::execute::Fault;
use serde::{Serialize, Deserialize};

/// Number of slots in the table, including the interrupt slot.
pub const VM_TABLE_SIZE: usize = 16;

/// Slot reserved for the context interrupted by an interrupt or fault.
pub const INTERRUPT_SLOT: usize = 0;

/// Words per guest descriptor in memory.
pub const CONTEXT_WORDS: usize = 8;

/// A saved execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VmContext {
    pub cs: u32,
    pub ds: u32,
    pub es: u32,
    pub ss: u32,
    pub rs: u32,
    pub ip: u32,
    pub flags: u32,
    pub priv_lvl: u8,
}

impl VmContext {
    /// Decode a guest descriptor: CS, DS, ES, SS, RS, IP, Flags, privLvl.
    pub fn from_words(words: &[u32; CONTEXT_WORDS]) -> Self {
        Self {
            cs: words[0],
            ds: words[1],
            es: words[2],
            ss: words[3],
            rs: words[4],
            ip: words[5],
            flags: words[6],
            priv_lvl: (words[7] & 0xff) as u8,
        }
    }

    /// Encode as a guest descriptor.
    pub fn to_words(&self) -> [u32; CONTEXT_WORDS] {
        [
            self.cs,
            self.ds,
            self.es,
            self.ss,
            self.rs,
            self.ip,
            self.flags,
            u32::from(self.priv_lvl),
        ]
    }
}

/// The VM context table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmTable {
    slots: [VmContext; VM_TABLE_SIZE],
    /// Number of nested slots in use.
    depth: usize,
}

impl VmTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            slots: [VmContext::default(); VM_TABLE_SIZE],
            depth: 0,
        }
    }

    /// Store a context in a slot.
    ///
    /// # Panics
    /// Panics if `slot >= VM_TABLE_SIZE`.
    pub fn save(&mut self, slot: usize, ctx: VmContext) {
        self.slots[slot] = ctx;
    }

    /// Fetch the context stored in a slot.
    ///
    /// # Panics
    /// Panics if `slot >= VM_TABLE_SIZE`.
    pub fn load(&self, slot: usize) -> VmContext {
        self.slots[slot]
    }

    /// Check if every nesting slot is in use.
    pub fn is_full(&self) -> bool {
        self.depth == VM_TABLE_SIZE - 1
    }

    /// Current nesting depth (0 when not inside a guest).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Save a parent context in the next nesting slot and return the slot.
    pub fn push(&mut self, ctx: VmContext) -> Result<usize, Fault> {
        if self.is_full() {
            return Err(Fault::VmTableExhausted);
        }
        self.depth += 1;
        self.slots[self.depth] = ctx;
        Ok(self.depth)
    }

    /// Take the innermost parent context, returning it with its slot.
    pub fn pop(&mut self) -> Option<(usize, VmContext)> {
        if self.depth == 0 {
            return None;
        }
        let slot = self.depth;
        self.depth -= 1;
        Some((slot, self.slots[slot]))
    }

    /// Iterate over all slots with their index.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &VmContext)> {
        self.slots.iter().enumerate()
    }
}

impl Default for VmTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(ip: u32) -> VmContext {
        VmContext { ip, ..VmContext::default() }
    }

    #[test]
    fn test_push_pop_nesting() {
        let mut table = VmTable::new();

        assert_eq!(table.push(ctx(1)), Ok(1));
        assert_eq!(table.push(ctx(2)), Ok(2));
        assert_eq!(table.depth(), 2);

        assert_eq!(table.pop(), Some((2, ctx(2))));
        assert_eq!(table.pop(), Some((1, ctx(1))));
        assert_eq!(table.pop(), None);
    }

    #[test]
    fn test_full_table() {
        let mut table = VmTable::new();
        for i in 1..VM_TABLE_SIZE {
            assert_eq!(table.push(ctx(i as u32)), Ok(i));
        }

        assert!(table.is_full());
        assert_eq!(table.push(ctx(99)), Err(Fault::VmTableExhausted));
        assert_eq!(table.depth(), VM_TABLE_SIZE - 1);
    }

    #[test]
    fn test_interrupt_slot_is_separate() {
        let mut table = VmTable::new();
        table.save(INTERRUPT_SLOT, ctx(0x40));
        table.push(ctx(0x80)).unwrap();

        assert_eq!(table.load(INTERRUPT_SLOT).ip, 0x40);
        assert_eq!(table.load(1).ip, 0x80);
        assert_eq!(table.iter().count(), VM_TABLE_SIZE);
    }

    #[test]
    fn test_descriptor_words() {
        let words = [1, 2, 3, 4, 5, 0x100, 0x7, 3];
        let ctx = VmContext::from_words(&words);

        assert_eq!(ctx.ip, 0x100);
        assert_eq!(ctx.priv_lvl, 3);
        assert_eq!(ctx.to_words(), words);
    }
}
