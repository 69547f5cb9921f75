//! Segment descriptors and the segment table.
//!
//! Every data access goes through one of the selector registers. The
//! selector indexes the segment table, and the descriptor found there
//! decides whether the access is allowed and where it lands in linear
//! memory.

use crate::cpu::execute::Fault;
use crate::cpu::memory::Memory;
use serde::{Serialize, Deserialize};

/// Number of entries in the segment table.
pub const NUM_SEGMENTS: usize = 8;

/// Words per segment descriptor in memory: start, limit, (privLvl << 8) | type.
pub const DESCRIPTOR_WORDS: usize = 3;

/// Kind of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentType {
    /// Unused entry; every access faults.
    Null,
    /// Executable, read-only.
    Code,
    Data,
    Stack,
    Io,
}

impl SegmentType {
    /// Decode the type field of a descriptor.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(SegmentType::Null),
            1 => Some(SegmentType::Code),
            2 => Some(SegmentType::Data),
            3 => Some(SegmentType::Stack),
            4 => Some(SegmentType::Io),
            _ => None,
        }
    }

    /// Encode as the type field of a descriptor.
    pub fn to_u32(self) -> u32 {
        match self {
            SegmentType::Null => 0,
            SegmentType::Code => 1,
            SegmentType::Data => 2,
            SegmentType::Stack => 3,
            SegmentType::Io => 4,
        }
    }

    /// Display name used by the debugger.
    pub fn name(self) -> &'static str {
        match self {
            SegmentType::Null => "NULL",
            SegmentType::Code => "CODE",
            SegmentType::Data => "DATA",
            SegmentType::Stack => "STACK",
            SegmentType::Io => "IO",
        }
    }
}

/// Kind of access requested through a selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Execute,
    Read,
    Write,
}

/// A segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// First linear address of the segment.
    pub start: u32,
    /// Size in words.
    pub limit: u32,
    /// Least privileged level allowed to access the segment.
    pub priv_lvl: u8,
    #[serde(rename = "type")]
    pub kind: SegmentType,
}

impl Segment {
    /// An unused descriptor.
    pub const fn null() -> Self {
        Self {
            start: 0,
            limit: 0,
            priv_lvl: 0,
            kind: SegmentType::Null,
        }
    }

    /// Create a descriptor. Returns `None` if `start + limit` overflows
    /// the address space.
    pub fn new(start: u32, limit: u32, priv_lvl: u8, kind: SegmentType) -> Option<Self> {
        start.checked_add(limit)?;
        Some(Self { start, limit, priv_lvl, kind })
    }

    /// Decode an in-memory descriptor.
    pub fn from_descriptor(words: [u32; DESCRIPTOR_WORDS]) -> Option<Self> {
        let priv_lvl = ((words[2] >> 8) & 0xff) as u8;
        let kind = SegmentType::from_u32(words[2] & 0xff)?;
        Self::new(words[0], words[1], priv_lvl, kind)
    }

    /// Encode as an in-memory descriptor.
    pub fn to_descriptor(&self) -> [u32; DESCRIPTOR_WORDS] {
        [
            self.start,
            self.limit,
            (u32::from(self.priv_lvl) << 8) | self.kind.to_u32(),
        ]
    }

    /// Check if a linear address falls inside the segment.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr - self.start < self.limit
    }

    fn permits(&self, access: Access) -> bool {
        match (self.kind, access) {
            (SegmentType::Null, _) => false,
            (SegmentType::Code, Access::Write) => false,
            (SegmentType::Code, _) => true,
            (_, Access::Execute) => false,
            _ => true,
        }
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::null()
    }
}

/// The cached segment table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentTable {
    entries: [Segment; NUM_SEGMENTS],
}

impl SegmentTable {
    /// The reset table: flat code, data and stack segments over all of
    /// memory at privilege level 0.
    pub fn flat(mem_words: usize) -> Self {
        let limit = u32::try_from(mem_words).unwrap_or(u32::MAX);
        let mut entries = [Segment::null(); NUM_SEGMENTS];
        entries[0] = Segment { start: 0, limit, priv_lvl: 0, kind: SegmentType::Code };
        entries[1] = Segment { start: 0, limit, priv_lvl: 0, kind: SegmentType::Data };
        entries[2] = Segment { start: 0, limit, priv_lvl: 0, kind: SegmentType::Stack };
        Self { entries }
    }

    /// Read a table of descriptors from linear memory at `base`.
    ///
    /// Fails with a protection fault if the table does not fit in memory
    /// or any descriptor is malformed.
    pub fn load(mem: &Memory, base: u32) -> Result<Self, Fault> {
        let words = mem
            .read_range(base, NUM_SEGMENTS * DESCRIPTOR_WORDS)
            .map_err(|_| Fault::Protection("segment table outside memory"))?;

        let mut entries = [Segment::null(); NUM_SEGMENTS];
        for (entry, chunk) in entries.iter_mut().zip(words.chunks_exact(DESCRIPTOR_WORDS)) {
            *entry = Segment::from_descriptor([chunk[0], chunk[1], chunk[2]])
                .ok_or(Fault::Protection("malformed segment descriptor"))?;
        }
        Ok(Self { entries })
    }

    /// Look up a descriptor by selector.
    pub fn get(&self, selector: u32) -> Option<&Segment> {
        self.entries.get(selector as usize)
    }

    /// Iterate over all descriptors in selector order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.entries.iter()
    }

    /// Check that a selector may be loaded at `priv_lvl` for `access`.
    pub fn check_selector(&self, selector: u32, priv_lvl: u8, access: Access) -> Result<&Segment, Fault> {
        let seg = self
            .get(selector)
            .ok_or(Fault::Protection("selector outside segment table"))?;
        if !seg.permits(access) {
            return Err(Fault::Protection("segment type forbids access"));
        }
        if priv_lvl > seg.priv_lvl {
            return Err(Fault::Protection("insufficient privilege"));
        }
        Ok(seg)
    }

    /// Translate `selector:offset` to a linear address.
    pub fn translate(&self, selector: u32, offset: u32, priv_lvl: u8, access: Access) -> Result<u32, Fault> {
        let seg = self.check_selector(selector, priv_lvl, access)?;
        if offset >= seg.limit {
            return Err(Fault::Protection("offset beyond segment limit"));
        }
        Ok(seg.start + offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let seg = Segment::new(0x100, 0x40, 3, SegmentType::Stack).unwrap();
        assert_eq!(Segment::from_descriptor(seg.to_descriptor()), Some(seg));
    }

    #[test]
    fn test_overflowing_segment_rejected() {
        assert!(Segment::new(u32::MAX, 2, 0, SegmentType::Data).is_none());
        assert!(Segment::from_descriptor([0, 1, 9]).is_none());
    }

    #[test]
    fn test_flat_table() {
        let table = SegmentTable::flat(0x1000);

        assert_eq!(table.translate(1, 0xfff, 0, Access::Write), Ok(0xfff));
        assert!(table.translate(1, 0x1000, 0, Access::Read).is_err());
        assert!(table.translate(0, 0x10, 0, Access::Write).is_err());
        assert!(table.translate(1, 0x10, 0, Access::Execute).is_err());
        assert!(table.translate(3, 0, 0, Access::Read).is_err());
        assert!(table.translate(NUM_SEGMENTS as u32, 0, 0, Access::Read).is_err());
    }

    #[test]
    fn test_load_from_memory() {
        let mut mem = Memory::new(64);
        let user = Segment::new(0x20, 0x10, 3, SegmentType::Data).unwrap();
        for (i, word) in user.to_descriptor().iter().enumerate() {
            mem.write_word(DESCRIPTOR_WORDS as u32 + i as u32, *word).unwrap();
        }

        let table = SegmentTable::load(&mem, 0).unwrap();
        assert_eq!(table.get(1), Some(&user));
        assert_eq!(table.get(0).unwrap().kind, SegmentType::Null);
        assert_eq!(table.translate(1, 4, 3, Access::Read), Ok(0x24));

        assert!(SegmentTable::load(&mem, 60).is_err());
    }

    proptest! {
        #[test]
        fn prop_privilege_check(seg_priv in 0u8..8, cur_priv in 0u8..8) {
            let mut table = SegmentTable::flat(16);
            table.entries[1].priv_lvl = seg_priv;

            let result = table.translate(1, 0, cur_priv, Access::Read);
            prop_assert_eq!(result.is_ok(), cur_priv <= seg_priv);
        }
    }
}
