//! Surrogate numeric ids for principals that only carry a GUID or SID
//!
//! Ids are handed out in fixed-capacity blocks, one block list per
//! identifier kind. Each block reserves a contiguous range from a
//! monotonically increasing id space that starts well above real uids and
//! gids, so a temporary id can be recognized by value alone. The same raw
//! key always maps to the same id for the lifetime of the allocator and ids
//! are never reused.

use crate::error::{IdCacheError, Result};
use crate::sid::Sid;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

/// First id handed out
pub const TEMPORARY_ID_BASE: u32 = 0xA000_0000;

/// Ids per block
pub const BLOCK_CAPACITY: u32 = 64;

/// SIDs whose binary form fits in this many bytes are "short"
const SHORT_SID_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentifierKind {
    Guid,
    ShortSid,
    LongSid,
}

impl IdentifierKind {
    fn slot(self) -> usize {
        self as usize
    }
}

/// Raw key a temporary id was minted for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemporaryKey {
    Guid(Uuid),
    Sid(Sid),
}

struct Block {
    base: u32,
    keys: Vec<Vec<u8>>,
}

impl Block {
    fn is_full(&self) -> bool {
        self.keys.len() as u32 >= BLOCK_CAPACITY
    }

    fn position(&self, raw: &[u8]) -> Option<u32> {
        self.keys
            .iter()
            .position(|key| key == raw)
            .map(|i| self.base + i as u32)
    }

    fn get(&self, id: u32) -> Option<&[u8]> {
        let offset = id.checked_sub(self.base)?;
        self.keys.get(offset as usize).map(Vec::as_slice)
    }
}

struct AllocatorState {
    blocks: [Vec<Block>; 3],
    next_base: u64,
}

/// Issues stable surrogate numeric ids
pub struct TemporaryIdAllocator {
    start: u32,
    end: u64,
    state: Mutex<AllocatorState>,
}

impl TemporaryIdAllocator {
    pub fn new() -> Self {
        Self::with_range(TEMPORARY_ID_BASE, u32::MAX)
    }

    /// Allocator over `[start, end)`
    pub fn with_range(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end as u64,
            state: Mutex::new(AllocatorState {
                blocks: [Vec::new(), Vec::new(), Vec::new()],
                next_base: start as u64,
            }),
        }
    }

    pub fn allocate_guid(&self, guid: &Uuid) -> Result<u32> {
        self.allocate(IdentifierKind::Guid, guid.as_bytes())
    }

    pub fn allocate_sid(&self, sid: &Sid) -> Result<u32> {
        let raw = sid.to_bytes();
        let kind = if raw.len() <= SHORT_SID_BYTES {
            IdentifierKind::ShortSid
        } else {
            IdentifierKind::LongSid
        };
        self.allocate(kind, &raw)
    }

    fn allocate(&self, kind: IdentifierKind, raw: &[u8]) -> Result<u32> {
        let mut state = self.state.lock();

        if let Some(id) = state.blocks[kind.slot()]
            .iter()
            .find_map(|block| block.position(raw))
        {
            return Ok(id);
        }

        let needs_block = state.blocks[kind.slot()]
            .last()
            .map_or(true, Block::is_full);
        if needs_block {
            let base = state.next_base;
            if base + BLOCK_CAPACITY as u64 > self.end {
                return Err(IdCacheError::TemporaryIdsExhausted);
            }
            state.next_base = base + BLOCK_CAPACITY as u64;
            debug!("New {:?} temporary id block at {:#x}", kind, base);
            state.blocks[kind.slot()].push(Block {
                base: base as u32,
                keys: Vec::with_capacity(BLOCK_CAPACITY as usize),
            });
        }

        let block = state.blocks[kind.slot()]
            .last_mut()
            .ok_or(IdCacheError::TemporaryIdsExhausted)?;
        let id = block.base + block.keys.len() as u32;
        block.keys.push(raw.to_vec());
        Ok(id)
    }

    /// Whether `id` lies in the range this allocator has handed out
    pub fn is_temporary(&self, id: u32) -> bool {
        id >= self.start && (id as u64) < self.state.lock().next_base
    }

    /// GUID or SID `id` was minted for
    pub fn lookup(&self, id: u32) -> Option<TemporaryKey> {
        if !self.is_temporary(id) {
            return None;
        }
        let state = self.state.lock();
        for (slot, blocks) in state.blocks.iter().enumerate() {
            let Some(raw) = blocks.iter().find_map(|block| block.get(id)) else {
                continue;
            };
            return if slot == IdentifierKind::Guid.slot() {
                Uuid::from_slice(raw).ok().map(TemporaryKey::Guid)
            } else {
                Sid::from_bytes(raw).ok().map(TemporaryKey::Sid)
            };
        }
        None
    }
}

impl Default for TemporaryIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_same_guid_same_id() {
        let allocator = TemporaryIdAllocator::new();
        let guid = Uuid::new_v4();

        let first = allocator.allocate_guid(&guid).unwrap();
        let second = allocator.allocate_guid(&guid).unwrap();

        assert_eq!(first, second);
        assert!(first >= TEMPORARY_ID_BASE);
        assert!(allocator.is_temporary(first));
        assert_eq!(allocator.lookup(first), Some(TemporaryKey::Guid(guid)));
    }

    #[test]
    fn test_short_and_long_sids_use_separate_blocks() {
        let allocator = TemporaryIdAllocator::new();
        let short: Sid = "S-1-5-32-544".parse().unwrap();
        let long: Sid = "S-1-5-21-3623811015-3361044348-30300820-1013".parse().unwrap();

        let short_id = allocator.allocate_sid(&short).unwrap();
        let long_id = allocator.allocate_sid(&long).unwrap();

        assert_eq!(long_id, short_id + BLOCK_CAPACITY);
        assert_eq!(allocator.lookup(long_id), Some(TemporaryKey::Sid(long)));
        assert_eq!(allocator.lookup(short_id), Some(TemporaryKey::Sid(short)));
    }

    #[test]
    fn test_full_block_grows() {
        let allocator = TemporaryIdAllocator::new();
        let ids: Vec<u32> = (0..BLOCK_CAPACITY + 1)
            .map(|_| allocator.allocate_guid(&Uuid::new_v4()).unwrap())
            .collect();

        assert_eq!(ids[BLOCK_CAPACITY as usize], TEMPORARY_ID_BASE + BLOCK_CAPACITY);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = TemporaryIdAllocator::with_range(1000, 1000 + BLOCK_CAPACITY);
        for _ in 0..BLOCK_CAPACITY {
            allocator.allocate_guid(&Uuid::new_v4()).unwrap();
        }

        assert_eq!(
            allocator.allocate_guid(&Uuid::new_v4()),
            Err(IdCacheError::TemporaryIdsExhausted)
        );
    }

    #[test]
    fn test_real_ids_are_not_temporary() {
        let allocator = TemporaryIdAllocator::new();
        assert!(!allocator.is_temporary(501));
        assert!(allocator.lookup(TEMPORARY_ID_BASE).is_none());
    }

    proptest! {
        #[test]
        fn prop_ids_are_stable_and_unique(seeds in proptest::collection::vec(any::<u128>(), 1..200)) {
            let allocator = TemporaryIdAllocator::new();
            let mut ids = HashSet::new();
            let distinct: HashSet<u128> = seeds.iter().copied().collect();

            for seed in &seeds {
                let guid = Uuid::from_u128(*seed);
                let id = allocator.allocate_guid(&guid).unwrap();
                prop_assert_eq!(allocator.allocate_guid(&guid).unwrap(), id);
                ids.insert(id);
            }

            prop_assert_eq!(ids.len(), distinct.len());
        }
    }
}
