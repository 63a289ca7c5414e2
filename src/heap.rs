//! Model of the flash application's UEFI pool allocator.
//!
//! The arena only ever grows towards lower addresses: newest allocations sit
//! at the bottom, so offsets of everything already tracked move up by the
//! amount the arena grows.

use std::{collections::BTreeMap, ops::Range};

pub const PAGE_SIZE: usize = 0x1000;
pub const POOL_HEAD_SIZE: usize = 0x10;
pub const POOL_TAIL_SIZE: usize = 0x0C;
pub const POOL_OVERHEAD: usize = POOL_HEAD_SIZE + POOL_TAIL_SIZE;

const POOL_HEAD_SIGNATURE: &[u8; 4] = b"phd0";
const POOL_TAIL_SIGNATURE: &[u8; 4] = b"ptal";
/// EfiBootServicesData
const POOL_MEMORY_TYPE: u32 = 4;

/// Offset of the declared size inside a pool head.
pub const POOL_HEAD_SIZE_OFFSET: usize = 0x0C;
const POOL_TAIL_SIZE_OFFSET: usize = 0x08;

pub const fn round_up_to_page(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Size written into the head and tail of a pool allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolSizeMode {
    /// Requested size plus head and tail. The phone reboots cleanly on a
    /// later crash, at the risk of NV corruption.
    Logical,
    /// Page rounded reservation. Forces the crash into emergency mode and
    /// keeps NV safe.
    #[default]
    Rounded,
}

#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    #[error("Allocation of {0:#X} bytes is below the page size")]
    UnsupportedAllocation(usize),
    #[error("Allocation {0:?} is not live")]
    UnknownAllocation(AllocationId),
    #[error("Write of {len:#X} bytes at {offset:#X} exceeds the {capacity:#X} byte content of {id:?}")]
    OutOfBounds {
        id: AllocationId,
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("Region {0:#X?} lies outside the arena")]
    OutsideArena(Range<usize>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(u32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub total: Range<usize>,
    pub head: Range<usize>,
    pub content: Range<usize>,
    pub tail: Range<usize>,
}

impl Allocation {
    fn shift(&mut self, amount: usize) {
        for range in [
            &mut self.total,
            &mut self.head,
            &mut self.content,
            &mut self.tail,
        ] {
            range.start += amount;
            range.end += amount;
        }
    }

    /// Bytes the content may grow to without leaving the reservation.
    pub fn content_capacity(&self) -> usize {
        self.total.len() - POOL_OVERHEAD
    }
}

/// `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeMemRange {
    pub start: usize,
    pub end: usize,
}

impl FreeMemRange {
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct UefiHeap {
    memory: Vec<u8>,
    allocations: BTreeMap<AllocationId, Allocation>,
    free_list: Vec<FreeMemRange>,
    next_id: u32,
    mode: PoolSizeMode,
}

impl UefiHeap {
    pub fn new(mode: PoolSizeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn reset(&mut self, mode: PoolSizeMode) {
        *self = Self::new(mode);
    }

    pub fn mode(&self) -> PoolSizeMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: PoolSizeMode) {
        self.mode = mode;
    }

    pub fn arena_len(&self) -> usize {
        self.memory.len()
    }

    pub fn free_list(&self) -> &[FreeMemRange] {
        &self.free_list
    }

    pub fn allocations(&self) -> impl Iterator<Item = (AllocationId, &Allocation)> {
        self.allocations.iter().map(|(id, allocation)| (*id, allocation))
    }

    pub fn allocation(&self, id: AllocationId) -> Result<&Allocation, HeapError> {
        self.allocations
            .get(&id)
            .ok_or(HeapError::UnknownAllocation(id))
    }

    /// Start of the lowest live allocation, the arena end when there is none.
    fn lowest_allocation(&self) -> usize {
        self.allocations
            .values()
            .map(|allocation| allocation.total.start)
            .min()
            .unwrap_or(self.memory.len())
    }

    /// Prepends `amount` bytes and moves every tracked range up with them.
    fn extend(&mut self, amount: usize) -> usize {
        self.memory.splice(0..0, std::iter::repeat_n(0u8, amount));

        for allocation in self.allocations.values_mut() {
            allocation.shift(amount);
        }

        for range in &mut self.free_list {
            range.start += amount;
            range.end += amount;
        }

        tracing::trace!("Grew simulated arena by {amount:#X} to {:#X}", self.memory.len());
        amount
    }

    pub fn allocate_pool(&mut self, size: usize) -> Result<AllocationId, HeapError> {
        if size < PAGE_SIZE {
            return Err(HeapError::UnsupportedAllocation(size));
        }

        let total_size = round_up_to_page(size + POOL_OVERHEAD);

        // Biggest free range first, the lowest (newest) one on ties
        let reused = self
            .free_list
            .iter()
            .enumerate()
            .filter(|(_, range)| range.len() >= total_size)
            .max_by(|(_, a), (_, b)| a.len().cmp(&b.len()).then(b.start.cmp(&a.start)))
            .map(|(idx, _)| idx);

        let start = match reused {
            Some(idx) => {
                let range = &mut self.free_list[idx];
                range.end -= total_size;
                let start = range.end;
                if range.is_empty() {
                    self.free_list.remove(idx);
                }
                start
            }
            None => {
                let low = self.lowest_allocation();
                let low = match total_size.checked_sub(low) {
                    Some(missing) if missing > 0 => low + self.extend(missing),
                    _ => low,
                };
                low - total_size
            }
        };

        let declared = match self.mode {
            PoolSizeMode::Logical => size + POOL_OVERHEAD,
            PoolSizeMode::Rounded => total_size,
        };

        let head = start..start + POOL_HEAD_SIZE;
        let content = head.end..head.end + size;
        let tail_start = start + declared - POOL_TAIL_SIZE;
        let allocation = Allocation {
            total: start..start + total_size,
            head,
            content,
            tail: tail_start..tail_start + POOL_TAIL_SIZE,
        };

        self.write_bookkeeping(&allocation, declared);

        let id = AllocationId(self.next_id);
        self.next_id += 1;

        tracing::trace!(
            "Allocated {size:#X} bytes as {id:?} at {:#X?}",
            allocation.total
        );

        self.allocations.insert(id, allocation);
        Ok(id)
    }

    pub fn free_pool(&mut self, id: AllocationId) -> Result<(), HeapError> {
        let allocation = self
            .allocations
            .remove(&id)
            .ok_or(HeapError::UnknownAllocation(id))?;

        if self.allocations.is_empty() {
            self.free_list.clear();
            return Ok(());
        }

        self.free_list.push(FreeMemRange {
            start: allocation.total.start,
            end: allocation.total.end,
        });
        self.free_list.sort_unstable_by_key(|range| range.start);

        let mut coalesced: Vec<FreeMemRange> = Vec::with_capacity(self.free_list.len());
        for range in self.free_list.drain(..) {
            match coalesced.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => coalesced.push(range),
            }
        }

        // Anything below the lowest allocation is part of the unused low region again
        let lowest = self.lowest_allocation();
        coalesced.retain(|range| range.start >= lowest);
        self.free_list = coalesced;

        Ok(())
    }

    fn write_bookkeeping(&mut self, allocation: &Allocation, declared: usize) {
        let head = &mut self.memory[allocation.head.clone()];
        head[0..4].copy_from_slice(POOL_HEAD_SIGNATURE);
        head[4..8].fill(0);
        head[8..12].copy_from_slice(&POOL_MEMORY_TYPE.to_le_bytes());
        head[POOL_HEAD_SIZE_OFFSET..POOL_HEAD_SIZE_OFFSET + 4]
            .copy_from_slice(&(declared as u32).to_le_bytes());

        let tail = &mut self.memory[allocation.tail.clone()];
        tail[0..4].copy_from_slice(POOL_TAIL_SIGNATURE);
        tail[4..8].fill(0);
        tail[POOL_TAIL_SIZE_OFFSET..POOL_TAIL_SIZE_OFFSET + 4]
            .copy_from_slice(&(declared as u32).to_le_bytes());
    }

    /// Grows or shrinks the content of `id` inside its reservation, moving the
    /// tail along in [`PoolSizeMode::Logical`].
    pub fn resize_content(&mut self, id: AllocationId, len: usize) -> Result<(), HeapError> {
        let mut allocation = self.allocation(id)?.clone();

        if len > allocation.content_capacity() {
            return Err(HeapError::OutOfBounds {
                id,
                offset: 0,
                len,
                capacity: allocation.content_capacity(),
            });
        }

        let declared = match self.mode {
            PoolSizeMode::Logical => len + POOL_OVERHEAD,
            PoolSizeMode::Rounded => allocation.total.len(),
        };

        self.memory[allocation.tail.clone()].fill(0);

        let tail_start = allocation.total.start + declared - POOL_TAIL_SIZE;
        allocation.content = allocation.head.end..allocation.head.end + len;
        allocation.tail = tail_start..tail_start + POOL_TAIL_SIZE;
        self.write_bookkeeping(&allocation, declared);

        self.allocations.insert(id, allocation);
        Ok(())
    }

    pub fn write(
        &mut self,
        id: AllocationId,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), HeapError> {
        let content = self.allocation(id)?.content.clone();

        if offset + bytes.len() > content.len() {
            return Err(HeapError::OutOfBounds {
                id,
                offset,
                len: bytes.len(),
                capacity: content.len(),
            });
        }

        let start = content.start + offset;
        self.memory[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, id: AllocationId) -> Result<&[u8], HeapError> {
        let content = self.allocation(id)?.content.clone();
        Ok(&self.memory[content])
    }

    /// Raw arena bytes, bookkeeping included.
    pub fn region(&self, range: Range<usize>) -> Result<&[u8], HeapError> {
        self.memory
            .get(range.clone())
            .ok_or(HeapError::OutsideArena(range))
    }

    /// Zeroes the size a pool head declares for `id`.
    ///
    /// The phone's pool free routine faults on the next free of this
    /// allocation, which sends it straight into emergency download mode.
    pub fn zero_declared_size(&mut self, id: AllocationId) -> Result<usize, HeapError> {
        let offset = self.allocation(id)?.head.start + POOL_HEAD_SIZE_OFFSET;
        self.memory[offset..offset + 4].copy_from_slice(&0u32.to_le_bytes());
        Ok(offset)
    }
}
