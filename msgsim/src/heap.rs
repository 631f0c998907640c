//! Simulated address space for NIC-visible buffers.
//!
//! The engine needs addresses for the regions it hands to the NIC (posted
//! short receive buffers, eager bounce buffers, header and acknowledgement
//! slots). No bytes are ever stored: [`HeapAddrs`] only hands out
//! non-overlapping address ranges from a fixed arena.
//!
//! Block sizes are rounded up to [`HEAP_ALIGN`] and released blocks are kept
//! on per-size free lists, so a freed block is reused (last freed, first
//! reused) by the next allocation of the same rounded size before the arena
//! cursor advances.
//!
//! # Example
//!
//! ```
//! use msgsim::heap::{HeapAddrs, SimAddr};
//!
//! let mut heap = HeapAddrs::new(SimAddr::new(0x1000), 4096);
//!
//! let a = heap.alloc(10).unwrap();
//! assert_eq!(a, SimAddr::new(0x1000));
//!
//! heap.free(a).unwrap();
//! assert_eq!(heap.alloc(16).unwrap(), a);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;

/// Alignment and size granularity of heap blocks, in bytes.
pub const HEAP_ALIGN: usize = 16;

/// Rounds a length up to the heap granularity.
pub const fn align_up(len: usize) -> usize {
    (len + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

/// An address in the simulated NIC-visible address space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimAddr(u64);

impl SimAddr {
    /// Creates an address from its raw value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw address value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the address located `offset` bytes past this one.
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

impl fmt::Display for SimAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Allocator of non-overlapping address ranges within a fixed arena.
pub struct HeapAddrs {
    start: SimAddr,
    length: usize,
    cursor: usize,
    /// Released blocks, keyed by rounded size.
    free: BTreeMap<usize, Vec<SimAddr>>,
    /// Live blocks and their rounded size.
    used: HashMap<SimAddr, usize>,
}

impl HeapAddrs {
    /// Creates an allocator over `[start, start + length)`.
    pub fn new(start: SimAddr, length: usize) -> Self {
        Self {
            start,
            length,
            cursor: 0,
            free: BTreeMap::new(),
            used: HashMap::new(),
        }
    }

    /// Allocates a block of at least `length` bytes.
    ///
    /// Zero-length requests still consume one granule so that every live
    /// block has a distinct address.
    pub fn alloc(&mut self, length: usize) -> Result<SimAddr, HeapError> {
        let size = align_up(length.max(1));

        if let Some(addr) = self.free.get_mut(&size).and_then(Vec::pop) {
            self.used.insert(addr, size);
            return Ok(addr);
        }

        let available = self.length - self.cursor;
        if size > available {
            return Err(HeapError::Exhausted {
                requested: length,
                available,
            });
        }

        let addr = self.start.offset(self.cursor);
        self.cursor += size;
        self.used.insert(addr, size);

        Ok(addr)
    }

    /// Releases a block previously returned by [`alloc`](Self::alloc).
    pub fn free(&mut self, addr: SimAddr) -> Result<(), HeapError> {
        let size = self
            .used
            .remove(&addr)
            .ok_or(HeapError::NotAllocated(addr))?;
        self.free.entry(size).or_default().push(addr);

        Ok(())
    }

    /// Returns `true` if `addr` is the start of a live block.
    pub fn is_allocated(&self, addr: SimAddr) -> bool {
        self.used.contains_key(&addr)
    }

    /// Number of live blocks.
    pub fn live_blocks(&self) -> usize {
        self.used.len()
    }

    /// Bytes held by live blocks, after rounding.
    pub fn bytes_in_use(&self) -> usize {
        self.used.values().sum()
    }

    /// Arena capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.length
    }
}

impl fmt::Debug for HeapAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAddrs")
            .field("start", &self.start)
            .field("length", &self.length)
            .field("cursor", &self.cursor)
            .field("live_blocks", &self.used.len())
            .finish_non_exhaustive()
    }
}

/// An error returned by the heap allocator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeapError {
    /// The arena cannot satisfy the request and no released block fits.
    Exhausted {
        /// Requested length, before rounding.
        requested: usize,
        /// Bytes left between the cursor and the end of the arena.
        available: usize,
    },
    /// The address is not the start of a live block.
    NotAllocated(SimAddr),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                requested,
                available,
            } => write!(
                f,
                "heap exhausted: {} bytes requested with {} bytes left in the arena",
                requested, available
            ),
            Self::NotAllocated(addr) => {
                write!(f, "address {} was not allocated from the heap", addr)
            }
        }
    }
}

impl Error for HeapError {}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn heap_rounds_sizes() {
        let mut heap = HeapAddrs::new(SimAddr::new(0x1000), 1024);

        let a = heap.alloc(1).unwrap();
        let b = heap.alloc(17).unwrap();
        let c = heap.alloc(0).unwrap();

        assert_eq!(a, SimAddr::new(0x1000));
        assert_eq!(b, SimAddr::new(0x1010));
        assert_eq!(c, SimAddr::new(0x1030));
        assert_eq!(heap.bytes_in_use(), 64);
    }

    #[test]
    fn heap_reuses_last_freed_block_first() {
        let mut heap = HeapAddrs::new(SimAddr::new(0), 1024);

        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();

        assert_eq!(heap.alloc(20).unwrap(), b);
        assert_eq!(heap.alloc(32).unwrap(), a);
        // A different size class advances the cursor.
        assert_eq!(heap.alloc(48).unwrap(), SimAddr::new(64));
    }

    #[test]
    fn heap_exhaustion() {
        let mut heap = HeapAddrs::new(SimAddr::new(0), 64);

        heap.alloc(48).unwrap();
        assert_eq!(
            heap.alloc(32),
            Err(HeapError::Exhausted {
                requested: 32,
                available: 16
            })
        );
        assert!(heap.alloc(16).is_ok());
    }

    #[test]
    fn heap_rejects_unknown_and_double_free() {
        let mut heap = HeapAddrs::new(SimAddr::new(0x100), 256);

        let a = heap.alloc(8).unwrap();
        assert!(heap.is_allocated(a));
        assert!(!heap.is_allocated(SimAddr::new(0x108)));
        assert_eq!(
            heap.free(SimAddr::new(0x108)),
            Err(HeapError::NotAllocated(SimAddr::new(0x108)))
        );
        heap.free(a).unwrap();
        assert!(!heap.is_allocated(a));
        assert_eq!(heap.free(a), Err(HeapError::NotAllocated(a)));
    }

    #[test]
    fn heap_live_blocks_never_overlap() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut heap = HeapAddrs::new(SimAddr::new(0x1000), 1 << 20);
        let mut live: Vec<(SimAddr, usize)> = Vec::new();

        for _ in 0..2000 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let (addr, _) = live.swap_remove(rng.gen_range(0..live.len()));
                heap.free(addr).unwrap();
            } else {
                let len = rng.gen_range(0..300);
                let addr = heap.alloc(len).unwrap();
                live.push((addr, len));
            }

            let mut ranges: Vec<(u64, u64)> = live
                .iter()
                .map(|&(a, l)| (a.get(), a.get() + align_up(l.max(1)) as u64))
                .collect();
            ranges.sort_unstable();
            for w in ranges.windows(2) {
                assert!(w[0].1 <= w[1].0, "overlapping blocks {:?}", w);
            }
        }
        assert_eq!(heap.live_blocks(), live.len());
    }
}
