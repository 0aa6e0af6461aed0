//! Table id allocation.
//!
//! Every per-connection table (questions, exports, embargoes) draws its
//! indices from an [`IdGen`]. Freed ids are reused smallest-first so table
//! vectors stay dense. The peer cannot observe allocation order, but tests
//! can, so the policy is part of the contract.

use crate::error::{Error, Result};

const WORD_BITS: u32 = u64::BITS;

/// Allocator for 32-bit table ids.
#[derive(Debug, Clone)]
pub struct IdGen {
    table: &'static str,
    next: u64,
    free: Vec<u64>,
    free_count: usize,
}

impl IdGen {
    /// Creates an allocator whose first id is zero.
    ///
    /// `table` names the owning table in exhaustion errors.
    #[must_use]
    pub const fn new(table: &'static str) -> Self {
        Self {
            table,
            next: 0,
            free: Vec::new(),
            free_count: 0,
        }
    }

    /// Creates an allocator that starts at `start`, to reach exhaustion
    /// without allocating four billion ids.
    #[cfg(test)]
    #[must_use]
    pub(crate) const fn starting_at(table: &'static str, start: u32) -> Self {
        Self {
            table,
            next: start as u64,
            free: Vec::new(),
            free_count: 0,
        }
    }

    /// Returns the smallest freed id, or the next unused one.
    ///
    /// Fails with [`ErrorKind::IdExhausted`](crate::ErrorKind::IdExhausted)
    /// once all 2^32 ids are live.
    pub fn next(&mut self) -> Result<u32> {
        if self.free_count > 0 {
            for (word_idx, word) in self.free.iter_mut().enumerate() {
                if *word != 0 {
                    let bit = word.trailing_zeros();
                    *word &= !(1u64 << bit);
                    self.free_count -= 1;
                    return Ok(word_idx as u32 * WORD_BITS + bit);
                }
            }
        }
        if self.next > u64::from(u32::MAX) {
            return Err(Error::id_exhausted(self.table));
        }
        let id = self.next as u32;
        self.next += 1;
        Ok(id)
    }

    /// Marks `id` as reusable. Ids never handed out, and ids already free,
    /// are ignored.
    pub fn remove(&mut self, id: u32) {
        if u64::from(id) >= self.next {
            return;
        }
        let word_idx = (id / WORD_BITS) as usize;
        let bit = 1u64 << (id % WORD_BITS);
        if word_idx >= self.free.len() {
            self.free.resize(word_idx + 1, 0);
        }
        if self.free[word_idx] & bit == 0 {
            self.free[word_idx] |= bit;
            self.free_count += 1;
        }
    }

    /// Number of ids currently handed out.
    #[must_use]
    pub fn live(&self) -> u64 {
        self.next - self.free_count as u64
    }
}
