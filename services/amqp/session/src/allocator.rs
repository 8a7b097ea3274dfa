//! Channel number allocation.
//!
//! A bitset over `1..=channel_max` where a set bit marks a free number. Allocation
//! scans forward from the last number handed out so freed numbers are not reused
//! immediately.

use crate::error::{AmqpError, Result};

/// Bitset-backed free list of channel numbers
#[derive(Debug, Clone)]
pub struct ChannelAllocator {
    max: u16,
    free: Vec<u64>,
    cursor: u16,
    outstanding: usize,
}

impl ChannelAllocator {
    /// Allocator for `1..=channel_max`; 0 means the whole 16-bit space
    pub fn new(channel_max: u16) -> Self {
        let max = if channel_max == 0 { u16::MAX } else { channel_max };
        let words = (max as usize + 1).div_ceil(64);
        let mut free = vec![u64::MAX; words];
        // Channel 0 belongs to the connection
        free[0] &= !1;
        // Bits past max are never free
        let tail = (max as usize + 1) % 64;
        if tail != 0 {
            free[words - 1] &= (1u64 << tail) - 1;
        }
        Self {
            max,
            free,
            cursor: 0,
            outstanding: 0,
        }
    }

    /// Highest channel number
    pub fn channel_max(&self) -> u16 {
        self.max
    }

    /// Numbers currently allocated or reserved
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Whether `number` is allocated or reserved
    pub fn is_allocated(&self, number: u16) -> bool {
        number != 0 && number <= self.max && !self.bit(number)
    }

    fn bit(&self, n: u16) -> bool {
        let n = n as usize;
        self.free[n / 64] & (1 << (n % 64)) != 0
    }

    fn set(&mut self, n: u16, free: bool) {
        let n = n as usize;
        if free {
            self.free[n / 64] |= 1 << (n % 64);
        } else {
            self.free[n / 64] &= !(1 << (n % 64));
        }
    }

    /// First free number in `lo..=hi`
    fn find_free(&self, lo: usize, hi: usize) -> Option<u16> {
        let mut idx = lo;
        while idx <= hi {
            let word = idx / 64;
            let masked = self.free[word] & (u64::MAX << (idx % 64));
            if masked != 0 {
                let found = word * 64 + masked.trailing_zeros() as usize;
                return (found <= hi).then_some(found as u16);
            }
            idx = (word + 1) * 64;
        }
        None
    }

    /// Take the next free number after the cursor, wrapping around
    pub fn allocate(&mut self) -> Result<u16> {
        let start = self.cursor as usize + 1;
        let found = self
            .find_free(start, self.max as usize)
            .or_else(|| self.find_free(1, start - 1))
            .ok_or(AmqpError::ChannelsExhausted)?;
        self.set(found, false);
        self.cursor = found;
        self.outstanding += 1;
        Ok(found)
    }

    /// Pin a specific number
    pub fn reserve(&mut self, number: u16) -> Result<()> {
        if number == 0 || number > self.max {
            return Err(AmqpError::ChannelOutOfRange(number));
        }
        if !self.bit(number) {
            return Err(AmqpError::ChannelInUse(number));
        }
        self.set(number, false);
        self.outstanding += 1;
        Ok(())
    }

    /// Return a number; false if it was not allocated
    pub fn free(&mut self, number: u16) -> bool {
        if !self.is_allocated(number) {
            return false;
        }
        self.set(number, true);
        self.outstanding -= 1;
        true
    }
}
