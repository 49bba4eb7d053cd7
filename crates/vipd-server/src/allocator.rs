//! Virtual address allocation.
//!
//! Addresses are handed out from a fixed IPv4 block. Fresh addresses come from a
//! cursor that only ever moves forward; released addresses go onto a free list
//! and are reused most-recently-freed first. Addresses whose last octet is `0` or
//! `255` are never issued.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("IP block exhausted")]
pub struct BlockExhausted;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocator {
    block: Ipv4Net,
    cursor: Ipv4Addr,
    free_list: Vec<Ipv4Addr>,
}

/// Placed in the cursor once it has run off the end of the address space.
const SPENT_CURSOR: Ipv4Addr = Ipv4Addr::BROADCAST;

fn is_issuable(address: Ipv4Addr) -> bool {
    !matches!(address.octets()[3], 0 | 255)
}

/// The next address after `address` that may be issued.
fn next_issuable(address: Ipv4Addr) -> Ipv4Addr {
    let mut candidate = u32::from(address);
    loop {
        candidate = match candidate.checked_add(1) {
            Some(next) => next,
            None => return SPENT_CURSOR,
        };
        let next = Ipv4Addr::from(candidate);
        if is_issuable(next) {
            return next;
        }
    }
}

impl AddressAllocator {
    /// An allocator that has not issued anything from `block` yet.
    #[must_use]
    pub fn new(block: Ipv4Net) -> Self {
        Self::with_free_list(block, Vec::new())
    }

    /// Starts at the beginning of `block` but keeps addresses freed earlier.
    ///
    /// Used when the configured block changed: freed addresses outside the new
    /// block are dropped the first time they are popped.
    #[must_use]
    pub fn with_free_list(block: Ipv4Net, free_list: Vec<Ipv4Addr>) -> Self {
        Self {
            block,
            cursor: next_issuable(block.network()),
            free_list,
        }
    }

    /// Rebuilds an allocator from persisted parts.
    #[must_use]
    pub const fn from_parts(block: Ipv4Net, cursor: Ipv4Addr, free_list: Vec<Ipv4Addr>) -> Self {
        Self {
            block,
            cursor,
            free_list,
        }
    }

    #[must_use]
    pub const fn block(&self) -> Ipv4Net {
        self.block
    }

    #[must_use]
    pub const fn cursor(&self) -> Ipv4Addr {
        self.cursor
    }

    #[must_use]
    pub fn free_list(&self) -> &[Ipv4Addr] {
        &self.free_list
    }

    #[must_use]
    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.block.contains(&address)
    }

    /// Hands out an address.
    ///
    /// `in_use` reports addresses currently held by live entries; those are never
    /// returned. They can only show up here after the block changed underneath
    /// existing entries.
    ///
    /// # Errors
    ///
    /// Returns [`BlockExhausted`] when neither the free list nor the cursor can
    /// produce an address inside the block. The allocator is left unchanged
    /// except for discarded out-of-block free list entries.
    pub fn allocate(&mut self, in_use: impl Fn(Ipv4Addr) -> bool) -> Result<Ipv4Addr, BlockExhausted> {
        while let Some(address) = self.free_list.pop() {
            if self.block.contains(&address) && !in_use(address) {
                return Ok(address);
            }
            debug!("Discarding freed address {} outside {}", address, self.block);
        }

        loop {
            let address = self.cursor;
            if !self.block.contains(&address) || !is_issuable(address) {
                return Err(BlockExhausted);
            }
            self.cursor = next_issuable(address);
            if !in_use(address) {
                return Ok(address);
            }
        }
    }

    /// Returns an address to the pool.
    ///
    /// The caller guarantees that `address` is no longer held by a live entry.
    pub fn release(&mut self, address: Ipv4Addr) {
        self.free_list.push(address);
    }
}
