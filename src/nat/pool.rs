//! External identifier allocation
//!
//! TCP ports come from 1024..=65535 and ICMP query identifiers from 1..=65535.
//! Allocation always hands out the lowest free identifier; the scan is linear,
//! which is acceptable for the table sizes a single router sees.

use crate::{Error, Result};
use std::fmt;
use std::ops::RangeInclusive;

/// Lowest external TCP port handed out
pub const MIN_TCP_PORT: u16 = 1024;

/// Lowest external ICMP identifier handed out
pub const MIN_ICMP_IDENTIFIER: u16 = 1;

/// Translation class of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    Tcp,
    Icmp,
}

impl MappingKind {
    /// From an IP protocol number; UDP is not translated
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(MappingKind::Icmp),
            6 => Some(MappingKind::Tcp),
            _ => None,
        }
    }

    /// Full legal identifier range for this kind
    pub fn id_range(self) -> RangeInclusive<u16> {
        match self {
            MappingKind::Tcp => MIN_TCP_PORT..=u16::MAX,
            MappingKind::Icmp => MIN_ICMP_IDENTIFIER..=u16::MAX,
        }
    }
}

impl fmt::Display for MappingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MappingKind::Tcp => f.write_str("tcp"),
            MappingKind::Icmp => f.write_str("icmp"),
        }
    }
}

/// Fixed-capacity bit set over an inclusive `u16` range
#[derive(Debug, Clone)]
struct IdBitmap {
    words: Vec<u64>,
    min: u16,
    max: u16,
    in_use: usize,
}

impl IdBitmap {
    fn new(range: RangeInclusive<u16>) -> Self {
        let (min, max) = range.into_inner();
        assert!(min <= max, "empty identifier range {}..={}", min, max);
        let slots = (max - min) as usize + 1;
        Self {
            words: vec![0; slots.div_ceil(64)],
            min,
            max,
            in_use: 0,
        }
    }

    fn capacity(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    fn slot(&self, id: u16) -> Option<(usize, u64)> {
        if id < self.min || id > self.max {
            return None;
        }
        let offset = (id - self.min) as usize;
        Some((offset / 64, 1u64 << (offset % 64)))
    }

    fn contains(&self, id: u16) -> bool {
        self.slot(id)
            .is_some_and(|(word, bit)| self.words[word] & bit != 0)
    }

    /// Marks the lowest clear bit and returns its identifier
    fn take_lowest(&mut self) -> Option<u16> {
        let capacity = self.capacity();
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let offset = index * 64 + bit;
            if offset >= capacity {
                return None;
            }
            *word |= 1u64 << bit;
            self.in_use += 1;
            return Some(self.min + offset as u16);
        }
        None
    }

    fn clear(&mut self, id: u16) -> bool {
        match self.slot(id) {
            Some((word, bit)) if self.words[word] & bit != 0 => {
                self.words[word] &= !bit;
                self.in_use -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Allocator for external TCP ports and ICMP identifiers
#[derive(Debug, Clone)]
pub struct IdentifierPool {
    tcp_ports: IdBitmap,
    icmp_ids: IdBitmap,
}

impl IdentifierPool {
    /// Pool over the full legal ranges, all identifiers free
    pub fn new() -> Self {
        Self::with_ranges(
            MappingKind::Tcp.id_range(),
            MappingKind::Icmp.id_range(),
        )
    }

    /// Pool over narrower ranges (small deployments and tests)
    pub fn with_ranges(tcp: RangeInclusive<u16>, icmp: RangeInclusive<u16>) -> Self {
        Self {
            tcp_ports: IdBitmap::new(tcp),
            icmp_ids: IdBitmap::new(icmp),
        }
    }

    fn bitmap(&self, kind: MappingKind) -> &IdBitmap {
        match kind {
            MappingKind::Tcp => &self.tcp_ports,
            MappingKind::Icmp => &self.icmp_ids,
        }
    }

    fn bitmap_mut(&mut self, kind: MappingKind) -> &mut IdBitmap {
        match kind {
            MappingKind::Tcp => &mut self.tcp_ports,
            MappingKind::Icmp => &mut self.icmp_ids,
        }
    }

    /// Allocate the lowest free identifier of `kind`
    pub fn allocate(&mut self, kind: MappingKind) -> Result<u16> {
        self.bitmap_mut(kind)
            .take_lowest()
            .ok_or(Error::PoolExhausted { kind })
    }

    /// Return an identifier to the pool.
    ///
    /// Releasing a free or out-of-range identifier is a no-op.
    pub fn release(&mut self, kind: MappingKind, id: u16) {
        self.bitmap_mut(kind).clear(id);
    }

    /// True while `id` is held by a live mapping
    pub fn is_allocated(&self, kind: MappingKind, id: u16) -> bool {
        self.bitmap(kind).contains(id)
    }

    /// Number of identifiers currently handed out
    pub fn in_use(&self, kind: MappingKind) -> usize {
        self.bitmap(kind).in_use
    }

    /// Size of the identifier range for `kind`
    pub fn capacity(&self, kind: MappingKind) -> usize {
        self.bitmap(kind).capacity()
    }
}

impl Default for IdentifierPool {
    fn default() -> Self {
        Self::new()
    }
}
