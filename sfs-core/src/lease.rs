//! Lease types and lease masks.

use crate::MAX_LEASE_TYPES;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// Inode number of a leased file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A typed permission a client may hold on a file.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseType {
    Read = 0,
    Write = 1,
    Append = 2,
    Truncate = 3,
    FileRecordLock = 4,
    Stage = 5,
    Open = 6,
    ReadMap = 7,
    WriteMap = 8,
    Exclusive = 9,
}

impl LeaseType {
    pub const ALL: [LeaseType; MAX_LEASE_TYPES] = [
        Self::Read,
        Self::Write,
        Self::Append,
        Self::Truncate,
        Self::FileRecordLock,
        Self::Stage,
        Self::Open,
        Self::ReadMap,
        Self::WriteMap,
        Self::Exclusive,
    ];

    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::Append),
            3 => Some(Self::Truncate),
            4 => Some(Self::FileRecordLock),
            5 => Some(Self::Stage),
            6 => Some(Self::Open),
            7 => Some(Self::ReadMap),
            8 => Some(Self::WriteMap),
            9 => Some(Self::Exclusive),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    #[must_use]
    pub const fn mask(self) -> LeaseMask {
        LeaseMask(1 << (self as u16))
    }

    /// Leases that survive without renewal until explicitly removed.
    #[inline]
    #[must_use]
    pub const fn is_non_expiring(self) -> bool {
        LeaseMask::NON_EXPIRING.contains(self)
    }
}

impl fmt::Display for LeaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Append => "append",
            Self::Truncate => "truncate",
            Self::FileRecordLock => "frlock",
            Self::Stage => "stage",
            Self::Open => "open",
            Self::ReadMap => "rmap",
            Self::WriteMap => "wmap",
            Self::Exclusive => "exclusive",
        };
        write!(f, "{name}")
    }
}

/// Bitset of [`LeaseType`], one bit per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LeaseMask(u16);

impl LeaseMask {
    pub const EMPTY: Self = Self(0);
    pub const ALL: Self = Self((1 << MAX_LEASE_TYPES) - 1);

    pub const READ: Self = LeaseType::Read.mask();
    pub const WRITE: Self = LeaseType::Write.mask();
    pub const APPEND: Self = LeaseType::Append.mask();
    pub const TRUNCATE: Self = LeaseType::Truncate.mask();
    pub const FRLOCK: Self = LeaseType::FileRecordLock.mask();
    pub const STAGE: Self = LeaseType::Stage.mask();
    pub const OPEN: Self = LeaseType::Open.mask();
    pub const READ_MAP: Self = LeaseType::ReadMap.mask();
    pub const WRITE_MAP: Self = LeaseType::WriteMap.mask();
    pub const EXCLUSIVE: Self = LeaseType::Exclusive.mask();

    pub const MAP: Self = Self::READ_MAP.union(Self::WRITE_MAP);
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);
    pub const WRITE_APPEND: Self = Self::WRITE.union(Self::APPEND);
    /// Leases never reclaimed by the expiry task.
    pub const NON_EXPIRING: Self = Self::TRUNCATE
        .union(Self::FRLOCK)
        .union(Self::OPEN)
        .union(Self::READ_MAP)
        .union(Self::WRITE_MAP);
    /// Leases whose grant lets the holder modify file data.
    pub const DATA_MODIFYING: Self = Self::WRITE
        .union(Self::WRITE_MAP)
        .union(Self::APPEND)
        .union(Self::STAGE);
    /// Leases whose grant lets the holder read file data.
    pub const DATA_READING: Self = Self::READ.union(Self::READ_MAP);
    /// Leases whose removal forces a metadata flush.
    pub const SIZE_CHANGING: Self = Self::TRUNCATE
        .union(Self::APPEND)
        .union(Self::EXCLUSIVE);
    /// Everything a close relinquishes; stage survives a close.
    pub const CLOSE: Self = Self::ALL.difference(Self::STAGE);

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, ltype: LeaseType) -> bool {
        self.0 & (1 << (ltype as u16)) != 0
    }

    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[inline]
    pub fn insert(&mut self, ltype: LeaseType) {
        self.0 |= ltype.mask().0;
    }

    #[inline]
    pub fn remove(&mut self, ltype: LeaseType) {
        self.0 &= !ltype.mask().0;
    }

    /// The single type in this mask, if exactly one bit is set.
    #[must_use]
    pub fn single(self) -> Option<LeaseType> {
        if self.0.count_ones() == 1 {
            LeaseType::from_u8(self.0.trailing_zeros() as u8)
        } else {
            None
        }
    }

    pub fn iter(self) -> impl Iterator<Item = LeaseType> {
        LeaseType::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl BitOr for LeaseMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for LeaseMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for LeaseMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersection(rhs)
    }
}

impl BitAndAssign for LeaseMask {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for LeaseMask {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

impl From<LeaseType> for LeaseMask {
    fn from(ltype: LeaseType) -> Self {
        ltype.mask()
    }
}

impl fmt::Display for LeaseMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let mut first = true;
        for ltype in self.iter() {
            if !first {
                write!(f, "|")?;
            }
            write!(f, "{ltype}")?;
            first = false;
        }
        Ok(())
    }
}

/// Per-(file, client, type) grant counter.
///
/// Comparison wraps like sequence numbers so a long-lived file never runs
/// out of generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(u32);

impl Generation {
    pub const ZERO: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// True when `self` was issued before `other`.
    #[inline]
    #[must_use]
    pub const fn is_behind(self, other: Self) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One generation per lease type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenerationSet([Generation; MAX_LEASE_TYPES]);

impl GenerationSet {
    #[inline]
    #[must_use]
    pub const fn get(&self, ltype: LeaseType) -> Generation {
        self.0[ltype.index()]
    }

    #[inline]
    pub fn set(&mut self, ltype: LeaseType, generation: Generation) {
        self.0[ltype.index()] = generation;
    }

    /// Bump and return the generation for `ltype`.
    pub fn bump(&mut self, ltype: LeaseType) -> Generation {
        let next = self.0[ltype.index()].next();
        self.0[ltype.index()] = next;
        next
    }

    #[must_use]
    pub fn as_array(&self) -> [u32; MAX_LEASE_TYPES] {
        let mut out = [0u32; MAX_LEASE_TYPES];
        for (slot, generation) in out.iter_mut().zip(self.0.iter()) {
            *slot = generation.get();
        }
        out
    }

    #[must_use]
    pub fn from_array(values: [u32; MAX_LEASE_TYPES]) -> Self {
        Self(values.map(Generation::new))
    }
}
