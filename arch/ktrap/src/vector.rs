// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Exception vector table geometry and trap identifiers.
//!
//! The table is fixed by the architecture (ARM DDI 0487, D1.10.2): 16 slots
//! of 0x80 bytes at `VBAR_ELx`, which itself must be 2 KiB aligned. Slots are
//! grouped by [`TrapSource`] (0x200 bytes each) and ordered by [`TrapKind`]
//! within a group, so the slot index alone identifies the trap:
//! `index = source * 4 + kind`.

use core::fmt;

/// Number of slots in the vector table.
pub const VECTOR_COUNT: usize = 16;
/// Size of one vector slot in bytes. Slots cannot be compacted.
pub const VECTOR_STRIDE: usize = 0x80;
/// Required alignment of the vector table base (`VBAR_ELx[10:0]` are RES0).
pub const VECTOR_TABLE_ALIGN: usize = 0x800;

/// Where the exception was taken from, relative to the kernel's level.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrapSource {
    /// Current exception level, running on `SP_EL0`.
    CurrentSpEl0 = 0,
    /// Current exception level, running on its own `SP_ELx`.
    CurrentSpElx = 1,
    /// A lower exception level executing AArch64.
    LowerAArch64 = 2,
    /// A lower exception level executing AArch32.
    LowerAArch32 = 3,
}

impl TrapSource {
    pub const fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Self::CurrentSpEl0,
            1 => Self::CurrentSpElx,
            2 => Self::LowerAArch64,
            3 => Self::LowerAArch32,
            _ => return None,
        })
    }

    /// Whether the trapped code ran at a lower (less privileged) level.
    pub const fn is_lower(self) -> bool {
        matches!(self, Self::LowerAArch64 | Self::LowerAArch32)
    }
}

/// The class of exception, in increasing priority order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrapKind {
    Synchronous = 0,
    Irq         = 1,
    Fiq         = 2,
    SError      = 3,
}

impl TrapKind {
    pub const fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Self::Synchronous,
            1 => Self::Irq,
            2 => Self::Fiq,
            3 => Self::SError,
            _ => return None,
        })
    }

    /// Only synchronous exceptions carry a meaningful syndrome and fault
    /// address; asynchronous ones leave `ESR/FAR` from an earlier event.
    pub const fn is_synchronous(self) -> bool {
        matches!(self, Self::Synchronous)
    }
}

/// The (source, kind) pair identifying one vector slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapInfo {
    pub source: TrapSource,
    pub kind: TrapKind,
}

impl TrapInfo {
    /// All 16 pairs in vector-table order.
    pub const ALL: [TrapInfo; VECTOR_COUNT] = {
        let mut all = [TrapInfo::new(TrapSource::CurrentSpEl0, TrapKind::Synchronous); VECTOR_COUNT];
        let mut i = 0;
        while i < VECTOR_COUNT {
            all[i] = match TrapInfo::from_vector(i) {
                Some(info) => info,
                None => unreachable!(),
            };
            i += 1;
        }
        all
    };

    pub const fn new(source: TrapSource, kind: TrapKind) -> Self {
        Self { source, kind }
    }

    /// Decodes the slot index the vector thunk passes to the common path.
    pub const fn from_vector(index: usize) -> Option<Self> {
        match (
            TrapSource::from_index(index / 4),
            TrapKind::from_index(index % 4),
        ) {
            (Some(source), Some(kind)) if index < VECTOR_COUNT => Some(Self { source, kind }),
            _ => None,
        }
    }

    pub const fn vector_index(self) -> usize {
        self.source as usize * 4 + self.kind as usize
    }

    /// Byte offset of this pair's slot from the vector base.
    pub const fn vector_offset(self) -> usize {
        self.vector_index() * VECTOR_STRIDE
    }
}

impl fmt::Display for TrapInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{:?}", self.source, self.kind)
    }
}
