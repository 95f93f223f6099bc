// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Exception masking discipline.
//!
//! On exception entry the hardware sets all four `PSTATE.{D,A,I,F}` bits, so
//! context save runs with every asynchronous class masked. Once the frame is
//! complete the handler runs with only the classes of equal or lower
//! priority masked, letting higher-priority exceptions preempt it and build
//! their own frame. Before context restore rewrites `ELR/SPSR` everything is
//! masked again; `eret` then installs the interrupted context's own mask
//! from `SPSR`.
//!
//! The masks are passed around explicitly as [`MaskTransition`] values, and
//! applied to the hardware through [`MaskControl`].

use crate::vector::TrapKind;

bitflags::bitflags! {
    /// `DAIF` bits, at the positions they occupy in both the `DAIF` system
    /// register and `SPSR_ELx`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DaifMask: u64 {
        /// FIQ masked.
        const F = 1 << 6;
        /// IRQ masked.
        const I = 1 << 7;
        /// SError masked.
        const A = 1 << 8;
        /// Debug exceptions masked.
        const D = 1 << 9;
    }
}

impl DaifMask {
    /// What the hardware guarantees on exception entry.
    pub const ENTRY: Self = Self::all();

    /// Classes that must stay masked while a frame of `kind` is being built:
    /// the kind's own class and every lower-priority asynchronous class.
    pub const fn construction(kind: TrapKind) -> Self {
        match kind {
            TrapKind::Synchronous => Self::D,
            TrapKind::Irq => Self::D.union(Self::I),
            TrapKind::Fiq => Self::D.union(Self::I).union(Self::F),
            TrapKind::SError => Self::all(),
        }
    }

    /// The mask a handler for `kind` runs under.
    ///
    /// Currently identical to [`DaifMask::construction`].
    pub const fn handler(kind: TrapKind) -> Self {
        Self::construction(kind)
    }
}

/// The masking decision made by context save and undone by context restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskTransition {
    /// In effect on entry; re-applied before the frame is restored.
    pub entry: DaifMask,
    /// In effect while the handler runs.
    pub handler: DaifMask,
}

impl MaskTransition {
    /// `interrupted` is the mask of the trapped context. Anything it had
    /// masked stays masked in the handler.
    pub const fn for_kind(kind: TrapKind, entry: DaifMask, interrupted: DaifMask) -> Self {
        Self {
            entry,
            handler: DaifMask::handler(kind).union(interrupted).intersection(entry),
        }
    }
}

/// Applies a mask to the executing core.
///
/// Implemented by the architecture glue with `msr daif`; tests record the
/// sequence instead.
pub trait MaskControl {
    fn set_mask(&self, mask: DaifMask);
}
