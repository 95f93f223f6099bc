// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! The contract between the trap pipeline and the kernel's trap handler.
//!
//! The handler is called exactly once per trap, synchronously, with the
//! frame that context save built. It sees the trap identity and the raw
//! syndrome through the frame's read-only accessors and expresses every
//! decision (resume, skip the instruction, return a syscall value, switch to
//! a different user context) by editing the frame's registers, program
//! counter and processor state before returning.
//!
//! A handler that switches to another kernel context and never returns hands
//! ownership of its frame to the scheduler, which must release the abandoned
//! slots with [`TrapCore::reclaim_to`](crate::TrapCore::reclaim_to) before it
//! resumes anything on this core.

use crate::{
    frame::TrapFrame,
    vector::{TrapInfo, TrapKind, TrapSource, VECTOR_COUNT},
};

/// What the pipeline should do with the frame once the handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Restore the frame, including any edits the handler made.
    Resume,
    /// The handler has no policy for this exception. Never resumed.
    Unexpected,
}

/// Kernel-side trap handling logic.
pub trait TrapHandler {
    /// Handles a trap whose (source, kind) the policy expects.
    fn handle(&self, frame: &mut TrapFrame) -> Disposition;

    /// Called instead of [`handle`](Self::handle) for a (source, kind) the
    /// policy does not expect. The frame is available for diagnostics.
    fn unexpected(&self, frame: &mut TrapFrame) -> Disposition {
        let _ = frame;
        Disposition::Unexpected
    }
}

impl<F> TrapHandler for F
where
    F: Fn(&mut TrapFrame) -> Disposition,
{
    fn handle(&self, frame: &mut TrapFrame) -> Disposition {
        self(frame)
    }
}

/// The set of vector slots the kernel has a policy for, one bit per slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapPolicy(u16);

impl TrapPolicy {
    /// Kernel on `SP_ELx`, user space in AArch64: synchronous exceptions,
    /// IRQs and SErrors from both. FIQs, traps taken on `SP_EL0` and AArch32
    /// user space are not expected.
    pub const DEFAULT: Self = Self::empty()
        .with(TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Synchronous))
        .with(TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::Irq))
        .with(TrapInfo::new(TrapSource::CurrentSpElx, TrapKind::SError))
        .with(TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Synchronous))
        .with(TrapInfo::new(TrapSource::LowerAArch64, TrapKind::Irq))
        .with(TrapInfo::new(TrapSource::LowerAArch64, TrapKind::SError));

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(((1u32 << VECTOR_COUNT) - 1) as u16)
    }

    pub const fn with(self, info: TrapInfo) -> Self {
        Self(self.0 | 1 << info.vector_index())
    }

    pub const fn without(self, info: TrapInfo) -> Self {
        Self(self.0 & !(1 << info.vector_index()))
    }

    pub const fn expects(self, info: TrapInfo) -> bool {
        self.0 & (1 << info.vector_index()) != 0
    }
}

impl Default for TrapPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Routes `frame` to `handler` according to `policy`.
pub fn dispatch<H>(policy: TrapPolicy, handler: &H, frame: &mut TrapFrame) -> Disposition
where
    H: TrapHandler + ?Sized,
{
    let info = frame.info();
    if policy.expects(info) {
        debug!("trap dispatch: {info}");
        handler.handle(frame)
    } else {
        debug!("trap dispatch: {info} has no policy");
        handler.unexpected(frame)
    }
}
