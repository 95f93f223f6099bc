// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! One core's trap pipeline: save, dispatch, restore.

use core::cell::Cell;

use crate::{
    MAX_TRAP_NESTING,
    dispatch::{self, Disposition, TrapHandler, TrapPolicy},
    error::FatalTrap,
    frame::RawTrapState,
    mask::{DaifMask, MaskControl},
    restore, save,
    stack::FrameStack,
    vector::TrapInfo,
};

/// The trap handling state of a single core.
///
/// Each core owns one instance and only ever enters it from its own trap
/// path. Nested traps re-enter the same instance through [`TrapCore::enter`]
/// while an outer handler is still running; they get their own frame slot.
///
/// The first fatal condition latches: every later trap on the core is
/// refused with [`FatalTrap::Halted`], and so is the return of any trap that
/// was still in its handler when the latch was set.
pub struct TrapCore<const N: usize = MAX_TRAP_NESTING> {
    frames: FrameStack<N>,
    policy: TrapPolicy,
    fatal: Cell<Option<FatalTrap>>,
}

impl<const N: usize> TrapCore<N> {
    pub const fn new(policy: TrapPolicy) -> Self {
        Self {
            frames: FrameStack::new(),
            policy,
            fatal: Cell::new(None),
        }
    }

    pub fn policy(&self) -> TrapPolicy {
        self.policy
    }

    pub fn frames(&self) -> &FrameStack<N> {
        &self.frames
    }

    /// The fatal condition that stopped this core, if any.
    pub fn fatal(&self) -> Option<FatalTrap> {
        self.fatal.get()
    }

    /// Handles one trap end to end.
    ///
    /// `raw` is the register image spilled by the vector path; on success it
    /// holds the state to return to. `entry` is the mask the hardware
    /// established on entry. Mask changes are applied through `masking`:
    /// the handler mask once the frame is built, then `entry` again before
    /// the frame is written back.
    pub fn enter<H, M>(
        &self,
        info: TrapInfo,
        raw: &mut RawTrapState,
        entry: DaifMask,
        handler: &H,
        masking: &M,
    ) -> Result<(), FatalTrap>
    where
        H: TrapHandler + ?Sized,
        M: MaskControl + ?Sized,
    {
        if self.fatal.get().is_some() {
            return Err(FatalTrap::Halted);
        }
        self.run(info, raw, entry, handler, masking)
            .inspect_err(|err| self.halt(*err))
    }

    /// Like [`enter`](Self::enter), for the slot index a vector thunk passes.
    pub fn enter_vector<H, M>(
        &self,
        index: usize,
        raw: &mut RawTrapState,
        entry: DaifMask,
        handler: &H,
        masking: &M,
    ) -> Result<(), FatalTrap>
    where
        H: TrapHandler + ?Sized,
        M: MaskControl + ?Sized,
    {
        let Some(info) = TrapInfo::from_vector(index) else {
            if self.fatal.get().is_some() {
                return Err(FatalTrap::Halted);
            }
            let err = FatalTrap::BadVector { index };
            self.halt(err);
            return Err(err);
        };
        self.enter(info, raw, entry, handler, masking)
    }

    fn run<H, M>(
        &self,
        info: TrapInfo,
        raw: &mut RawTrapState,
        entry: DaifMask,
        handler: &H,
        masking: &M,
    ) -> Result<(), FatalTrap>
    where
        H: TrapHandler + ?Sized,
        M: MaskControl + ?Sized,
    {
        let (mut slot, transition) = save::save(&self.frames, info, raw, entry)?;

        masking.set_mask(transition.handler);
        let disposition = dispatch::dispatch(self.policy, handler, slot.frame_mut());
        masking.set_mask(transition.entry);

        if self.fatal.get().is_some() {
            // A nested trap stopped the core while this handler ran.
            self.frames.pop(slot)?;
            return Err(FatalTrap::Halted);
        }

        match disposition {
            Disposition::Resume => restore::restore(&self.frames, slot, raw),
            Disposition::Unexpected => {
                let frame = self.frames.pop(slot)?;
                error!("unexpected exception {}:\n{:#x?}", info, frame);
                Err(FatalTrap::Unexpected { info })
            }
        }
    }

    fn halt(&self, err: FatalTrap) {
        if self.fatal.get().is_none() {
            error!("trap pipeline halted: {err}");
            self.fatal.set(Some(err));
        }
    }

    /// Releases the frames of traps whose handlers switched away for good.
    ///
    /// # Safety
    ///
    /// Called by the scheduler before it resumes a context on this core.
    /// Every frame at nesting depth `>= depth` must belong to a handler that
    /// will never return; see [`FrameStack::reclaim_to`].
    pub unsafe fn reclaim_to(&self, depth: usize) {
        debug!(
            "trap reclaim: depth {} -> {}",
            self.frames.depth(),
            depth
        );
        unsafe { self.frames.reclaim_to(depth) };
    }
}
