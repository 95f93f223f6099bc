// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! Per-core storage for the frames of nested traps.
//!
//! A fixed array of `N` frame slots used strictly as a stack: the trap taken
//! most recently owns the top slot. A trap that nests inside a handler gets
//! the next slot up, so it can never alias the frame the outer handler is
//! still working on. Running out of slots is fatal.
//!
//! The stack belongs to exactly one core and is only ever touched by that
//! core's trap path, so it uses `Cell`/`UnsafeCell` rather than locks. It is
//! `!Sync`.
//!
//! Next to every slot the stack records the trap's origin (identity,
//! syndrome, fault addresses) out of reach of the handler, and stamps it back
//! onto the frame when the slot is popped.

use core::{
    cell::{Cell, UnsafeCell},
    marker::PhantomData,
};

use crate::{
    error::FatalTrap,
    frame::{TrapFrame, TrapOrigin},
};

/// A bounded LIFO arena of [`TrapFrame`]s.
pub struct FrameStack<const N: usize> {
    slots: [UnsafeCell<TrapFrame>; N],
    origins: [Cell<TrapOrigin>; N],
    depth: Cell<usize>,
    high_water: Cell<usize>,
}

impl<const N: usize> FrameStack<N> {
    pub const fn new() -> Self {
        Self {
            slots: [const { UnsafeCell::new(TrapFrame::EMPTY) }; N],
            origins: [const { Cell::new(TrapOrigin::EMPTY) }; N],
            depth: Cell::new(0),
            high_water: Cell::new(0),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of frames currently live.
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Deepest nesting observed since creation.
    pub fn high_water(&self) -> usize {
        self.high_water.get()
    }

    /// Stores `frame` in the next free slot.
    ///
    /// On exhaustion nothing is written, so every outer frame stays intact.
    pub fn push(&self, frame: TrapFrame) -> Result<FrameSlot<'_>, FatalTrap> {
        let index = self.depth.get();
        if index >= N {
            return Err(FatalTrap::Exhausted { capacity: N });
        }
        // SAFETY: slots at or above `depth` have no outstanding `FrameSlot`.
        unsafe { *self.slots[index].get() = frame };
        self.origins[index].set(frame.origin());
        self.depth.set(index + 1);
        if index + 1 > self.high_water.get() {
            self.high_water.set(index + 1);
        }
        Ok(FrameSlot {
            ptr: self.slots[index].get(),
            index,
            _stack: PhantomData,
        })
    }

    /// Releases the top slot and hands its frame back by value, carrying the
    /// origin recorded by [`push`](Self::push) whatever the handler did to it.
    ///
    /// `slot` must be the most recently pushed live slot.
    pub fn pop(&self, slot: FrameSlot<'_>) -> Result<TrapFrame, FatalTrap> {
        let top = self.depth.get();
        if top == 0 || slot.index != top - 1 {
            return Err(FatalTrap::OutOfOrder {
                expected: top.wrapping_sub(1),
                got: slot.index,
            });
        }
        let mut frame = *slot.frame();
        frame.restamp(self.origins[slot.index].get());
        self.depth.set(slot.index);
        Ok(frame)
    }

    /// Drops every frame at or above `depth` without restoring it.
    ///
    /// Used when a handler switched to another context and will never return
    /// through the frames it abandoned.
    ///
    /// # Safety
    ///
    /// No [`FrameSlot`] for an index `>= depth` may be used afterwards. The
    /// caller takes over ownership of the abandoned execution states.
    pub unsafe fn reclaim_to(&self, depth: usize) {
        if depth < self.depth.get() {
            self.depth.set(depth);
        }
    }
}

/// Exclusive access to one live slot of a [`FrameStack`].
///
/// Obtained from [`FrameStack::push`] and consumed by [`FrameStack::pop`].
pub struct FrameSlot<'a> {
    ptr: *mut TrapFrame,
    index: usize,
    _stack: PhantomData<&'a UnsafeCell<TrapFrame>>,
}

impl FrameSlot<'_> {
    /// Nesting depth of this frame, 0 for the outermost trap.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn frame(&self) -> &TrapFrame {
        // SAFETY: the slot is live and this is its only handle.
        unsafe { &*self.ptr }
    }

    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: as above, and `&mut self` makes the borrow unique.
        unsafe { &mut *self.ptr }
    }
}
