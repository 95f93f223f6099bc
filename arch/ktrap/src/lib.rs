// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 KylinSoft Co., Ltd. <https://www.kylinos.cn/>
// See LICENSES for license details.

//! AArch64 exception entry layer.
//!
//! This crate owns everything between the hardware taking an exception and
//! the kernel's trap handler running, and everything between that handler
//! returning and `eret`:
//!
//! - the 16-slot exception vector table ([`vector`], `aarch64/vectors.S`),
//! - context save: raw trapped registers into a [`TrapFrame`] ([`save`]),
//! - context restore: the frame back into registers ([`restore`]),
//! - the handler contract ([`TrapHandler`], [`Disposition`]),
//! - per-core, bounded, LIFO frame storage for nested traps ([`FrameStack`]).
//!
//! All of the logic is plain Rust over [`RawTrapState`], so it runs on the
//! host; only the assembly thunks and system-register accesses in the
//! `aarch64` module are target specific.
#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;

pub mod dispatch;
pub mod excp;
pub mod frame;
pub mod mask;
pub mod pipeline;
pub mod restore;
pub mod save;
pub mod stack;
pub mod vector;

mod error;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod aarch64;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use self::aarch64::{init, with_current};
#[cfg(feature = "fp-simd")]
pub use self::frame::FpState;
pub use self::{
    dispatch::{Disposition, TrapHandler, TrapPolicy},
    error::{FatalTrap, ProtocolViolation},
    excp::LinkedHandlers,
    frame::{GPR_COUNT, ProcessorState, RawTrapState, Syndrome, TrapFrame},
    mask::{DaifMask, MaskControl, MaskTransition},
    pipeline::TrapCore,
    stack::{FrameSlot, FrameStack},
    vector::{TrapInfo, TrapKind, TrapSource},
};

cfg_if::cfg_if! {
    if #[cfg(feature = "arm-el2")] {
        /// Exception level the kernel itself executes at.
        pub const KERNEL_EL: u8 = 2;
    } else {
        /// Exception level the kernel itself executes at.
        pub const KERNEL_EL: u8 = 1;
    }
}

/// Maximum number of traps that may be nested on one core.
///
/// Synchronous faults inside an IRQ handler inside a system call, plus an
/// SError on top, is the deepest legitimate chain; the rest is headroom.
pub const MAX_TRAP_NESTING: usize = 8;
